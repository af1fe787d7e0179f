// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Login credential resolution for freshly-provisioned machines.
//!
//! Credentials are resolved per machine through a fallback chain: whatever
//! the driver attached to the machine wins, the machine template fills the
//! gaps, and a provider-generated secret is fetched as the last resort.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use slog::{debug, o, Logger};

use flotilla_common::{ConditionLatch, Deadline, LatchError, TimeoutError};
use flotilla_provision::cloud::CloudApi;
use flotilla_provision::config::MachineTemplate;
use flotilla_provision::driver::ProvisioningError;
use flotilla_provision::machine::{MachineDetails, RemoteCredential};

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("no login credentials available for machine {machine_id}")]
    Unresolved { machine_id: String },

    #[error("failed to fetch generated credentials for machine {machine_id}")]
    Fetch {
        machine_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Timeout(#[from] TimeoutError),
}

/// Retrieves provider-generated login secrets for machines whose template
/// carries none.
#[async_trait]
pub trait CredentialFetcher: Send + Sync {
    /// The generated secret for a machine, or `None` when the provider
    /// does not generate one.
    async fn fetch(
        &self,
        machine: &MachineDetails,
        deadline: Deadline,
    ) -> Result<Option<RemoteCredential>, CredentialError>;
}

/// Runs the fallback chain on one machine, mutating it in place so the
/// installer sees the resolved credentials.
pub async fn resolve_credentials(
    log: &Logger,
    machine: &mut MachineDetails,
    template: &MachineTemplate,
    fetcher: Option<&dyn CredentialFetcher>,
    deadline: Deadline,
) -> Result<(), CredentialError> {
    if machine.remote_username.is_none() {
        machine.remote_username = template.username.clone();
    }
    if machine.remote_credential.is_none() {
        machine.remote_credential = if let Some(password) = &template.password {
            Some(RemoteCredential::Password(password.clone()))
        } else {
            template.key_file.clone().map(RemoteCredential::KeyFile)
        };
    }

    if machine.remote_credential.is_none() {
        if let Some(fetcher) = fetcher {
            debug!(log, "asking the provider for generated credentials";
                "machine_id" => &machine.machine_id);
            machine.remote_credential = fetcher.fetch(machine, deadline).await?;
        }
    }

    if machine.remote_username.is_some() && machine.remote_credential.is_some() {
        Ok(())
    } else {
        Err(CredentialError::Unresolved { machine_id: machine.machine_id.clone() })
    }
}

/// [`CredentialFetcher`] over a cloud API whose provider generates machine
/// passwords some time after the machine starts. The raw secret may be
/// encrypted with an account keypair, so a decrypt hook is applied before
/// the password is handed back.
pub struct CloudCredentialFetcher {
    log: Logger,
    api: Arc<dyn CloudApi>,
    poll_interval: Duration,
    decrypt: Box<dyn Fn(&str) -> anyhow::Result<String> + Send + Sync>,
}

impl CloudCredentialFetcher {
    pub fn new(log: &Logger, api: Arc<dyn CloudApi>) -> CloudCredentialFetcher {
        CloudCredentialFetcher {
            log: log.new(o!("component" => "CloudCredentialFetcher")),
            api,
            poll_interval: Duration::from_secs(5),
            decrypt: Box::new(|raw| Ok(raw.to_string())),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> CloudCredentialFetcher {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_decrypt<F>(mut self, decrypt: F) -> CloudCredentialFetcher
    where
        F: Fn(&str) -> anyhow::Result<String> + Send + Sync + 'static,
    {
        self.decrypt = Box::new(decrypt);
        self
    }
}

#[async_trait]
impl CredentialFetcher for CloudCredentialFetcher {
    async fn fetch(
        &self,
        machine: &MachineDetails,
        deadline: Deadline,
    ) -> Result<Option<RemoteCredential>, CredentialError> {
        let machine_id = machine.machine_id.as_str();
        let secret: Mutex<Option<String>> = Mutex::new(None);
        let latch = ConditionLatch::new(&self.log, deadline)
            .poll_interval(self.poll_interval)
            .timeout_message(format!(
                "provider did not generate credentials for machine {machine_id} in time"
            ));
        let result = latch
            .wait_for(|| {
                let api = &self.api;
                let secret = &secret;
                async move {
                    match api.generated_secret(machine_id).await? {
                        Some(raw) => {
                            *secret.lock().unwrap() = Some(raw);
                            Ok::<_, ProvisioningError>(true)
                        }
                        None => Ok(false),
                    }
                }
            })
            .await;
        match result {
            Ok(()) => {
                let raw = secret
                    .into_inner()
                    .unwrap()
                    .expect("latch succeeded only after the secret was stored");
                let password = (self.decrypt)(&raw).map_err(|source| CredentialError::Fetch {
                    machine_id: machine_id.to_string(),
                    source,
                })?;
                Ok(Some(RemoteCredential::Password(password)))
            }
            Err(LatchError::TimedOut(err)) => Err(CredentialError::Timeout(err)),
            Err(LatchError::Failed(err)) => Err(CredentialError::Fetch {
                machine_id: machine_id.to_string(),
                source: anyhow::Error::new(err),
            }),
        }
    }
}
