// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Dynamic bring-your-own-node provisioning: node addresses come from an
//! [`AddressStrategy`] at allocation time instead of a static inventory.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use slog::{debug, info, o, warn, Logger};

use flotilla_common::Deadline;

use crate::config::{ConfigurationError, MachineTemplate, ProvisioningConfig};
use crate::driver::{ProvisioningDriver, ProvisioningError};
use crate::locator::probe_host;
use crate::machine::{MachineDetails, RemoteCredential};

pub const PROVIDER_ID: &str = "dynamic-byon";

/// Hands out host addresses on demand. Implementations typically shell out
/// to a site-specific allocation service.
#[async_trait]
pub trait AddressStrategy: Send + Sync {
    /// Acquires the address of the next available host.
    async fn acquire(&self) -> Result<String, ProvisioningError>;

    /// Returns a previously-acquired address to the allocator.
    async fn release(&self, addr: &str) -> Result<(), ProvisioningError>;
}

/// BYON without a fixed inventory: every allocation asks the strategy for a
/// host, and every stop gives it back.
pub struct DynamicByonDriver {
    log: Logger,
    config: Arc<ProvisioningConfig>,
    strategy: Arc<dyn AddressStrategy>,
    allocated: Mutex<Vec<String>>,
    probe_timeout: Duration,
}

impl DynamicByonDriver {
    pub fn new(
        log: &Logger,
        strategy: Arc<dyn AddressStrategy>,
        config: &ProvisioningConfig,
    ) -> Result<DynamicByonDriver, ConfigurationError> {
        config.management_template()?;
        Ok(DynamicByonDriver {
            log: log.new(o!("component" => "DynamicByonDriver")),
            config: Arc::new(config.clone()),
            strategy,
            allocated: Mutex::new(Vec::new()),
            probe_timeout: crate::locator::DEFAULT_PROBE_TIMEOUT,
        })
    }

    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> DynamicByonDriver {
        self.probe_timeout = probe_timeout;
        self
    }

    fn template(&self) -> &MachineTemplate {
        // Verified present in `new`.
        self.config.templates.get(&self.config.management_template).unwrap()
    }

    fn machine_from_addr(&self, addr: &str) -> MachineDetails {
        let template = self.template();
        let credential = if let Some(password) = &template.password {
            Some(RemoteCredential::Password(password.clone()))
        } else {
            template.key_file.clone().map(RemoteCredential::KeyFile)
        };
        MachineDetails {
            machine_id: addr.to_string(),
            public_address: None,
            private_address: Some(addr.to_string()),
            remote_username: template.username.clone(),
            remote_credential: credential,
            agent_running: false,
            control_plane_installed: false,
            location_id: None,
            file_transfer: template.file_transfer,
            remote_execution: template.remote_execution,
            clean_remote_directory: template.clean_remote_directory,
        }
    }

    async fn give_back(&self, addr: &str) {
        if let Err(err) = self.strategy.release(addr).await {
            warn!(self.log, "failed to return address to the strategy";
                "addr" => addr,
                "error" => %err,
            );
        }
    }

    async fn acquire_one(&self) -> Result<MachineDetails, ProvisioningError> {
        let addr = self.strategy.acquire().await?;
        let login_port = self.template().login_port;
        if !probe_host(&addr, login_port, self.probe_timeout).await {
            warn!(self.log, "acquired host is unreachable, returning it";
                "addr" => &addr,
                "login_port" => login_port,
            );
            self.give_back(&addr).await;
            return Err(ProvisioningError::Unreachable { addr, port: login_port });
        }
        self.allocated.lock().unwrap().push(addr.clone());
        info!(self.log, "acquired host"; "addr" => &addr);
        Ok(self.machine_from_addr(&addr))
    }
}

#[async_trait]
impl ProvisioningDriver for DynamicByonDriver {
    fn provider(&self) -> &str {
        PROVIDER_ID
    }

    async fn start_machine(
        &self,
        location_hint: Option<&str>,
        deadline: Deadline,
    ) -> Result<MachineDetails, ProvisioningError> {
        deadline.remaining()?;
        if let Some(location) = location_hint {
            debug!(self.log, "address strategies are location-unaware, ignoring hint";
                "location" => location);
        }
        self.acquire_one().await
    }

    async fn start_management_machines(
        &self,
        deadline: Deadline,
    ) -> Result<Vec<MachineDetails>, ProvisioningError> {
        let expected = self.config.management_machines;
        let mut machines: Vec<MachineDetails> = Vec::with_capacity(expected);
        for _ in 0..expected {
            let result = match deadline.remaining() {
                Ok(_) => self.acquire_one().await,
                Err(err) => Err(err.into()),
            };
            match result {
                Ok(machine) => machines.push(machine),
                Err(err) => {
                    for machine in &machines {
                        if let Some(addr) = machine.private_address.as_deref() {
                            self.allocated.lock().unwrap().retain(|a| a != addr);
                            self.give_back(addr).await;
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(machines)
    }

    async fn stop_machine(&self, ip: &str, _deadline: Deadline) -> Result<bool, ProvisioningError> {
        let held = {
            let mut allocated = self.allocated.lock().unwrap();
            match allocated.iter().position(|a| a == ip) {
                Some(index) => {
                    allocated.remove(index);
                    true
                }
                None => false,
            }
        };
        if !held {
            warn!(self.log, "stop requested for an address this driver never acquired";
                "addr" => ip);
            return Ok(false);
        }
        self.strategy.release(ip).await?;
        info!(self.log, "returned host to the strategy"; "addr" => ip);
        Ok(true)
    }

    async fn stop_management_machines(&self) -> Result<(), ProvisioningError> {
        let held = std::mem::take(&mut *self.allocated.lock().unwrap());
        if held.is_empty() {
            warn!(self.log, "no acquired hosts to release");
            return Ok(());
        }
        let mut first_error = None;
        for addr in held {
            if let Err(err) = self.strategy.release(&addr).await {
                warn!(self.log, "failed to release host"; "addr" => &addr, "error" => %err);
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn close(&self) {
        debug!(self.log, "closing dynamic inventory driver");
    }
}
