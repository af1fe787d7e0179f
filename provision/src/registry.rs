// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Maps a configured provider name to a driver constructor.

use std::collections::BTreeMap;
use std::sync::Arc;

use slog::{info, Logger};

use crate::azure::AzureApi;
use crate::byon::ByonDriver;
use crate::cloud::CloudDriver;
use crate::config::{ConfigurationError, ProvisioningConfig};
use crate::driver::ProvisioningDriver;
use crate::openstack::OpenStackApi;
use crate::{azure, byon, dynamic, openstack};

/// Builds a driver from the provisioning configuration.
pub type DriverFactory = Box<
    dyn Fn(&Logger, &ProvisioningConfig) -> Result<Arc<dyn ProvisioningDriver>, ConfigurationError>
        + Send
        + Sync,
>;

/// Registry of provider names to driver factories. Embedders may add their
/// own providers or replace the built-in ones.
pub struct DriverRegistry {
    factories: BTreeMap<String, DriverFactory>,
}

impl DriverRegistry {
    /// An empty registry with no providers.
    pub fn new() -> DriverRegistry {
        DriverRegistry { factories: BTreeMap::new() }
    }

    /// The registry with every built-in provider.
    ///
    /// The dynamic BYON provider is registered as a placeholder: it needs
    /// an address strategy only the embedder can supply, so selecting it
    /// without re-registering fails with a configuration error.
    pub fn builtin() -> DriverRegistry {
        let mut registry = DriverRegistry::new();
        registry.register(byon::PROVIDER_ID, |log, config| {
            Ok(Arc::new(ByonDriver::new(log, config)?))
        });
        registry.register(openstack::PROVIDER_ID, |log, config| {
            let api = Arc::new(OpenStackApi::new(log, config)?);
            Ok(Arc::new(CloudDriver::new(log, api, config)?))
        });
        registry.register(azure::PROVIDER_ID, |log, config| {
            let api = Arc::new(AzureApi::new(log, config)?);
            Ok(Arc::new(CloudDriver::new(log, api, config)?))
        });
        registry.register(dynamic::PROVIDER_ID, |_log, _config| {
            Err(ConfigurationError::MissingStrategy {
                provider: dynamic::PROVIDER_ID.to_string(),
            })
        });
        registry
    }

    pub fn register<S, F>(&mut self, provider: S, factory: F)
    where
        S: Into<String>,
        F: Fn(&Logger, &ProvisioningConfig) -> Result<Arc<dyn ProvisioningDriver>, ConfigurationError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(provider.into(), Box::new(factory));
    }

    /// Builds the driver named by `config.provider`.
    pub fn create(
        &self,
        log: &Logger,
        config: &ProvisioningConfig,
    ) -> Result<Arc<dyn ProvisioningDriver>, ConfigurationError> {
        let factory = self.factories.get(&config.provider).ok_or_else(|| {
            ConfigurationError::UnknownProvider { provider: config.provider.clone() }
        })?;
        let driver = factory(log, config)?;
        info!(log, "created provisioning driver"; "provider" => driver.provider());
        Ok(driver)
    }
}

impl Default for DriverRegistry {
    fn default() -> DriverRegistry {
        DriverRegistry::builtin()
    }
}
