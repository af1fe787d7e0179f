// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Provisioning configuration, deserialized from the operator's TOML file.

use std::collections::BTreeMap;

use camino::Utf8PathBuf;
use serde::Deserialize;

use crate::machine::{
    AddressMode, CustomNode, FileTransferMode, RemoteExecutionMode, DEFAULT_LOGIN_PORT,
};

/// Required fields are missing or invalid, a referenced entity is not
/// defined, or an on-disk artifact could not be loaded. Always fatal.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("failed to read {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("failed to parse {path}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },

    #[error("malformed controllers file {path}")]
    Controllers {
        path: Utf8PathBuf,
        #[source]
        err: serde_json::Error,
    },

    #[error("no provisioning driver registered for provider {provider:?}")]
    UnknownProvider { provider: String },

    #[error("template {template:?} is not defined in the configuration")]
    UnknownTemplate { template: String },

    #[error("no management machine template configured")]
    NoManagementTemplate,

    #[error("provider {provider:?} requires an injected address strategy")]
    MissingStrategy { provider: String },

    #[error("provider {provider:?} requires an API endpoint")]
    MissingEndpoint { provider: String },

    #[error("provider {provider:?} requires API credentials")]
    MissingCredentials { provider: String },
}

/// A machine template: login defaults and provider-side shape for machines
/// provisioned from it.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MachineTemplate {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub key_file: Option<Utf8PathBuf>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub flavor: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default = "default_login_port")]
    pub login_port: u16,
    #[serde(default)]
    pub file_transfer: FileTransferMode,
    #[serde(default)]
    pub remote_execution: RemoteExecutionMode,
    #[serde(default)]
    pub clean_remote_directory: bool,
}

fn default_login_port() -> u16 {
    DEFAULT_LOGIN_PORT
}

/// Identity used against a provider's REST API.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiCredentials {
    pub identity: String,
    pub credential: String,
    #[serde(default)]
    pub project: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProvisioningConfig {
    /// Provider identifier, resolved through the driver registry.
    pub provider: String,

    /// Template management machines are provisioned from.
    pub management_template: String,

    /// Number of management machines forming the control plane.
    pub management_machines: usize,

    /// Name prefix shared by every management machine.
    pub management_group: String,

    /// Upper bound on the server-name counter; names wrap modulo this.
    #[serde(default = "default_max_servers")]
    pub max_servers: u32,

    pub address_mode: AddressMode,

    /// Port probed to recognize a host already running the control plane.
    #[serde(default = "default_control_plane_port")]
    pub control_plane_port: u16,

    #[serde(default)]
    pub templates: BTreeMap<String, MachineTemplate>,

    /// BYON inventory, keyed by template name.
    #[serde(default)]
    pub nodes: BTreeMap<String, Vec<CustomNode>>,

    /// Base URL of the provider's REST API, for the REST-driven variants.
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub api_credentials: Option<ApiCredentials>,
}

fn default_max_servers() -> u32 {
    200
}

fn default_control_plane_port() -> u16 {
    8100
}

impl ProvisioningConfig {
    pub fn management_template(&self) -> Result<&MachineTemplate, ConfigurationError> {
        self.templates
            .get(&self.management_template)
            .ok_or(ConfigurationError::NoManagementTemplate)
    }

    pub fn template(&self, name: &str) -> Result<&MachineTemplate, ConfigurationError> {
        self.templates
            .get(name)
            .ok_or_else(|| ConfigurationError::UnknownTemplate { template: name.to_string() })
    }

    pub fn endpoint(&self) -> Result<&str, ConfigurationError> {
        self.endpoint
            .as_deref()
            .ok_or_else(|| ConfigurationError::MissingEndpoint { provider: self.provider.clone() })
    }

    pub fn api_credentials(&self) -> Result<&ApiCredentials, ConfigurationError> {
        self.api_credentials.as_ref().ok_or_else(|| ConfigurationError::MissingCredentials {
            provider: self.provider.clone(),
        })
    }
}
