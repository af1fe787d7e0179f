// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Operator configuration for the `flotilla` command.

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use flotilla_provision::{ConfigurationError, ProvisioningConfig};

/// The whole operator config file: session shaping at the top level, the
/// provider-specific pieces under `[provisioning]`.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Where controller addresses are persisted between invocations.
    #[serde(default)]
    pub managers_file: Option<Utf8PathBuf>,

    /// Placement zones handed to every installed agent.
    #[serde(default)]
    pub zones: Vec<String>,

    /// Whether the management web services come up during bootstrap.
    #[serde(default = "default_web_services")]
    pub web_services: bool,

    #[serde(default)]
    pub security: SecurityConfig,

    pub install: InstallConfig,

    #[serde(default)]
    pub admin: AdminConfig,

    pub provisioning: ProvisioningConfig,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecurityConfig {
    #[serde(default)]
    pub secured: bool,
    #[serde(default)]
    pub keystore_password: Option<String>,
}

/// The external command that installs the agent on one machine.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstallConfig {
    pub command: Utf8PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdminConfig {
    /// Base URL of the management admin API, used by teardown. Bootstrap
    /// probes the machines directly and needs no endpoint.
    #[serde(default)]
    pub endpoint: Option<String>,
}

fn default_web_services() -> bool {
    true
}

impl Config {
    pub fn from_file(path: &Utf8Path) -> Result<Config, ConfigurationError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|err| ConfigurationError::Io { path: path.to_owned(), err })?;
        toml::from_str(&contents)
            .map_err(|err| ConfigurationError::Parse { path: path.to_owned(), err })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use camino_tempfile::Utf8TempDir;

    const EXAMPLE: &str = r#"
        managers_file = "/var/lib/flotilla/managers.json"
        zones = ["zone-a", "zone-b"]

        [security]
        secured = true
        keystore_password = "changeit"

        [install]
        command = "/usr/libexec/flotilla-install"
        args = ["--retries", "3"]

        [provisioning]
        provider = "byon"
        management_template = "manager"
        management_machines = 2
        management_group = "flotilla-manager-"
        address_mode = "private"

        [provisioning.templates.manager]
        username = "admin"
        password = "hunter2"

        [[provisioning.nodes.manager]]
        id = "rack1-n1"
        private_ip = "10.0.0.1"
    "#;

    #[test]
    fn example_config_parses() {
        let dir = Utf8TempDir::new().unwrap();
        let path = dir.path().join("flotilla.toml");
        std::fs::write(&path, EXAMPLE).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.zones, vec!["zone-a".to_string(), "zone-b".to_string()]);
        assert!(config.web_services, "web services default on");
        assert!(config.security.secured);
        assert_eq!(config.install.command, "/usr/libexec/flotilla-install");
        assert_eq!(config.provisioning.provider, "byon");
        assert_eq!(config.provisioning.management_machines, 2);
        assert!(config.admin.endpoint.is_none());
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = Config::from_file(Utf8Path::new("/nonexistent/flotilla.toml")).unwrap_err();
        assert!(matches!(err, ConfigurationError::Io { .. }));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = Utf8TempDir::new().unwrap();
        let path = dir.path().join("flotilla.toml");
        std::fs::write(&path, format!("{EXAMPLE}\ntypo_key = 1\n")).unwrap();

        let err = Config::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigurationError::Parse { .. }));
    }
}
