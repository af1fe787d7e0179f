// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Data entities describing provisioned and inventory hosts.

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::config::ConfigurationError;
use crate::driver::ProvisioningError;

pub const DEFAULT_LOGIN_PORT: u16 = 22;

/// Which address family the orchestrator uses to reach machines.
///
/// Bootstrapping on public IPs requires every machine to carry a public
/// address; connecting on private IPs requires a private one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressMode {
    Public,
    Private,
}

/// A login secret for a remote machine.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteCredential {
    Password(String),
    KeyFile(Utf8PathBuf),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileTransferMode {
    #[default]
    Sftp,
    Scp,
    Cifs,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteExecutionMode {
    #[default]
    Ssh,
    WinRm,
}

/// A machine handed back by a [`crate::driver::ProvisioningDriver`].
///
/// Created by the driver, mutated once during credential resolution, then
/// single-owner in the install task that consumes it.
#[derive(Clone, Debug, Default)]
pub struct MachineDetails {
    pub machine_id: String,
    pub public_address: Option<String>,
    pub private_address: Option<String>,
    pub remote_username: Option<String>,
    pub remote_credential: Option<RemoteCredential>,
    /// The per-machine agent is already registered with the control plane.
    pub agent_running: bool,
    pub control_plane_installed: bool,
    pub location_id: Option<String>,
    pub file_transfer: FileTransferMode,
    pub remote_execution: RemoteExecutionMode,
    pub clean_remote_directory: bool,
}

impl MachineDetails {
    /// The address used to reach this machine in the given mode.
    pub fn address(&self, mode: AddressMode) -> Option<&str> {
        match mode {
            AddressMode::Public => self.public_address.as_deref(),
            AddressMode::Private => self.private_address.as_deref(),
        }
    }

    /// Enforces the addressing invariant: a machine with neither address is
    /// never acceptable, and the configured mode's address must be present.
    pub fn validate_addresses(&self, mode: AddressMode) -> Result<(), ProvisioningError> {
        if self.address(mode).is_none() {
            return Err(ProvisioningError::MissingAddress {
                machine_id: self.machine_id.clone(),
                mode,
            });
        }
        Ok(())
    }
}

/// One member of a bring-your-own-node inventory pool.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CustomNode {
    #[serde(default)]
    pub provider_id: Option<String>,
    pub id: String,
    pub private_ip: String,
    #[serde(default)]
    pub public_ip: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<RemoteCredential>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default = "default_login_port")]
    pub login_port: u16,
    /// Filled in once the node's hostname has been resolved.
    #[serde(default)]
    pub resolved_ip: Option<String>,
}

fn default_login_port() -> u16 {
    DEFAULT_LOGIN_PORT
}

impl CustomNode {
    /// The address to connect to: the resolved IP when known, the configured
    /// private IP otherwise.
    pub fn connect_ip(&self) -> &str {
        self.resolved_ip.as_deref().unwrap_or(&self.private_ip)
    }
}

/// Minimal addressing record used to re-attach to previously-bootstrapped
/// management machines across process restarts.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ControllerDetails {
    #[serde(default)]
    pub private_ip: Option<String>,
    #[serde(default)]
    pub public_ip: Option<String>,
}

impl ControllerDetails {
    pub fn address(&self, mode: AddressMode) -> Option<&str> {
        match mode {
            AddressMode::Public => self.public_ip.as_deref(),
            AddressMode::Private => self.private_ip.as_deref(),
        }
    }
}

/// Loads the persisted re-attach file: an unversioned JSON array of
/// controller addresses. Malformed content is a fatal configuration error.
pub fn load_controllers(path: &Utf8Path) -> Result<Vec<ControllerDetails>, ConfigurationError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|err| ConfigurationError::Io { path: path.to_owned(), err })?;
    serde_json::from_str(&contents)
        .map_err(|err| ConfigurationError::Controllers { path: path.to_owned(), err })
}

pub fn save_controllers(
    path: &Utf8Path,
    controllers: &[ControllerDetails],
) -> Result<(), ConfigurationError> {
    let contents = serde_json::to_string_pretty(controllers)
        .expect("controller details always serialize");
    std::fs::write(path, contents)
        .map_err(|err| ConfigurationError::Io { path: path.to_owned(), err })
}
