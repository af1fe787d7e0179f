// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-machine agent installation: what to install and the surface that
//! performs it.

use async_trait::async_trait;

use flotilla_common::{Deadline, TimeoutError};
use flotilla_provision::machine::{MachineDetails, RemoteCredential};
use flotilla_provision::AddressMode;

/// The remote installation failed or timed out. Failures carry the target
/// address so fan-out errors name the machine at fault.
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("installation on {addr} failed")]
    Failed {
        addr: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Timeout(#[from] TimeoutError),
}

/// Transport security settings applied to an installed agent.
#[derive(Clone, Debug, Default)]
pub struct SecurityProfile {
    pub secured: bool,
    pub keystore_password: Option<String>,
}

/// Everything an [`Installer`] needs to put an agent on one machine.
#[derive(Clone, Debug)]
pub struct InstallationDetails {
    pub machine: MachineDetails,
    /// The address the installer connects to, chosen by the configured
    /// address mode.
    pub connect_addr: String,
    pub username: String,
    pub credential: RemoteCredential,
    /// Addresses of every management machine, used by the installed agent
    /// to find the cluster.
    pub management_addrs: Vec<String>,
    pub zones: Vec<String>,
    pub security: SecurityProfile,
    /// Whether the management web services come up alongside the agent.
    pub web_services: bool,
    pub is_management: bool,
}

impl InstallationDetails {
    /// Assembles the details for one machine. The caller has already run
    /// credential resolution, so a machine without credentials here is a
    /// programming error, not an operator error.
    pub fn for_machine(
        machine: &MachineDetails,
        mode: AddressMode,
        management_addrs: Vec<String>,
        zones: Vec<String>,
        security: SecurityProfile,
        web_services: bool,
        is_management: bool,
    ) -> InstallationDetails {
        let connect_addr = machine
            .address(mode)
            .expect("machine addresses were validated before install")
            .to_string();
        InstallationDetails {
            machine: machine.clone(),
            connect_addr,
            username: machine
                .remote_username
                .clone()
                .expect("credentials were resolved before install"),
            credential: machine
                .remote_credential
                .clone()
                .expect("credentials were resolved before install"),
            management_addrs,
            zones,
            security,
            web_services,
            is_management,
        }
    }

    /// The locator string handed to the agent, one address per management
    /// machine.
    pub fn locator(&self) -> String {
        self.management_addrs.join(",")
    }
}

/// Puts an agent on a remote machine and removes it again.
#[async_trait]
pub trait Installer: Send + Sync {
    async fn install(
        &self,
        details: &InstallationDetails,
        deadline: Deadline,
    ) -> Result<(), InstallError>;
}
