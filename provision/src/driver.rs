// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The capability interface every provisioning backend implements.

use async_trait::async_trait;
use flotilla_common::{Deadline, TimeoutError};

use crate::cloud::NodeState;
use crate::locator::ManagementLocator;
use crate::machine::{AddressMode, MachineDetails};

/// The provider handed back inconsistent or wrong data, or could not supply
/// what was asked of it.
#[derive(Debug, thiserror::Error)]
pub enum ProvisioningError {
    #[error("expected {expected} management machines, provider returned {actual}")]
    WrongMachineCount { expected: usize, actual: usize },

    #[error("machine {machine_id:?} has no address usable in {mode:?} addressing mode")]
    MissingAddress { machine_id: String, mode: AddressMode },

    #[error(
        "no node available for template {template:?} \
         (free: {free}, allocated: {allocated}, invalid: {invalid})"
    )]
    PoolExhausted { template: String, free: usize, allocated: usize, invalid: usize },

    #[error("template {template:?} is not part of this driver's inventory")]
    UnknownTemplate { template: String },

    #[error("server name space exhausted after {limit} probes")]
    NameSpaceExhausted { limit: u32 },

    #[error("node {node_id} entered fatal state {state:?} before running")]
    NodeFailed { node_id: String, state: NodeState },

    #[error("no management machines found with name prefix {prefix:?}")]
    NoManagementMachines { prefix: String },

    #[error("host {addr}:{port} did not accept a connection")]
    Unreachable { addr: String, port: u16 },

    #[error("provider API request failed")]
    Api(#[source] anyhow::Error),

    #[error(transparent)]
    Timeout(#[from] TimeoutError),
}

/// One provisioning backend: acquires and releases machines and knows how to
/// bring up the management set.
///
/// Implementations are a closed set selected by the configuration-driven
/// [`crate::registry::DriverRegistry`]; callers never downcast.
#[async_trait]
pub trait ProvisioningDriver: Send + Sync {
    /// The provider identifier this driver was registered under.
    fn provider(&self) -> &str;

    /// Provision a single machine, optionally in a specific location.
    async fn start_machine(
        &self,
        location_hint: Option<&str>,
        deadline: Deadline,
    ) -> Result<MachineDetails, ProvisioningError>;

    /// Bring up the full set of management machines, or re-discover them.
    ///
    /// Idempotent: when matching management machines are already running and
    /// discoverable this returns them unchanged instead of creating new
    /// ones. Returns exactly the configured number of machines or fails —
    /// never a partial result.
    async fn start_management_machines(
        &self,
        deadline: Deadline,
    ) -> Result<Vec<MachineDetails>, ProvisioningError>;

    /// Stop the machine reachable at `ip`. Returns `false` when no such
    /// machine is known to the provider.
    async fn stop_machine(&self, ip: &str, deadline: Deadline)
        -> Result<bool, ProvisioningError>;

    /// Stop every management machine this driver is responsible for.
    async fn stop_management_machines(&self) -> Result<(), ProvisioningError>;

    /// Release any resources held against the provider.
    async fn close(&self);

    /// The locate-existing-management-machines capability, if this backend
    /// supports it.
    fn locator(&self) -> Option<&dyn ManagementLocator> {
        None
    }
}
