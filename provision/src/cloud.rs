// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Generic cloud-API provisioning: a [`CloudDriver`] drives any compute API
//! implementing [`CloudApi`] through the create, poll-until-running, destroy
//! lifecycle.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use slog::{debug, info, o, warn, Logger};

use flotilla_common::{ConditionLatch, Deadline, LatchError};

use crate::config::{ConfigurationError, MachineTemplate, ProvisioningConfig};
use crate::driver::{ProvisioningDriver, ProvisioningError};
use crate::locator::{LocateError, ManagementLocator};
use crate::machine::{ControllerDetails, MachineDetails, RemoteCredential};
use crate::name_alloc::NameAllocator;

/// Default interval between node status polls while waiting for a node to
/// come up or go away.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Coarse lifecycle state of a cloud node, as normalized from the provider's
/// own status vocabulary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    /// Still being built by the provider.
    Pending,
    /// Up and addressable.
    Running,
    /// Gone, or shut down for good.
    Terminated,
    /// The provider gave up on it.
    Error,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Pending => "pending",
            NodeState::Running => "running",
            NodeState::Terminated => "terminated",
            NodeState::Error => "error",
        };
        write!(f, "{s}")
    }
}

impl NodeState {
    /// A state the node cannot recover from.
    pub fn is_fatal(&self) -> bool {
        matches!(self, NodeState::Terminated | NodeState::Error)
    }
}

/// A compute instance as reported by the provider.
#[derive(Clone, Debug)]
pub struct CloudNode {
    pub id: String,
    pub name: String,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    pub state: NodeState,
    pub location: Option<String>,
}

/// The provider-specific surface a [`CloudDriver`] runs against. REST
/// bindings implement this; tests drop in an in-memory fake.
#[async_trait]
pub trait CloudApi: Send + Sync {
    fn provider(&self) -> &str;

    async fn create_node(
        &self,
        name: &str,
        template: &MachineTemplate,
        location: Option<&str>,
    ) -> Result<CloudNode, ProvisioningError>;

    async fn node_state(&self, id: &str) -> Result<NodeState, ProvisioningError>;

    async fn get_node(&self, id: &str) -> Result<CloudNode, ProvisioningError>;

    async fn find_by_name(&self, name: &str) -> Result<Option<CloudNode>, ProvisioningError>;

    async fn find_by_ip(&self, ip: &str) -> Result<Option<CloudNode>, ProvisioningError>;

    /// All nodes whose name starts with the given prefix.
    async fn list_prefixed(&self, prefix: &str) -> Result<Vec<CloudNode>, ProvisioningError>;

    async fn destroy_node(&self, id: &str) -> Result<(), ProvisioningError>;

    /// The password the provider generated for the node, once available.
    /// Providers without generated passwords keep the default.
    async fn generated_secret(&self, _id: &str) -> Result<Option<String>, ProvisioningError> {
        Ok(None)
    }

    async fn close(&self) {}
}

/// Lifecycle driver over a [`CloudApi`].
///
/// Cloneable so management fan-out can hand one handle per spawned task;
/// clones share the API, the config, and the name counter.
#[derive(Clone)]
pub struct CloudDriver {
    log: Logger,
    api: Arc<dyn CloudApi>,
    config: Arc<ProvisioningConfig>,
    names: Arc<NameAllocator>,
    poll_interval: Duration,
}

impl CloudDriver {
    pub fn new(
        log: &Logger,
        api: Arc<dyn CloudApi>,
        config: &ProvisioningConfig,
    ) -> Result<CloudDriver, ConfigurationError> {
        config.management_template()?;
        Ok(CloudDriver {
            log: log.new(o!(
                "component" => "CloudDriver",
                "provider" => api.provider().to_string(),
            )),
            names: Arc::new(NameAllocator::new(config.management_group.as_str(), config.max_servers)),
            api,
            config: Arc::new(config.clone()),
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> CloudDriver {
        self.poll_interval = poll_interval;
        self
    }

    pub fn api(&self) -> &Arc<dyn CloudApi> {
        &self.api
    }

    fn template(&self) -> &MachineTemplate {
        // Verified present in `new`.
        self.config.templates.get(&self.config.management_template).unwrap()
    }

    fn machine_from_node(&self, node: &CloudNode) -> MachineDetails {
        let template = self.template();
        let credential = if let Some(password) = &template.password {
            Some(RemoteCredential::Password(password.clone()))
        } else {
            template.key_file.clone().map(RemoteCredential::KeyFile)
        };
        MachineDetails {
            machine_id: node.id.clone(),
            public_address: node.public_ip.clone(),
            private_address: node.private_ip.clone(),
            remote_username: template.username.clone(),
            remote_credential: credential,
            agent_running: false,
            control_plane_installed: false,
            location_id: node.location.clone(),
            file_transfer: template.file_transfer,
            remote_execution: template.remote_execution,
            clean_remote_directory: template.clean_remote_directory,
        }
    }

    async fn allocate_name(&self) -> Result<String, ProvisioningError> {
        let api = &self.api;
        self.names
            .allocate(|name| async move { Ok(api.find_by_name(&name).await?.is_some()) })
            .await
    }

    /// Polls the node until it reports running, then refetches it so the
    /// caller sees its assigned addresses. A fatal state aborts the wait; a
    /// timeout leaves the node as it is, since it may still come up and the
    /// caller decides whether to tear it down.
    async fn wait_until_running(
        &self,
        node_id: &str,
        deadline: Deadline,
    ) -> Result<CloudNode, ProvisioningError> {
        let latch = ConditionLatch::new(&self.log, deadline)
            .poll_interval(self.poll_interval)
            .timeout_message(format!("node {node_id} did not reach the running state in time"));
        let result = latch
            .wait_for(|| async {
                match self.api.node_state(node_id).await? {
                    NodeState::Running => Ok(true),
                    NodeState::Pending => Ok(false),
                    state => Err(ProvisioningError::NodeFailed {
                        node_id: node_id.to_string(),
                        state,
                    }),
                }
            })
            .await;
        match result {
            Ok(()) => self.api.get_node(node_id).await,
            Err(LatchError::TimedOut(err)) => Err(ProvisioningError::Timeout(err)),
            Err(LatchError::Failed(err)) => Err(err),
        }
    }

    /// Creates one node and waits for it to run. On a fatal node state the
    /// half-built node is destroyed before the error is returned; on a
    /// timeout it is left in place.
    async fn start_one(
        &self,
        location_hint: Option<&str>,
        deadline: Deadline,
    ) -> Result<MachineDetails, ProvisioningError> {
        let template = self.template();
        let name = self.allocate_name().await?;
        let location = location_hint.or(template.location.as_deref());
        info!(self.log, "creating node"; "name" => &name, "location" => location);
        let node = self.api.create_node(&name, template, location).await?;
        match self.wait_until_running(&node.id, deadline).await {
            Ok(node) => {
                let machine = self.machine_from_node(&node);
                if let Err(err) = machine.validate_addresses(self.config.address_mode) {
                    warn!(self.log, "node is running but missing its address, destroying it";
                        "node_id" => &node.id);
                    if let Err(destroy_err) = self.api.destroy_node(&node.id).await {
                        warn!(self.log, "failed to destroy broken node";
                            "node_id" => &node.id,
                            "error" => %destroy_err,
                        );
                    }
                    return Err(err);
                }
                info!(self.log, "node is running";
                    "node_id" => &node.id,
                    "name" => &node.name,
                );
                Ok(machine)
            }
            Err(err @ ProvisioningError::Timeout(_)) => {
                warn!(self.log, "node did not come up before the deadline, leaving it in place";
                    "node_id" => &node.id);
                Err(err)
            }
            Err(err) => {
                warn!(self.log, "node failed to come up, destroying it";
                    "node_id" => &node.id,
                    "error" => %err,
                );
                if let Err(destroy_err) = self.api.destroy_node(&node.id).await {
                    warn!(self.log, "failed to destroy broken node";
                        "node_id" => &node.id,
                        "error" => %destroy_err,
                    );
                }
                Err(err)
            }
        }
    }

    async fn destroy_machines(&self, machines: &[MachineDetails]) {
        for machine in machines {
            if let Err(err) = self.api.destroy_node(&machine.machine_id).await {
                warn!(self.log, "rollback failed to destroy node";
                    "node_id" => &machine.machine_id,
                    "error" => %err,
                );
            }
        }
    }
}

#[async_trait]
impl ProvisioningDriver for CloudDriver {
    fn provider(&self) -> &str {
        self.api.provider()
    }

    async fn start_machine(
        &self,
        location_hint: Option<&str>,
        deadline: Deadline,
    ) -> Result<MachineDetails, ProvisioningError> {
        deadline.remaining()?;
        self.start_one(location_hint, deadline).await
    }

    async fn start_management_machines(
        &self,
        deadline: Deadline,
    ) -> Result<Vec<MachineDetails>, ProvisioningError> {
        match self.locate_existing(&[]).await {
            Ok(found) => {
                info!(self.log, "management machines already running";
                    "count" => found.len());
                return Ok(found);
            }
            Err(LocateError::NotFound) => {}
            Err(LocateError::CountMismatch { expected, found }) => {
                return Err(ProvisioningError::WrongMachineCount { expected, actual: found });
            }
            Err(LocateError::LookupFailed(err)) => {
                return Err(ProvisioningError::Api(err));
            }
        }

        let expected = self.config.management_machines;
        info!(self.log, "starting management machines"; "count" => expected);
        let starts: Vec<_> = (0..expected)
            .map(|_| {
                let driver = self.clone();
                async move { driver.start_one(None, deadline).await }
            })
            .collect();

        // The futures run inside this task, so cancelling the caller
        // cancels every in-flight creation. Results come back in
        // submission order so the error reported is always the first
        // submitted creation's failure.
        let mut machines = Vec::with_capacity(expected);
        let mut first_error = None;
        for result in futures::future::join_all(starts).await {
            match result {
                Ok(machine) => machines.push(machine),
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    } else {
                        warn!(self.log, "additional machine failed during fan-out";
                            "error" => %err);
                    }
                }
            }
        }

        if let Some(err) = first_error {
            warn!(self.log, "management fan-out failed, destroying started machines";
                "started" => machines.len(),
                "error" => %err,
            );
            self.destroy_machines(&machines).await;
            return Err(err);
        }
        Ok(machines)
    }

    async fn stop_machine(&self, ip: &str, deadline: Deadline) -> Result<bool, ProvisioningError> {
        let Some(node) = self.api.find_by_ip(ip).await? else {
            warn!(self.log, "no node owns this address, nothing to stop"; "addr" => ip);
            return Ok(false);
        };
        info!(self.log, "destroying node"; "node_id" => &node.id, "addr" => ip);
        self.api.destroy_node(&node.id).await?;

        let latch = ConditionLatch::new(&self.log, deadline)
            .poll_interval(self.poll_interval)
            .timeout_message(format!("node {} was not destroyed in time", node.id));
        let result = latch
            .wait_for(|| async {
                match self.api.find_by_ip(ip).await? {
                    None => Ok(true),
                    Some(node) => Ok(node.state == NodeState::Terminated),
                }
            })
            .await;
        match result {
            Ok(()) => Ok(true),
            Err(LatchError::TimedOut(err)) => Err(ProvisioningError::Timeout(err)),
            Err(LatchError::Failed(err)) => Err(err),
        }
    }

    async fn stop_management_machines(&self) -> Result<(), ProvisioningError> {
        let nodes = self.api.list_prefixed(&self.config.management_group).await?;
        if nodes.is_empty() {
            return Err(ProvisioningError::NoManagementMachines {
                prefix: self.config.management_group.clone(),
            });
        }
        let mut first_error = None;
        for node in nodes {
            info!(self.log, "destroying management node";
                "node_id" => &node.id,
                "name" => &node.name,
            );
            if let Err(err) = self.api.destroy_node(&node.id).await {
                warn!(self.log, "failed to destroy management node";
                    "node_id" => &node.id,
                    "error" => %err,
                );
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
        debug!(self.log, "closing cloud driver");
        self.api.close().await;
    }

    fn locator(&self) -> Option<&dyn ManagementLocator> {
        Some(self)
    }
}

#[async_trait]
impl ManagementLocator for CloudDriver {
    async fn locate_existing(
        &self,
        hints: &[ControllerDetails],
    ) -> Result<Vec<MachineDetails>, LocateError> {
        let nodes = if hints.is_empty() {
            self.api
                .list_prefixed(&self.config.management_group)
                .await
                .map_err(|err| LocateError::LookupFailed(anyhow::Error::new(err)))?
        } else {
            let mut nodes = Vec::with_capacity(hints.len());
            for hint in hints {
                let Some(addr) = hint
                    .address(self.config.address_mode)
                    .or(hint.private_ip.as_deref())
                    .or(hint.public_ip.as_deref())
                else {
                    continue;
                };
                let found = self
                    .api
                    .find_by_ip(addr)
                    .await
                    .map_err(|err| LocateError::LookupFailed(anyhow::Error::new(err)))?;
                if let Some(node) = found {
                    nodes.push(node);
                } else {
                    debug!(self.log, "no node found for recorded controller address";
                        "addr" => addr);
                }
            }
            nodes
        };

        let running: Vec<&CloudNode> =
            nodes.iter().filter(|node| node.state == NodeState::Running).collect();
        if running.is_empty() {
            return Err(LocateError::NotFound);
        }
        let expected = self.config.management_machines;
        if running.len() != expected {
            return Err(LocateError::CountMismatch { expected, found: running.len() });
        }
        Ok(running
            .into_iter()
            .map(|node| {
                let mut machine = self.machine_from_node(node);
                machine.agent_running = true;
                machine.control_plane_installed = true;
                machine
            })
            .collect())
    }
}
