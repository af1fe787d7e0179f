// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bring-your-own-node provisioning: machines come from a static inventory
//! pool instead of a cloud API.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use slog::{debug, info, o, warn, Logger};

use flotilla_common::Deadline;

use crate::config::{ConfigurationError, MachineTemplate, ProvisioningConfig};
use crate::driver::{ProvisioningDriver, ProvisioningError};
use crate::locator::{probe_candidates, probe_host, LocateError, ManagementLocator};
use crate::machine::{ControllerDetails, CustomNode, MachineDetails};

pub const PROVIDER_ID: &str = "byon";

/// Inventory pool state: per template name, three disjoint lists. Guarded
/// by one mutex scoped to this pool (and thereby to one driver instance).
#[derive(Default)]
struct TemplateLists {
    free: Vec<CustomNode>,
    allocated: Vec<CustomNode>,
    invalid: Vec<CustomNode>,
}

struct NodePool {
    lists: Mutex<BTreeMap<String, TemplateLists>>,
}

enum Candidate {
    FromFree(CustomNode),
    FromInvalid(CustomNode),
}

impl NodePool {
    fn new(nodes: BTreeMap<String, Vec<CustomNode>>) -> NodePool {
        let lists = nodes
            .into_iter()
            .map(|(template, free)| {
                (template, TemplateLists { free, ..Default::default() })
            })
            .collect();
        NodePool { lists: Mutex::new(lists) }
    }

    /// Takes one node out of the pool for probing. The node is in no list
    /// while the probe runs, so overlapping allocations cannot hand it out
    /// twice.
    fn take_candidate(&self, template: &str) -> Result<Candidate, ProvisioningError> {
        let mut lists = self.lists.lock().unwrap();
        let lists = lists
            .get_mut(template)
            .ok_or_else(|| ProvisioningError::UnknownTemplate { template: template.to_string() })?;
        if !lists.free.is_empty() {
            Ok(Candidate::FromFree(lists.free.remove(0)))
        } else if !lists.invalid.is_empty() {
            Ok(Candidate::FromInvalid(lists.invalid.remove(0)))
        } else {
            Err(ProvisioningError::PoolExhausted {
                template: template.to_string(),
                free: 0,
                allocated: lists.allocated.len(),
                invalid: 0,
            })
        }
    }

    fn put_back(&self, template: &str, node: CustomNode, list: fn(&mut TemplateLists) -> &mut Vec<CustomNode>) {
        let mut lists = self.lists.lock().unwrap();
        if let Some(lists) = lists.get_mut(template) {
            list(lists).push(node);
        }
    }

    fn exhausted(&self, template: &str) -> ProvisioningError {
        let lists = self.lists.lock().unwrap();
        let (free, allocated, invalid) = match lists.get(template) {
            Some(l) => (l.free.len(), l.allocated.len(), l.invalid.len()),
            None => (0, 0, 0),
        };
        ProvisioningError::PoolExhausted { template: template.to_string(), free, allocated, invalid }
    }

    /// Moves the allocated node with the given connect address back to the
    /// free list. Returns false when no allocated node matches.
    fn release(&self, template: &str, ip: &str) -> bool {
        let mut lists = self.lists.lock().unwrap();
        let Some(lists) = lists.get_mut(template) else {
            return false;
        };
        match lists.allocated.iter().position(|node| node_matches(node, ip)) {
            Some(index) => {
                let node = lists.allocated.remove(index);
                lists.free.push(node);
                true
            }
            None => false,
        }
    }

    /// Moves every allocated node for the template back to the free list,
    /// returning how many were released.
    fn release_all(&self, template: &str) -> usize {
        let mut lists = self.lists.lock().unwrap();
        let Some(lists) = lists.get_mut(template) else {
            return 0;
        };
        let released = lists.allocated.len();
        let allocated = std::mem::take(&mut lists.allocated);
        lists.free.extend(allocated);
        released
    }

    /// Marks the node with the given connect address allocated, wherever it
    /// currently sits. Used when a running management machine is discovered
    /// on a node the pool still considers free.
    fn mark_allocated(&self, template: &str, ip: &str) {
        let mut lists = self.lists.lock().unwrap();
        let Some(lists) = lists.get_mut(template) else {
            return;
        };
        for source in [&mut lists.free, &mut lists.invalid] {
            if let Some(index) = source.iter().position(|node| node_matches(node, ip)) {
                let node = source.remove(index);
                lists.allocated.push(node);
                return;
            }
        }
    }

    /// Every node known for the template, across all three lists.
    fn all_nodes(&self, template: &str) -> Result<Vec<CustomNode>, ProvisioningError> {
        let lists = self.lists.lock().unwrap();
        let lists = lists
            .get(template)
            .ok_or_else(|| ProvisioningError::UnknownTemplate { template: template.to_string() })?;
        Ok(lists
            .free
            .iter()
            .chain(lists.allocated.iter())
            .chain(lists.invalid.iter())
            .cloned()
            .collect())
    }
}

fn node_matches(node: &CustomNode, ip: &str) -> bool {
    node.connect_ip() == ip
        || node.private_ip == ip
        || node.public_ip.as_deref() == Some(ip)
        || node.id == ip
}

/// Draws machines from a static inventory of pre-existing hosts.
pub struct ByonDriver {
    log: Logger,
    config: Arc<ProvisioningConfig>,
    pool: NodePool,
    probe_timeout: Duration,
}

impl ByonDriver {
    pub fn new(log: &Logger, config: &ProvisioningConfig) -> Result<ByonDriver, ConfigurationError> {
        // Fail at construction if the management template is missing; every
        // operation needs it.
        config.management_template()?;
        Ok(ByonDriver {
            log: log.new(o!("component" => "ByonDriver")),
            config: Arc::new(config.clone()),
            pool: NodePool::new(config.nodes.clone()),
            probe_timeout: crate::locator::DEFAULT_PROBE_TIMEOUT,
        })
    }

    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> ByonDriver {
        self.probe_timeout = probe_timeout;
        self
    }

    fn template(&self) -> &MachineTemplate {
        // Verified present in `new`.
        self.config.templates.get(&self.config.management_template).unwrap()
    }

    fn machine_from_node(&self, node: &CustomNode) -> MachineDetails {
        let template = self.template();
        MachineDetails {
            machine_id: node.id.clone(),
            public_address: node.public_ip.clone(),
            private_address: Some(node.connect_ip().to_string()),
            remote_username: node.username.clone(),
            remote_credential: node.credential.clone(),
            agent_running: false,
            control_plane_installed: false,
            location_id: node.group.clone(),
            file_transfer: template.file_transfer,
            remote_execution: template.remote_execution,
            clean_remote_directory: template.clean_remote_directory,
        }
    }

    /// Picks a node for the template: free nodes first, with a connectivity
    /// check on the login port; an unreachable free node moves to the
    /// invalid list. When the free list is empty, invalid nodes are
    /// re-probed before giving up.
    async fn allocate_node(&self, template: &str) -> Result<CustomNode, ProvisioningError> {
        match self.pool.take_candidate(template)? {
            Candidate::FromFree(node) => {
                let addr = node.connect_ip().to_string();
                if probe_host(&addr, node.login_port, self.probe_timeout).await {
                    self.pool.put_back(template, node.clone(), |l| &mut l.allocated);
                    return Ok(node);
                }
                warn!(self.log, "inventory node is unreachable, marking invalid";
                    "node_id" => &node.id,
                    "addr" => &addr,
                    "login_port" => node.login_port,
                );
                let port = node.login_port;
                self.pool.put_back(template, node, |l| &mut l.invalid);
                Err(ProvisioningError::Unreachable { addr, port })
            }
            Candidate::FromInvalid(node) => {
                let addr = node.connect_ip().to_string();
                if probe_host(&addr, node.login_port, self.probe_timeout).await {
                    info!(self.log, "previously-invalid node answered, reusing it";
                        "node_id" => &node.id,
                    );
                    self.pool.put_back(template, node.clone(), |l| &mut l.allocated);
                    return Ok(node);
                }
                self.pool.put_back(template, node, |l| &mut l.invalid);
                Err(self.pool.exhausted(template))
            }
        }
    }
}

#[async_trait]
impl ProvisioningDriver for ByonDriver {
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
            debug!(self.log, "inventory nodes have fixed locations, ignoring hint";
                "location" => location);
        }
        let node = self.allocate_node(&self.config.management_template).await?;
        info!(self.log, "allocated inventory node";
            "node_id" => &node.id,
            "addr" => node.connect_ip(),
        );
        Ok(self.machine_from_node(&node))
    }

    async fn start_management_machines(
        &self,
        deadline: Deadline,
    ) -> Result<Vec<MachineDetails>, ProvisioningError> {
        // Re-discovery first: a management cluster that is already running
        // is returned as-is.
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
        let mut machines: Vec<MachineDetails> = Vec::with_capacity(expected);
        for _ in 0..expected {
            let result = match deadline.remaining() {
                Ok(_) => self.start_machine(None, deadline).await,
                Err(err) => Err(err.into()),
            };
            match result {
                Ok(machine) => machines.push(machine),
                Err(err) => {
                    // Return what we took so the pool does not leak nodes.
                    for machine in &machines {
                        if let Some(addr) = machine.private_address.as_deref() {
                            self.pool.release(&self.config.management_template, addr);
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(machines)
    }

    async fn stop_machine(
        &self,
        ip: &str,
        _deadline: Deadline,
    ) -> Result<bool, ProvisioningError> {
        let released = self.pool.release(&self.config.management_template, ip);
        if released {
            info!(self.log, "returned node to the free pool"; "addr" => ip);
        } else {
            warn!(self.log, "stop requested for an address not in the allocated pool";
                "addr" => ip);
        }
        Ok(released)
    }

    async fn stop_management_machines(&self) -> Result<(), ProvisioningError> {
        let released = self.pool.release_all(&self.config.management_template);
        if released == 0 {
            warn!(self.log, "no allocated management nodes to release");
        } else {
            info!(self.log, "released management nodes"; "count" => released);
        }
        Ok(())
    }

    async fn close(&self) {
        debug!(self.log, "closing inventory driver");
    }

    fn locator(&self) -> Option<&dyn ManagementLocator> {
        Some(self)
    }
}

#[async_trait]
impl ManagementLocator for ByonDriver {
    async fn locate_existing(
        &self,
        hints: &[ControllerDetails],
    ) -> Result<Vec<MachineDetails>, LocateError> {
        let candidates: Vec<(String, MachineDetails)> = if hints.is_empty() {
            // Probe the whole inventory pool for a live control plane.
            let nodes = self
                .pool
                .all_nodes(&self.config.management_template)
                .map_err(|err| LocateError::LookupFailed(anyhow::Error::new(err)))?;
            nodes
                .iter()
                .map(|node| (node.connect_ip().to_string(), self.machine_from_node(node)))
                .collect()
        } else {
            hints
                .iter()
                .filter_map(|hint| {
                    let addr = hint
                        .address(self.config.address_mode)
                        .or(hint.private_ip.as_deref())
                        .or(hint.public_ip.as_deref())?;
                    Some((
                        addr.to_string(),
                        MachineDetails {
                            machine_id: addr.to_string(),
                            public_address: hint.public_ip.clone(),
                            private_address: hint.private_ip.clone(),
                            ..Default::default()
                        },
                    ))
                })
                .collect()
        };

        let found = probe_candidates(
            &self.log,
            candidates,
            self.config.control_plane_port,
            self.probe_timeout,
            self.config.management_machines,
        )
        .await?;

        // Nodes hosting a discovered control plane must not be handed out
        // again by later allocations.
        for machine in &found {
            if let Some(addr) = machine.private_address.as_deref() {
                self.pool.mark_allocated(&self.config.management_template, addr);
            }
        }
        Ok(found)
    }
}
