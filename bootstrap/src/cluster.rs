// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Administrative surface of a running management cluster.

use std::fmt;

use async_trait::async_trait;

use flotilla_common::{Deadline, TimeoutError};

/// The application hosting the management services themselves. It is never
/// uninstalled by teardown; stopping the machines takes it down.
pub const MANAGEMENT_APPLICATION: &str = "management";

/// Identifier of an asynchronous lifecycle job started by the cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobId(pub String);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterAdminError {
    #[error("not connected to a management cluster")]
    NotConnected,

    #[error("lifecycle job {job} failed: {reason}")]
    JobFailed { job: JobId, reason: String },

    #[error("cluster API request failed")]
    Api(#[source] anyhow::Error),

    #[error(transparent)]
    Timeout(#[from] TimeoutError),
}

/// Client-side view of the management cluster's admin API.
#[async_trait]
pub trait ClusterAdmin: Send + Sync {
    async fn is_connected(&self) -> bool;

    /// Names of every deployed application, the management application
    /// included.
    async fn list_applications(&self) -> Result<Vec<String>, ClusterAdminError>;

    /// Starts uninstalling an application and returns the lifecycle job
    /// tracking it.
    async fn uninstall_application(
        &self,
        name: &str,
        deadline: Deadline,
    ) -> Result<JobId, ClusterAdminError>;

    /// Waits for a lifecycle job to finish, failing if the job reports an
    /// error or the deadline passes first.
    async fn wait_for_lifecycle_completion(
        &self,
        job: &JobId,
        deadline: Deadline,
    ) -> Result<(), ClusterAdminError>;

    /// Which of the given hosts answer on the control plane port.
    async fn probe_control_plane_hosts(
        &self,
        hosts: &[String],
    ) -> Result<Vec<String>, ClusterAdminError>;

    async fn disconnect(&self);
}
