// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Orchestration of management cluster bootstrap and teardown.
//!
//! [`service::BootstrapService`] drives a session end to end: machines come
//! from a `flotilla-provision` driver, agents go on through an
//! [`install::Installer`], login secrets resolve through the
//! [`credentials`] fallback chain, and the running cluster is administered
//! through a [`cluster::ClusterAdmin`].

pub mod cluster;
pub mod credentials;
pub mod install;
pub mod service;

pub use cluster::{ClusterAdmin, ClusterAdminError, JobId};
pub use credentials::{CredentialError, CredentialFetcher};
pub use install::{InstallError, InstallationDetails, Installer};
pub use service::{BootstrapError, BootstrapOptions, BootstrapService, SessionState};
