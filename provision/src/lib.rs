// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Machine provisioning for the flotilla control plane.
//!
//! A [`driver::ProvisioningDriver`] acquires and releases machines against
//! one backend: a static bring-your-own-node inventory ([`byon`]), a cloud
//! provider API polled through an explicit node state machine ([`cloud`],
//! with reference REST backends in [`openstack`] and [`azure`]), or an
//! externally-managed address pool ([`dynamic`]). Drivers are constructed
//! through the configuration-driven [`registry::DriverRegistry`] and expose
//! the optional [`locator::ManagementLocator`] capability for re-discovering
//! management machines that are already running.

pub mod azure;
pub mod byon;
pub mod cloud;
pub mod config;
pub mod driver;
pub mod dynamic;
pub mod locator;
pub mod machine;
pub mod name_alloc;
pub mod openstack;
pub mod registry;

pub use config::{ConfigurationError, ProvisioningConfig};
pub use driver::{ProvisioningDriver, ProvisioningError};
pub use locator::{LocateError, ManagementLocator};
pub use machine::{AddressMode, ControllerDetails, CustomNode, MachineDetails};
