// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared building blocks for the flotilla bootstrapper: wall-clock
//! deadlines and the condition-polling latch that everything waiting on an
//! external condition goes through.

pub mod deadline;
pub mod poll;

pub use deadline::{Deadline, TimeoutError};
pub use poll::{ConditionLatch, LatchError};
