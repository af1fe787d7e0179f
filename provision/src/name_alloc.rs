// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Candidate server-name allocation.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::driver::ProvisioningError;

/// Produces candidate server names `prefix1 .. prefixN` from a bounded,
/// wrapping counter owned by the driver instance.
///
/// Each candidate is checked against the provider or inventory for a
/// collision; after `limit` failed probes allocation fails. The counter
/// wraps modulo `limit`, intentionally reusing old names — callers must
/// guarantee that prior machines with a reused name are fully
/// decommissioned, otherwise a not-yet-reaped machine can collide.
pub struct NameAllocator {
    prefix: String,
    limit: u32,
    counter: AtomicU32,
}

impl NameAllocator {
    pub fn new<S: Into<String>>(prefix: S, limit: u32) -> NameAllocator {
        NameAllocator::with_counter(prefix, limit, 0)
    }

    /// Starts the counter at a known suffix; the next candidate is
    /// `counter % limit + 1`.
    pub fn with_counter<S: Into<String>>(prefix: S, limit: u32, counter: u32) -> NameAllocator {
        assert!(limit > 0, "name allocator needs a positive limit");
        NameAllocator { prefix: prefix.into(), limit, counter: AtomicU32::new(counter) }
    }

    /// Allocates the next free name, where `in_use` answers whether a
    /// candidate already exists at the provider.
    pub async fn allocate<F, Fut>(&self, mut in_use: F) -> Result<String, ProvisioningError>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<bool, ProvisioningError>>,
    {
        for _ in 0..self.limit {
            let previous = self
                .counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| Some(c % self.limit + 1))
                .expect("fetch_update closure never returns None");
            let suffix = previous % self.limit + 1;
            let candidate = format!("{}{}", self.prefix, suffix);
            if !in_use(candidate.clone()).await? {
                return Ok(candidate);
            }
        }
        Err(ProvisioningError::NameSpaceExhausted { limit: self.limit })
    }
}
