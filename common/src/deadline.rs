// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Absolute deadlines shared by a batch of concurrent operations.

use std::time::Duration;
use tokio::time::Instant;

/// The single point in time by which a batch of operations must complete.
///
/// Every timeout within the batch is derived from the same `Deadline`, so a
/// task launched later in a long batch inherently gets less time. Copying a
/// `Deadline` into a spawned task keeps it pointing at the same instant.
#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    /// A deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Deadline {
        Deadline { at: Instant::now() + timeout }
    }

    pub fn at(at: Instant) -> Deadline {
        Deadline { at }
    }

    pub fn instant(&self) -> Instant {
        self.at
    }

    pub fn is_elapsed(&self) -> bool {
        Instant::now() >= self.at
    }

    /// Time left until the deadline.
    ///
    /// An already-elapsed deadline is an immediate [`TimeoutError`], never a
    /// zero-length or negative wait.
    pub fn remaining(&self) -> Result<Duration, TimeoutError> {
        let now = Instant::now();
        if now >= self.at {
            Err(TimeoutError::new("operation deadline elapsed"))
        } else {
            Ok(self.at - now)
        }
    }
}

/// A deadline was exceeded. Carries the message configured by whoever set up
/// the wait.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{message}")]
pub struct TimeoutError {
    message: String,
}

impl TimeoutError {
    pub fn new<S: Into<String>>(message: S) -> TimeoutError {
        TimeoutError { message: message.into() }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn remaining_counts_down() {
        let deadline = Deadline::after(Duration::from_secs(10));
        assert_eq!(deadline.remaining().unwrap(), Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(deadline.remaining().unwrap(), Duration::from_secs(6));
        assert!(!deadline.is_elapsed());
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_deadline_is_an_immediate_timeout() {
        let deadline = Deadline::after(Duration::from_secs(1));
        tokio::time::advance(Duration::from_secs(1)).await;

        assert!(deadline.is_elapsed());
        let err = deadline.remaining().unwrap_err();
        assert_eq!(err.message(), "operation deadline elapsed");
    }
}
