// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Predicate-poll-with-timeout: wait for an external condition to hold.

use std::future::Future;
use std::time::Duration;

use slog::{debug, Logger};

use crate::deadline::{Deadline, TimeoutError};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_TIMEOUT_MESSAGE: &str = "operation timed out";

/// Why a [`ConditionLatch`] wait ended without the condition holding.
#[derive(Debug, thiserror::Error)]
pub enum LatchError<E> {
    /// The deadline passed before the condition held.
    #[error(transparent)]
    TimedOut(#[from] TimeoutError),

    /// The condition itself failed; polling stops immediately.
    #[error("condition evaluation failed: {0}")]
    Failed(E),
}

/// Waits for a predicate to hold, sampling it at a fixed interval until a
/// deadline.
///
/// The predicate is evaluated immediately; while it reports false and the
/// deadline has not been reached, the latch sleeps one interval and
/// re-evaluates. The first true result returns. Once the deadline passes the
/// wait fails with a [`TimeoutError`] carrying the configured message. A
/// predicate error aborts the wait at once; so does cancelling the future.
pub struct ConditionLatch {
    log: Logger,
    deadline: Deadline,
    poll_interval: Duration,
    message: String,
    verbose: bool,
}

impl ConditionLatch {
    pub fn new(log: &Logger, deadline: Deadline) -> ConditionLatch {
        ConditionLatch {
            log: log.clone(),
            deadline,
            poll_interval: DEFAULT_POLL_INTERVAL,
            message: DEFAULT_TIMEOUT_MESSAGE.to_string(),
            verbose: false,
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> ConditionLatch {
        self.poll_interval = interval;
        self
    }

    /// Message attached to the [`TimeoutError`] raised when the deadline
    /// passes.
    pub fn timeout_message<S: Into<String>>(mut self, message: S) -> ConditionLatch {
        self.message = message.into();
        self
    }

    /// Log each poll attempt with the remaining time.
    pub fn verbose(mut self, verbose: bool) -> ConditionLatch {
        self.verbose = verbose;
        self
    }

    pub async fn wait_for<E, F, Fut>(&self, mut cond: F) -> Result<(), LatchError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, E>>,
    {
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            if cond().await.map_err(LatchError::Failed)? {
                return Ok(());
            }

            let remaining = self
                .deadline
                .remaining()
                .map_err(|_| TimeoutError::new(self.message.clone()))?;
            if self.verbose {
                debug!(self.log, "condition does not hold yet";
                    "attempt" => attempt,
                    "remaining" => ?remaining,
                );
            }

            // Never sleep past the deadline; the final evaluation happens
            // right when it expires.
            tokio::time::sleep(self.poll_interval.min(remaining)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use slog::{o, Drain};
    use tokio::time::Instant;

    fn test_logger() -> Logger {
        let decorator = slog_term::PlainSyncDecorator::new(std::io::stderr());
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        Logger::root(drain, o!())
    }

    #[tokio::test(start_paused = true)]
    async fn completes_when_condition_flips() {
        let log = test_logger();
        let start = Instant::now();
        let false_evals = Arc::new(AtomicUsize::new(0));

        let latch = ConditionLatch::new(&log, Deadline::after(Duration::from_millis(1000)))
            .poll_interval(Duration::from_millis(100));

        let counter = false_evals.clone();
        latch
            .wait_for(|| {
                let counter = counter.clone();
                async move {
                    // Flips true at t=350ms on the paused clock.
                    if start.elapsed() >= Duration::from_millis(350) {
                        Ok::<_, Infallible>(true)
                    } else {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(false)
                    }
                }
            })
            .await
            .unwrap();

        // Sampled false at 0, 100, 200 and 300ms, then true at 400ms.
        assert_eq!(false_evals.load(Ordering::SeqCst), 4);
        assert_eq!(start.elapsed(), Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_with_configured_message() {
        let log = test_logger();
        let start = Instant::now();

        let latch = ConditionLatch::new(&log, Deadline::after(Duration::from_millis(1000)))
            .poll_interval(Duration::from_millis(100))
            .timeout_message("management service did not start");

        let err = latch
            .wait_for(|| async { Ok::<_, Infallible>(false) })
            .await
            .unwrap_err();

        match err {
            LatchError::TimedOut(err) => {
                assert_eq!(err.message(), "management service did not start")
            }
            LatchError::Failed(_) => panic!("expected timeout"),
        }
        // The timeout fires exactly once the deadline passes, not before.
        assert_eq!(start.elapsed(), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn predicate_error_aborts_immediately() {
        let log = test_logger();
        let evals = Arc::new(AtomicUsize::new(0));

        let latch = ConditionLatch::new(&log, Deadline::after(Duration::from_secs(60)));
        let counter = evals.clone();
        let err = latch
            .wait_for(|| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<bool, _>(std::io::Error::other("probe exploded"))
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, LatchError::Failed(_)));
        assert_eq!(evals.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn short_final_interval_still_gets_a_last_evaluation() {
        let log = test_logger();
        let start = Instant::now();

        // 250ms deadline with a 100ms interval: evaluations at 0, 100, 200
        // and a final one at 250 when the remaining 50ms elapse.
        let latch = ConditionLatch::new(&log, Deadline::after(Duration::from_millis(250)))
            .poll_interval(Duration::from_millis(100));

        let err = latch
            .wait_for(|| async { Ok::<_, Infallible>(false) })
            .await
            .unwrap_err();
        assert!(matches!(err, LatchError::TimedOut(_)));
        assert_eq!(start.elapsed(), Duration::from_millis(250));
    }
}
