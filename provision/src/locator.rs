// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Re-discovery of management machines that are already running.

use std::time::Duration;

use async_trait::async_trait;
use slog::{debug, info, Logger};
use tokio::net::TcpStream;

use crate::machine::{ControllerDetails, MachineDetails};

/// How long a single connectivity probe may take. Probes are expected to
/// fail for most hosts, so this stays short.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Locating existing management machines failed. The three cases are
/// deliberately distinct: callers react differently to "nothing is
/// running", "something is running but not the whole control plane", and
/// "we could not even look".
#[derive(Debug, thiserror::Error)]
pub enum LocateError {
    #[error("no management machines found")]
    NotFound,

    #[error("found {found} management machines, expected {expected}")]
    CountMismatch { expected: usize, found: usize },

    #[error("management machine lookup failed")]
    LookupFailed(#[source] anyhow::Error),
}

/// Capability for locating already-running management machines, given zero
/// or more controller address hints.
#[async_trait]
pub trait ManagementLocator: Send + Sync {
    async fn locate_existing(
        &self,
        hints: &[ControllerDetails],
    ) -> Result<Vec<MachineDetails>, LocateError>;
}

/// Short-timeout TCP connect to `addr:port`. A refused or timed-out
/// connection is an expected negative result, not an error.
pub async fn probe_host(addr: &str, port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect((addr, port))).await,
        Ok(Ok(_))
    )
}

/// Probes each `(connect address, machine)` candidate on the control-plane
/// port and cross-checks the responders against the expected management
/// machine count. Machines that respond are marked as running an agent with
/// the control plane installed.
pub(crate) async fn probe_candidates(
    log: &Logger,
    candidates: Vec<(String, MachineDetails)>,
    port: u16,
    probe_timeout: Duration,
    expected: usize,
) -> Result<Vec<MachineDetails>, LocateError> {
    let mut found = Vec::new();
    for (addr, mut machine) in candidates {
        if probe_host(&addr, port, probe_timeout).await {
            info!(log, "found running management machine";
                "addr" => &addr,
                "machine_id" => &machine.machine_id,
            );
            machine.agent_running = true;
            machine.control_plane_installed = true;
            found.push(machine);
        } else {
            // Not a management machine; expected for most of the pool.
            debug!(log, "host did not answer on the control-plane port";
                "addr" => &addr,
                "port" => port,
            );
        }
    }

    if found.is_empty() {
        Err(LocateError::NotFound)
    } else if found.len() != expected {
        Err(LocateError::CountMismatch { expected, found: found.len() })
    } else {
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use slog::{o, Drain};
    use tokio::net::TcpListener;

    fn test_logger() -> Logger {
        let decorator = slog_term::PlainSyncDecorator::new(std::io::stderr());
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        Logger::root(drain, o!())
    }

    fn candidate(addr: &str) -> (String, MachineDetails) {
        (
            addr.to_string(),
            MachineDetails {
                machine_id: addr.to_string(),
                private_address: Some(addr.to_string()),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn probe_distinguishes_open_and_closed_ports() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open_port = listener.local_addr().unwrap().port();

        assert!(probe_host("127.0.0.1", open_port, Duration::from_secs(1)).await);

        // Grab a port and close it again so nothing is listening there.
        let closed_port = {
            let spare = TcpListener::bind("127.0.0.1:0").await.unwrap();
            spare.local_addr().unwrap().port()
        };
        assert!(!probe_host("127.0.0.1", closed_port, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn responders_are_marked_and_cross_checked() {
        let log = test_logger();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let machines = probe_candidates(
            &log,
            vec![candidate("127.0.0.1")],
            port,
            Duration::from_secs(1),
            1,
        )
        .await
        .unwrap();
        assert_eq!(machines.len(), 1);
        assert!(machines[0].agent_running);
        assert!(machines[0].control_plane_installed);
    }

    #[tokio::test]
    async fn count_mismatch_is_distinct_from_not_found() {
        let log = test_logger();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // One responder when two are expected.
        let err = probe_candidates(
            &log,
            vec![candidate("127.0.0.1")],
            port,
            Duration::from_secs(1),
            2,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, LocateError::CountMismatch { expected: 2, found: 1 }));

        // No responders at all.
        let closed_port = {
            let spare = TcpListener::bind("127.0.0.1:0").await.unwrap();
            spare.local_addr().unwrap().port()
        };
        let err = probe_candidates(
            &log,
            vec![candidate("127.0.0.1")],
            closed_port,
            Duration::from_secs(1),
            1,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, LocateError::NotFound));
    }
}
