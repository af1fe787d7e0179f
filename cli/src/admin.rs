// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! REST client for the management cluster's admin API.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use slog::{debug, o, Logger};

use flotilla_bootstrap::cluster::{ClusterAdmin, ClusterAdminError, JobId};
use flotilla_common::{ConditionLatch, Deadline, LatchError};
use flotilla_provision::locator::probe_host;

const DEFAULT_JOB_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Admin client over the management REST API. Control plane probes go
/// straight to the machines, so an instance without an endpoint still
/// serves bootstrap; application management needs the endpoint.
pub struct RestClusterAdmin {
    log: Logger,
    client: reqwest::Client,
    endpoint: Option<String>,
    control_plane_port: u16,
    probe_timeout: Duration,
    job_poll_interval: Duration,
}

impl RestClusterAdmin {
    pub fn new(
        log: &Logger,
        endpoint: Option<String>,
        control_plane_port: u16,
    ) -> RestClusterAdmin {
        RestClusterAdmin {
            log: log.new(o!("component" => "RestClusterAdmin")),
            client: reqwest::Client::new(),
            endpoint: endpoint.map(|e| e.trim_end_matches('/').to_string()),
            control_plane_port,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            job_poll_interval: DEFAULT_JOB_POLL_INTERVAL,
        }
    }

    pub fn with_job_poll_interval(mut self, interval: Duration) -> RestClusterAdmin {
        self.job_poll_interval = interval;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> RestClusterAdmin {
        self.probe_timeout = timeout;
        self
    }

    fn endpoint(&self) -> Result<&str, ClusterAdminError> {
        self.endpoint.as_deref().ok_or(ClusterAdminError::NotConnected)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: String,
    ) -> Result<T, ClusterAdminError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| ClusterAdminError::Api(anyhow::Error::new(err)))?
            .error_for_status()
            .map_err(|err| ClusterAdminError::Api(anyhow::Error::new(err)))?;
        response.json().await.map_err(|err| ClusterAdminError::Api(anyhow::Error::new(err)))
    }

    async fn job_record(&self, job: &JobId) -> Result<JobRecord, ClusterAdminError> {
        let endpoint = self.endpoint()?;
        self.get_json(format!("{endpoint}/jobs/{job}")).await
    }
}

#[async_trait]
impl ClusterAdmin for RestClusterAdmin {
    async fn is_connected(&self) -> bool {
        let Some(endpoint) = self.endpoint.as_deref() else {
            return false;
        };
        match self.client.get(format!("{endpoint}/status")).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    async fn list_applications(&self) -> Result<Vec<String>, ClusterAdminError> {
        let endpoint = self.endpoint()?;
        let list: ApplicationList = self.get_json(format!("{endpoint}/applications")).await?;
        Ok(list.applications)
    }

    async fn uninstall_application(
        &self,
        name: &str,
        deadline: Deadline,
    ) -> Result<JobId, ClusterAdminError> {
        deadline.remaining()?;
        let endpoint = self.endpoint()?;
        let response = self
            .client
            .delete(format!("{endpoint}/applications/{name}"))
            .send()
            .await
            .map_err(|err| ClusterAdminError::Api(anyhow::Error::new(err)))?
            .error_for_status()
            .map_err(|err| ClusterAdminError::Api(anyhow::Error::new(err)))?;
        let started: JobStarted = response
            .json()
            .await
            .map_err(|err| ClusterAdminError::Api(anyhow::Error::new(err)))?;
        Ok(JobId(started.job_id))
    }

    async fn wait_for_lifecycle_completion(
        &self,
        job: &JobId,
        deadline: Deadline,
    ) -> Result<(), ClusterAdminError> {
        let failure: Mutex<Option<ClusterAdminError>> = Mutex::new(None);
        let latch = ConditionLatch::new(&self.log, deadline)
            .poll_interval(self.job_poll_interval)
            .timeout_message(format!("lifecycle job {job} did not finish in time"));
        let result = latch
            .wait_for(|| {
                let failure = &failure;
                let job = &job;
                async move {
                    let record = self.job_record(job).await?;
                    match record.outcome() {
                        JobOutcome::Running => Ok(false),
                        JobOutcome::Succeeded => Ok(true),
                        JobOutcome::Failed(reason) => {
                            *failure.lock().unwrap() = Some(ClusterAdminError::JobFailed {
                                job: (*job).clone(),
                                reason,
                            });
                            // Terminal; stop polling and report below.
                            Ok(true)
                        }
                    }
                }
            })
            .await;
        match result {
            Ok(()) => match failure.into_inner().unwrap() {
                Some(err) => Err(err),
                None => Ok(()),
            },
            Err(LatchError::TimedOut(err)) => Err(ClusterAdminError::Timeout(err)),
            Err(LatchError::Failed(err)) => Err(err),
        }
    }

    async fn probe_control_plane_hosts(
        &self,
        hosts: &[String],
    ) -> Result<Vec<String>, ClusterAdminError> {
        let mut up = Vec::with_capacity(hosts.len());
        for host in hosts {
            if probe_host(host, self.control_plane_port, self.probe_timeout).await {
                up.push(host.clone());
            } else {
                debug!(self.log, "control plane not answering yet";
                    "host" => host.as_str(),
                    "port" => self.control_plane_port,
                );
            }
        }
        Ok(up)
    }

    async fn disconnect(&self) {
        debug!(self.log, "disconnecting from the admin API");
    }
}

#[derive(Debug, Deserialize)]
struct ApplicationList {
    applications: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct JobStarted {
    job_id: String,
}

#[derive(Debug, Deserialize)]
struct JobRecord {
    state: String,
    #[serde(default)]
    reason: Option<String>,
}

enum JobOutcome {
    Running,
    Succeeded,
    Failed(String),
}

impl JobRecord {
    fn outcome(&self) -> JobOutcome {
        match self.state.as_str() {
            "succeeded" => JobOutcome::Succeeded,
            "failed" => JobOutcome::Failed(
                self.reason.clone().unwrap_or_else(|| "no reason reported".to_string()),
            ),
            _ => JobOutcome::Running,
        }
    }
}
