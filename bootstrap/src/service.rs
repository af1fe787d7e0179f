// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bootstrap and teardown orchestration for a management cluster.
//!
//! A bootstrap session moves through acquisition, validation, credential
//! resolution, concurrent installation, and a wait for the management
//! services, compensating on failure by stopping every machine it started.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use camino::Utf8PathBuf;
use slog::{debug, info, o, warn, Logger};

use flotilla_common::{ConditionLatch, Deadline, LatchError, TimeoutError};
use flotilla_provision::config::ConfigurationError;
use flotilla_provision::locator::LocateError;
use flotilla_provision::machine::{load_controllers, save_controllers, ControllerDetails};
use flotilla_provision::{MachineDetails, ProvisioningConfig, ProvisioningDriver, ProvisioningError};

use crate::cluster::{ClusterAdmin, ClusterAdminError, MANAGEMENT_APPLICATION};
use crate::credentials::{resolve_credentials, CredentialError, CredentialFetcher};
use crate::install::{InstallError, InstallationDetails, Installer, SecurityProfile};

/// How long a compensating rollback gets, independent of the (possibly
/// already elapsed) session deadline.
const ROLLBACK_TIMEOUT: Duration = Duration::from_secs(300);

const DEFAULT_SERVICE_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("machine provisioning failed")]
    Provisioning(#[from] ProvisioningError),

    #[error("agent installation failed")]
    Install(#[from] InstallError),

    #[error("credential resolution failed")]
    Credential(#[from] CredentialError),

    #[error("cluster administration failed")]
    Admin(#[from] ClusterAdminError),

    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    #[error("not connected to a management cluster; teardown requires force")]
    NotConnected,

    #[error("provider {provider:?} cannot re-attach to existing machines")]
    ReattachUnsupported { provider: String },
}

/// Where a bootstrap session currently stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Init,
    AcquiringMachines,
    Validating,
    ResolvingCredentials,
    Installing,
    WaitingForServices,
    Ready,
    TearingDown,
}

/// Operator-facing knobs that shape a session without being part of the
/// provisioning configuration.
#[derive(Clone, Debug, Default)]
pub struct BootstrapOptions {
    /// Placement zones handed to every installed agent.
    pub zones: Vec<String>,
    pub security: SecurityProfile,
    /// Whether the management web services come up alongside the agents.
    pub web_services: bool,
    /// Where controller addresses are persisted for later re-attachment.
    pub managers_file: Option<Utf8PathBuf>,
    /// Re-attach to already-running management machines instead of starting
    /// new ones.
    pub use_existing: bool,
    pub service_poll_interval: Option<Duration>,
    /// Narrate every service-readiness poll attempt.
    pub verbose: bool,
}

pub struct BootstrapService {
    log: Logger,
    driver: Arc<dyn ProvisioningDriver>,
    installer: Arc<dyn Installer>,
    admin: Arc<dyn ClusterAdmin>,
    fetcher: Option<Arc<dyn CredentialFetcher>>,
    config: Arc<ProvisioningConfig>,
    options: BootstrapOptions,
    state: Mutex<SessionState>,
}

impl BootstrapService {
    pub fn new(
        log: &Logger,
        driver: Arc<dyn ProvisioningDriver>,
        installer: Arc<dyn Installer>,
        admin: Arc<dyn ClusterAdmin>,
        fetcher: Option<Arc<dyn CredentialFetcher>>,
        config: ProvisioningConfig,
        options: BootstrapOptions,
    ) -> BootstrapService {
        BootstrapService {
            log: log.new(o!("component" => "BootstrapService")),
            driver,
            installer,
            admin,
            fetcher,
            config: Arc::new(config),
            options,
            state: Mutex::new(SessionState::Init),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: SessionState) {
        debug!(self.log, "session state change"; "state" => ?state);
        *self.state.lock().unwrap() = state;
    }

    /// Brings up the management cluster and returns its machines.
    ///
    /// Every phase is bounded by the one session deadline. On failure after
    /// machines were acquired, each of them is stopped before the error is
    /// returned; rollback failures are logged, never surfaced over the
    /// original error.
    pub async fn bootstrap(
        &self,
        deadline: Deadline,
    ) -> Result<Vec<MachineDetails>, BootstrapError> {
        self.set_state(SessionState::AcquiringMachines);
        let mut machines = if self.options.use_existing {
            self.locate_machines().await?
        } else {
            self.driver.start_management_machines(deadline).await?
        };

        self.set_state(SessionState::Validating);
        if let Err(err) = self.validate_machines(&machines) {
            self.roll_back(&machines).await;
            return Err(err);
        }

        let pending_install: Vec<usize> = machines
            .iter()
            .enumerate()
            .filter(|(_, m)| !m.control_plane_installed)
            .map(|(i, _)| i)
            .collect();

        if !pending_install.is_empty() {
            self.set_state(SessionState::ResolvingCredentials);
            if let Err(err) = self.resolve_all(&mut machines, &pending_install, deadline).await {
                return Err(err);
            }

            self.set_state(SessionState::Installing);
            let management_addrs = self.management_addrs(&machines);
            if let Err(err) =
                self.install_all(&machines, &pending_install, &management_addrs, deadline).await
            {
                self.roll_back(&machines).await;
                return Err(err);
            }

            self.set_state(SessionState::WaitingForServices);
            if let Err(err) = self.wait_for_services(&management_addrs, deadline).await {
                self.roll_back(&machines).await;
                return Err(err);
            }
            for machine in &mut machines {
                machine.agent_running = true;
                machine.control_plane_installed = true;
            }
        } else {
            info!(self.log, "all management machines already carry the control plane");
        }

        self.persist_controllers(&machines)?;
        self.set_state(SessionState::Ready);
        info!(self.log, "management cluster is ready"; "machines" => machines.len());
        Ok(machines)
    }

    /// Takes the cluster down: uninstalls the hosted applications, then
    /// stops the management machines. With `force`, connectivity and
    /// uninstall failures are logged and teardown presses on to the
    /// machines.
    pub async fn teardown(&self, force: bool, deadline: Deadline) -> Result<(), BootstrapError> {
        self.set_state(SessionState::TearingDown);
        let connected = self.admin.is_connected().await;
        if connected {
            if let Err(err) = self.uninstall_applications(deadline).await {
                if !force {
                    return Err(err);
                }
                warn!(self.log, "ignoring uninstall failure under force"; "error" => %err);
            }
        } else if force {
            warn!(self.log, "not connected to the cluster, force-stopping its machines");
        } else {
            return Err(BootstrapError::NotConnected);
        }

        self.driver.stop_management_machines().await?;
        if connected {
            self.admin.disconnect().await;
        }
        self.forget_controllers();
        self.driver.close().await;
        self.set_state(SessionState::Init);
        info!(self.log, "management cluster torn down");
        Ok(())
    }

    /// Re-attach path: the persisted controller addresses (when present)
    /// seed the driver's locator.
    async fn locate_machines(&self) -> Result<Vec<MachineDetails>, BootstrapError> {
        let hints: Vec<ControllerDetails> = match &self.options.managers_file {
            Some(path) if path.as_std_path().exists() => load_controllers(path)?,
            _ => Vec::new(),
        };
        let locator = self.driver.locator().ok_or_else(|| {
            BootstrapError::ReattachUnsupported { provider: self.driver.provider().to_string() }
        })?;
        info!(self.log, "looking for running management machines";
            "hints" => hints.len());
        locator.locate_existing(&hints).await.map_err(|err| match err {
            LocateError::NotFound => {
                BootstrapError::Provisioning(ProvisioningError::NoManagementMachines {
                    prefix: self.config.management_group.clone(),
                })
            }
            LocateError::CountMismatch { expected, found } => {
                BootstrapError::Provisioning(ProvisioningError::WrongMachineCount {
                    expected,
                    actual: found,
                })
            }
            LocateError::LookupFailed(err) => {
                BootstrapError::Provisioning(ProvisioningError::Api(err))
            }
        })
    }

    fn validate_machines(&self, machines: &[MachineDetails]) -> Result<(), BootstrapError> {
        let expected = self.config.management_machines;
        if machines.len() != expected {
            return Err(ProvisioningError::WrongMachineCount {
                expected,
                actual: machines.len(),
            }
            .into());
        }
        for machine in machines {
            machine.validate_addresses(self.config.address_mode)?;
        }
        Ok(())
    }

    fn management_addrs(&self, machines: &[MachineDetails]) -> Vec<String> {
        machines
            .iter()
            .filter_map(|m| m.address(self.config.address_mode))
            .map(str::to_string)
            .collect()
    }

    /// Resolves credentials machine by machine. On a failure the machine at
    /// fault is stopped first so its identity is preserved in the logs, then
    /// the rest are rolled back.
    async fn resolve_all(
        &self,
        machines: &mut [MachineDetails],
        pending: &[usize],
        deadline: Deadline,
    ) -> Result<(), BootstrapError> {
        let template = self.config.management_template()?.clone();
        for &index in pending {
            let machine = &mut machines[index];
            let result = resolve_credentials(
                &self.log,
                machine,
                &template,
                self.fetcher.as_deref(),
                deadline,
            )
            .await;
            if let Err(err) = result {
                warn!(self.log, "credential resolution failed, stopping the machine";
                    "machine_id" => &machines[index].machine_id,
                    "error" => %err,
                );
                self.stop_one(&machines[index]).await;
                let rest: Vec<MachineDetails> = machines
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != index)
                    .map(|(_, m)| m.clone())
                    .collect();
                self.roll_back(&rest).await;
                return Err(err.into());
            }
        }
        Ok(())
    }

    /// Installs the agent on every pending machine concurrently. The
    /// install futures run inside this task, so cancelling it cancels
    /// them; results are inspected in submission order, so the error
    /// surfaced is deterministic under concurrent failures and the rest
    /// are logged. Only the first pending machine hosts the management
    /// web services.
    async fn install_all(
        &self,
        machines: &[MachineDetails],
        pending: &[usize],
        management_addrs: &[String],
        deadline: Deadline,
    ) -> Result<(), BootstrapError> {
        let mut installs = Vec::with_capacity(pending.len());
        for (slot, &index) in pending.iter().enumerate() {
            let machine = &machines[index];
            let details = InstallationDetails::for_machine(
                machine,
                self.config.address_mode,
                management_addrs.to_vec(),
                self.options.zones.clone(),
                self.options.security.clone(),
                self.options.web_services && slot == 0,
                true,
            );
            info!(self.log, "installing agent";
                "machine_id" => &machine.machine_id,
                "addr" => &details.connect_addr,
            );
            let installer = Arc::clone(&self.installer);
            installs.push(async move { installer.install(&details, deadline).await });
        }

        let mut first_error: Option<BootstrapError> = None;
        for result in futures::future::join_all(installs).await {
            if let Err(err) = result.map_err(BootstrapError::Install) {
                if first_error.is_none() {
                    first_error = Some(err);
                } else {
                    warn!(self.log, "additional installation failed"; "error" => %err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Waits until every management address answers on the control plane
    /// port, as observed through the cluster admin API.
    async fn wait_for_services(
        &self,
        management_addrs: &[String],
        deadline: Deadline,
    ) -> Result<(), BootstrapError> {
        let interval =
            self.options.service_poll_interval.unwrap_or(DEFAULT_SERVICE_POLL_INTERVAL);
        let latch = ConditionLatch::new(&self.log, deadline)
            .poll_interval(interval)
            .timeout_message("management services did not come up in time")
            .verbose(self.options.verbose);
        let result = latch
            .wait_for(|| {
                let admin = &self.admin;
                async move {
                    let up = admin.probe_control_plane_hosts(management_addrs).await?;
                    Ok(up.len() == management_addrs.len())
                }
            })
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(LatchError::TimedOut(err)) => Err(BootstrapError::Timeout(err)),
            Err(LatchError::Failed(err)) => Err(BootstrapError::Admin(err)),
        }
    }

    async fn uninstall_applications(&self, deadline: Deadline) -> Result<(), BootstrapError> {
        let applications = self.admin.list_applications().await?;
        for application in applications {
            if application == MANAGEMENT_APPLICATION {
                continue;
            }
            info!(self.log, "uninstalling application"; "application" => &application);
            let job = self.admin.uninstall_application(&application, deadline).await?;
            self.admin.wait_for_lifecycle_completion(&job, deadline).await?;
        }
        Ok(())
    }

    fn persist_controllers(&self, machines: &[MachineDetails]) -> Result<(), BootstrapError> {
        let Some(path) = &self.options.managers_file else {
            return Ok(());
        };
        let controllers: Vec<ControllerDetails> = machines
            .iter()
            .map(|m| ControllerDetails {
                private_ip: m.private_address.clone(),
                public_ip: m.public_address.clone(),
            })
            .collect();
        save_controllers(path, &controllers)?;
        info!(self.log, "persisted controller addresses"; "path" => %path);
        Ok(())
    }

    fn forget_controllers(&self) {
        let Some(path) = &self.options.managers_file else {
            return;
        };
        match std::fs::remove_file(path) {
            Ok(()) => debug!(self.log, "removed controller addresses"; "path" => %path),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(self.log, "failed to remove controller addresses";
                    "path" => %path,
                    "error" => %err,
                );
            }
        }
    }

    async fn stop_one(&self, machine: &MachineDetails) {
        let Some(addr) = machine.address(self.config.address_mode) else {
            return;
        };
        let deadline = Deadline::after(ROLLBACK_TIMEOUT);
        if let Err(err) = self.driver.stop_machine(addr, deadline).await {
            warn!(self.log, "rollback failed to stop machine";
                "machine_id" => &machine.machine_id,
                "addr" => addr,
                "error" => %err,
            );
        }
    }

    /// Compensating rollback: stops every acquired machine. Failures are
    /// logged only; the caller keeps the error that triggered the rollback.
    async fn roll_back(&self, machines: &[MachineDetails]) {
        if machines.is_empty() {
            return;
        }
        warn!(self.log, "rolling back, stopping acquired machines";
            "count" => machines.len());
        for machine in machines {
            self.stop_one(machine).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use async_trait::async_trait;
    use camino_tempfile::Utf8TempDir;
    use slog::Drain;

    use flotilla_provision::config::MachineTemplate;
    use flotilla_provision::locator::ManagementLocator;
    use flotilla_provision::machine::{AddressMode, RemoteCredential};

    use crate::cluster::JobId;

    fn test_logger() -> Logger {
        let decorator = slog_term::PlainSyncDecorator::new(std::io::stderr());
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        Logger::root(drain, o!())
    }

    fn machine(n: u8, with_creds: bool) -> MachineDetails {
        MachineDetails {
            machine_id: format!("m-{n}"),
            private_address: Some(format!("10.0.0.{n}")),
            remote_username: with_creds.then(|| "admin".to_string()),
            remote_credential: with_creds
                .then(|| RemoteCredential::Password("hunter2".to_string())),
            ..Default::default()
        }
    }

    fn config(count: usize, template_creds: bool) -> ProvisioningConfig {
        ProvisioningConfig {
            provider: "fake".to_string(),
            management_template: "manager".to_string(),
            management_machines: count,
            management_group: "flotilla-manager-".to_string(),
            max_servers: 200,
            address_mode: AddressMode::Private,
            control_plane_port: 8100,
            templates: BTreeMap::from([(
                "manager".to_string(),
                MachineTemplate {
                    username: template_creds.then(|| "admin".to_string()),
                    password: template_creds.then(|| "hunter2".to_string()),
                    ..Default::default()
                },
            )]),
            nodes: BTreeMap::new(),
            endpoint: None,
            api_credentials: None,
        }
    }

    #[derive(Default)]
    struct FakeDriver {
        machines: Vec<MachineDetails>,
        /// Machines the locator reports as already running.
        running: Vec<MachineDetails>,
        stopped: Mutex<Vec<String>>,
        stopped_management: AtomicBool,
        /// Teardown steps, shared with the admin double.
        events: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl ProvisioningDriver for FakeDriver {
        fn provider(&self) -> &str {
            "fake"
        }

        async fn start_machine(
            &self,
            _location_hint: Option<&str>,
            _deadline: Deadline,
        ) -> Result<MachineDetails, ProvisioningError> {
            unreachable!()
        }

        async fn start_management_machines(
            &self,
            _deadline: Deadline,
        ) -> Result<Vec<MachineDetails>, ProvisioningError> {
            Ok(self.machines.clone())
        }

        async fn stop_machine(
            &self,
            ip: &str,
            _deadline: Deadline,
        ) -> Result<bool, ProvisioningError> {
            self.stopped.lock().unwrap().push(ip.to_string());
            Ok(true)
        }

        async fn stop_management_machines(&self) -> Result<(), ProvisioningError> {
            self.stopped_management.store(true, Ordering::SeqCst);
            self.events.lock().unwrap().push("stop_management_machines");
            Ok(())
        }

        async fn close(&self) {}

        fn locator(&self) -> Option<&dyn ManagementLocator> {
            Some(self)
        }
    }

    #[async_trait]
    impl ManagementLocator for FakeDriver {
        async fn locate_existing(
            &self,
            _hints: &[ControllerDetails],
        ) -> Result<Vec<MachineDetails>, LocateError> {
            if self.running.is_empty() {
                return Err(LocateError::NotFound);
            }
            Ok(self.running.clone())
        }
    }

    #[derive(Default)]
    struct FakeInstaller {
        /// Connect addresses whose installation fails.
        fail_addrs: Vec<String>,
        /// Connect addresses whose installation stalls briefly first.
        slow_addrs: Vec<String>,
        installed: Mutex<Vec<String>>,
        /// Connect addresses installed with the web services enabled.
        web_service_addrs: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Installer for FakeInstaller {
        async fn install(
            &self,
            details: &InstallationDetails,
            _deadline: Deadline,
        ) -> Result<(), InstallError> {
            if self.slow_addrs.contains(&details.connect_addr) {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            if self.fail_addrs.contains(&details.connect_addr) {
                return Err(InstallError::Failed {
                    addr: details.connect_addr.clone(),
                    source: anyhow::anyhow!("ssh connection refused"),
                });
            }
            if details.web_services {
                self.web_service_addrs.lock().unwrap().push(details.connect_addr.clone());
            }
            self.installed.lock().unwrap().push(details.connect_addr.clone());
            Ok(())
        }
    }

    struct FakeAdmin {
        connected: AtomicBool,
        applications: Vec<String>,
        uninstall_fails: bool,
        uninstalled: Mutex<Vec<String>>,
        /// Probes before the control plane reports every host up.
        probes_until_up: u32,
        probes: AtomicU32,
        /// Teardown steps, shared with the driver double.
        events: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Default for FakeAdmin {
        fn default() -> FakeAdmin {
            FakeAdmin {
                connected: AtomicBool::new(true),
                applications: vec![MANAGEMENT_APPLICATION.to_string()],
                uninstall_fails: false,
                uninstalled: Mutex::new(Vec::new()),
                probes_until_up: 0,
                probes: AtomicU32::new(0),
                events: Arc::default(),
            }
        }
    }

    #[async_trait]
    impl ClusterAdmin for FakeAdmin {
        async fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn list_applications(&self) -> Result<Vec<String>, ClusterAdminError> {
            Ok(self.applications.clone())
        }

        async fn uninstall_application(
            &self,
            name: &str,
            _deadline: Deadline,
        ) -> Result<JobId, ClusterAdminError> {
            if self.uninstall_fails {
                return Err(ClusterAdminError::Api(anyhow::anyhow!("admin api unavailable")));
            }
            self.uninstalled.lock().unwrap().push(name.to_string());
            Ok(JobId(format!("job-{name}")))
        }

        async fn wait_for_lifecycle_completion(
            &self,
            _job: &JobId,
            _deadline: Deadline,
        ) -> Result<(), ClusterAdminError> {
            Ok(())
        }

        async fn probe_control_plane_hosts(
            &self,
            hosts: &[String],
        ) -> Result<Vec<String>, ClusterAdminError> {
            if self.probes.fetch_add(1, Ordering::SeqCst) >= self.probes_until_up {
                Ok(hosts.to_vec())
            } else {
                Ok(Vec::new())
            }
        }

        async fn disconnect(&self) {
            self.connected.store(false, Ordering::SeqCst);
            self.events.lock().unwrap().push("disconnect");
        }
    }

    struct Harness {
        driver: Arc<FakeDriver>,
        installer: Arc<FakeInstaller>,
        admin: Arc<FakeAdmin>,
        service: BootstrapService,
    }

    fn harness(
        driver: FakeDriver,
        installer: FakeInstaller,
        admin: FakeAdmin,
        config: ProvisioningConfig,
        options: BootstrapOptions,
    ) -> Harness {
        let driver = Arc::new(driver);
        let installer = Arc::new(installer);
        let admin = Arc::new(admin);
        let options = BootstrapOptions {
            service_poll_interval: Some(Duration::from_millis(100)),
            ..options
        };
        let service = BootstrapService::new(
            &test_logger(),
            driver.clone(),
            installer.clone(),
            admin.clone(),
            None,
            config,
            options,
        );
        Harness { driver, installer, admin, service }
    }

    fn far_deadline() -> Deadline {
        Deadline::after(Duration::from_secs(3600))
    }

    #[tokio::test(start_paused = true)]
    async fn bootstrap_brings_up_the_cluster() {
        let dir = Utf8TempDir::new().unwrap();
        let managers_file = dir.path().join("managers.json");
        let h = harness(
            FakeDriver {
                machines: vec![machine(1, true), machine(2, true)],
                ..Default::default()
            },
            FakeInstaller::default(),
            FakeAdmin { probes_until_up: 2, ..Default::default() },
            config(2, false),
            BootstrapOptions {
                managers_file: Some(managers_file.clone()),
                web_services: true,
                ..Default::default()
            },
        );

        let machines = h.service.bootstrap(far_deadline()).await.unwrap();
        assert_eq!(h.service.state(), SessionState::Ready);
        assert_eq!(machines.len(), 2);
        assert!(machines.iter().all(|m| m.agent_running && m.control_plane_installed));
        assert_eq!(h.installer.installed.lock().unwrap().len(), 2);
        assert!(h.driver.stopped.lock().unwrap().is_empty());

        let controllers = load_controllers(&managers_file).unwrap();
        assert_eq!(controllers.len(), 2);
        assert_eq!(controllers[0].private_ip.as_deref(), Some("10.0.0.1"));
    }

    #[tokio::test(start_paused = true)]
    async fn install_failure_stops_every_machine() {
        let h = harness(
            FakeDriver {
                machines: vec![machine(1, true), machine(2, true), machine(3, true)],
                ..Default::default()
            },
            FakeInstaller {
                fail_addrs: vec!["10.0.0.2".to_string()],
                ..Default::default()
            },
            FakeAdmin::default(),
            config(3, false),
            BootstrapOptions::default(),
        );

        let err = h.service.bootstrap(far_deadline()).await.unwrap_err();
        assert!(matches!(
            err,
            BootstrapError::Install(InstallError::Failed { ref addr, .. }) if addr == "10.0.0.2"
        ));

        let stopped = h.driver.stopped.lock().unwrap().clone();
        assert_eq!(stopped.len(), 3, "every acquired machine should be stopped");
        for n in 1..=3 {
            assert!(stopped.contains(&format!("10.0.0.{n}")));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn only_the_first_machine_hosts_the_web_services() {
        let h = harness(
            FakeDriver {
                machines: vec![machine(1, true), machine(2, true), machine(3, true)],
                ..Default::default()
            },
            FakeInstaller::default(),
            FakeAdmin::default(),
            config(3, false),
            BootstrapOptions { web_services: true, ..Default::default() },
        );

        h.service.bootstrap(far_deadline()).await.unwrap();
        assert_eq!(h.installer.installed.lock().unwrap().len(), 3);
        let web = h.installer.web_service_addrs.lock().unwrap().clone();
        assert_eq!(web, vec!["10.0.0.1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn earliest_submitted_install_failure_is_the_one_surfaced() {
        // Machine 3 fails immediately, machine 2 fails later; the error
        // reported is still machine 2's, the first submitted failure.
        let h = harness(
            FakeDriver {
                machines: vec![machine(1, true), machine(2, true), machine(3, true)],
                ..Default::default()
            },
            FakeInstaller {
                fail_addrs: vec!["10.0.0.2".to_string(), "10.0.0.3".to_string()],
                slow_addrs: vec!["10.0.0.2".to_string()],
                ..Default::default()
            },
            FakeAdmin::default(),
            config(3, false),
            BootstrapOptions::default(),
        );

        let err = h.service.bootstrap(far_deadline()).await.unwrap_err();
        assert!(matches!(
            err,
            BootstrapError::Install(InstallError::Failed { ref addr, .. }) if addr == "10.0.0.2"
        ));
        assert_eq!(h.driver.stopped.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn unresolvable_credentials_stop_the_machine_at_fault_first() {
        // Machines carry no credentials, the template has none either.
        let h = harness(
            FakeDriver {
                machines: vec![machine(1, false), machine(2, true)],
                ..Default::default()
            },
            FakeInstaller::default(),
            FakeAdmin::default(),
            config(2, false),
            BootstrapOptions::default(),
        );

        let err = h.service.bootstrap(far_deadline()).await.unwrap_err();
        assert!(matches!(
            err,
            BootstrapError::Credential(CredentialError::Unresolved { ref machine_id })
                if machine_id == "m-1"
        ));

        let stopped = h.driver.stopped.lock().unwrap().clone();
        assert_eq!(stopped, vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()]);
        assert!(h.installer.installed.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn wrong_machine_count_rolls_back() {
        // Driver hands back one machine where two were configured.
        let h = harness(
            FakeDriver { machines: vec![machine(1, true)], ..Default::default() },
            FakeInstaller::default(),
            FakeAdmin::default(),
            config(2, false),
            BootstrapOptions::default(),
        );

        let err = h.service.bootstrap(far_deadline()).await.unwrap_err();
        assert!(matches!(
            err,
            BootstrapError::Provisioning(ProvisioningError::WrongMachineCount {
                expected: 2,
                actual: 1,
            })
        ));
        assert_eq!(h.driver.stopped.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn services_never_coming_up_times_out_and_rolls_back() {
        let h = harness(
            FakeDriver { machines: vec![machine(1, true)], ..Default::default() },
            FakeInstaller::default(),
            FakeAdmin { probes_until_up: u32::MAX, ..Default::default() },
            config(1, false),
            BootstrapOptions::default(),
        );

        let err = h.service.bootstrap(Deadline::after(Duration::from_secs(1))).await.unwrap_err();
        assert!(matches!(err, BootstrapError::Timeout(_)));
        assert_eq!(h.driver.stopped.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reattaches_to_a_running_cluster_without_installing() {
        let mut running = machine(1, true);
        running.agent_running = true;
        running.control_plane_installed = true;
        let h = harness(
            FakeDriver { running: vec![running], ..Default::default() },
            FakeInstaller::default(),
            FakeAdmin::default(),
            config(1, false),
            BootstrapOptions { use_existing: true, ..Default::default() },
        );

        let machines = h.service.bootstrap(far_deadline()).await.unwrap();
        assert_eq!(machines.len(), 1);
        assert_eq!(h.service.state(), SessionState::Ready);
        assert!(h.installer.installed.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reattach_with_nothing_running_fails() {
        let h = harness(
            FakeDriver::default(),
            FakeInstaller::default(),
            FakeAdmin::default(),
            config(1, false),
            BootstrapOptions { use_existing: true, ..Default::default() },
        );

        let err = h.service.bootstrap(far_deadline()).await.unwrap_err();
        assert!(matches!(
            err,
            BootstrapError::Provisioning(ProvisioningError::NoManagementMachines { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_uninstalls_applications_and_stops_machines() {
        let dir = Utf8TempDir::new().unwrap();
        let managers_file = dir.path().join("managers.json");
        std::fs::write(&managers_file, "[]").unwrap();
        let events: Arc<Mutex<Vec<&'static str>>> = Arc::default();
        let h = harness(
            FakeDriver { events: events.clone(), ..Default::default() },
            FakeInstaller::default(),
            FakeAdmin {
                applications: vec![
                    MANAGEMENT_APPLICATION.to_string(),
                    "petclinic".to_string(),
                    "travel".to_string(),
                ],
                events: events.clone(),
                ..Default::default()
            },
            config(1, false),
            BootstrapOptions { managers_file: Some(managers_file.clone()), ..Default::default() },
        );

        h.service.teardown(false, far_deadline()).await.unwrap();

        // The management application itself is never uninstalled.
        let uninstalled = h.admin.uninstalled.lock().unwrap().clone();
        assert_eq!(uninstalled, vec!["petclinic".to_string(), "travel".to_string()]);
        assert!(h.driver.stopped_management.load(Ordering::SeqCst));
        assert!(!h.admin.is_connected().await);
        assert!(!managers_file.as_std_path().exists());
        // The admin connection outlives the machines it manages.
        assert_eq!(*events.lock().unwrap(), vec!["stop_management_machines", "disconnect"]);
    }

    #[tokio::test(start_paused = true)]
    async fn forced_teardown_stops_machines_before_disconnecting() {
        let events: Arc<Mutex<Vec<&'static str>>> = Arc::default();
        let h = harness(
            FakeDriver { events: events.clone(), ..Default::default() },
            FakeInstaller::default(),
            FakeAdmin {
                applications: vec!["petclinic".to_string()],
                uninstall_fails: true,
                events: events.clone(),
                ..Default::default()
            },
            config(1, false),
            BootstrapOptions::default(),
        );

        h.service.teardown(true, far_deadline()).await.unwrap();
        assert!(h.driver.stopped_management.load(Ordering::SeqCst));
        assert_eq!(*events.lock().unwrap(), vec!["stop_management_machines", "disconnect"]);
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_when_disconnected_requires_force() {
        let h = harness(
            FakeDriver::default(),
            FakeInstaller::default(),
            FakeAdmin { connected: AtomicBool::new(false), ..Default::default() },
            config(1, false),
            BootstrapOptions::default(),
        );

        let err = h.service.teardown(false, far_deadline()).await.unwrap_err();
        assert!(matches!(err, BootstrapError::NotConnected));
        assert!(!h.driver.stopped_management.load(Ordering::SeqCst));

        h.service.teardown(true, far_deadline()).await.unwrap();
        assert!(h.driver.stopped_management.load(Ordering::SeqCst));
    }
}
