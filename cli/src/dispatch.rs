// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Args, Parser, Subcommand};
use slog::{info, o, Drain, Logger};
use uuid::Uuid;

use flotilla_bootstrap::credentials::{CloudCredentialFetcher, CredentialFetcher};
use flotilla_bootstrap::install::SecurityProfile;
use flotilla_bootstrap::{BootstrapOptions, BootstrapService};
use flotilla_common::Deadline;
use flotilla_provision::registry::DriverRegistry;
use flotilla_provision::{azure, openstack};

use crate::admin::RestClusterAdmin;
use crate::config::Config;
use crate::installer::CommandInstaller;

/// Flotilla app.
#[derive(Debug, Parser)]
#[command(version)]
pub struct FlotillaApp {
    /// File the full session log is written to, alongside stderr.
    #[clap(long, global = true, env = "FLOTILLA_LOG_FILE")]
    pub log_file: Option<Utf8PathBuf>,

    /// Log at the debug level and narrate every poll attempt.
    #[clap(short, long, global = true)]
    pub verbose: bool,

    #[clap(subcommand)]
    subcommand: FlotillaCommand,
}

impl FlotillaApp {
    /// Executes the app.
    pub async fn exec(self, log: &Logger) -> Result<()> {
        let log = log.new(o!("session" => Uuid::new_v4().to_string()));
        match self.subcommand {
            FlotillaCommand::Bootstrap(opts) => opts.exec(&log, self.verbose).await,
            FlotillaCommand::Teardown(opts) => opts.exec(&log).await,
        }
    }

    pub fn setup_log(path: Option<&Utf8Path>, verbose: bool) -> Result<Logger> {
        let stderr_drain = stderr_env_drain("RUST_LOG", verbose);
        let drain = match path {
            Some(path) => {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(path)?;
                let file_decorator = slog_term::PlainDecorator::new(file);
                let file_drain =
                    slog_term::FullFormat::new(file_decorator).build().fuse();
                let drain = slog::Duplicate::new(file_drain, stderr_drain).fuse();
                slog_async::Async::new(drain).build().fuse()
            }
            None => slog_async::Async::new(stderr_drain.fuse()).build().fuse(),
        };
        Ok(Logger::root(drain, o!()))
    }
}

#[derive(Debug, Subcommand)]
enum FlotillaCommand {
    /// Bring up the management cluster.
    Bootstrap(BootstrapOpts),
    /// Tear the management cluster down.
    Teardown(TeardownOpts),
}

/// Options shared by both subcommands.
#[derive(Debug, Args)]
struct SessionOpts {
    /// Path to the operator configuration.
    #[clap(long, env = "FLOTILLA_CONFIG")]
    config: Utf8PathBuf,

    /// Overall deadline for the operation, in seconds.
    #[clap(long, default_value_t = 3600)]
    timeout_secs: u64,
}

impl SessionOpts {
    fn deadline(&self) -> Deadline {
        Deadline::after(Duration::from_secs(self.timeout_secs))
    }
}

#[derive(Debug, Args)]
struct BootstrapOpts {
    #[command(flatten)]
    session: SessionOpts,

    /// Re-attach to management machines that are already running instead
    /// of starting new ones.
    #[clap(long)]
    use_existing_managers: bool,

    /// Re-attach using the controller addresses recorded in this file
    /// instead of the one named in the configuration.
    #[clap(long, conflicts_with = "use_existing_managers")]
    managers_file: Option<Utf8PathBuf>,
}

impl BootstrapOpts {
    async fn exec(self, log: &Logger, verbose: bool) -> Result<()> {
        let config = Config::from_file(&self.session.config)?;
        let use_existing = self.use_existing_managers || self.managers_file.is_some();
        let service = build_service(
            log,
            &config,
            self.managers_file,
            use_existing,
            None,
            verbose,
        )?;
        info!(log, "bootstrapping management cluster";
            "provider" => &config.provisioning.provider,
            "machines" => config.provisioning.management_machines,
        );
        let machines = service.bootstrap(self.session.deadline()).await?;
        for machine in &machines {
            println!(
                "manager {} public={} private={}",
                machine.machine_id,
                machine.public_address.as_deref().unwrap_or("-"),
                machine.private_address.as_deref().unwrap_or("-"),
            );
        }
        Ok(())
    }
}

#[derive(Debug, Args)]
struct TeardownOpts {
    #[command(flatten)]
    session: SessionOpts,

    /// Keep going past connectivity and uninstall failures.
    #[clap(long)]
    force: bool,

    /// Override the admin API endpoint from the configuration.
    #[clap(long)]
    admin_endpoint: Option<String>,
}

impl TeardownOpts {
    async fn exec(self, log: &Logger) -> Result<()> {
        let config = Config::from_file(&self.session.config)?;
        let service = build_service(log, &config, None, false, self.admin_endpoint, false)?;
        info!(log, "tearing down management cluster"; "force" => self.force);
        service.teardown(self.force, self.session.deadline()).await?;
        println!("management cluster torn down");
        Ok(())
    }
}

fn build_service(
    log: &Logger,
    config: &Config,
    managers_file_override: Option<Utf8PathBuf>,
    use_existing: bool,
    admin_endpoint_override: Option<String>,
    verbose: bool,
) -> Result<BootstrapService> {
    let registry = DriverRegistry::builtin();
    let driver = registry.create(log, &config.provisioning)?;
    let installer = Arc::new(CommandInstaller::new(
        log,
        config.install.command.clone(),
        config.install.args.clone(),
    ));
    let admin = Arc::new(RestClusterAdmin::new(
        log,
        admin_endpoint_override.or_else(|| config.admin.endpoint.clone()),
        config.provisioning.control_plane_port,
    ));

    // Providers that generate machine passwords get the polling fetcher as
    // the last link of the credential chain.
    let fetcher: Option<Arc<dyn CredentialFetcher>> =
        match config.provisioning.provider.as_str() {
            openstack::PROVIDER_ID => {
                let api = Arc::new(openstack::OpenStackApi::new(log, &config.provisioning)?);
                Some(Arc::new(CloudCredentialFetcher::new(log, api)))
            }
            azure::PROVIDER_ID => {
                let api = Arc::new(azure::AzureApi::new(log, &config.provisioning)?);
                Some(Arc::new(CloudCredentialFetcher::new(log, api)))
            }
            _ => None,
        };

    let options = BootstrapOptions {
        zones: config.zones.clone(),
        security: SecurityProfile {
            secured: config.security.secured,
            keystore_password: config.security.keystore_password.clone(),
        },
        web_services: config.web_services,
        managers_file: managers_file_override.or_else(|| config.managers_file.clone()),
        use_existing,
        service_poll_interval: None,
        verbose,
    };
    Ok(BootstrapService::new(
        log,
        driver,
        installer,
        admin,
        fetcher,
        config.provisioning.clone(),
        options,
    ))
}

pub(crate) fn stderr_env_drain(
    env_var: &str,
    verbose: bool,
) -> impl Drain<Ok = (), Err = slog::Never> {
    let stderr_decorator = slog_term::TermDecorator::new().build();
    let stderr_drain = slog_term::FullFormat::new(stderr_decorator).build().fuse();
    let mut builder = slog_envlogger::LogBuilder::new(stderr_drain);
    if let Ok(s) = std::env::var(env_var) {
        builder = builder.parse(&s);
    } else if verbose {
        builder = builder.filter(None, slog::FilterLevel::Debug);
    } else {
        // Log at the info level by default.
        builder = builder.filter(None, slog::FilterLevel::Info);
    }
    builder.build()
}
