// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Agent installation by external command.
//!
//! The configured command receives one machine's installation parameters
//! through `FLOTILLA_*` environment variables and is expected to exit zero
//! once the agent is on the machine.

use anyhow::anyhow;
use async_trait::async_trait;
use camino::Utf8PathBuf;
use slog::{debug, o, Logger};
use tokio::process::Command;

use flotilla_bootstrap::install::{InstallError, InstallationDetails, Installer};
use flotilla_common::{Deadline, TimeoutError};
use flotilla_provision::machine::RemoteCredential;

pub struct CommandInstaller {
    log: Logger,
    command: Utf8PathBuf,
    args: Vec<String>,
}

impl CommandInstaller {
    pub fn new(log: &Logger, command: Utf8PathBuf, args: Vec<String>) -> CommandInstaller {
        CommandInstaller {
            log: log.new(o!("component" => "CommandInstaller")),
            command,
            args,
        }
    }

    fn build_command(&self, details: &InstallationDetails) -> Command {
        let mut command = Command::new(self.command.as_std_path());
        command.args(&self.args);
        command.env("FLOTILLA_TARGET", &details.connect_addr);
        command.env("FLOTILLA_USERNAME", &details.username);
        match &details.credential {
            RemoteCredential::Password(password) => {
                command.env("FLOTILLA_PASSWORD", password);
            }
            RemoteCredential::KeyFile(path) => {
                command.env("FLOTILLA_KEY_FILE", path.as_str());
            }
        }
        command.env("FLOTILLA_LOCATOR", details.locator());
        command.env("FLOTILLA_ZONES", details.zones.join(","));
        command.env("FLOTILLA_WEB_SERVICES", if details.web_services { "1" } else { "0" });
        command.env("FLOTILLA_SECURED", if details.security.secured { "1" } else { "0" });
        if let Some(password) = &details.security.keystore_password {
            command.env("FLOTILLA_KEYSTORE_PASSWORD", password);
        }
        command.kill_on_drop(true);
        command
    }
}

#[async_trait]
impl Installer for CommandInstaller {
    async fn install(
        &self,
        details: &InstallationDetails,
        deadline: Deadline,
    ) -> Result<(), InstallError> {
        let remaining = deadline.remaining()?;
        debug!(self.log, "running install command";
            "command" => %self.command,
            "target" => &details.connect_addr,
        );
        let mut command = self.build_command(details);
        let output = tokio::time::timeout(remaining, command.output())
            .await
            .map_err(|_| {
                TimeoutError::new(format!(
                    "install command did not finish for {}",
                    details.connect_addr
                ))
            })?
            .map_err(|err| InstallError::Failed {
                addr: details.connect_addr.clone(),
                source: anyhow::Error::new(err),
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(InstallError::Failed {
                addr: details.connect_addr.clone(),
                source: anyhow!(
                    "install command exited with {}: {}",
                    output.status,
                    stderr.trim()
                ),
            });
        }
        Ok(())
    }
}
