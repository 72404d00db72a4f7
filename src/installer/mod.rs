//! Agentless installation of the cluster agent over SSH and SFTP.
//!
//! [`AgentlessInstaller::install`] runs four strictly sequential steps
//! against one machine: probe the transfer port, upload the bootstrap
//! bundle, export the environment contract, and run the bootstrap script.
//! The caller's absolute deadline is checked before each step and bounds
//! every external process. The installer never retries; callers use
//! [`InstallerError::is_retryable`] to decide.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::future::Future;
use std::io::Write as _;
use std::pin::Pin;
use std::time::Duration;

use camino::Utf8PathBuf;
use thiserror::Error;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::config::StratusConfig;
use crate::machine::{Credential, FileTransferMode, InstallationDetails, RemoteExecutionMode};
use crate::reachability::ReachabilityProbe;

pub mod env;
pub mod exit_codes;
mod runner;
pub mod transfer;

pub use runner::{CommandOutput, CommandRunner, CommandSpec, ProcessCommandRunner, RunnerFuture};

const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PROBE_BACKOFF: Duration = Duration::from_secs(5);

/// Errors raised while installing one machine.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum InstallerError {
    /// Raised when the transfer port never accepts a connection.
    #[error("timed out waiting for {host}:{port} to accept connections")]
    ConnectTimeout {
        /// Target host.
        host: String,
        /// Probed port.
        port: u16,
    },
    /// Raised when the upload fails.
    #[error("file transfer to {host} failed: {message}")]
    Transfer {
        /// Target host.
        host: String,
        /// Error detail, usually the client's stderr.
        message: String,
    },
    /// Raised when the bootstrap script exits with a failure status.
    #[error("bootstrap script {script} on {host} failed with status {status}: {description}")]
    NonZeroExit {
        /// Target host.
        host: String,
        /// Script that failed.
        script: String,
        /// Exit status, or `signal` when the process was killed.
        status: String,
        /// Meaning of the exit status.
        description: String,
    },
    /// Raised when a remote command runs past the deadline and is killed.
    #[error("{command} on {host} did not finish before the deadline")]
    ExecutionTimeout {
        /// Target host.
        host: String,
        /// Program that was killed.
        command: String,
    },
    /// Raised when a local client cannot be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that could not start.
        program: String,
        /// Operating system error.
        message: String,
    },
    /// Raised for transfer or execution modes this installer cannot drive.
    #[error("machine {host} requests unsupported {mode}")]
    UnsupportedMode {
        /// Target host.
        host: String,
        /// Offending mode.
        mode: String,
    },
    /// Raised when the deadline expires between steps.
    #[error("deadline expired on {host} before {step}")]
    DeadlineExceeded {
        /// Target host.
        host: String,
        /// Step that did not start.
        step: String,
    },
    /// Raised when the machine has no address to connect to.
    #[error("machine {machine_id} has no address to connect to")]
    MissingAddress {
        /// Backend machine identifier.
        machine_id: String,
    },
}

impl InstallerError {
    /// Returns `true` for failures a fresh attempt on the same machine may
    /// overcome.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectTimeout { .. } | Self::Transfer { .. } | Self::ExecutionTimeout { .. } => true,
            Self::NonZeroExit { status, .. } => {
                *status == exit_codes::SSH_CONNECTION_FAILURE.to_string()
            }
            Self::Spawn { .. }
            | Self::UnsupportedMode { .. }
            | Self::DeadlineExceeded { .. }
            | Self::MissingAddress { .. } => false,
        }
    }
}

/// Future returned by [`Installer::install`].
pub type InstallFuture<'a> = Pin<Box<dyn Future<Output = Result<(), InstallerError>> + Send + 'a>>;

/// Installs the cluster agent on one machine.
pub trait Installer: Send + Sync {
    /// Installs `details` before `deadline`.
    fn install<'a>(&'a self, details: &'a InstallationDetails, deadline: Instant) -> InstallFuture<'a>;
}

/// Client binaries and host key policy used by the installer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstallerOptions {
    /// Path to the `ssh` executable.
    pub ssh_bin: String,
    /// Path to the `sftp` executable.
    pub sftp_bin: String,
    /// Path to the `sshpass` executable.
    pub sshpass_bin: String,
    /// Known hosts file passed to the clients.
    pub known_hosts_file: String,
    /// Whether to enforce host key checking.
    pub strict_host_key_checking: bool,
    /// Upper bound of a single reachability probe.
    pub probe_timeout: Duration,
    /// Pause between failed probes.
    pub probe_backoff: Duration,
}

impl Default for InstallerOptions {
    fn default() -> Self {
        Self {
            ssh_bin: String::from("ssh"),
            sftp_bin: String::from("sftp"),
            sshpass_bin: String::from("sshpass"),
            known_hosts_file: String::from("/dev/null"),
            strict_host_key_checking: false,
            probe_timeout: PROBE_CONNECT_TIMEOUT,
            probe_backoff: PROBE_BACKOFF,
        }
    }
}

impl From<&StratusConfig> for InstallerOptions {
    fn from(config: &StratusConfig) -> Self {
        Self {
            ssh_bin: config.ssh_bin.clone(),
            sftp_bin: config.sftp_bin.clone(),
            sshpass_bin: config.sshpass_bin.clone(),
            known_hosts_file: config.ssh_known_hosts_file.clone(),
            strict_host_key_checking: config.ssh_strict_host_key_checking,
            ..Self::default()
        }
    }
}

/// Installer that only needs SSH access to the target machine.
#[derive(Clone, Debug)]
pub struct AgentlessInstaller<R, P> {
    options: InstallerOptions,
    runner: R,
    probe: P,
}

impl<R: CommandRunner, P: ReachabilityProbe> AgentlessInstaller<R, P> {
    /// Creates an installer from its options, command runner and probe.
    #[must_use]
    pub const fn new(options: InstallerOptions, runner: R, probe: P) -> Self {
        Self {
            options,
            runner,
            probe,
        }
    }

    /// Returns the configured options.
    #[must_use]
    pub const fn options(&self) -> &InstallerOptions {
        &self.options
    }

    async fn run_install(
        &self,
        details: &InstallationDetails,
        deadline: Instant,
    ) -> Result<(), InstallerError> {
        let host = details
            .connect_host()
            .ok_or_else(|| InstallerError::MissingAddress {
                machine_id: details.machine_id.clone(),
            })?
            .to_owned();
        check_modes(&host, details)?;

        info!(host = %host, machine_id = %details.machine_id, "installing agent");
        ensure_time_left(&host, "reachability probe", deadline)?;
        self.wait_for_port(&host, details.file_transfer.port(), deadline)
            .await?;

        ensure_time_left(&host, "file transfer", deadline)?;
        self.upload(&host, details, deadline).await?;

        ensure_time_left(&host, "remote execution", deadline)?;
        self.execute(&host, details, deadline).await?;

        info!(host = %host, machine_id = %details.machine_id, "agent installed");
        Ok(())
    }

    async fn wait_for_port(
        &self,
        host: &str,
        port: u16,
        deadline: Instant,
    ) -> Result<(), InstallerError> {
        loop {
            let before = Instant::now();
            if before >= deadline {
                break;
            }
            let limit = self.options.probe_timeout.min(deadline - before);
            if self.probe.probe(host, port, limit).await {
                debug!(host, port, "port is reachable");
                return Ok(());
            }

            let after = Instant::now();
            if after >= deadline {
                break;
            }
            debug!(host, port, "port not reachable yet");
            sleep(self.options.probe_backoff.min(deadline - after)).await;
        }
        Err(InstallerError::ConnectTimeout {
            host: host.to_owned(),
            port,
        })
    }

    async fn upload(
        &self,
        host: &str,
        details: &InstallationDetails,
        deadline: Instant,
    ) -> Result<(), InstallerError> {
        let transfer_error = |message: String| InstallerError::Transfer {
            host: host.to_owned(),
            message,
        };

        let remote = self.remote_listing(host, details, deadline).await?;
        let skip = descriptor_inside(details);
        let local = transfer::walk_local(&details.local_directory, skip.as_deref())
            .map_err(|err| transfer_error(format!("{}: {err}", details.local_directory)))?;
        let plan = transfer::plan_transfer(&local, &remote, &details.exclusions);

        if plan.is_empty() && details.cluster_descriptor.is_none() {
            info!(host, "remote directory up to date, nothing to transfer");
            return Ok(());
        }

        let script = transfer::batch_script(
            &details.local_directory,
            &details.remote_directory,
            &plan,
            details.cluster_descriptor.as_ref(),
        );
        let mut batch = tempfile::NamedTempFile::new()
            .map_err(|err| transfer_error(format!("failed to create batch file: {err}")))?;
        batch
            .write_all(script.as_bytes())
            .and_then(|()| batch.flush())
            .map_err(|err| transfer_error(format!("failed to write batch file: {err}")))?;

        info!(host, files = plan.files.len(), "uploading bootstrap bundle");
        // sftp appends `-obatchmode yes` where `-b` appears and ssh keeps the
        // first value, so the password options must come first.
        let mut args = self.common_options(details.credential.as_ref());
        args.push(OsString::from("-b"));
        args.push(batch.path().as_os_str().to_owned());
        args.push(OsString::from(format!("{}@{host}", details.username)));

        let spec = self.command(&self.options.sftp_bin, args, details, host, deadline);
        let output = self.runner.run(&spec).await?;
        if output.timed_out {
            return Err(InstallerError::ExecutionTimeout {
                host: host.to_owned(),
                command: self.options.sftp_bin.clone(),
            });
        }
        if !output.is_success() {
            return Err(transfer_error(non_empty_or(
                output.stderr.trim(),
                "sftp exited with a failure status",
            )));
        }
        Ok(())
    }

    async fn remote_listing(
        &self,
        host: &str,
        details: &InstallationDetails,
        deadline: Instant,
    ) -> Result<BTreeMap<String, u64>, InstallerError> {
        let directory = shell_escape::unix::escape(Cow::from(details.remote_directory.as_str()));
        let command = format!("find {directory} -type f -printf '%P\\t%s\\n' 2>/dev/null || true");
        let spec = self.ssh_command(host, details, command, deadline);
        let output = self.runner.run(&spec).await?;
        if output.timed_out {
            return Err(InstallerError::ExecutionTimeout {
                host: host.to_owned(),
                command: self.options.ssh_bin.clone(),
            });
        }
        if !output.is_success() {
            return Err(InstallerError::Transfer {
                host: host.to_owned(),
                message: non_empty_or(output.stderr.trim(), "failed to list the remote directory"),
            });
        }
        Ok(transfer::parse_remote_listing(&output.stdout))
    }

    async fn execute(
        &self,
        host: &str,
        details: &InstallationDetails,
        deadline: Instant,
    ) -> Result<(), InstallerError> {
        info!(host, script = %details.bootstrap_script, "running bootstrap script");
        let spec = self.ssh_command(host, details, env::script_command(details), deadline);
        let output = self.runner.run(&spec).await?;
        if output.timed_out {
            return Err(InstallerError::ExecutionTimeout {
                host: host.to_owned(),
                command: details.bootstrap_script.clone(),
            });
        }
        if output.is_success() {
            return Ok(());
        }

        let status = output
            .code
            .map_or_else(|| String::from("signal"), |code| code.to_string());
        warn!(host, status = %status, "bootstrap script failed");
        Err(InstallerError::NonZeroExit {
            host: host.to_owned(),
            script: details.bootstrap_script.clone(),
            status,
            description: exit_codes::describe(output.code).to_owned(),
        })
    }

    fn ssh_command(
        &self,
        host: &str,
        details: &InstallationDetails,
        remote_command: String,
        deadline: Instant,
    ) -> CommandSpec {
        let mut args = self.common_options(details.credential.as_ref());
        args.push(OsString::from(format!("{}@{host}", details.username)));
        args.push(OsString::from(remote_command));
        self.command(&self.options.ssh_bin, args, details, host, deadline)
    }

    fn command(
        &self,
        program: &str,
        args: Vec<OsString>,
        details: &InstallationDetails,
        host: &str,
        deadline: Instant,
    ) -> CommandSpec {
        match &details.credential {
            Some(Credential::Password(password)) => {
                let mut wrapped = vec![OsString::from("-e"), OsString::from(program)];
                wrapped.extend(args);
                CommandSpec {
                    program: self.options.sshpass_bin.clone(),
                    args: wrapped,
                    env: vec![(String::from("SSHPASS"), password.clone())],
                    deadline,
                    log_tag: host.to_owned(),
                }
            }
            _ => CommandSpec {
                program: program.to_owned(),
                args,
                env: Vec::new(),
                deadline,
                log_tag: host.to_owned(),
            },
        }
    }

    fn common_options(&self, credential: Option<&Credential>) -> Vec<OsString> {
        let mut args = Vec::new();
        match credential {
            Some(Credential::KeyFile(path)) => {
                args.push(OsString::from("-i"));
                args.push(OsString::from(path.as_str()));
                args.push(OsString::from("-o"));
                args.push(OsString::from("BatchMode=yes"));
            }
            Some(Credential::Password(_)) => {
                args.push(OsString::from("-o"));
                args.push(OsString::from("BatchMode=no"));
            }
            None => {
                args.push(OsString::from("-o"));
                args.push(OsString::from("BatchMode=yes"));
            }
        }

        if !self.options.strict_host_key_checking {
            args.push(OsString::from("-o"));
            args.push(OsString::from("StrictHostKeyChecking=no"));
        }

        if !self.options.known_hosts_file.trim().is_empty() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "UserKnownHostsFile={}",
                self.options.known_hosts_file
            )));
        }

        args
    }
}

impl<R: CommandRunner, P: ReachabilityProbe> Installer for AgentlessInstaller<R, P> {
    fn install<'a>(&'a self, details: &'a InstallationDetails, deadline: Instant) -> InstallFuture<'a> {
        Box::pin(self.run_install(details, deadline))
    }
}

fn check_modes(host: &str, details: &InstallationDetails) -> Result<(), InstallerError> {
    if details.file_transfer != FileTransferMode::Sftp {
        return Err(InstallerError::UnsupportedMode {
            host: host.to_owned(),
            mode: format!("file transfer mode {:?}", details.file_transfer),
        });
    }
    if details.remote_execution != RemoteExecutionMode::Ssh {
        return Err(InstallerError::UnsupportedMode {
            host: host.to_owned(),
            mode: format!("remote execution mode {:?}", details.remote_execution),
        });
    }
    Ok(())
}

fn ensure_time_left(host: &str, step: &str, deadline: Instant) -> Result<(), InstallerError> {
    if Instant::now() >= deadline {
        return Err(InstallerError::DeadlineExceeded {
            host: host.to_owned(),
            step: step.to_owned(),
        });
    }
    Ok(())
}

/// Relative path of the cluster descriptor when it lives inside the local
/// directory, so the walk skips it.
fn descriptor_inside(details: &InstallationDetails) -> Option<String> {
    let descriptor: &Utf8PathBuf = details.cluster_descriptor.as_ref()?;
    descriptor
        .strip_prefix(&details.local_directory)
        .ok()
        .map(|relative| relative.as_str().to_owned())
}

fn non_empty_or(text: &str, fallback: &str) -> String {
    if text.is_empty() {
        fallback.to_owned()
    } else {
        text.to_owned()
    }
}

#[cfg(test)]
mod tests;
