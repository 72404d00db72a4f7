//! Bootstrap and teardown of the management cluster.
//!
//! [`BootstrapOrchestrator`] resolves a provisioning driver from the
//! registry, asks it for management machines, installs the agent on each of
//! them concurrently under one absolute deadline, and waits for the REST
//! gateway to answer. Teardown reverses the process: applications are
//! undeployed through the control plane before the machines are stopped.

mod staging;

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::StratusConfig;
use crate::control_plane::{
    ControlPlane, ControlPlaneConnector, ControlPlaneError, MANAGEMENT_APPLICATION,
};
use crate::descriptor::{ClusterDescriptor, DescriptorError};
use crate::driver::{DriverError, DriverRegistry, ProvisioningDriver};
use crate::installer::{Installer, InstallerError};
use crate::latch::{ConditionLatch, DEFAULT_POLL_INTERVAL, LatchError, Probe};
use crate::machine::{InstallRole, InstallationDetails, MachineDetails};

pub use crate::control_plane::DEFAULT_REST_PORT;
pub use staging::{STAGED_DESCRIPTOR_NAME, StagedDescriptor};

/// Message reported when the REST gateway or the teardown uninstall does
/// not finish in time.
pub const OPERATION_TIMED_OUT: &str =
    "The operation timed out. Try to increase the timeout using the -timeout flag";

const DEFAULT_ROLLBACK_TIMEOUT: Duration = Duration::from_secs(300);

/// Errors raised while bootstrapping or tearing down a cluster.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Raised when the driver cannot be built, configured, or used.
    #[error(transparent)]
    Driver(#[from] DriverError),
    /// Raised when the descriptor lacks the management template.
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    /// Raised when the driver returns no management machine.
    #[error("the provisioning driver returned no management machines")]
    NoManagementMachines,
    /// Raised when the descriptor cannot be staged for upload.
    #[error("failed to stage cluster descriptor at {path}: {message}")]
    Stage {
        /// Path that could not be read or written.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the agent installation fails on a machine.
    #[error("installation on {host} failed: {source}")]
    Install {
        /// Host the installation targeted.
        host: String,
        /// Installer failure.
        #[source]
        source: Box<InstallerError>,
    },
    /// Raised when an installation task ends without reporting a result.
    #[error("installation task for {host} did not complete")]
    InstallTask {
        /// Host the installation targeted.
        host: String,
    },
    /// Raised when a control plane request fails.
    #[error(transparent)]
    ControlPlane(#[from] ControlPlaneError),
    /// Raised when a wait does not finish before the deadline.
    #[error("{message}")]
    TimedOut {
        /// Timeout message.
        message: String,
    },
    /// Raised when a teardown without force has no control plane URL.
    #[error("a control plane URL is required to uninstall applications; pass --force to skip")]
    MissingRestUrl,
}

impl From<LatchError<ControlPlaneError>> for BootstrapError {
    fn from(value: LatchError<ControlPlaneError>) -> Self {
        match value {
            LatchError::TimedOut { message } => Self::TimedOut { message },
            LatchError::Aborted(err) => Self::ControlPlane(err),
        }
    }
}

/// Tunables of the orchestrator.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BootstrapOptions {
    /// Port of the REST gateway on each management machine.
    pub rest_port: u16,
    /// Stops freshly provisioned machines when bootstrap fails.
    pub rollback_on_failure: bool,
    /// Budget of the rollback, measured from the moment it starts.
    pub rollback_timeout: Duration,
    /// Interval between REST and uninstall polls.
    pub poll_interval: Duration,
    /// Logs pending polls at info level.
    pub verbose: bool,
}

impl Default for BootstrapOptions {
    fn default() -> Self {
        Self {
            rest_port: DEFAULT_REST_PORT,
            rollback_on_failure: true,
            rollback_timeout: DEFAULT_ROLLBACK_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            verbose: false,
        }
    }
}

impl From<&StratusConfig> for BootstrapOptions {
    fn from(config: &StratusConfig) -> Self {
        Self {
            rest_port: config.rest_port,
            rollback_on_failure: config.rollback_on_failure,
            verbose: config.verbose,
            ..Self::default()
        }
    }
}

/// Outcome of a successful bootstrap.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BootstrapReport {
    /// Management machines returned by the driver, in driver order.
    pub machines: Vec<MachineDetails>,
    /// Hosts the agent was installed on. Machines already running an agent
    /// are absent.
    pub installed: Vec<String>,
    /// REST gateway URLs that answered.
    pub rest_urls: Vec<String>,
}

/// Drives bootstrap and teardown for one cluster descriptor.
pub struct BootstrapOrchestrator {
    registry: Arc<DriverRegistry>,
    descriptor: ClusterDescriptor,
    descriptor_path: Utf8PathBuf,
    installer: Arc<dyn Installer>,
    connector: Arc<dyn ControlPlaneConnector>,
    options: BootstrapOptions,
}

impl BootstrapOrchestrator {
    /// Creates an orchestrator. `descriptor_path` is the file `descriptor`
    /// was loaded from; it is staged into the upload directory verbatim.
    #[must_use]
    pub fn new(
        registry: Arc<DriverRegistry>,
        descriptor: ClusterDescriptor,
        descriptor_path: Utf8PathBuf,
        installer: Arc<dyn Installer>,
        connector: Arc<dyn ControlPlaneConnector>,
    ) -> Self {
        Self {
            registry,
            descriptor,
            descriptor_path,
            installer,
            connector,
            options: BootstrapOptions::default(),
        }
    }

    /// Replaces the tunables.
    #[must_use]
    pub const fn with_options(mut self, options: BootstrapOptions) -> Self {
        self.options = options;
        self
    }

    /// Starts the management machines, installs the agent on them and
    /// waits for the REST gateway. The driver is closed on every path.
    ///
    /// # Errors
    ///
    /// Returns the first failure. Installation failures name the host and
    /// keep the [`InstallerError`]. Failures after provisioning trigger a
    /// best-effort rollback when enabled.
    pub async fn bootstrap(&self, timeout: Duration) -> Result<BootstrapReport, BootstrapError> {
        let deadline = Instant::now() + timeout;
        let mut driver = self.registry.create(&self.descriptor.provider.driver)?;
        let outcome = match self.configure(driver.as_mut()) {
            Ok(()) => self.provision_and_install(driver.as_ref(), deadline).await,
            Err(err) => Err(err),
        };
        close_driver(driver.as_ref(), outcome).await
    }

    /// Undeploys every application except the management one, then stops
    /// the management machines.
    ///
    /// With `force`, uninstall failures and a missing `rest_url` are logged
    /// and the machines are stopped regardless.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::MissingRestUrl`] without force and URL,
    /// uninstall failures without force, and any driver failure.
    pub async fn teardown(
        &self,
        timeout: Duration,
        force: bool,
        rest_url: Option<&str>,
    ) -> Result<(), BootstrapError> {
        let deadline = Instant::now() + timeout;
        let mut driver = self.registry.create(&self.descriptor.provider.driver)?;
        let outcome = match self.configure(driver.as_mut()) {
            Ok(()) => {
                self.teardown_with(driver.as_ref(), deadline, force, rest_url)
                    .await
            }
            Err(err) => Err(err),
        };
        close_driver(driver.as_ref(), outcome).await
    }

    fn configure(&self, driver: &mut dyn ProvisioningDriver) -> Result<(), BootstrapError> {
        driver.set_config(&self.descriptor, &self.descriptor.management_template, true)?;
        Ok(())
    }

    async fn provision_and_install(
        &self,
        driver: &dyn ProvisioningDriver,
        deadline: Instant,
    ) -> Result<BootstrapReport, BootstrapError> {
        let machines = driver.start_management_machines(deadline).await?;
        if machines.is_empty() {
            return Err(BootstrapError::NoManagementMachines);
        }
        for machine in &machines {
            info!(
                machine_id = %machine.machine_id,
                host = machine.host_label(),
                agent_running = machine.agent_running,
                "management machine ready"
            );
        }

        match self.install_and_wait(&machines, deadline).await {
            Ok((installed, rest_urls)) => Ok(BootstrapReport {
                machines,
                installed,
                rest_urls,
            }),
            Err(err) => {
                let provisioned = machines.iter().any(|machine| !machine.agent_running);
                if provisioned && self.options.rollback_on_failure {
                    self.rollback(driver).await;
                }
                Err(err)
            }
        }
    }

    async fn install_and_wait(
        &self,
        machines: &[MachineDetails],
        deadline: Instant,
    ) -> Result<(Vec<String>, Vec<String>), BootstrapError> {
        let details = self.installation_details(machines)?;

        let installed = {
            let staged = StagedDescriptor::stage(
                details
                    .first()
                    .map(|entry| entry.local_directory.as_path())
                    .ok_or(BootstrapError::NoManagementMachines)?,
                &self.descriptor_path,
            )?;
            let pending: Vec<InstallationDetails> = machines
                .iter()
                .zip(&details)
                .filter(|(machine, _)| !machine.agent_running)
                .map(|(_, entry)| InstallationDetails {
                    cluster_descriptor: Some(staged.path().to_path_buf()),
                    ..entry.clone()
                })
                .collect();
            self.run_installs(pending, deadline).await?
        };

        let mut rest_urls = Vec::with_capacity(details.len());
        for entry in &details {
            let url = format!("http://{}:{}", entry.host_label(), self.options.rest_port);
            self.wait_for_rest(&url, deadline).await?;
            info!(url = %url, "REST gateway is available");
            rest_urls.push(url);
        }
        Ok((installed, rest_urls))
    }

    fn installation_details(
        &self,
        machines: &[MachineDetails],
    ) -> Result<Vec<InstallationDetails>, BootstrapError> {
        let mut template = self.descriptor.management_installation(String::new(), None)?;
        let addresses: Vec<&str> = machines
            .iter()
            .filter_map(|machine| machine.address(template.bind_to_private_ip))
            .collect();
        template.locator = addresses.join(",");

        Ok(machines
            .iter()
            .enumerate()
            .map(|(index, machine)| {
                template.details_for(
                    machine,
                    InstallRole::Seed {
                        no_web_services: index > 0,
                    },
                )
            })
            .collect())
    }

    /// Installs on every machine concurrently and reports the first failure
    /// in machine order once all tasks have finished.
    async fn run_installs(
        &self,
        pending: Vec<InstallationDetails>,
        deadline: Instant,
    ) -> Result<Vec<String>, BootstrapError> {
        let mut tasks = JoinSet::new();
        for (index, entry) in pending.iter().cloned().enumerate() {
            let installer = Arc::clone(&self.installer);
            info!(host = entry.host_label(), "installing management agent");
            tasks.spawn(async move {
                let outcome = installer.install(&entry, deadline).await;
                (index, outcome)
            });
        }

        let mut outcomes: Vec<Option<Result<(), InstallerError>>> = vec![None; pending.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => {
                    if let Some(slot) = outcomes.get_mut(index) {
                        *slot = Some(outcome);
                    }
                }
                Err(err) => warn!(error = %err, "installation task ended abnormally"),
            }
        }

        let mut installed = Vec::with_capacity(pending.len());
        for (entry, outcome) in pending.iter().zip(outcomes) {
            let host = entry.host_label().to_owned();
            match outcome {
                Some(Ok(())) => {
                    info!(host = %host, "management agent installed");
                    installed.push(host);
                }
                Some(Err(source)) => {
                    return Err(BootstrapError::Install {
                        host,
                        source: Box::new(source),
                    });
                }
                None => return Err(BootstrapError::InstallTask { host }),
            }
        }
        Ok(installed)
    }

    fn latch(&self, deadline: Instant) -> ConditionLatch {
        ConditionLatch::new(deadline.saturating_duration_since(Instant::now()))
            .with_poll_interval(self.options.poll_interval)
            .with_timeout_message(OPERATION_TIMED_OUT)
            .verbose(self.options.verbose)
    }

    async fn wait_for_rest(&self, url: &str, deadline: Instant) -> Result<(), BootstrapError> {
        let plane = self.connector.connect(url)?;
        let client: &dyn ControlPlane = plane.as_ref();
        self.latch(deadline)
            .wait_until(deadline, move || async move {
                match client.ping().await {
                    Ok(()) => Ok(true),
                    Err(err) => Err(Probe::<ControlPlaneError>::NotReady(format!(
                        "connecting to rest service: {err}"
                    ))),
                }
            })
            .await
            .map_err(BootstrapError::from)
    }

    async fn rollback(&self, driver: &dyn ProvisioningDriver) {
        warn!("bootstrap failed; stopping management machines");
        let rollback_deadline = Instant::now() + self.options.rollback_timeout;
        match driver.stop_management_machines(rollback_deadline).await {
            Ok(()) => info!("management machines stopped after failed bootstrap"),
            Err(err) => warn!(
                error = %err,
                "failed to clean management machines after provisioning failure"
            ),
        }
    }

    async fn teardown_with(
        &self,
        driver: &dyn ProvisioningDriver,
        deadline: Instant,
        force: bool,
        rest_url: Option<&str>,
    ) -> Result<(), BootstrapError> {
        match rest_url {
            Some(url) => {
                if let Err(err) = self.uninstall_applications(url, deadline).await {
                    if !force {
                        return Err(err);
                    }
                    warn!(
                        error = %err,
                        "failed to uninstall applications; stopping management machines anyway"
                    );
                }
            }
            None if force => {
                warn!("no control plane URL given; skipping application uninstall");
            }
            None => return Err(BootstrapError::MissingRestUrl),
        }

        driver.stop_management_machines(deadline).await?;
        info!("management machines stopped");
        Ok(())
    }

    async fn uninstall_applications(
        &self,
        url: &str,
        deadline: Instant,
    ) -> Result<(), BootstrapError> {
        let plane = self.connector.connect(url)?;
        let client: &dyn ControlPlane = plane.as_ref();

        for application in client.applications().await? {
            if application.application_name == MANAGEMENT_APPLICATION {
                continue;
            }
            let deployment_id = client
                .undeploy_application(&application.application_name)
                .await?;
            info!(
                application = %application.application_name,
                deployment_id = %deployment_id,
                "uninstalling application"
            );
        }

        self.latch(deadline)
            .wait_until(deadline, move || async move {
                let deployed = match client.applications().await {
                    Ok(deployed) => deployed,
                    Err(err) => return Err(Probe::Fatal(err)),
                };
                let remaining: Vec<&str> = deployed
                    .iter()
                    .map(|application| application.application_name.as_str())
                    .filter(|name| *name != MANAGEMENT_APPLICATION)
                    .collect();
                if remaining.is_empty() {
                    Ok(true)
                } else {
                    Err(Probe::NotReady(format!(
                        "waiting for applications to uninstall: {}",
                        remaining.join(", ")
                    )))
                }
            })
            .await
            .map_err(BootstrapError::from)?;
        info!("all applications uninstalled");
        Ok(())
    }
}

/// Closes `driver` and folds a close failure into `outcome`.
///
/// A close failure only surfaces when everything else succeeded.
async fn close_driver<T>(
    driver: &dyn ProvisioningDriver,
    outcome: Result<T, BootstrapError>,
) -> Result<T, BootstrapError> {
    match (driver.close().await, outcome) {
        (Ok(()), result) => result,
        (Err(err), Ok(_)) => Err(err.into()),
        (Err(err), Err(primary)) => {
            warn!(error = %err, "failed to close provisioning driver");
            Err(primary)
        }
    }
}
