//! Observation of deployment progress through the control plane.
//!
//! An [`InstallationProcessInspector`] polls the control plane through a
//! [`ConditionLatch`] until the scenario described by its
//! [`InspectionKind`] has ended. Every poll also reports newly running
//! instances and replays deployment events recorded since the previous poll.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::control_plane::{ControlPlane, ControlPlaneError, DeploymentState};
use crate::latch::{ConditionLatch, LatchError, Probe};

/// Interval between inspector polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Errors raised while waiting on a deployment.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum InspectorError {
    /// Raised when the control plane reports a failed deployment.
    #[error("deployment of service {service} in application {application} failed")]
    DeploymentFailed {
        /// Application owning the service.
        application: String,
        /// Service whose lifecycle failed.
        service: String,
    },
    /// Raised when the deadline elapses first.
    #[error("{message}")]
    TimedOut {
        /// Scenario-specific timeout message.
        message: String,
    },
    /// Raised when a control plane call fails with anything but not-found.
    #[error(transparent)]
    ControlPlane(#[from] ControlPlaneError),
}

/// Scenario an inspector waits on, and the condition that ends it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InspectionKind {
    /// Installation of `services` in `application`. Ends when every service
    /// is started.
    Install {
        /// Application being installed.
        application: String,
        /// Services expected to start.
        services: Vec<String>,
    },
    /// Removal of a deployment. Ends when the deployment has no services.
    Uninstall {
        /// Deployment being removed.
        deployment_id: String,
    },
    /// Growth of a service to `planned` instances.
    ScaleUp {
        /// Application owning the service.
        application: String,
        /// Scaled service.
        service: String,
        /// Target instance count.
        planned: u32,
    },
    /// Shrinkage of a service to `planned` instances.
    ScaleDown {
        /// Application owning the service.
        application: String,
        /// Scaled service.
        service: String,
        /// Target instance count.
        planned: u32,
    },
}

impl InspectionKind {
    /// Message reported when the scenario times out.
    #[must_use]
    pub const fn timeout_message(&self) -> &'static str {
        match self {
            Self::Install { .. } => {
                "Service installation timed out. Configure the timeout using the -timeout flag."
            }
            Self::Uninstall { .. } => {
                "Application uninstall timed out. Configure the timeout using the -timeout flag."
            }
            Self::ScaleUp { .. } => {
                "Service scale up timed out. Configure the timeout using the -timeout flag."
            }
            Self::ScaleDown { .. } => {
                "Service scale down timed out. Configure the timeout using the -timeout flag."
            }
        }
    }

    fn tracked_services(&self) -> Vec<(String, String, Option<u32>)> {
        match self {
            Self::Install {
                application,
                services,
            } => services
                .iter()
                .map(|service| (application.clone(), service.clone(), None))
                .collect(),
            Self::Uninstall { .. } => Vec::new(),
            Self::ScaleUp {
                application,
                service,
                planned,
            }
            | Self::ScaleDown {
                application,
                service,
                planned,
            } => vec![(application.clone(), service.clone(), Some(*planned))],
        }
    }
}

#[derive(Debug, Default)]
struct InspectorState {
    planned: BTreeMap<String, u32>,
    current: BTreeMap<String, u32>,
    last_event_index: i64,
    deployment_id: Option<String>,
}

/// Polls the control plane until a deployment scenario has ended.
pub struct InstallationProcessInspector<P: ControlPlane + ?Sized> {
    control_plane: Arc<P>,
    kind: InspectionKind,
    poll_interval: Duration,
    verbose: bool,
    state: Mutex<InspectorState>,
}

impl<P: ControlPlane + ?Sized> InstallationProcessInspector<P> {
    /// Creates an inspector for `kind`.
    #[must_use]
    pub fn new(control_plane: Arc<P>, kind: InspectionKind) -> Self {
        let mut state = InspectorState {
            last_event_index: -1,
            ..InspectorState::default()
        };
        for (_, service, planned) in kind.tracked_services() {
            if let Some(count) = planned {
                state.planned.insert(service, count);
            }
        }
        if let InspectionKind::Uninstall { deployment_id } = &kind {
            state.deployment_id = Some(deployment_id.clone());
        }

        Self {
            control_plane,
            kind,
            poll_interval: DEFAULT_POLL_INTERVAL,
            verbose: false,
            state: Mutex::new(state),
        }
    }

    /// Overrides the interval between polls.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Logs pending polls at info level.
    #[must_use]
    pub const fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Scenario this inspector waits on.
    #[must_use]
    pub const fn kind(&self) -> &InspectionKind {
        &self.kind
    }

    /// Index of the last deployment event reported, or `-1`.
    #[must_use]
    pub fn last_event_index(&self) -> i64 {
        self.state.lock().last_event_index
    }

    /// Number of running instances of a service. A service the control
    /// plane does not know has none.
    ///
    /// # Errors
    ///
    /// Propagates control plane failures other than not-found.
    pub async fn number_of_running_instances(
        &self,
        application: &str,
        service: &str,
    ) -> Result<u32, ControlPlaneError> {
        match self
            .control_plane
            .service_description(application, service)
            .await
        {
            Ok(description) => Ok(description.instance_count),
            Err(err) if err.is_not_found() => Ok(0),
            Err(err) => Err(err),
        }
    }

    /// Polls until the scenario ends or `deadline` passes.
    ///
    /// # Errors
    ///
    /// Returns [`InspectorError::DeploymentFailed`] as soon as a failed
    /// lifecycle is observed, [`InspectorError::ControlPlane`] as soon as a
    /// control plane call fails with anything but not-found, and
    /// [`InspectorError::TimedOut`] with the scenario's message when the
    /// deadline elapses.
    pub async fn wait_for_completion(&self, deadline: Instant) -> Result<(), InspectorError> {
        let latch = ConditionLatch::new(deadline.saturating_duration_since(Instant::now()))
            .with_poll_interval(self.poll_interval)
            .with_timeout_message(self.kind.timeout_message())
            .verbose(self.verbose);

        latch
            .wait_until(deadline, || self.poll())
            .await
            .map_err(|err| match err {
                LatchError::TimedOut { message } => InspectorError::TimedOut { message },
                LatchError::Aborted(inner) => inner,
            })
    }

    async fn poll(&self) -> Result<bool, Probe<InspectorError>> {
        self.report_new_instances().await.map_err(fatal)?;
        let ended = self.lifecycle_ended().await;
        let reported = self.report_events().await;
        match (ended, reported) {
            (Err(probe), _) => Err(probe),
            (Ok(_), Err(err)) => Err(fatal(err)),
            (Ok(true), Ok(())) => Ok(true),
            (Ok(false), Ok(())) => {
                Err(Probe::NotReady(String::from("deployment still in progress")))
            }
        }
    }

    async fn report_new_instances(&self) -> Result<(), ControlPlaneError> {
        for (application, service, _) in self.kind.tracked_services() {
            let count = self
                .number_of_running_instances(&application, &service)
                .await?;

            let mut state = self.state.lock();
            let previous = state.current.get(&service).copied().unwrap_or(0);
            if count > previous {
                let planned = state.planned.get(&service).copied().unwrap_or(count);
                info!(
                    %service,
                    running = count,
                    planned,
                    "successfully installed instances"
                );
            }
            state.current.insert(service, count);
        }
        Ok(())
    }

    async fn lifecycle_ended(&self) -> Result<bool, Probe<InspectorError>> {
        match &self.kind {
            InspectionKind::Install {
                application,
                services,
            } => {
                let mut ended = true;
                for service in services {
                    let description = match self
                        .control_plane
                        .service_description(application, service)
                        .await
                    {
                        Ok(description) => description,
                        Err(err) if err.is_not_found() => {
                            ended = false;
                            continue;
                        }
                        Err(err) => return Err(fatal(err)),
                    };
                    self.remember(service, &description.deployment_id, description.planned_instances);
                    match description.service_state {
                        DeploymentState::Failed => {
                            return Err(Probe::Fatal(InspectorError::DeploymentFailed {
                                application: application.clone(),
                                service: service.clone(),
                            }));
                        }
                        DeploymentState::Started => {}
                        _ => ended = false,
                    }
                }
                Ok(ended)
            }
            InspectionKind::Uninstall { deployment_id } => {
                match self.control_plane.service_descriptions(deployment_id).await {
                    Ok(remaining) => Ok(remaining.is_empty()),
                    Err(err) if err.is_not_found() => Ok(true),
                    Err(err) => Err(fatal(err)),
                }
            }
            InspectionKind::ScaleUp {
                application,
                service,
                planned,
            } => match self
                .control_plane
                .service_description(application, service)
                .await
            {
                Ok(description) => {
                    self.remember(service, &description.deployment_id, *planned);
                    Ok(description.instance_count == *planned
                        && description.service_state == DeploymentState::Started)
                }
                Err(err) if err.is_not_found() => Ok(false),
                Err(err) => Err(fatal(err)),
            },
            InspectionKind::ScaleDown {
                application,
                service,
                planned,
            } => match self
                .control_plane
                .service_description(application, service)
                .await
            {
                Ok(description) => {
                    self.remember(service, &description.deployment_id, *planned);
                    Ok(description.instance_count == *planned)
                }
                Err(err) if err.is_not_found() => Ok(*planned == 0),
                Err(err) => Err(fatal(err)),
            },
        }
    }

    fn remember(&self, service: &str, deployment_id: &str, planned: u32) {
        let mut state = self.state.lock();
        state.planned.entry(service.to_owned()).or_insert(planned);
        if state.deployment_id.is_none() && !deployment_id.is_empty() {
            state.deployment_id = Some(deployment_id.to_owned());
        }
    }

    async fn report_events(&self) -> Result<(), ControlPlaneError> {
        let (deployment_id, from) = {
            let state = self.state.lock();
            let Some(id) = state.deployment_id.clone() else {
                return Ok(());
            };
            (id, state.last_event_index.saturating_add(1))
        };

        let events = match self
            .control_plane
            .deployment_events(&deployment_id, from)
            .await
        {
            Ok(events) => events,
            Err(err) if err.is_not_found() => {
                debug!(%deployment_id, "deployment has no event log");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        for event in &events {
            info!(%deployment_id, "{}", event.description);
        }
        if let Some(last) = events.last() {
            let mut state = self.state.lock();
            state.last_event_index = state.last_event_index.max(last.index);
        }
        Ok(())
    }
}

fn fatal(err: ControlPlaneError) -> Probe<InspectorError> {
    Probe::Fatal(InspectorError::ControlPlane(err))
}

#[cfg(test)]
mod tests;
