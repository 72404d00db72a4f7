//! Uninstall and scale flows.
//!
//! These flows never provision anything. They issue one request to the
//! control plane, then hand the wait to an [`InstallationProcessInspector`].

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::info;

use crate::control_plane::{ControlPlane, ControlPlaneError, MANAGEMENT_APPLICATION};
use crate::inspector::{
    DEFAULT_POLL_INTERVAL, InspectionKind, InspectorError, InstallationProcessInspector,
};

/// Errors raised by the deployment flows.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DeploymentError {
    /// Raised when the application is not deployed.
    #[error("application {application} is not deployed; deployed applications: {known}")]
    ApplicationNotFound {
        /// Requested application.
        application: String,
        /// Comma separated names of the deployed applications.
        known: String,
    },
    /// Raised when a service is unknown to the control plane.
    #[error("service {service} not found in application {application}")]
    ServiceNotFound {
        /// Application owning the service.
        application: String,
        /// Requested service.
        service: String,
    },
    /// Raised when asked to uninstall the management application.
    #[error("the management application cannot be uninstalled; use teardown")]
    ProtectedApplication,
    /// Raised when a control plane request fails.
    #[error(transparent)]
    ControlPlane(#[from] ControlPlaneError),
    /// Raised when the wait fails or times out.
    #[error(transparent)]
    Inspector(InspectorError),
}

impl From<InspectorError> for DeploymentError {
    fn from(err: InspectorError) -> Self {
        match err {
            InspectorError::ControlPlane(inner) => Self::ControlPlane(inner),
            other => Self::Inspector(other),
        }
    }
}

/// Result of a scale request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScaleOutcome {
    /// The service already ran the requested number of instances.
    Unchanged {
        /// Instance count.
        count: u32,
    },
    /// The service grew.
    ScaledUp {
        /// Count before the request.
        from: u32,
        /// Count after the request.
        to: u32,
    },
    /// The service shrank.
    ScaledDown {
        /// Count before the request.
        from: u32,
        /// Count after the request.
        to: u32,
    },
}

/// Runs uninstall and scale requests against one control plane.
pub struct DeploymentFlows<P: ControlPlane + ?Sized> {
    control_plane: Arc<P>,
    poll_interval: Duration,
    verbose: bool,
}

impl<P: ControlPlane + ?Sized> DeploymentFlows<P> {
    /// Creates flows bound to `control_plane`.
    #[must_use]
    pub const fn new(control_plane: Arc<P>) -> Self {
        Self {
            control_plane,
            poll_interval: DEFAULT_POLL_INTERVAL,
            verbose: false,
        }
    }

    /// Overrides the inspector poll interval.
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

    fn inspector(&self, kind: InspectionKind) -> InstallationProcessInspector<P> {
        InstallationProcessInspector::new(Arc::clone(&self.control_plane), kind)
            .with_poll_interval(self.poll_interval)
            .verbose(self.verbose)
    }

    /// Undeploys `application` and waits until its deployment is empty.
    ///
    /// Returns the deployment id reported by the control plane.
    ///
    /// # Errors
    ///
    /// Returns [`DeploymentError::ApplicationNotFound`] for unknown
    /// applications, [`DeploymentError::ProtectedApplication`] for the
    /// management application, and the inspector error when the wait fails.
    pub async fn uninstall_application(
        &self,
        application: &str,
        deadline: Instant,
    ) -> Result<String, DeploymentError> {
        if application == MANAGEMENT_APPLICATION {
            return Err(DeploymentError::ProtectedApplication);
        }

        let deployed = self.control_plane.applications().await?;
        if !deployed
            .iter()
            .any(|description| description.application_name == application)
        {
            let known: Vec<&str> = deployed
                .iter()
                .map(|description| description.application_name.as_str())
                .collect();
            return Err(DeploymentError::ApplicationNotFound {
                application: application.to_owned(),
                known: known.join(", "),
            });
        }

        let deployment_id = self.control_plane.undeploy_application(application).await?;
        info!(application, deployment_id = %deployment_id, "uninstalling application");
        self.inspector(InspectionKind::Uninstall {
            deployment_id: deployment_id.clone(),
        })
        .wait_for_completion(deadline)
        .await?;
        info!(application, "application uninstalled");
        Ok(deployment_id)
    }

    /// Sets the instance count of a service and waits until it is reached.
    ///
    /// # Errors
    ///
    /// Returns [`DeploymentError::ServiceNotFound`] for unknown services and
    /// the inspector error when the wait fails.
    pub async fn set_service_instances(
        &self,
        application: &str,
        service: &str,
        count: u32,
        deadline: Instant,
    ) -> Result<ScaleOutcome, DeploymentError> {
        let current = match self
            .control_plane
            .service_description(application, service)
            .await
        {
            Ok(description) => description.instance_count,
            Err(err) if err.is_not_found() => {
                return Err(DeploymentError::ServiceNotFound {
                    application: application.to_owned(),
                    service: service.to_owned(),
                });
            }
            Err(err) => return Err(err.into()),
        };

        let (kind, outcome) = match count.cmp(&current) {
            Ordering::Equal => {
                info!(application, service, count, "instance count unchanged");
                return Ok(ScaleOutcome::Unchanged { count });
            }
            Ordering::Greater => (
                InspectionKind::ScaleUp {
                    application: application.to_owned(),
                    service: service.to_owned(),
                    planned: count,
                },
                ScaleOutcome::ScaledUp {
                    from: current,
                    to: count,
                },
            ),
            Ordering::Less => (
                InspectionKind::ScaleDown {
                    application: application.to_owned(),
                    service: service.to_owned(),
                    planned: count,
                },
                ScaleOutcome::ScaledDown {
                    from: current,
                    to: count,
                },
            ),
        };

        self.control_plane
            .set_instances(application, service, count)
            .await?;
        info!(application, service, from = current, to = count, "scaling service");
        self.inspector(kind).wait_for_completion(deadline).await?;
        Ok(outcome)
    }
}
