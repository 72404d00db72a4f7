//! Narrow client for the control plane REST gateway.
//!
//! Only the read, undeploy and scale calls the orchestrator and inspectors
//! need are modelled. [`RestControlPlane`] is the HTTP implementation;
//! tests substitute their own [`ControlPlane`].

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

mod rest;

pub use rest::{RestConnector, RestControlPlane};

/// Application the management services are deployed under.
pub const MANAGEMENT_APPLICATION: &str = "management";

/// Port of the REST gateway when none is configured.
pub const DEFAULT_REST_PORT: u16 = 8100;

/// Future returned by control plane calls.
pub type ControlPlaneFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, ControlPlaneError>> + Send + 'a>>;

/// Errors raised by control plane clients.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ControlPlaneError {
    /// Raised when the base URL cannot be used.
    #[error("invalid control plane URL {url}: {message}")]
    InvalidUrl {
        /// Offending URL.
        url: String,
        /// Parser message.
        message: String,
    },
    /// Raised when the gateway cannot be reached.
    #[error("failed to reach {url}: {message}")]
    Connection {
        /// Requested URL.
        url: String,
        /// Transport error.
        message: String,
    },
    /// Raised when the requested resource does not exist.
    #[error("resource not found: {path}")]
    NotFound {
        /// Requested path.
        path: String,
    },
    /// Raised for any other non-success response.
    #[error("request {path} failed with HTTP {status}: {message}")]
    Http {
        /// Requested path.
        path: String,
        /// HTTP status code.
        status: u16,
        /// Message extracted from the response body.
        message: String,
    },
    /// Raised when a response body has an unexpected shape.
    #[error("failed to decode response of {path}: {message}")]
    Decode {
        /// Requested path.
        path: String,
        /// Decoder message.
        message: String,
    },
}

impl ControlPlaneError {
    /// Returns `true` for [`ControlPlaneError::NotFound`].
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Lifecycle state of a deployed service.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentState {
    /// Instances are still being installed.
    #[default]
    Installing,
    /// All planned instances are running.
    Started,
    /// The deployment failed.
    Failed,
    /// Any state without a mapping.
    #[serde(other)]
    Unknown,
}

/// Description of one deployed service.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceDescription {
    /// Application owning the service.
    pub application_name: String,
    /// Service name.
    pub service_name: String,
    /// Number of running instances.
    pub instance_count: u32,
    /// Number of instances the deployment aims for.
    pub planned_instances: u32,
    /// Deployment the service belongs to.
    #[serde(alias = "deploymentID")]
    pub deployment_id: String,
    /// Lifecycle state.
    pub service_state: DeploymentState,
}

/// Description of one deployed application.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ApplicationDescription {
    /// Application name.
    pub application_name: String,
    /// Services of the application.
    pub services_description: Vec<ServiceDescription>,
}

/// A lifecycle event reported for a deployment.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct DeploymentEvent {
    /// Monotonic event index within the deployment.
    pub index: i64,
    /// Human-readable description.
    pub description: String,
}

/// Read, undeploy and scale operations of the control plane.
pub trait ControlPlane: Send + Sync {
    /// Checks that the gateway answers.
    fn ping(&self) -> ControlPlaneFuture<'_, ()>;

    /// Describes one service. A missing service is
    /// [`ControlPlaneError::NotFound`].
    fn service_description<'a>(
        &'a self,
        application: &'a str,
        service: &'a str,
    ) -> ControlPlaneFuture<'a, ServiceDescription>;

    /// Describes every service of a deployment.
    fn service_descriptions<'a>(
        &'a self,
        deployment_id: &'a str,
    ) -> ControlPlaneFuture<'a, Vec<ServiceDescription>>;

    /// Describes every deployed application.
    fn applications(&self) -> ControlPlaneFuture<'_, Vec<ApplicationDescription>>;

    /// Requests removal of an application and returns its deployment id.
    fn undeploy_application<'a>(&'a self, application: &'a str) -> ControlPlaneFuture<'a, String>;

    /// Requests removal of one service.
    fn undeploy_service<'a>(
        &'a self,
        application: &'a str,
        service: &'a str,
    ) -> ControlPlaneFuture<'a, ()>;

    /// Events of a deployment with an index of at least `from`.
    fn deployment_events<'a>(
        &'a self,
        deployment_id: &'a str,
        from: i64,
    ) -> ControlPlaneFuture<'a, Vec<DeploymentEvent>>;

    /// Requests a new instance count for a service.
    fn set_instances<'a>(
        &'a self,
        application: &'a str,
        service: &'a str,
        count: u32,
    ) -> ControlPlaneFuture<'a, ()>;

    /// Addresses of every machine currently part of the cluster.
    fn machine_hosts(&self) -> ControlPlaneFuture<'_, BTreeSet<String>>;
}

/// Opens control plane clients for gateway URLs.
pub trait ControlPlaneConnector: Send + Sync {
    /// Returns a client for the gateway at `url`.
    ///
    /// # Errors
    ///
    /// Returns [`ControlPlaneError::InvalidUrl`] for unusable URLs.
    fn connect(&self, url: &str) -> Result<Arc<dyn ControlPlane>, ControlPlaneError>;
}
