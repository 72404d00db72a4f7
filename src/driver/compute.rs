//! Provider seam used by the generic driver.
//!
//! A [`ComputeService`] knows how to talk to one cloud API. The generic
//! driver owns naming, retries, readiness polling and cleanup on top of it.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

/// Future returned by compute service operations.
pub type ComputeFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ComputeError>> + Send + 'a>>;

/// Lifecycle state of a provider node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeState {
    /// Being created or booting.
    Pending,
    /// Booted and reachable.
    Running,
    /// Powered off but still allocated.
    Stopped,
    /// Destroyed or being destroyed.
    Terminated,
    /// Failed on the provider side.
    Error,
    /// Any state the provider reports that has no mapping.
    Unknown,
}

impl NodeState {
    /// Returns `true` for states a management rediscovery treats as live.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

/// Provider node as seen by the generic driver.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodeSummary {
    /// Provider identifier.
    pub id: String,
    /// Server name.
    pub name: String,
    /// Lifecycle state.
    pub state: NodeState,
    /// Public address, when assigned.
    pub public_ip: Option<String>,
    /// Private address, when assigned.
    pub private_ip: Option<String>,
    /// Zone or location identifier.
    pub location: Option<String>,
}

impl NodeSummary {
    /// Returns `true` when either address equals `ip`.
    #[must_use]
    pub fn has_address(&self, ip: &str) -> bool {
        self.public_ip.as_deref() == Some(ip) || self.private_ip.as_deref() == Some(ip)
    }
}

/// Parameters for a single node creation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodeRequest {
    /// Server name.
    pub name: String,
    /// Image identifier or label.
    pub image: String,
    /// Hardware (flavour) identifier.
    pub hardware: String,
    /// Zone or location identifier, when the template names one.
    pub location: Option<String>,
    /// Group the server is tagged with.
    pub group: String,
}

/// Errors raised by compute services.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ComputeError {
    /// Raised when the provider has not yet propagated a fresh security
    /// group. The generic driver retries this one.
    #[error("The security group {group} does not exist yet")]
    SecurityGroupNotReady {
        /// Security group named by the provider.
        group: String,
    },
    /// Raised when a node id is unknown to the provider.
    #[error("node {id} not found")]
    NotFound {
        /// Provider identifier.
        id: String,
    },
    /// Wrapper for any other provider failure.
    #[error("provider error: {message}")]
    Provider {
        /// Provider message.
        message: String,
    },
}

impl ComputeError {
    /// Returns `true` for the transient security group error.
    ///
    /// Providers that only report a message are recognised by its wording.
    #[must_use]
    pub fn is_security_group_not_ready(&self) -> bool {
        match self {
            Self::SecurityGroupNotReady { .. } => true,
            Self::Provider { message } => {
                message.contains("The security group") && message.contains("does not exist")
            }
            Self::NotFound { .. } => false,
        }
    }
}

/// Minimal interface a cloud API exposes to the generic driver.
pub trait ComputeService: Send + Sync {
    /// Creates a node and returns it in whatever state the provider reports.
    fn create_node<'a>(&'a self, request: &'a NodeRequest) -> ComputeFuture<'a, NodeSummary>;

    /// Fetches a node, or `None` when it no longer exists.
    fn get_node<'a>(&'a self, id: &'a str) -> ComputeFuture<'a, Option<NodeSummary>>;

    /// Lists every node the service manages.
    fn list_nodes(&self) -> ComputeFuture<'_, Vec<NodeSummary>>;

    /// Requests destruction of a node.
    fn destroy_node<'a>(&'a self, id: &'a str) -> ComputeFuture<'a, ()>;

    /// Releases connections. Safe to call more than once.
    fn close(&self) -> ComputeFuture<'_, ()>;

    /// Tells the service which location the configured template targets.
    fn register_location(&self, _location: &str) {}
}
