//! Errors raised by provisioning drivers.

use thiserror::Error;

use super::compute::ComputeError;
use crate::descriptor::DescriptorError;

/// Errors raised by provisioning drivers and the driver registry.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DriverError {
    /// Raised when the descriptor or template cannot drive this backend.
    #[error("driver configuration error: {0}")]
    Config(String),
    /// Raised when a lifecycle call precedes `set_config`.
    #[error("driver used before set_config was called")]
    NotConfigured,
    /// Raised when the registry has no constructor for a key.
    #[error("unknown provisioning driver '{name}'; known drivers: {known}")]
    UnknownDriver {
        /// Requested registry key.
        name: String,
        /// Comma separated list of registered keys.
        known: String,
    },
    /// Raised when the backend refuses or fails a request.
    #[error("provisioning failed: {message}")]
    Provisioning {
        /// Backend message.
        message: String,
    },
    /// Raised when the deadline passes before an action completes.
    #[error("timed out: {action}")]
    Timeout {
        /// Action that did not complete.
        action: String,
    },
    /// Raised when a static pool has no free node left.
    #[error("no free nodes left in template {template}")]
    PoolExhausted {
        /// Template owning the pool.
        template: String,
    },
    /// Raised when no unused server name can be found.
    #[error("could not find an unused server name after {limit} attempts")]
    ServerLimitReached {
        /// Number of names tried.
        limit: u32,
    },
    /// Raised when no management machine matches the management prefix.
    #[error("no management machines found with name prefix {prefix}")]
    NoManagementMachines {
        /// Management name prefix.
        prefix: String,
    },
    /// Wrapper for compute service failures.
    #[error(transparent)]
    Compute(#[from] ComputeError),
}

impl From<DescriptorError> for DriverError {
    fn from(value: DescriptorError) -> Self {
        Self::Config(value.to_string())
    }
}
