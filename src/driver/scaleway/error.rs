//! Error types for the Scaleway connector.

use scaleway_rs::ScalewayError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::driver::DriverError;
use crate::driver::compute::ComputeError;

/// Errors raised by the Scaleway connector.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ScalewayBackendError {
    /// Raised when the credentials are incomplete.
    #[error("configuration error: {0}")]
    Config(String),
    /// Raised when the requested image label cannot be resolved.
    #[error("image '{label}' (arch {arch}) not found in zone {zone}")]
    ImageNotFound {
        /// Image label from the compute template.
        label: String,
        /// Architecture from the credentials.
        arch: String,
        /// Zone used for the lookup.
        zone: String,
    },
    /// Raised when the server type is not offered in the selected zone.
    #[error("instance type '{instance_type}' not available in zone {zone}")]
    InstanceTypeUnavailable {
        /// Requested commercial type.
        instance_type: String,
        /// Target zone.
        zone: String,
    },
    /// Raised when a freshly created server cannot be powered on.
    #[error("instance {instance_id} in state {state} cannot be powered on")]
    PowerOnNotAllowed {
        /// Provider instance identifier.
        instance_id: String,
        /// Current state reported by the provider.
        state: String,
    },
    /// Raised when a server id is unknown in every tracked zone.
    #[error("instance {instance_id} not found")]
    NotFound {
        /// Provider instance identifier.
        instance_id: String,
    },
    /// Wrapper for provider level failures.
    #[error("provider error: {message}")]
    Provider {
        /// Message returned by the API or the HTTP client.
        message: String,
    },
}

impl From<ScalewayError> for ScalewayBackendError {
    fn from(value: ScalewayError) -> Self {
        Self::Provider {
            message: value.to_string(),
        }
    }
}

impl From<reqwest::Error> for ScalewayBackendError {
    fn from(value: reqwest::Error) -> Self {
        Self::Provider {
            message: value.to_string(),
        }
    }
}

impl From<ConfigError> for ScalewayBackendError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value.to_string())
    }
}

impl From<ScalewayBackendError> for ComputeError {
    fn from(value: ScalewayBackendError) -> Self {
        match value {
            ScalewayBackendError::NotFound { instance_id } => Self::NotFound { id: instance_id },
            ScalewayBackendError::Provider { message } => Self::Provider { message },
            other => Self::Provider {
                message: other.to_string(),
            },
        }
    }
}

impl From<ScalewayBackendError> for DriverError {
    fn from(value: ScalewayBackendError) -> Self {
        match value {
            ScalewayBackendError::Config(message) => Self::Config(message),
            other => Self::Compute(other.into()),
        }
    }
}
