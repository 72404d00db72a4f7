//! String-keyed table of driver constructors.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use super::generic::GenericDriver;
use super::scaleway::ScalewayCompute;
use super::{DriverError, ProvisioningDriver};
use crate::byon::ByonDriver;
use crate::config::ScalewayConfig;
use crate::control_plane::DEFAULT_REST_PORT;
use crate::reachability::TcpProbe;

/// Builds a fresh, unconfigured driver.
pub type DriverConstructor =
    Box<dyn Fn() -> Result<Box<dyn ProvisioningDriver>, DriverError> + Send + Sync>;

/// Maps the `provider.driver` key of a cluster descriptor to a constructor.
#[derive(Default)]
pub struct DriverRegistry {
    constructors: BTreeMap<String, DriverConstructor>,
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("keys", &self.keys())
            .finish()
    }
}

impl DriverRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in `byon` and `scaleway` drivers.
    #[must_use]
    pub fn with_builtin() -> Self {
        Self::builtin_with_rest_port(DEFAULT_REST_PORT)
    }

    /// Like [`DriverRegistry::with_builtin`], with BYON management nodes
    /// recognised by a gateway listening on `rest_port`.
    #[must_use]
    pub fn builtin_with_rest_port(rest_port: u16) -> Self {
        let mut registry = Self::new();
        registry.register("byon", move || {
            let driver = ByonDriver::new(Arc::new(TcpProbe)).with_rest_port(rest_port);
            Ok(Box::new(driver) as Box<dyn ProvisioningDriver>)
        });
        registry.register("scaleway", || {
            let config = ScalewayConfig::load_without_cli_args()
                .map_err(|err| DriverError::Config(err.to_string()))?;
            let compute = ScalewayCompute::new(config)?;
            Ok(Box::new(GenericDriver::new(compute)) as Box<dyn ProvisioningDriver>)
        });
        registry
    }

    /// Adds or replaces the constructor for `key`.
    pub fn register<F>(&mut self, key: impl Into<String>, constructor: F)
    where
        F: Fn() -> Result<Box<dyn ProvisioningDriver>, DriverError> + Send + Sync + 'static,
    {
        self.constructors.insert(key.into(), Box::new(constructor));
    }

    /// Registered keys in sorted order.
    #[must_use]
    pub fn keys(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    /// Checks that `key` names a registered driver without building it.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::UnknownDriver`] listing the known keys.
    pub fn validate(&self, key: &str) -> Result<(), DriverError> {
        if self.constructors.contains_key(key.trim()) {
            return Ok(());
        }
        Err(DriverError::UnknownDriver {
            name: key.to_owned(),
            known: self.keys().join(", "),
        })
    }

    /// Builds an unconfigured driver for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::UnknownDriver`] for unregistered keys and any
    /// error raised by the constructor itself.
    pub fn create(&self, key: &str) -> Result<Box<dyn ProvisioningDriver>, DriverError> {
        let constructor =
            self.constructors
                .get(key.trim())
                .ok_or_else(|| DriverError::UnknownDriver {
                    name: key.to_owned(),
                    known: self.keys().join(", "),
                })?;
        debug!(driver = key, "constructing provisioning driver");
        constructor()
    }
}
