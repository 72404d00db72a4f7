//! Configuration loading via `ortho-config`.
//!
//! [`StratusConfig`] carries the runtime settings of the bootstrap tool and
//! [`ScalewayConfig`] the credentials of the Scaleway connector. Both merge
//! defaults, configuration files, and environment variables.

use std::ffi::OsString;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Runtime settings shared by every command.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "STRATUS",
    discovery(
        app_name = "stratus",
        env_var = "STRATUS_CONFIG_PATH",
        config_file_name = "stratus.toml",
        dotfile_name = ".stratus.toml",
        project_file_name = "stratus.toml"
    )
)]
#[expect(
    clippy::struct_excessive_bools,
    reason = "configuration struct with user-facing toggles"
)]
pub struct StratusConfig {
    /// Path to the cluster descriptor.
    #[ortho_config(default = "cluster.toml".to_owned())]
    pub cluster_descriptor: String,
    /// Overall bootstrap budget in minutes.
    #[ortho_config(default = 30)]
    pub bootstrap_timeout_minutes: u64,
    /// Overall teardown budget in minutes.
    #[ortho_config(default = 15)]
    pub teardown_timeout_minutes: u64,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `sftp` executable.
    #[ortho_config(default = "sftp".to_owned())]
    pub sftp_bin: String,
    /// Path to the `sshpass` executable used for password logins.
    #[ortho_config(default = "sshpass".to_owned())]
    pub sshpass_bin: String,
    /// Known hosts file override; defaults to `/dev/null` for fresh hosts.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub ssh_known_hosts_file: String,
    /// Whether to enforce host key checking.
    #[ortho_config(default = false)]
    pub ssh_strict_host_key_checking: bool,
    /// Port of the control plane REST gateway.
    #[ortho_config(default = 8100)]
    pub rest_port: u16,
    /// Version segment of the control plane REST paths.
    #[ortho_config(default = "2.7.0".to_owned())]
    pub rest_api_version: String,
    /// Stops freshly provisioned machines when bootstrap fails.
    #[ortho_config(default = true)]
    pub rollback_on_failure: bool,
    /// Logs polling progress at info level.
    #[ortho_config(default = false)]
    pub verbose: bool,
}

impl StratusConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("stratus")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Checks the values the loader cannot validate on its own.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] for blank values and
    /// [`ConfigError::Invalid`] for zero budgets or ports.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.cluster_descriptor,
            &FieldMetadata::new(
                "cluster descriptor path",
                "STRATUS_CLUSTER_DESCRIPTOR",
                "cluster_descriptor",
                "stratus",
            ),
        )?;
        require_field(
            &self.ssh_bin,
            &FieldMetadata::new("ssh binary", "STRATUS_SSH_BIN", "ssh_bin", "stratus"),
        )?;
        require_field(
            &self.sftp_bin,
            &FieldMetadata::new("sftp binary", "STRATUS_SFTP_BIN", "sftp_bin", "stratus"),
        )?;
        require_field(
            &self.rest_api_version,
            &FieldMetadata::new(
                "REST API version",
                "STRATUS_REST_API_VERSION",
                "rest_api_version",
                "stratus",
            ),
        )?;
        if self.bootstrap_timeout_minutes == 0 {
            return Err(ConfigError::Invalid(String::from(
                "bootstrap_timeout_minutes must be greater than zero",
            )));
        }
        if self.teardown_timeout_minutes == 0 {
            return Err(ConfigError::Invalid(String::from(
                "teardown_timeout_minutes must be greater than zero",
            )));
        }
        if self.rest_port == 0 {
            return Err(ConfigError::Invalid(String::from(
                "rest_port must be a valid TCP port",
            )));
        }
        Ok(())
    }

    /// Cluster descriptor path as a UTF-8 path.
    #[must_use]
    pub fn descriptor_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(self.cluster_descriptor.trim())
    }

    /// Bootstrap budget as a duration.
    #[must_use]
    pub const fn bootstrap_timeout(&self) -> Duration {
        Duration::from_secs(self.bootstrap_timeout_minutes.saturating_mul(60))
    }

    /// Teardown budget as a duration.
    #[must_use]
    pub const fn teardown_timeout(&self) -> Duration {
        Duration::from_secs(self.teardown_timeout_minutes.saturating_mul(60))
    }
}

/// Scaleway credentials and zone defaults.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "SCW")]
pub struct ScalewayConfig {
    /// Access key assigned to the Scaleway application.
    pub access_key: Option<String>,
    /// Secret key used for authentication. This value is required.
    pub secret_key: String,
    /// Organisation identifier used by some Scaleway endpoints.
    pub default_organization_id: Option<String>,
    /// Project identifier used for billing and resource scoping.
    pub default_project_id: String,
    /// Zone used when a compute template names no location.
    #[ortho_config(default = "fr-par-1".to_owned())]
    pub default_zone: String,
    /// CPU architecture used to select the correct image variant.
    #[ortho_config(default = "x86_64".to_owned())]
    pub default_architecture: String,
}

impl ScalewayConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("stratus")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.secret_key,
            &FieldMetadata::new(
                "Scaleway API secret key",
                "SCW_SECRET_KEY",
                "secret_key",
                "scaleway",
            ),
        )?;
        require_field(
            &self.default_project_id,
            &FieldMetadata::new(
                "Scaleway project ID",
                "SCW_DEFAULT_PROJECT_ID",
                "default_project_id",
                "scaleway",
            ),
        )?;
        require_field(
            &self.default_zone,
            &FieldMetadata::new(
                "availability zone",
                "SCW_DEFAULT_ZONE",
                "default_zone",
                "scaleway",
            ),
        )?;
        require_field(
            &self.default_architecture,
            &FieldMetadata::new(
                "CPU architecture",
                "SCW_DEFAULT_ARCHITECTURE",
                "default_architecture",
                "scaleway",
            ),
        )?;
        Ok(())
    }
}

/// Metadata for a configuration field, used to generate actionable error
/// messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
    section: &'static str,
}

impl FieldMetadata {
    const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
        section: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
            section,
        }
    }
}

fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to [{}] in stratus.toml",
            metadata.description, metadata.env_var, metadata.toml_key, metadata.section
        )));
    }
    Ok(())
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a value is present but unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
