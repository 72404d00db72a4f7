//! Cluster descriptor: the TOML document naming the provisioning driver, the
//! compute templates, and the static node lists used by the BYON driver.

use std::collections::{BTreeMap, BTreeSet};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use ortho_config::toml;
use serde::Deserialize;
use thiserror::Error;

use crate::byon::NodeRecord;
use crate::installer::env::is_variable_name;
use crate::machine::{Credential, FileTransferMode, InstallationTemplate, RemoteExecutionMode};

/// Name prefix used for management machines when the provider sets none.
pub const DEFAULT_MANAGEMENT_PREFIX: &str = "stratus-manager-";

/// Name prefix used for worker machines when the provider sets none.
pub const DEFAULT_AGENT_PREFIX: &str = "stratus-agent-";

/// Zone tag given to every management machine.
pub const MANAGEMENT_ZONE: &str = "management";

const DEFAULT_USERNAME: &str = "root";
const DEFAULT_REMOTE_DIRECTORY: &str = "/opt/stratus";
const DEFAULT_BOOTSTRAP_SCRIPT: &str = "bootstrap-management.sh";

/// Errors raised while loading or querying a cluster descriptor.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum DescriptorError {
    /// Raised when the descriptor file cannot be read.
    #[error("failed to read cluster descriptor {path}: {message}")]
    Io {
        /// Path that could not be read.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the descriptor is not valid TOML or has the wrong shape.
    #[error("failed to parse cluster descriptor {path}: {message}")]
    Parse {
        /// Path that could not be parsed.
        path: Utf8PathBuf,
        /// Parser error message.
        message: String,
    },
    /// Raised when a semantic check fails.
    #[error("invalid cluster descriptor: {0}")]
    Invalid(String),
    /// Raised when a template name does not exist in the descriptor.
    #[error("compute template '{name}' is not defined in the cluster descriptor")]
    UnknownTemplate {
        /// Requested template name.
        name: String,
    },
}

/// Top-level cluster descriptor.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct ClusterDescriptor {
    /// Cluster name, used in logs and staged file names.
    pub name: String,
    /// Provider settings shared by every template.
    pub provider: ProviderSection,
    /// Template used for management machines.
    pub management_template: String,
    /// Compute templates keyed by name.
    #[serde(default)]
    pub templates: BTreeMap<String, ComputeTemplate>,
}

/// Provider settings shared by every template.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct ProviderSection {
    /// Registry key of the provisioning driver.
    pub driver: String,
    /// Name prefix of management machines.
    #[serde(default)]
    pub management_group: Option<String>,
    /// Name prefix of worker machines.
    #[serde(default)]
    pub machine_name_prefix: Option<String>,
    /// Size of the management cluster.
    #[serde(default = "default_management_machines")]
    pub management_machines: usize,
    /// Files that only management machines receive.
    #[serde(default)]
    pub management_only_files: BTreeSet<String>,
    /// URL the bootstrap script downloads the cluster software from.
    pub install_source_url: String,
    /// Optional URL of an overrides archive.
    #[serde(default)]
    pub install_overrides_url: Option<String>,
}

const fn default_management_machines() -> usize {
    1
}

impl ProviderSection {
    /// Returns the name prefix for the requested role.
    #[must_use]
    pub fn name_prefix(&self, management: bool) -> String {
        let (configured, fallback) = if management {
            (&self.management_group, DEFAULT_MANAGEMENT_PREFIX)
        } else {
            (&self.machine_name_prefix, DEFAULT_AGENT_PREFIX)
        };
        configured
            .as_deref()
            .map(str::trim)
            .filter(|prefix| !prefix.is_empty())
            .unwrap_or(fallback)
            .to_owned()
    }
}

/// A compute template: what to provision and how to reach it.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct ComputeTemplate {
    /// Image identifier or label.
    #[serde(default)]
    pub image: Option<String>,
    /// Hardware (flavour) identifier.
    #[serde(default)]
    pub hardware: Option<String>,
    /// Location or zone identifier.
    #[serde(default)]
    pub location: Option<String>,
    /// Remote login user.
    #[serde(default = "default_username")]
    pub username: String,
    /// Remote login password.
    #[serde(default)]
    pub password: Option<String>,
    /// Private key used for remote login.
    #[serde(default)]
    pub key_file: Option<Utf8PathBuf>,
    /// Local bootstrap directory uploaded to every machine.
    pub local_directory: Utf8PathBuf,
    /// Remote directory receiving the bootstrap bundle.
    #[serde(default = "default_remote_directory")]
    pub remote_directory: String,
    /// File transfer protocol.
    #[serde(default)]
    pub file_transfer: FileTransferMode,
    /// Remote execution mechanism.
    #[serde(default)]
    pub remote_execution: RemoteExecutionMode,
    /// Connects over private addresses.
    #[serde(default)]
    pub connect_via_private_ip: bool,
    /// Advertises private addresses to peers.
    #[serde(default)]
    pub bind_to_private_ip: bool,
    /// Script executed once the bundle is in place.
    #[serde(default = "default_bootstrap_script")]
    pub bootstrap_script: String,
    /// Additional variables exported before the script runs.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Static nodes for the BYON driver.
    #[serde(default)]
    pub nodes: Vec<NodeRecord>,
}

fn default_username() -> String {
    DEFAULT_USERNAME.to_owned()
}

fn default_remote_directory() -> String {
    DEFAULT_REMOTE_DIRECTORY.to_owned()
}

fn default_bootstrap_script() -> String {
    DEFAULT_BOOTSTRAP_SCRIPT.to_owned()
}

impl ComputeTemplate {
    /// Returns the configured login credential. A key file wins over a
    /// password.
    #[must_use]
    pub fn credential(&self) -> Option<Credential> {
        self.key_file
            .as_ref()
            .map(|path| Credential::KeyFile(path.clone()))
            .or_else(|| self.password.clone().map(Credential::Password))
    }
}

impl ClusterDescriptor {
    /// Reads and validates a descriptor from disk.
    ///
    /// # Errors
    ///
    /// Returns [`DescriptorError::Io`] when the file cannot be read,
    /// [`DescriptorError::Parse`] when it is not a valid descriptor, and
    /// [`DescriptorError::Invalid`] when validation fails.
    pub fn load(path: &Utf8Path) -> Result<Self, DescriptorError> {
        let contents = read_descriptor(path)?;
        Self::parse(path, &contents)
    }

    /// Parses and validates descriptor `contents`. `path` only labels errors.
    ///
    /// # Errors
    ///
    /// Returns [`DescriptorError::Parse`] or [`DescriptorError::Invalid`].
    pub fn parse(path: &Utf8Path, contents: &str) -> Result<Self, DescriptorError> {
        let descriptor: Self = toml::from_str(contents).map_err(|err| DescriptorError::Parse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Checks the cross-field rules the deserialiser cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`DescriptorError::Invalid`] describing the first violation.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        if self.provider.driver.trim().is_empty() {
            return Err(DescriptorError::Invalid(String::from(
                "provider.driver must name a provisioning driver",
            )));
        }
        if self.provider.management_machines == 0 {
            return Err(DescriptorError::Invalid(String::from(
                "provider.management_machines must be at least 1",
            )));
        }
        if self.provider.install_source_url.trim().is_empty() {
            return Err(DescriptorError::Invalid(String::from(
                "provider.install_source_url must not be empty",
            )));
        }
        self.template(&self.management_template)?;
        for (name, template) in &self.templates {
            if let Some(key) = template.env.keys().find(|key| !is_variable_name(key)) {
                return Err(DescriptorError::Invalid(format!(
                    "templates.{name}.env key '{key}' is not a valid environment variable name"
                )));
            }
        }
        Ok(())
    }

    /// Looks up a compute template by name.
    ///
    /// # Errors
    ///
    /// Returns [`DescriptorError::UnknownTemplate`] when `name` is undefined.
    pub fn template(&self, name: &str) -> Result<&ComputeTemplate, DescriptorError> {
        self.templates
            .get(name)
            .ok_or_else(|| DescriptorError::UnknownTemplate {
                name: name.to_owned(),
            })
    }

    /// Builds the shared installation template for management machines.
    ///
    /// # Errors
    ///
    /// Returns [`DescriptorError::UnknownTemplate`] when the management
    /// template is undefined.
    pub fn management_installation(
        &self,
        locator: String,
        cluster_descriptor: Option<Utf8PathBuf>,
    ) -> Result<InstallationTemplate, DescriptorError> {
        let template = self.template(&self.management_template)?;
        Ok(InstallationTemplate {
            template_name: self.management_template.clone(),
            locator,
            zones: vec![MANAGEMENT_ZONE.to_owned()],
            local_directory: template.local_directory.clone(),
            remote_directory: template.remote_directory.clone(),
            management_only_files: self.provider.management_only_files.clone(),
            cluster_descriptor,
            connect_via_private_ip: template.connect_via_private_ip,
            bind_to_private_ip: template.bind_to_private_ip,
            install_source_url: self.provider.install_source_url.clone(),
            install_overrides_url: self.provider.install_overrides_url.clone(),
            bootstrap_script: template.bootstrap_script.clone(),
            extra_env: template.env.clone(),
        })
    }
}

fn read_descriptor(path: &Utf8Path) -> Result<String, DescriptorError> {
    let parent = path
        .parent()
        .filter(|dir| !dir.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path.file_name().ok_or_else(|| DescriptorError::Io {
        path: path.to_path_buf(),
        message: String::from("descriptor path is missing a file name"),
    })?;

    let dir =
        Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| DescriptorError::Io {
            path: parent.to_path_buf(),
            message: err.to_string(),
        })?;

    dir.read_to_string(file_name)
        .map_err(|err| DescriptorError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
}

#[cfg(test)]
mod tests;
