//! Records describing provisioned machines and the per-machine parameters
//! the agentless installer consumes.
//!
//! A [`MachineDetails`] value is produced by a provisioning driver and is
//! read-only afterwards except for the two agent flags. An
//! [`InstallationDetails`] value is derived from a shared
//! [`InstallationTemplate`] for exactly one machine and is consumed once.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use camino::Utf8PathBuf;
use serde::Deserialize;
use uuid::Uuid;

/// Default SSH port used for probing and file transfer.
pub const SSH_PORT: u16 = 22;

/// Default SMB port used when the file transfer mode is CIFS.
pub const CIFS_PORT: u16 = 445;

/// Protocol used to copy the bootstrap bundle onto a machine.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum FileTransferMode {
    /// Secure file transfer over SSH.
    #[default]
    Sftp,
    /// Windows file sharing.
    Cifs,
}

impl FileTransferMode {
    /// Returns the TCP port the reachability probe targets for this mode.
    #[must_use]
    pub const fn port(self) -> u16 {
        match self {
            Self::Sftp => SSH_PORT,
            Self::Cifs => CIFS_PORT,
        }
    }
}

/// Mechanism used to run the bootstrap script remotely.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum RemoteExecutionMode {
    /// POSIX shell over SSH.
    #[default]
    Ssh,
    /// Windows remote shell.
    Shell,
}

/// Authentication material for remote sessions.
#[derive(Clone, Eq, PartialEq)]
pub enum Credential {
    /// Password authentication.
    Password(String),
    /// Private key file on the local machine.
    KeyFile(Utf8PathBuf),
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(<redacted>)"),
            Self::KeyFile(path) => f.debug_tuple("KeyFile").field(path).finish(),
        }
    }
}

/// A machine handed back by a provisioning driver.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MachineDetails {
    /// Backend specific machine identifier.
    pub machine_id: String,
    /// Publicly routable address, when the backend assigned one.
    pub public_address: Option<String>,
    /// Address on the private network, when known.
    pub private_address: Option<String>,
    /// Remote login user.
    pub username: String,
    /// Remote login credential.
    pub credential: Option<Credential>,
    /// Directory the bootstrap bundle is copied into.
    pub remote_directory: String,
    /// File transfer protocol supported by the machine.
    pub file_transfer: FileTransferMode,
    /// Remote execution mechanism supported by the machine.
    pub remote_execution: RemoteExecutionMode,
    /// Set when a cluster agent already runs on the machine.
    pub agent_running: bool,
    /// Set when the cluster software is already present on the machine.
    pub agent_installed: bool,
    /// Location or zone the machine lives in.
    pub location_id: Option<String>,
    /// Compute template the machine was created from.
    pub template_name: String,
}

impl MachineDetails {
    /// Returns the preferred address, falling back to the other one when the
    /// preferred address is missing.
    #[must_use]
    pub fn address(&self, prefer_private: bool) -> Option<&str> {
        let (first, second) = if prefer_private {
            (&self.private_address, &self.public_address)
        } else {
            (&self.public_address, &self.private_address)
        };
        first.as_deref().or(second.as_deref())
    }

    /// Returns a label suitable for log lines and error messages.
    #[must_use]
    pub fn host_label(&self) -> &str {
        self.address(false).unwrap_or(self.machine_id.as_str())
    }
}

/// Role a machine plays once the agent starts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InstallRole {
    /// Management (seed) node. Only the first seed serves the web services.
    Seed {
        /// Suppresses the web UI and REST gateway on this node.
        no_web_services: bool,
    },
    /// Worker node.
    Agent,
}

/// Installation parameters for exactly one machine.
#[derive(Clone, Debug, Eq, PartialEq)]
#[expect(
    clippy::struct_excessive_bools,
    reason = "the remote script contract is a set of independent toggles"
)]
pub struct InstallationDetails {
    /// Backend specific machine identifier.
    pub machine_id: String,
    /// Compute template the machine was created from.
    pub template_name: String,
    /// Private address of the machine.
    pub private_ip: Option<String>,
    /// Public address of the machine.
    pub public_ip: Option<String>,
    /// Remote login user.
    pub username: String,
    /// Remote login credential.
    pub credential: Option<Credential>,
    /// Comma separated peer discovery addresses.
    pub locator: String,
    /// Zone tags advertised by the agent.
    pub zones: Vec<String>,
    /// Local bootstrap directory mirrored onto the machine.
    pub local_directory: Utf8PathBuf,
    /// Remote directory receiving the bootstrap bundle.
    pub remote_directory: String,
    /// File names or relative paths withheld from the transfer.
    pub exclusions: BTreeSet<String>,
    /// Cluster descriptor copied into the remote root when present.
    pub cluster_descriptor: Option<Utf8PathBuf>,
    /// Starts the agent in seed mode.
    pub management: bool,
    /// Suppresses the web UI and REST gateway.
    pub no_web_services: bool,
    /// Connects over the private address instead of the public one.
    pub connect_via_private_ip: bool,
    /// Advertises the private address as the machine address.
    pub bind_to_private_ip: bool,
    /// URL the bootstrap script downloads the cluster software from.
    pub install_source_url: String,
    /// Optional URL of an overrides archive.
    pub install_overrides_url: Option<String>,
    /// Identifier reserving this install with the control plane.
    pub reservation_id: String,
    /// Name of the script executed after the transfer.
    pub bootstrap_script: String,
    /// Additional variables exported before the script runs.
    pub extra_env: BTreeMap<String, String>,
    /// File transfer protocol used for this machine.
    pub file_transfer: FileTransferMode,
    /// Remote execution mechanism used for this machine.
    pub remote_execution: RemoteExecutionMode,
}

impl InstallationDetails {
    /// Address the installer connects to.
    #[must_use]
    pub fn connect_host(&self) -> Option<&str> {
        if self.connect_via_private_ip {
            self.private_ip.as_deref()
        } else {
            self.public_ip.as_deref()
        }
    }

    /// Address the agent advertises to its peers.
    #[must_use]
    pub fn machine_ip(&self) -> Option<&str> {
        if self.bind_to_private_ip {
            self.private_ip.as_deref()
        } else {
            self.public_ip.as_deref()
        }
    }

    /// Returns a label suitable for log lines and error messages.
    #[must_use]
    pub fn host_label(&self) -> &str {
        self.connect_host()
            .or(self.public_ip.as_deref())
            .or(self.private_ip.as_deref())
            .unwrap_or(self.machine_id.as_str())
    }
}

/// Shared installation settings cloned for every machine.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InstallationTemplate {
    /// Compute template name.
    pub template_name: String,
    /// Peer discovery addresses shared by every machine.
    pub locator: String,
    /// Zone tags shared by every machine.
    pub zones: Vec<String>,
    /// Local bootstrap directory.
    pub local_directory: Utf8PathBuf,
    /// Remote directory used when the machine does not name one.
    pub remote_directory: String,
    /// Files withheld from worker nodes.
    pub management_only_files: BTreeSet<String>,
    /// Cluster descriptor handed to seed nodes.
    pub cluster_descriptor: Option<Utf8PathBuf>,
    /// Connects over private addresses.
    pub connect_via_private_ip: bool,
    /// Advertises private addresses.
    pub bind_to_private_ip: bool,
    /// Software download URL.
    pub install_source_url: String,
    /// Optional overrides download URL.
    pub install_overrides_url: Option<String>,
    /// Script executed after the transfer.
    pub bootstrap_script: String,
    /// Additional variables exported before the script runs.
    pub extra_env: BTreeMap<String, String>,
}

impl InstallationTemplate {
    /// Clones the template for `machine`, overriding the identity fields.
    ///
    /// Seed nodes receive the cluster descriptor and the full bundle. Agents
    /// have the management-only files withheld and never see the descriptor.
    #[must_use]
    pub fn details_for(&self, machine: &MachineDetails, role: InstallRole) -> InstallationDetails {
        let (management, no_web_services) = match role {
            InstallRole::Seed { no_web_services } => (true, no_web_services),
            InstallRole::Agent => (false, true),
        };
        let exclusions = if management {
            BTreeSet::new()
        } else {
            self.management_only_files.clone()
        };
        let cluster_descriptor = if management {
            self.cluster_descriptor.clone()
        } else {
            None
        };
        let remote_directory = if machine.remote_directory.trim().is_empty() {
            self.remote_directory.clone()
        } else {
            machine.remote_directory.clone()
        };
        let locator = if self.locator.trim().is_empty() {
            machine.private_address.clone().unwrap_or_default()
        } else {
            self.locator.clone()
        };

        InstallationDetails {
            machine_id: machine.machine_id.clone(),
            template_name: self.template_name.clone(),
            private_ip: machine.private_address.clone(),
            public_ip: machine.public_address.clone(),
            username: machine.username.clone(),
            credential: machine.credential.clone(),
            locator,
            zones: self.zones.clone(),
            local_directory: self.local_directory.clone(),
            remote_directory,
            exclusions,
            cluster_descriptor,
            management,
            no_web_services,
            connect_via_private_ip: self.connect_via_private_ip,
            bind_to_private_ip: self.bind_to_private_ip,
            install_source_url: self.install_source_url.clone(),
            install_overrides_url: self.install_overrides_url.clone(),
            reservation_id: Uuid::new_v4().to_string(),
            bootstrap_script: self.bootstrap_script.clone(),
            extra_env: self.extra_env.clone(),
            file_transfer: machine.file_transfer,
            remote_execution: machine.remote_execution,
        }
    }
}

#[cfg(test)]
mod tests;
