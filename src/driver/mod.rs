//! Provisioning driver contract.
//!
//! A driver turns a compute template into running machines. Callers invoke
//! [`ProvisioningDriver::set_config`] once, then any mix of the lifecycle
//! methods, then [`ProvisioningDriver::close`]. Every lifecycle method takes
//! the caller's absolute deadline.

use std::future::Future;
use std::pin::Pin;

use tokio::time::Instant;

use crate::descriptor::ClusterDescriptor;
use crate::machine::{Credential, FileTransferMode, MachineDetails, RemoteExecutionMode};

pub mod compute;
mod error;
pub mod generic;
mod registry;
pub mod scaleway;

pub use error::DriverError;
pub use registry::{DriverConstructor, DriverRegistry};

/// Future returned by driver operations.
pub type DriverFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, DriverError>> + Send + 'a>>;

/// Upper bound on name candidates tried before giving up.
pub const MAX_SERVER_NAME_ATTEMPTS: u32 = 200;

/// Template values a driver captures in `set_config`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TemplateSettings {
    /// Compute template name.
    pub template_name: String,
    /// Image identifier or label.
    pub image: Option<String>,
    /// Hardware identifier.
    pub hardware: Option<String>,
    /// Zone or location identifier.
    pub location: Option<String>,
    /// Remote login user.
    pub username: String,
    /// Remote login credential.
    pub credential: Option<Credential>,
    /// Remote directory receiving the bootstrap bundle.
    pub remote_directory: String,
    /// File transfer protocol.
    pub file_transfer: FileTransferMode,
    /// Remote execution mechanism.
    pub remote_execution: RemoteExecutionMode,
    /// Prefix for names of machines started in the configured role.
    pub name_prefix: String,
    /// Prefix identifying management machines.
    pub management_prefix: String,
    /// Number of management machines to start.
    pub management_machines: usize,
}

impl TemplateSettings {
    /// Captures the values of `template` from `descriptor`.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Config`] when the template is undefined.
    pub fn from_descriptor(
        descriptor: &ClusterDescriptor,
        template: &str,
        management: bool,
    ) -> Result<Self, DriverError> {
        let compute = descriptor.template(template)?;
        Ok(Self {
            template_name: template.to_owned(),
            image: compute.image.clone(),
            hardware: compute.hardware.clone(),
            location: compute.location.clone(),
            username: compute.username.clone(),
            credential: compute.credential(),
            remote_directory: compute.remote_directory.clone(),
            file_transfer: compute.file_transfer,
            remote_execution: compute.remote_execution,
            name_prefix: descriptor.provider.name_prefix(management),
            management_prefix: descriptor.provider.name_prefix(true),
            management_machines: descriptor.provider.management_machines,
        })
    }

    /// Builds the machine record for a node created from this template.
    #[must_use]
    pub fn machine(
        &self,
        machine_id: String,
        public_address: Option<String>,
        private_address: Option<String>,
    ) -> MachineDetails {
        MachineDetails {
            machine_id,
            public_address,
            private_address,
            username: self.username.clone(),
            credential: self.credential.clone(),
            remote_directory: self.remote_directory.clone(),
            file_transfer: self.file_transfer,
            remote_execution: self.remote_execution,
            agent_running: false,
            agent_installed: false,
            location_id: self.location.clone(),
            template_name: self.template_name.clone(),
        }
    }
}

/// Backend capable of creating and destroying machines.
pub trait ProvisioningDriver: Send + Sync {
    /// Binds the driver to one compute template.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Config`] when the template is missing or
    /// incomplete for this backend.
    fn set_config(
        &mut self,
        descriptor: &ClusterDescriptor,
        template: &str,
        management: bool,
    ) -> Result<(), DriverError>;

    /// Starts one worker machine.
    fn start_machine(&self, deadline: Instant) -> DriverFuture<'_, MachineDetails>;

    /// Starts, or rediscovers, the management machines.
    fn start_management_machines(&self, deadline: Instant)
    -> DriverFuture<'_, Vec<MachineDetails>>;

    /// Stops the machine reachable at `ip`.
    ///
    /// Resolves to `false` for unknown machines and ignored repeat requests.
    fn stop_machine<'a>(&'a self, ip: &'a str, deadline: Instant) -> DriverFuture<'a, bool>;

    /// Stops every management machine.
    fn stop_management_machines(&self, deadline: Instant) -> DriverFuture<'_, ()>;

    /// Releases backend resources. Safe to call more than once.
    fn close(&self) -> DriverFuture<'_, ()>;
}
