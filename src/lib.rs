//! Core library for the stratus cluster bootstrapper.
//!
//! The crate provisions machines through pluggable drivers (a Scaleway
//! connector behind a generic multi-provider driver, and a static
//! bring-your-own-nodes pool), installs a cluster-management agent on them
//! over plain SSH/SFTP, and observes asynchronous completion through a
//! bounded polling latch. Uninstall and scale flows drive the same latch
//! against the control plane REST gateway.

pub mod bootstrap;
pub mod byon;
pub mod config;
pub mod control_plane;
pub mod deployment;
pub mod descriptor;
pub mod driver;
pub mod inspector;
pub mod installer;
pub mod latch;
pub mod machine;
pub mod reachability;
pub mod test_support;

pub use bootstrap::{
    BootstrapError, BootstrapOptions, BootstrapOrchestrator, BootstrapReport, OPERATION_TIMED_OUT,
};
pub use byon::{ByonDriver, ByonPool, NodeRecord};
pub use config::{ConfigError, ScalewayConfig, StratusConfig};
pub use control_plane::{
    ControlPlane, ControlPlaneConnector, ControlPlaneError, RestConnector, RestControlPlane,
};
pub use deployment::{DeploymentError, DeploymentFlows, ScaleOutcome};
pub use descriptor::{ClusterDescriptor, DescriptorError};
pub use driver::generic::GenericDriver;
pub use driver::scaleway::{ScalewayBackendError, ScalewayCompute};
pub use driver::{DriverError, DriverRegistry, ProvisioningDriver};
pub use inspector::{InspectionKind, InspectorError, InstallationProcessInspector};
pub use installer::{
    AgentlessInstaller, CommandRunner, Installer, InstallerError, InstallerOptions,
    ProcessCommandRunner,
};
pub use latch::{ConditionLatch, LatchError, Probe};
pub use machine::{InstallationDetails, MachineDetails};
pub use reachability::{ReachabilityProbe, TcpProbe};
