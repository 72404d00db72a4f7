//! Command-line interface definitions for the `stratus` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser};

/// Top-level CLI for the `stratus` binary.
#[derive(Debug, Parser)]
#[command(
    name = "stratus",
    about = "Provision machines and bootstrap a cluster-management agent over SSH",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Start the management machines and install the agent on them.
    #[command(
        name = "bootstrap",
        about = "Start the management machines and install the agent on them"
    )]
    Bootstrap(BootstrapCommand),
    /// Uninstall every application and stop the management machines.
    #[command(
        name = "teardown",
        about = "Uninstall every application and stop the management machines"
    )]
    Teardown(TeardownCommand),
    /// Undeploy one application and wait until it is gone.
    #[command(name = "uninstall", about = "Undeploy one application and wait until it is gone")]
    Uninstall(UninstallCommand),
    /// Change the instance count of a service and wait for it.
    #[command(name = "scale", about = "Change the instance count of a service and wait for it")]
    Scale(ScaleCommand),
}

impl Cli {
    /// Flags shared by every subcommand.
    pub(crate) const fn common(&self) -> &CommonArgs {
        match self {
            Self::Bootstrap(args) => &args.common,
            Self::Teardown(args) => &args.common,
            Self::Uninstall(args) => &args.common,
            Self::Scale(args) => &args.common,
        }
    }
}

/// Flags accepted by every subcommand.
#[derive(Debug, Args)]
pub(crate) struct CommonArgs {
    /// Overall budget in minutes. Defaults to the configured budget.
    #[arg(long, value_name = "MINUTES")]
    pub(crate) timeout: Option<u64>,
    /// Log polling progress at info level.
    #[arg(long, short)]
    pub(crate) verbose: bool,
}

/// Arguments for the `stratus bootstrap` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct BootstrapCommand {
    /// Cluster descriptor to bootstrap. Overrides `STRATUS_CLUSTER_DESCRIPTOR`.
    #[arg(long, value_name = "PATH")]
    pub(crate) descriptor: Option<String>,
    #[command(flatten)]
    pub(crate) common: CommonArgs,
}

/// Arguments for the `stratus teardown` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct TeardownCommand {
    /// Cluster descriptor to tear down. Overrides `STRATUS_CLUSTER_DESCRIPTOR`.
    #[arg(long, value_name = "PATH")]
    pub(crate) descriptor: Option<String>,
    /// REST gateway of the running cluster, e.g. `http://10.0.0.1:8100`.
    #[arg(long, value_name = "URL")]
    pub(crate) rest_url: Option<String>,
    /// Stop the machines even when applications cannot be uninstalled.
    #[arg(long)]
    pub(crate) force: bool,
    #[command(flatten)]
    pub(crate) common: CommonArgs,
}

/// Arguments for the `stratus uninstall` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct UninstallCommand {
    /// Application to undeploy.
    pub(crate) application: String,
    /// REST gateway of the running cluster.
    #[arg(long, value_name = "URL")]
    pub(crate) rest_url: String,
    #[command(flatten)]
    pub(crate) common: CommonArgs,
}

/// Arguments for the `stratus scale` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct ScaleCommand {
    /// Application owning the service.
    pub(crate) application: String,
    /// Service to scale.
    pub(crate) service: String,
    /// Requested number of instances.
    #[arg(long, value_name = "COUNT")]
    pub(crate) count: u32,
    /// REST gateway of the running cluster.
    #[arg(long, value_name = "URL")]
    pub(crate) rest_url: String,
    #[command(flatten)]
    pub(crate) common: CommonArgs,
}
