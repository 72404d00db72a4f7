//! Binary entry point for the stratus CLI.

use std::io::{self, Write};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;

use stratus::{
    AgentlessInstaller, BootstrapError, BootstrapOptions, BootstrapOrchestrator, ClusterDescriptor,
    ControlPlane, ControlPlaneConnector, ControlPlaneError, DeploymentError, DeploymentFlows,
    DescriptorError, DriverRegistry, InstallerOptions, ProcessCommandRunner, RestConnector,
    ScaleOutcome, StratusConfig, TcpProbe,
};

mod cli;

use cli::{BootstrapCommand, Cli, ScaleCommand, TeardownCommand, UninstallCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
    #[error(transparent)]
    Deployment(#[from] DeploymentError),
    #[error(transparent)]
    ControlPlane(#[from] ControlPlaneError),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.common().verbose);
    let exit_code = match dispatch(cli).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "stratus=debug" } else { "stratus=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    match cli {
        Cli::Bootstrap(args) => exec_bootstrap(args).await,
        Cli::Teardown(args) => exec_teardown(args).await,
        Cli::Uninstall(args) => exec_uninstall(args).await,
        Cli::Scale(args) => exec_scale(args).await,
    }
}

fn load_config(descriptor: Option<&str>, verbose: bool) -> Result<StratusConfig, CliError> {
    let mut config =
        StratusConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    if let Some(path) = descriptor {
        path.clone_into(&mut config.cluster_descriptor);
    }
    config.verbose |= verbose;
    config
        .validate()
        .map_err(|err| CliError::Config(err.to_string()))?;
    Ok(config)
}

const fn minutes(value: u64) -> Duration {
    Duration::from_secs(value.saturating_mul(60))
}

fn orchestrator(config: &StratusConfig) -> Result<BootstrapOrchestrator, CliError> {
    let path = config.descriptor_path();
    let descriptor = ClusterDescriptor::load(&path)?;
    let registry = DriverRegistry::builtin_with_rest_port(config.rest_port);
    registry
        .validate(&descriptor.provider.driver)
        .map_err(BootstrapError::from)?;
    let installer = AgentlessInstaller::new(
        InstallerOptions::from(config),
        ProcessCommandRunner,
        TcpProbe,
    );
    Ok(BootstrapOrchestrator::new(
        Arc::new(registry),
        descriptor,
        path,
        Arc::new(installer),
        Arc::new(RestConnector::new(config.rest_api_version.clone())),
    )
    .with_options(BootstrapOptions::from(config)))
}

async fn exec_bootstrap(args: BootstrapCommand) -> Result<(), CliError> {
    let config = load_config(args.descriptor.as_deref(), args.common.verbose)?;
    let timeout = args
        .common
        .timeout
        .map_or_else(|| config.bootstrap_timeout(), minutes);
    let report = orchestrator(&config)?.bootstrap(timeout).await?;

    let mut stdout = io::stdout();
    for url in &report.rest_urls {
        writeln!(stdout, "REST gateway available at {url}").ok();
    }
    Ok(())
}

async fn exec_teardown(args: TeardownCommand) -> Result<(), CliError> {
    let config = load_config(args.descriptor.as_deref(), args.common.verbose)?;
    let timeout = args
        .common
        .timeout
        .map_or_else(|| config.teardown_timeout(), minutes);
    orchestrator(&config)?
        .teardown(timeout, args.force, args.rest_url.as_deref())
        .await?;
    writeln!(io::stdout(), "management machines stopped").ok();
    Ok(())
}

fn flows(
    config: &StratusConfig,
    rest_url: &str,
) -> Result<DeploymentFlows<dyn ControlPlane>, CliError> {
    let plane = RestConnector::new(config.rest_api_version.clone()).connect(rest_url)?;
    Ok(DeploymentFlows::new(plane).verbose(config.verbose))
}

async fn exec_uninstall(args: UninstallCommand) -> Result<(), CliError> {
    let config = load_config(None, args.common.verbose)?;
    let timeout = args
        .common
        .timeout
        .map_or_else(|| config.teardown_timeout(), minutes);
    let deadline = Instant::now() + timeout;
    flows(&config, &args.rest_url)?
        .uninstall_application(&args.application, deadline)
        .await?;
    writeln!(io::stdout(), "application {} uninstalled", args.application).ok();
    Ok(())
}

async fn exec_scale(args: ScaleCommand) -> Result<(), CliError> {
    let config = load_config(None, args.common.verbose)?;
    let timeout = args
        .common
        .timeout
        .map_or_else(|| config.bootstrap_timeout(), minutes);
    let deadline = Instant::now() + timeout;
    let outcome = flows(&config, &args.rest_url)?
        .set_service_instances(&args.application, &args.service, args.count, deadline)
        .await?;
    writeln!(io::stdout(), "{}", describe_outcome(&args.service, outcome)).ok();
    Ok(())
}

fn describe_outcome(service: &str, outcome: ScaleOutcome) -> String {
    match outcome {
        ScaleOutcome::Unchanged { count } => {
            format!("service {service} already runs {count} instances")
        }
        ScaleOutcome::ScaledUp { from, to } | ScaleOutcome::ScaledDown { from, to } => {
            format!("service {service} scaled from {from} to {to} instances")
        }
    }
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
