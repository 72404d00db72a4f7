//! Provisioning driver backed by a static node pool.
//!
//! "Starting" a machine allocates a free node and checks that its file
//! transfer port answers. Nodes that never answer are invalidated and the
//! next free node is tried. "Stopping" returns the node to the pool.
//!
//! The pool lives in memory only, so each process rebuilds its view of the
//! cluster: management nodes are recognised by a listening REST gateway and
//! worker allocations are resynchronised from the control plane when one is
//! attached.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use camino::Utf8PathBuf;
use futures::future::join_all;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::control_plane::{ControlPlane, DEFAULT_REST_PORT};
use crate::descriptor::ClusterDescriptor;
use crate::driver::{
    DriverError, DriverFuture, MAX_SERVER_NAME_ATTEMPTS, ProvisioningDriver, TemplateSettings,
};
use crate::machine::{Credential, MachineDetails};
use crate::reachability::ReachabilityProbe;

use super::{ByonDeployer, ByonNode, ByonPool};

const VALIDATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Driver that hands out nodes from the descriptor's BYON pools.
pub struct ByonDriver {
    probe: Arc<dyn ReachabilityProbe>,
    settings: Option<TemplateSettings>,
    pool: Option<Arc<ByonPool>>,
    counter: AtomicU32,
    validation_timeout: Duration,
    rest_port: u16,
    control_plane: Option<Arc<dyn ControlPlane>>,
}

impl ByonDriver {
    /// Creates an unconfigured driver that validates nodes with `probe`.
    #[must_use]
    pub fn new(probe: Arc<dyn ReachabilityProbe>) -> Self {
        Self {
            probe,
            settings: None,
            pool: None,
            counter: AtomicU32::new(0),
            validation_timeout: VALIDATION_TIMEOUT,
            rest_port: DEFAULT_REST_PORT,
            control_plane: None,
        }
    }

    /// Overrides the per-node reachability timeout.
    #[must_use]
    pub const fn with_validation_timeout(mut self, limit: Duration) -> Self {
        self.validation_timeout = limit;
        self
    }

    /// Sets the port management nodes serve the REST gateway on.
    #[must_use]
    pub const fn with_rest_port(mut self, port: u16) -> Self {
        self.rest_port = port;
        self
    }

    /// Attaches the control plane whose machines are marked allocated
    /// before each `start_machine`.
    #[must_use]
    pub fn with_control_plane(mut self, plane: Arc<dyn ControlPlane>) -> Self {
        self.control_plane = Some(plane);
        self
    }

    /// Pool of the configured template.
    #[must_use]
    pub const fn pool(&self) -> Option<&Arc<ByonPool>> {
        self.pool.as_ref()
    }

    /// Marks the free nodes listed in `hosts` as allocated.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::NotConfigured`] before `set_config`.
    pub fn resync_allocated(&self, hosts: &BTreeSet<String>) -> Result<usize, DriverError> {
        let (_, pool) = self.bound()?;
        let moved = pool.set_allocated(hosts);
        info!(template = %pool.template(), moved, "resynchronised allocated nodes");
        Ok(moved)
    }

    fn bound(&self) -> Result<(&TemplateSettings, &Arc<ByonPool>), DriverError> {
        match (&self.settings, &self.pool) {
            (Some(settings), Some(pool)) => Ok((settings, pool)),
            _ => Err(DriverError::NotConfigured),
        }
    }

    fn next_name(&self, pool: &ByonPool, prefix: &str) -> Result<String, DriverError> {
        for _ in 0..MAX_SERVER_NAME_ATTEMPTS {
            let index = self.counter.fetch_add(1, Ordering::Relaxed).saturating_add(1);
            let candidate = format!("{prefix}{index}");
            if pool.node_by_name(&candidate).is_none() {
                return Ok(candidate);
            }
            debug!(name = %candidate, "server name already in use");
        }
        Err(DriverError::ServerLimitReached {
            limit: MAX_SERVER_NAME_ATTEMPTS,
        })
    }

    fn machine_for(settings: &TemplateSettings, node: &ByonNode) -> MachineDetails {
        let mut machine = settings.machine(
            node.id.clone(),
            Some(node.host.clone()),
            Some(node.host.clone()),
        );
        if let Some(username) = &node.username {
            machine.username.clone_from(username);
        }
        if let Some(key_file) = &node.key_file {
            machine.credential = Some(Credential::KeyFile(Utf8PathBuf::from(key_file)));
        } else if let Some(password) = &node.credential {
            machine.credential = Some(Credential::Password(password.clone()));
        }
        machine
    }

    fn running(settings: &TemplateSettings, node: &ByonNode) -> MachineDetails {
        let mut machine = Self::machine_for(settings, node);
        machine.agent_running = true;
        machine.agent_installed = true;
        machine
    }

    /// Management nodes this driver knows of, or failing that, the nodes
    /// whose REST port answers.
    async fn discover_management(&self, deadline: Instant) -> Result<Vec<ByonNode>, DriverError> {
        let (settings, pool) = self.bound()?;
        let prefix = &settings.management_prefix;
        let known = pool.allocated_with_prefix(prefix);
        if !known.is_empty() {
            return Ok(known);
        }

        let limit = self
            .validation_timeout
            .min(deadline.saturating_duration_since(Instant::now()));
        let hosts = pool.usable_hosts();
        let answers = join_all(
            hosts
                .iter()
                .map(|host| self.probe.probe(host, self.rest_port, limit)),
        )
        .await;

        let listening = hosts
            .iter()
            .zip(answers)
            .filter_map(|(host, answered)| answered.then_some(host));
        let mut found = Vec::new();
        for host in listening {
            let name = format!("{prefix}{}", found.len().saturating_add(1));
            if let Some(node) = pool.adopt(host, &name) {
                found.push(node);
            }
        }
        if !found.is_empty() {
            info!(count = found.len(), port = self.rest_port, "found running management nodes");
        }
        Ok(found)
    }

    async fn sync_with_control_plane(&self) -> Result<(), DriverError> {
        let Some(plane) = &self.control_plane else {
            return Ok(());
        };
        let hosts = plane
            .machine_hosts()
            .await
            .map_err(|err| DriverError::Provisioning {
                message: format!("failed to list cluster machines: {err}"),
            })?;
        self.resync_allocated(&hosts)?;
        Ok(())
    }

    async fn allocate(&self, name: &str, deadline: Instant) -> Result<MachineDetails, DriverError> {
        let (settings, pool) = self.bound()?;
        let port = settings.file_transfer.port();
        loop {
            let node = pool.create_server(name)?;
            let now = Instant::now();
            if now >= deadline {
                pool.shutdown_server(Some(&node));
                return Err(DriverError::Timeout {
                    action: format!("allocating a node for {name}"),
                });
            }

            let limit = self.validation_timeout.min(deadline - now);
            if self.probe.probe(&node.host, port, limit).await {
                info!(server = name, node = %node.id, host = %node.host, "node ready");
                return Ok(Self::machine_for(settings, &node));
            }

            warn!(node = %node.id, host = %node.host, port, "node unreachable, withdrawing it from the pool");
            pool.invalidate_server(&node);
        }
    }
}

impl ProvisioningDriver for ByonDriver {
    fn set_config(
        &mut self,
        descriptor: &ClusterDescriptor,
        template: &str,
        management: bool,
    ) -> Result<(), DriverError> {
        let settings = TemplateSettings::from_descriptor(descriptor, template, management)?;
        let deployer = ByonDeployer::from_descriptor(descriptor)?;
        let pool = deployer.pool(template)?;
        info!(template, nodes = pool.len(), "configured BYON pool");
        self.settings = Some(settings);
        self.pool = Some(pool);
        Ok(())
    }

    fn start_machine(&self, deadline: Instant) -> DriverFuture<'_, MachineDetails> {
        Box::pin(async move {
            let (settings, pool) = self.bound()?;
            self.sync_with_control_plane().await?;
            let name = self.next_name(pool, &settings.name_prefix)?;
            self.allocate(&name, deadline).await
        })
    }

    fn start_management_machines(
        &self,
        deadline: Instant,
    ) -> DriverFuture<'_, Vec<MachineDetails>> {
        Box::pin(async move {
            let (settings, pool) = self.bound()?;
            let prefix = &settings.management_prefix;
            let existing = self.discover_management(deadline).await?;
            if !existing.is_empty() {
                info!(count = existing.len(), prefix = %prefix, "reusing running management nodes");
                return Ok(existing
                    .iter()
                    .map(|node| Self::running(settings, node))
                    .collect());
            }

            let names: Vec<String> = (1..=settings.management_machines)
                .map(|index| format!("{prefix}{index}"))
                .collect();
            let results = join_all(names.iter().map(|name| self.allocate(name, deadline))).await;

            let mut started = Vec::new();
            let mut first_error = None;
            for result in results {
                match result {
                    Ok(machine) => started.push(machine),
                    Err(err) => {
                        first_error.get_or_insert(err);
                    }
                }
            }

            let Some(err) = first_error else {
                return Ok(started);
            };
            warn!(error = %err, started = started.len(), "management allocation failed, releasing nodes");
            for machine in &started {
                pool.shutdown_server(pool.node_by_id(&machine.machine_id).as_ref());
            }
            Err(err)
        })
    }

    fn stop_machine<'a>(&'a self, ip: &'a str, _deadline: Instant) -> DriverFuture<'a, bool> {
        Box::pin(async move {
            let (_, pool) = self.bound()?;
            let node = pool.node_by_ip(ip);
            if node.is_none() {
                warn!(host = ip, "no node found for stop request");
            }
            Ok(pool.shutdown_server(node.as_ref()))
        })
    }

    fn stop_management_machines(&self, deadline: Instant) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            let (settings, pool) = self.bound()?;
            let nodes = self.discover_management(deadline).await?;
            if nodes.is_empty() {
                return Err(DriverError::NoManagementMachines {
                    prefix: settings.management_prefix.clone(),
                });
            }
            for node in &nodes {
                pool.shutdown_server(Some(node));
            }
            info!(count = nodes.len(), "released management nodes");
            Ok(())
        })
    }

    fn close(&self) -> DriverFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}
