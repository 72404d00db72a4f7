//! Provider-independent driver built on a [`ComputeService`].
//!
//! The driver names servers, retries the transient security group error,
//! waits for nodes to reach `Running` and destroys half-created nodes. The
//! compute service only translates single API calls.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use super::compute::{ComputeError, ComputeService, NodeRequest, NodeState, NodeSummary};
use super::{
    DriverError, DriverFuture, MAX_SERVER_NAME_ATTEMPTS, ProvisioningDriver, TemplateSettings,
};
use crate::descriptor::ClusterDescriptor;
use crate::machine::MachineDetails;

const RUNNING_POLL_INTERVAL: Duration = Duration::from_secs(2);
const SECURITY_GROUP_RETRY_DELAY: Duration = Duration::from_secs(5);
const SECURITY_GROUP_RETRIES: u32 = 2;
const STOP_IGNORE_WINDOW: Duration = Duration::from_secs(120);

/// Driver that implements the provisioning lifecycle over any compute API.
pub struct GenericDriver<S> {
    compute: S,
    settings: Option<TemplateSettings>,
    counter: AtomicU32,
    recent_stops: Mutex<HashMap<String, Instant>>,
    poll_interval: Duration,
    retry_delay: Duration,
    stop_window: Duration,
}

impl<S: ComputeService> GenericDriver<S> {
    /// Wraps `compute` in an unconfigured driver.
    #[must_use]
    pub fn new(compute: S) -> Self {
        Self {
            compute,
            settings: None,
            counter: AtomicU32::new(0),
            recent_stops: Mutex::new(HashMap::new()),
            poll_interval: RUNNING_POLL_INTERVAL,
            retry_delay: SECURITY_GROUP_RETRY_DELAY,
            stop_window: STOP_IGNORE_WINDOW,
        }
    }

    /// Overrides the readiness poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Overrides the security group retry delay.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Returns the wrapped compute service.
    #[must_use]
    pub const fn compute(&self) -> &S {
        &self.compute
    }

    fn settings(&self) -> Result<&TemplateSettings, DriverError> {
        self.settings.as_ref().ok_or(DriverError::NotConfigured)
    }

    fn node_request(settings: &TemplateSettings, name: String) -> Result<NodeRequest, DriverError> {
        let image = settings
            .image
            .clone()
            .ok_or_else(|| DriverError::Config(String::from("template image is not set")))?;
        let hardware = settings
            .hardware
            .clone()
            .ok_or_else(|| DriverError::Config(String::from("template hardware is not set")))?;
        Ok(NodeRequest {
            name,
            image,
            hardware,
            location: settings.location.clone(),
            group: settings.name_prefix.clone(),
        })
    }

    fn next_name(&self, prefix: &str, taken: &BTreeSet<String>) -> Result<String, DriverError> {
        for _ in 0..MAX_SERVER_NAME_ATTEMPTS {
            let index = self.counter.fetch_add(1, Ordering::Relaxed).saturating_add(1);
            let candidate = format!("{prefix}{index}");
            if !taken.contains(&candidate) {
                return Ok(candidate);
            }
            debug!(name = %candidate, "server name already in use");
        }
        Err(DriverError::ServerLimitReached {
            limit: MAX_SERVER_NAME_ATTEMPTS,
        })
    }

    async fn create_with_retry(
        &self,
        request: &NodeRequest,
        deadline: Instant,
    ) -> Result<NodeSummary, DriverError> {
        let mut retries = 0;
        loop {
            match self.compute.create_node(request).await {
                Err(err) if err.is_security_group_not_ready() && retries < SECURITY_GROUP_RETRIES => {
                    if Instant::now() + self.retry_delay >= deadline {
                        warn!(name = %request.name, error = %err, "no time left to retry node creation");
                        return Err(DriverError::Timeout {
                            action: format!("creating server {}", request.name),
                        });
                    }
                    retries += 1;
                    warn!(
                        name = %request.name,
                        retry = retries,
                        error = %err,
                        "security group not ready, retrying node creation"
                    );
                    sleep(self.retry_delay).await;
                }
                other => return other.map_err(DriverError::from),
            }
        }
    }

    async fn wait_for_running(
        &self,
        id: &str,
        deadline: Instant,
    ) -> Result<NodeSummary, DriverError> {
        loop {
            let Some(node) = self.compute.get_node(id).await? else {
                return Err(DriverError::Provisioning {
                    message: format!("node {id} disappeared while starting"),
                });
            };
            match node.state {
                NodeState::Running => return Ok(node),
                NodeState::Pending => {}
                other => {
                    return Err(DriverError::Provisioning {
                        message: format!("node {id} entered state {other:?} while starting"),
                    });
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(DriverError::Timeout {
                    action: String::from("node failed to reach RUNNING state in time"),
                });
            }
            sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn wait_until_gone(&self, id: &str, deadline: Instant) -> Result<(), DriverError> {
        loop {
            match self.compute.get_node(id).await? {
                None => return Ok(()),
                Some(node) if node.state == NodeState::Terminated => return Ok(()),
                Some(_) => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(DriverError::Timeout {
                    action: format!("node {id} failed to terminate in time"),
                });
            }
            sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn start_named(&self, name: String, deadline: Instant) -> Result<MachineDetails, DriverError> {
        let settings = self.settings()?;
        let request = Self::node_request(settings, name)?;
        info!(name = %request.name, template = %settings.template_name, "creating node");
        let created = self.create_with_retry(&request, deadline).await?;

        match self.wait_for_running(&created.id, deadline).await {
            Ok(node) => {
                info!(name = %node.name, machine_id = %node.id, "node running");
                Ok(settings.machine(node.id, node.public_ip, node.private_ip))
            }
            Err(err) => {
                if let Err(cleanup) = self.compute.destroy_node(&created.id).await {
                    warn!(machine_id = %created.id, error = %cleanup, "failed to destroy node after start failure");
                }
                Err(err)
            }
        }
    }

    async fn destroy_and_wait(&self, node: &NodeSummary, deadline: Instant) -> Result<(), DriverError> {
        info!(name = %node.name, machine_id = %node.id, "destroying node");
        self.compute.destroy_node(&node.id).await?;
        self.wait_until_gone(&node.id, deadline).await
    }

    fn recently_stopped(&self, ip: &str) -> bool {
        let now = Instant::now();
        let mut stops = self.recent_stops.lock();
        stops.retain(|_, at| now.duration_since(*at) < self.stop_window);
        if stops.contains_key(ip) {
            return true;
        }
        stops.insert(ip.to_owned(), now);
        false
    }
}

impl<S: ComputeService> ProvisioningDriver for GenericDriver<S> {
    fn set_config(
        &mut self,
        descriptor: &ClusterDescriptor,
        template: &str,
        management: bool,
    ) -> Result<(), DriverError> {
        let settings = TemplateSettings::from_descriptor(descriptor, template, management)?;
        Self::node_request(&settings, String::new())?;
        if let Some(location) = &settings.location {
            self.compute.register_location(location);
        }
        self.settings = Some(settings);
        Ok(())
    }

    fn start_machine(&self, deadline: Instant) -> DriverFuture<'_, MachineDetails> {
        Box::pin(async move {
            let prefix = self.settings()?.name_prefix.clone();
            let taken: BTreeSet<String> = self
                .compute
                .list_nodes()
                .await?
                .into_iter()
                .map(|node| node.name)
                .collect();
            let name = self.next_name(&prefix, &taken)?;
            self.start_named(name, deadline).await
        })
    }

    fn start_management_machines(
        &self,
        deadline: Instant,
    ) -> DriverFuture<'_, Vec<MachineDetails>> {
        Box::pin(async move {
            let settings = self.settings()?;
            let prefix = settings.management_prefix.clone();
            let existing: Vec<NodeSummary> = self
                .compute
                .list_nodes()
                .await?
                .into_iter()
                .filter(|node| node.name.starts_with(&prefix) && node.state.is_live())
                .collect();

            if !existing.is_empty() {
                info!(count = existing.len(), prefix = %prefix, "found running management machines");
                return Ok(existing
                    .into_iter()
                    .map(|node| {
                        let mut machine = settings.machine(node.id, node.public_ip, node.private_ip);
                        machine.agent_running = true;
                        machine.agent_installed = true;
                        machine
                    })
                    .collect());
            }

            let starts = (1..=settings.management_machines)
                .map(|index| self.start_named(format!("{prefix}{index}"), deadline));
            let results = join_all(starts).await;

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
            warn!(error = %err, started = started.len(), "management start failed, destroying started nodes");
            let cleanups = started
                .iter()
                .map(|machine| self.compute.destroy_node(&machine.machine_id));
            for cleanup in join_all(cleanups).await {
                if let Err(cleanup_err) = cleanup {
                    warn!(error = %cleanup_err, "failed to destroy management node");
                }
            }
            Err(err)
        })
    }

    fn stop_machine<'a>(&'a self, ip: &'a str, deadline: Instant) -> DriverFuture<'a, bool> {
        Box::pin(async move {
            self.settings()?;
            if self.recently_stopped(ip) {
                debug!(host = ip, "ignoring repeated stop request");
                return Ok(false);
            }

            let nodes = self.compute.list_nodes().await?;
            let Some(node) = nodes.into_iter().find(|node| node.has_address(ip)) else {
                warn!(host = ip, "no node found for stop request");
                return Ok(false);
            };
            self.destroy_and_wait(&node, deadline).await?;
            Ok(true)
        })
    }

    fn stop_management_machines(&self, deadline: Instant) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            let prefix = self.settings()?.management_prefix.clone();
            let nodes: Vec<NodeSummary> = self
                .compute
                .list_nodes()
                .await?
                .into_iter()
                .filter(|node| node.name.starts_with(&prefix) && node.state != NodeState::Terminated)
                .collect();
            if nodes.is_empty() {
                return Err(DriverError::NoManagementMachines { prefix });
            }

            let stops = nodes.iter().map(|node| self.destroy_and_wait(node, deadline));
            join_all(stops)
                .await
                .into_iter()
                .collect::<Result<Vec<()>, DriverError>>()?;
            Ok(())
        })
    }

    fn close(&self) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            self.compute.close().await?;
            Ok(())
        })
    }
}
