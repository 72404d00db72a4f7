//! Scaleway Instances API connector for the generic driver.
//!
//! Image lookup, power-on and deletion go through `scaleway-rs`; server
//! creation, lookup and listing use `reqwest` against the same API. Servers
//! are tagged `stratus` plus their name group so listings only ever see
//! nodes this tool created.

mod error;
mod image;
mod servers;

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use parking_lot::Mutex;
use scaleway_rs::ScalewayApi;
use tracing::{debug, info, warn};

use super::DriverError;
use super::compute::{ComputeError, ComputeFuture, ComputeService, NodeRequest, NodeState, NodeSummary};
use crate::config::ScalewayConfig;
use image::ImageQuery;
use servers::ServerRecord;

pub use error::ScalewayBackendError;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const SCALEWAY_INSTANCE_API_BASE: &str = "https://api.scaleway.com/instance/v1";

/// [`ComputeService`] backed by the Scaleway Instances API.
pub struct ScalewayCompute {
    api: ScalewayApi,
    config: ScalewayConfig,
    http: reqwest::Client,
    api_base: String,
    zones: Mutex<BTreeSet<String>>,
    placements: Mutex<BTreeMap<String, String>>,
}

impl ScalewayCompute {
    /// Builds a connector from validated credentials.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Config`] when a required credential is blank.
    pub fn new(config: ScalewayConfig) -> Result<Self, DriverError> {
        config
            .validate()
            .map_err(|err| DriverError::Config(err.to_string()))?;
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Ok(Self {
            api: ScalewayApi::new(&config.secret_key),
            zones: Mutex::new(BTreeSet::from([config.default_zone.clone()])),
            placements: Mutex::new(BTreeMap::new()),
            http,
            api_base: SCALEWAY_INSTANCE_API_BASE.to_owned(),
            config,
        })
    }

    /// Points the REST calls at another base URL.
    #[must_use]
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_owned();
        self
    }

    /// Zones listed by [`ComputeService::list_nodes`], in name order.
    #[must_use]
    pub fn zones(&self) -> Vec<String> {
        self.zones.lock().iter().cloned().collect()
    }

    fn zone_for(&self, request: &NodeRequest) -> String {
        request
            .location
            .clone()
            .unwrap_or_else(|| self.config.default_zone.clone())
    }

    /// Zones that may hold `id`: its recorded zone, or every tracked zone.
    fn candidate_zones(&self, id: &str) -> Vec<String> {
        self.placements
            .lock()
            .get(id)
            .map_or_else(|| self.zones(), |zone| vec![zone.clone()])
    }

    async fn locate(&self, id: &str) -> Result<Option<(String, ServerRecord)>, ScalewayBackendError> {
        for zone in self.candidate_zones(id) {
            if let Some(server) = self.fetch_server(&zone, id).await? {
                self.placements.lock().insert(id.to_owned(), zone.clone());
                return Ok(Some((zone, server)));
            }
        }
        Ok(None)
    }

    async fn power_on_if_needed(
        &self,
        zone: &str,
        server: &ServerRecord,
    ) -> Result<NodeState, ScalewayBackendError> {
        if server.state == "running" {
            return Ok(NodeState::Running);
        }
        if server.allows("poweron") {
            self.api
                .perform_instance_action_async(zone, &server.id, "poweron")
                .await?;
            return Ok(NodeState::Pending);
        }
        Err(ScalewayBackendError::PowerOnNotAllowed {
            instance_id: server.id.clone(),
            state: server.state.clone(),
        })
    }

    async fn create(&self, request: &NodeRequest) -> Result<NodeSummary, ScalewayBackendError> {
        let zone = self.zone_for(request);
        self.zones.lock().insert(zone.clone());
        let image_id = self
            .resolve_image_id(&ImageQuery {
                label: &request.image,
                zone: &zone,
                arch: &self.config.default_architecture,
            })
            .await?;
        debug!(image = %request.image, image_id = %image_id, zone = %zone, "resolved image");

        let server = self.create_server(request, &zone, &image_id).await?;
        self.placements.lock().insert(server.id.clone(), zone.clone());
        info!(server = %server.name, machine_id = %server.id, zone = %zone, "server created");

        match self.power_on_if_needed(&zone, &server).await {
            Ok(state) => {
                let mut summary = server.summary(&zone);
                summary.state = state;
                Ok(summary)
            }
            Err(err) => {
                if let Err(cleanup) = self.api.delete_instance_async(&zone, &server.id).await {
                    warn!(machine_id = %server.id, error = %cleanup, "failed to delete server that never powered on");
                }
                Err(err)
            }
        }
    }

    async fn destroy(&self, id: &str) -> Result<(), ScalewayBackendError> {
        let Some((zone, server)) = self.locate(id).await? else {
            return Err(ScalewayBackendError::NotFound {
                instance_id: id.to_owned(),
            });
        };
        if server.allows("terminate") {
            self.api
                .perform_instance_action_async(&zone, id, "terminate")
                .await?;
        } else {
            self.api.delete_instance_async(&zone, id).await?;
        }
        info!(server = %server.name, machine_id = %id, zone = %zone, "server deletion requested");
        Ok(())
    }
}

impl ComputeService for ScalewayCompute {
    fn create_node<'a>(&'a self, request: &'a NodeRequest) -> ComputeFuture<'a, NodeSummary> {
        Box::pin(async move { self.create(request).await.map_err(ComputeError::from) })
    }

    fn get_node<'a>(&'a self, id: &'a str) -> ComputeFuture<'a, Option<NodeSummary>> {
        Box::pin(async move {
            let found = self.locate(id).await?;
            Ok(found.map(|(zone, server)| server.summary(&zone)))
        })
    }

    fn list_nodes(&self) -> ComputeFuture<'_, Vec<NodeSummary>> {
        Box::pin(async move {
            let mut nodes = Vec::new();
            for zone in self.zones() {
                let servers = self.list_servers(&zone).await?;
                nodes.extend(servers.iter().map(|server| server.summary(&zone)));
            }
            Ok(nodes)
        })
    }

    fn destroy_node<'a>(&'a self, id: &'a str) -> ComputeFuture<'a, ()> {
        Box::pin(async move { self.destroy(id).await.map_err(ComputeError::from) })
    }

    fn close(&self) -> ComputeFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn register_location(&self, location: &str) {
        self.zones.lock().insert(location.to_owned());
    }
}

#[cfg(test)]
mod tests;
