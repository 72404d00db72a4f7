//! Server calls made directly against the Instances REST API.
//!
//! Creation, lookup and listing go through `reqwest` with local serde
//! types so the connector controls tags, paging and error decoding.

use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};

use crate::driver::compute::{NodeRequest, NodeState, NodeSummary};

use super::{ScalewayBackendError, ScalewayCompute};

const PAGE_SIZE: usize = 100;
/// Tag carried by every server this connector creates.
pub(super) const SERVER_TAG: &str = "stratus";

#[derive(Serialize)]
struct CreateServerRequest<'a> {
    name: &'a str,
    commercial_type: &'a str,
    image: &'a str,
    project: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    organization: Option<&'a str>,
    routed_ip_enabled: bool,
    dynamic_ip_required: bool,
    tags: Vec<String>,
}

#[derive(Deserialize)]
struct ServerEnvelope {
    server: ServerRecord,
}

#[derive(Deserialize)]
struct ServerPage {
    #[serde(default)]
    servers: Vec<ServerRecord>,
}

#[derive(Default, Deserialize)]
struct ApiErrorBody {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    resource: Option<String>,
}

/// Server as returned by the Instances API.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(super) struct ServerRecord {
    pub(super) id: String,
    pub(super) name: String,
    pub(super) state: String,
    #[serde(default)]
    pub(super) allowed_actions: Vec<String>,
    #[serde(default)]
    pub(super) public_ip: Option<AddressRecord>,
    #[serde(default)]
    pub(super) public_ips: Vec<AddressRecord>,
    #[serde(default)]
    pub(super) private_ip: Option<String>,
}

/// Public address entry.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(super) struct AddressRecord {
    pub(super) address: String,
    #[serde(default)]
    pub(super) family: Option<String>,
}

impl ServerRecord {
    /// Legacy `public_ip` first, then the first IPv4 routed address.
    pub(super) fn public_address(&self) -> Option<String> {
        self.public_ip
            .as_ref()
            .or_else(|| {
                self.public_ips
                    .iter()
                    .find(|ip| ip.family.as_deref() != Some("inet6"))
            })
            .map(|ip| ip.address.clone())
    }

    pub(super) fn allows(&self, action: &str) -> bool {
        self.allowed_actions.iter().any(|allowed| allowed == action)
    }

    pub(super) fn summary(&self, zone: &str) -> NodeSummary {
        NodeSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            state: node_state(&self.state),
            public_ip: self.public_address(),
            private_ip: self.private_ip.clone(),
            location: Some(zone.to_owned()),
        }
    }
}

/// Maps an Instances API server state onto the generic lifecycle.
pub(super) fn node_state(state: &str) -> NodeState {
    match state {
        "running" => NodeState::Running,
        "starting" => NodeState::Pending,
        "stopped" | "stopped in place" | "stopping" => NodeState::Stopped,
        "locked" => NodeState::Error,
        _ => NodeState::Unknown,
    }
}

impl ScalewayCompute {
    fn servers_url(&self, zone: &str) -> String {
        format!("{}/zones/{zone}/servers", self.api_base)
    }

    async fn send<B: Serialize + Sync>(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, String)],
        body: Option<&B>,
    ) -> Result<(StatusCode, Vec<u8>), ScalewayBackendError> {
        let mut request = self
            .http
            .request(method, url)
            .header("X-Auth-Token", &self.config.secret_key)
            .query(query);
        if let Some(payload) = body {
            request = request.json(payload);
        }
        let response = request.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        Ok((status, bytes.to_vec()))
    }

    pub(super) async fn create_server(
        &self,
        request: &NodeRequest,
        zone: &str,
        image_id: &str,
    ) -> Result<ServerRecord, ScalewayBackendError> {
        let payload = CreateServerRequest {
            name: &request.name,
            commercial_type: &request.hardware,
            image: image_id,
            project: &self.config.default_project_id,
            organization: self.config.default_organization_id.as_deref(),
            routed_ip_enabled: true,
            dynamic_ip_required: true,
            tags: vec![SERVER_TAG.to_owned(), request.group.clone()],
        };
        let (status, body) = self
            .send(Method::POST, &self.servers_url(zone), &[], Some(&payload))
            .await?;

        if status.is_success() {
            let parsed: ServerEnvelope =
                serde_json::from_slice(&body).map_err(|err| ScalewayBackendError::Provider {
                    message: err.to_string(),
                })?;
            return Ok(parsed.server);
        }

        let api_err: ApiErrorBody = serde_json::from_slice(&body).unwrap_or_default();
        let mentions_type = api_err.resource.as_deref() == Some("commercial_type")
            || (api_err.kind == "invalid_arguments"
                && api_err.message.to_ascii_lowercase().contains("commercial_type"));
        if mentions_type {
            return Err(ScalewayBackendError::InstanceTypeUnavailable {
                instance_type: request.hardware.clone(),
                zone: zone.to_owned(),
            });
        }

        let message = if api_err.message.is_empty() {
            format!("HTTP {}: {}", status.as_u16(), String::from_utf8_lossy(&body))
        } else {
            api_err.message
        };
        Err(ScalewayBackendError::Provider { message })
    }

    pub(super) async fn fetch_server(
        &self,
        zone: &str,
        id: &str,
    ) -> Result<Option<ServerRecord>, ScalewayBackendError> {
        let url = format!("{}/{id}", self.servers_url(zone));
        let (status, body) = self.send::<()>(Method::GET, &url, &[], None).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(ScalewayBackendError::Provider {
                message: format!("HTTP {}: {}", status.as_u16(), String::from_utf8_lossy(&body)),
            });
        }
        let parsed: ServerEnvelope =
            serde_json::from_slice(&body).map_err(|err| ScalewayBackendError::Provider {
                message: err.to_string(),
            })?;
        Ok(Some(parsed.server))
    }

    pub(super) async fn list_servers(
        &self,
        zone: &str,
    ) -> Result<Vec<ServerRecord>, ScalewayBackendError> {
        let url = self.servers_url(zone);
        let mut servers = Vec::new();
        let mut page = 1_u32;
        loop {
            let query = [
                ("tags", SERVER_TAG.to_owned()),
                ("per_page", PAGE_SIZE.to_string()),
                ("page", page.to_string()),
            ];
            let (status, body) = self.send::<()>(Method::GET, &url, &query, None).await?;
            if !status.is_success() {
                return Err(ScalewayBackendError::Provider {
                    message: format!("HTTP {}: {}", status.as_u16(), String::from_utf8_lossy(&body)),
                });
            }
            let parsed: ServerPage =
                serde_json::from_slice(&body).map_err(|err| ScalewayBackendError::Provider {
                    message: err.to_string(),
                })?;
            let count = parsed.servers.len();
            servers.extend(parsed.servers);
            if count < PAGE_SIZE {
                return Ok(servers);
            }
            page = page.saturating_add(1);
        }
    }
}
