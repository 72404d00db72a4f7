//! HTTP implementation of [`ControlPlane`].

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    ApplicationDescription, ControlPlane, ControlPlaneConnector, ControlPlaneError,
    ControlPlaneFuture, DeploymentEvent, ServiceDescription,
};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Envelope every gateway response is wrapped in.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<T> {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    message_id: Option<String>,
    response: Option<T>,
}

#[derive(Default, Deserialize)]
struct Events {
    #[serde(default)]
    events: Vec<DeploymentEvent>,
}

#[derive(Deserialize)]
struct Undeployed {
    #[serde(rename = "deploymentID", alias = "deploymentId")]
    deployment_id: String,
}

/// Admin view of the cluster machines, keyed `hostname/address`.
#[derive(Default, Deserialize)]
struct HostsByAddress {
    #[serde(rename = "HostsByAddress-Elements", default)]
    elements: Vec<String>,
}

impl HostsByAddress {
    fn addresses(self) -> BTreeSet<String> {
        self.elements
            .into_iter()
            .filter_map(|entry| entry.rsplit('/').next().map(str::to_owned))
            .filter(|address| !address.is_empty())
            .collect()
    }
}

#[derive(Serialize)]
struct SetInstances {
    count: u32,
}

/// Control plane client speaking the versioned REST gateway protocol.
#[derive(Clone, Debug)]
pub struct RestControlPlane {
    client: reqwest::Client,
    base: String,
}

impl RestControlPlane {
    /// Builds a client for the gateway at `url` using `api_version` as the
    /// path prefix.
    ///
    /// # Errors
    ///
    /// Returns [`ControlPlaneError::InvalidUrl`] when `url` is not an
    /// absolute HTTP URL.
    pub fn new(url: &str, api_version: &str) -> Result<Self, ControlPlaneError> {
        let trimmed = url.trim().trim_end_matches('/');
        let parsed = reqwest::Url::parse(trimmed).map_err(|err| ControlPlaneError::InvalidUrl {
            url: url.to_owned(),
            message: err.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ControlPlaneError::InvalidUrl {
                url: url.to_owned(),
                message: format!("unsupported scheme {}", parsed.scheme()),
            });
        }

        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Ok(Self {
            client,
            base: format!("{trimmed}/{}", api_version.trim_matches('/')),
        })
    }

    /// Versioned gateway root, without a trailing slash.
    #[must_use]
    pub fn base(&self) -> &str {
        &self.base
    }

    async fn send<B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Vec<u8>, ControlPlaneError>
    where
        B: Serialize + Sync,
    {
        let url = format!("{}{path}", self.base);
        debug!(%method, %url, "control plane request");

        let mut request = self.client.request(method, &url);
        if let Some(payload) = body {
            request = request.json(payload);
        }
        let response = request
            .send()
            .await
            .map_err(|err| ControlPlaneError::Connection {
                url: url.clone(),
                message: err.to_string(),
            })?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| ControlPlaneError::Connection {
                url: url.clone(),
                message: err.to_string(),
            })?;

        if status == StatusCode::NOT_FOUND {
            return Err(ControlPlaneError::NotFound {
                path: path.to_owned(),
            });
        }
        if !status.is_success() {
            return Err(ControlPlaneError::Http {
                path: path.to_owned(),
                status: status.as_u16(),
                message: error_message(&bytes),
            });
        }
        Ok(bytes.to_vec())
    }

    async fn call<B, T>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Option<T>, ControlPlaneError>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let bytes = self.send(method, path, body).await?;
        if bytes.is_empty() {
            return Ok(None);
        }

        let envelope: Envelope<T> =
            serde_json::from_slice(&bytes).map_err(|err| ControlPlaneError::Decode {
                path: path.to_owned(),
                message: err.to_string(),
            })?;
        Ok(envelope.response)
    }

    async fn fetch<T: DeserializeOwned>(&self, path: &str) -> Result<T, ControlPlaneError> {
        self.call::<(), T>(Method::GET, path, None)
            .await?
            .ok_or_else(|| ControlPlaneError::Decode {
                path: path.to_owned(),
                message: String::from("response body carried no payload"),
            })
    }
}

/// Extracts the most useful message from an error body.
fn error_message(body: &[u8]) -> String {
    serde_json::from_slice::<Envelope<serde_json::Value>>(body)
        .ok()
        .and_then(|envelope| envelope.message.or(envelope.message_id))
        .unwrap_or_else(|| String::from_utf8_lossy(body).trim().to_owned())
}

impl ControlPlane for RestControlPlane {
    fn ping(&self) -> ControlPlaneFuture<'_, ()> {
        Box::pin(async move {
            self.call::<(), serde_json::Value>(Method::GET, "/service/testrest", None)
                .await
                .map(|_| ())
        })
    }

    fn service_description<'a>(
        &'a self,
        application: &'a str,
        service: &'a str,
    ) -> ControlPlaneFuture<'a, ServiceDescription> {
        Box::pin(async move {
            self.fetch(&format!("/deployments/{application}/service/{service}/description"))
                .await
        })
    }

    fn service_descriptions<'a>(
        &'a self,
        deployment_id: &'a str,
    ) -> ControlPlaneFuture<'a, Vec<ServiceDescription>> {
        Box::pin(async move { self.fetch(&format!("/deployments/{deployment_id}/description")).await })
    }

    fn applications(&self) -> ControlPlaneFuture<'_, Vec<ApplicationDescription>> {
        Box::pin(async move { self.fetch("/deployments/applications/description").await })
    }

    fn undeploy_application<'a>(&'a self, application: &'a str) -> ControlPlaneFuture<'a, String> {
        Box::pin(async move {
            let path = format!("/deployments/{application}");
            let undeployed: Undeployed = self
                .call::<(), Undeployed>(Method::DELETE, &path, None)
                .await?
                .ok_or_else(|| ControlPlaneError::Decode {
                    path: path.clone(),
                    message: String::from("response body carried no deployment id"),
                })?;
            Ok(undeployed.deployment_id)
        })
    }

    fn undeploy_service<'a>(
        &'a self,
        application: &'a str,
        service: &'a str,
    ) -> ControlPlaneFuture<'a, ()> {
        Box::pin(async move {
            self.call::<(), serde_json::Value>(
                Method::DELETE,
                &format!("/deployments/{application}/services/{service}"),
                None,
            )
            .await
            .map(|_| ())
        })
    }

    fn deployment_events<'a>(
        &'a self,
        deployment_id: &'a str,
        from: i64,
    ) -> ControlPlaneFuture<'a, Vec<DeploymentEvent>> {
        Box::pin(async move {
            let path = format!("/deployments/{deployment_id}/events/?from={from}&to=-1");
            let events: Option<Events> = self.call::<(), Events>(Method::GET, &path, None).await?;
            Ok(events.unwrap_or_default().events)
        })
    }

    fn set_instances<'a>(
        &'a self,
        application: &'a str,
        service: &'a str,
        count: u32,
    ) -> ControlPlaneFuture<'a, ()> {
        Box::pin(async move {
            self.call::<SetInstances, serde_json::Value>(
                Method::POST,
                &format!("/deployments/{application}/services/{service}/count"),
                Some(&SetInstances { count }),
            )
            .await
            .map(|_| ())
        })
    }

    fn machine_hosts(&self) -> ControlPlaneFuture<'_, BTreeSet<String>> {
        Box::pin(async move {
            let path = "/admin/machines/HostsByAddress";
            let bytes = self.send::<()>(Method::GET, path, None).await?;
            if bytes.is_empty() {
                return Ok(BTreeSet::new());
            }
            let hosts: HostsByAddress =
                serde_json::from_slice(&bytes).map_err(|err| ControlPlaneError::Decode {
                    path: path.to_owned(),
                    message: err.to_string(),
                })?;
            Ok(hosts.addresses())
        })
    }
}

/// Opens [`RestControlPlane`] clients for a fixed API version.
#[derive(Clone, Debug)]
pub struct RestConnector {
    api_version: String,
}

impl RestConnector {
    /// Creates a connector using `api_version` as the path prefix.
    #[must_use]
    pub fn new(api_version: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
        }
    }
}

impl ControlPlaneConnector for RestConnector {
    fn connect(&self, url: &str) -> Result<Arc<dyn ControlPlane>, ControlPlaneError> {
        let client = RestControlPlane::new(url, &self.api_version)?;
        Ok(Arc::new(client))
    }
}
