//! HTTP transport against the cluster's REST API
//!
//! Authenticates either with a pre-provisioned API token (stateless header)
//! or with a username/password ticket obtained from `/access/ticket`.
//! Every response arrives wrapped in a `{"data": ...}` envelope.

use super::{
    ApiError, ClusterApi, ClusterResource, NodeStatus, StoragePool, VmStatus, VolumeInfo,
};
use crate::models::GuestKind;
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;
use url::Url;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection settings for the HTTP transport
#[derive(Debug, Clone)]
pub struct HttpApiConfig {
    /// Base URL of the API, e.g. `https://kv01.example:8006/api2/json/`
    pub base_url: String,
    /// Username including realm, e.g. `planner@pam`
    pub user: Option<String>,
    pub password: Option<String>,
    /// API token id; together with `token_secret` replaces ticket auth
    pub token_id: Option<String>,
    pub token_secret: Option<String>,
    /// Skip TLS certificate verification (self-signed cluster certs)
    pub insecure: bool,
    pub timeout: Duration,
}

impl Default for HttpApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://localhost:8006/api2/json/".to_string(),
            user: None,
            password: None,
            token_id: None,
            token_secret: None,
            insecure: false,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Session ticket obtained from password authentication
#[derive(Debug, Clone)]
struct Session {
    ticket: String,
    csrf_token: String,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct TicketData {
    ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    csrf_token: String,
}

/// HTTP implementation of [`ClusterApi`]
pub struct HttpApi {
    client: Client,
    base_url: Url,
    config: HttpApiConfig,
    session: RwLock<Option<Session>>,
}

impl HttpApi {
    pub fn new(config: HttpApiConfig) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.insecure)
            .build()?;

        let base_url = Url::parse(&config.base_url)
            .map_err(|e| ApiError::Decode(format!("invalid base URL: {e}")))?;

        Ok(Self {
            client,
            base_url,
            config,
            session: RwLock::new(None),
        })
    }

    fn token_header(&self) -> Option<String> {
        match (&self.config.user, &self.config.token_id, &self.config.token_secret) {
            (Some(user), Some(id), Some(secret)) => {
                Some(format!("PVEAPIToken={user}!{id}={secret}"))
            }
            _ => None,
        }
    }

    fn map_err(e: reqwest::Error, timeout: Duration) -> ApiError {
        if e.is_timeout() {
            ApiError::Timeout(timeout)
        } else {
            ApiError::Http(e)
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| ApiError::Decode(format!("invalid path {path}: {e}")))?;

        let mut request = self.client.get(url);
        if let Some(header) = self.token_header() {
            request = request.header("Authorization", header);
        } else if let Some(session) = self.session.read().await.as_ref() {
            request = request
                .header("Cookie", format!("PVEAuthCookie={}", session.ticket))
                .header("CSRFPreventionToken", session.csrf_token.clone());
        }

        let response = request
            .send()
            .await
            .map_err(|e| Self::map_err(e, self.config.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        Ok(envelope.data)
    }

    /// Fetch a config endpoint and keep its values as plain strings
    async fn get_config_map(&self, path: &str) -> Result<HashMap<String, String>, ApiError> {
        let raw: HashMap<String, serde_json::Value> = self.get(path).await?;
        Ok(raw
            .into_iter()
            .map(|(k, v)| {
                let v = match v {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (k, v)
            })
            .collect())
    }

    /// Reconstruct config text from a config map: the `description` field
    /// carries the comment lines, `meta` carries the creation metadata.
    fn config_text_from_map(map: &HashMap<String, String>) -> String {
        let mut text = String::new();
        if let Some(description) = map.get("description") {
            for line in description.lines() {
                text.push('#');
                text.push_str(line);
                text.push('\n');
            }
        }
        let mut keys: Vec<&String> = map.keys().filter(|k| *k != "description").collect();
        keys.sort();
        for key in keys {
            text.push_str(key);
            text.push_str(": ");
            text.push_str(&map[key]);
            text.push('\n');
        }
        text
    }
}

#[async_trait]
impl ClusterApi for HttpApi {
    async fn list_resources(&self) -> Result<Vec<ClusterResource>, ApiError> {
        // Records of other types (pools, SDN zones) are not our concern;
        // decode per record so they don't fail the whole call.
        let raw: Vec<serde_json::Value> = self.get("cluster/resources").await?;
        Ok(raw
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect())
    }

    async fn node_status(&self, node: &str) -> Result<NodeStatus, ApiError> {
        self.get(&format!("nodes/{node}/status")).await
    }

    async fn vm_status(
        &self,
        node: &str,
        vmid: u32,
        kind: GuestKind,
    ) -> Result<VmStatus, ApiError> {
        self.get(&format!(
            "nodes/{node}/{}/{vmid}/status/current",
            kind.as_path()
        ))
        .await
    }

    async fn vm_config(
        &self,
        node: &str,
        vmid: u32,
        kind: GuestKind,
    ) -> Result<HashMap<String, String>, ApiError> {
        self.get_config_map(&format!("nodes/{node}/{}/{vmid}/config", kind.as_path()))
            .await
    }

    async fn vm_config_text(
        &self,
        node: &str,
        vmid: u32,
        kind: GuestKind,
    ) -> Result<String, ApiError> {
        let map = self.vm_config(node, vmid, kind).await?;
        Ok(Self::config_text_from_map(&map))
    }

    async fn node_config_text(&self, node: &str) -> Result<String, ApiError> {
        let map = self.get_config_map(&format!("nodes/{node}/config")).await?;
        Ok(Self::config_text_from_map(&map))
    }

    async fn node_storages(&self, node: &str) -> Result<Vec<StoragePool>, ApiError> {
        self.get(&format!("nodes/{node}/storage")).await
    }

    async fn storage_content(
        &self,
        node: &str,
        storage: &str,
    ) -> Result<Vec<VolumeInfo>, ApiError> {
        self.get(&format!("nodes/{node}/storage/{storage}/content"))
            .await
    }

    async fn ping(&self) -> Result<(), ApiError> {
        let _: serde_json::Value = self.get("version").await?;
        Ok(())
    }

    async fn login(&self) -> Result<(), ApiError> {
        if self.token_header().is_some() {
            debug!("using API token auth, no session ticket needed");
            return Ok(());
        }

        let (user, password) = match (&self.config.user, &self.config.password) {
            (Some(u), Some(p)) => (u.clone(), p.clone()),
            _ => {
                return Err(ApiError::Auth(
                    "no API token and no username/password configured".to_string(),
                ))
            }
        };

        let url = self
            .base_url
            .join("access/ticket")
            .map_err(|e| ApiError::Decode(e.to_string()))?;

        let response = self
            .client
            .post(url)
            .form(&[("username", user.as_str()), ("password", password.as_str())])
            .send()
            .await
            .map_err(|e| Self::map_err(e, self.config.timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Auth(format!("ticket request returned {status}")));
        }

        let envelope: Envelope<TicketData> = response
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;

        debug!(user = %user, "session ticket obtained");
        *self.session.write().await = Some(Session {
            ticket: envelope.data.ticket,
            csrf_token: envelope.data.csrf_token,
        });
        Ok(())
    }
}
