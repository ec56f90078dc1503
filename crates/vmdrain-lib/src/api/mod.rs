//! Transport boundary to the cluster's management API
//!
//! The collector is transport-agnostic: both the HTTP client and the local
//! shell client implement [`ClusterApi`]. Responses from the resource
//! enumeration endpoint are heterogeneous records discriminated by a `type`
//! field; we model that as a tagged union and narrow it into concrete
//! entity types during ingestion.

mod http;
mod shell;

pub use http::{HttpApi, HttpApiConfig};
pub use shell::ShellApi;

use crate::models::GuestKind;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by a transport
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("failed to decode response: {0}")]
    Decode(String),
    #[error("command failed: {0}")]
    Subprocess(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

/// A resource discovered by the cluster-wide enumeration call.
///
/// The `type` field determines the variant. This record never leaves the
/// collector's first stage: nodes, VMs and storage are materialized from it
/// immediately.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClusterResource {
    Node(NodeRecord),
    Storage(StorageRecord),
    Qemu(GuestRecord),
    Lxc(GuestRecord),
}

/// Node entry from the resource enumeration
#[derive(Debug, Clone, Deserialize)]
pub struct NodeRecord {
    pub node: String,
    #[serde(default)]
    pub status: Option<String>,
    /// CPU utilization as a 0-1 fraction
    #[serde(default)]
    pub cpu: Option<f64>,
    /// Logical CPU count
    #[serde(default)]
    pub maxcpu: Option<u32>,
    #[serde(default)]
    pub mem: Option<u64>,
    #[serde(default)]
    pub maxmem: Option<u64>,
    /// Root filesystem usage in bytes
    #[serde(default)]
    pub disk: Option<u64>,
    #[serde(default)]
    pub maxdisk: Option<u64>,
    #[serde(default)]
    pub uptime: Option<u64>,
}

/// Storage entry from the resource enumeration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageRecord {
    pub node: String,
    pub storage: String,
    #[serde(default)]
    pub status: Option<String>,
    /// Used bytes
    #[serde(default)]
    pub disk: Option<u64>,
    /// Total bytes
    #[serde(default)]
    pub maxdisk: Option<u64>,
}

/// QEMU or LXC guest entry from the resource enumeration
#[derive(Debug, Clone, Deserialize)]
pub struct GuestRecord {
    pub vmid: u32,
    pub node: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    /// Nonzero when the record is a template, not a real guest
    #[serde(default)]
    pub template: Option<u8>,
    /// CPU utilization as a 0-1 fraction of the allocated vCPUs
    #[serde(default)]
    pub cpu: Option<f64>,
    #[serde(default)]
    pub maxcpu: Option<u32>,
    #[serde(default)]
    pub mem: Option<u64>,
    #[serde(default)]
    pub maxmem: Option<u64>,
    #[serde(default)]
    pub disk: Option<u64>,
    #[serde(default)]
    pub maxdisk: Option<u64>,
    #[serde(default)]
    pub uptime: Option<u64>,
}

impl GuestRecord {
    pub fn is_template(&self) -> bool {
        self.template.unwrap_or(0) != 0
    }
}

/// CPU hardware details from the node status endpoint
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CpuInfo {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub sockets: u32,
    #[serde(default)]
    pub cpus: u32,
    #[serde(default)]
    pub mhz: f64,
}

/// Total/used byte pair used for memory and swap figures
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UsagePair {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub used: u64,
}

/// Detailed status for one node
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeStatus {
    #[serde(default)]
    pub cpuinfo: CpuInfo,
    /// 1, 5 and 15-minute load averages
    #[serde(default)]
    pub loadavg: Option<[f64; 3]>,
    #[serde(default)]
    pub memory: UsagePair,
    #[serde(default)]
    pub swap: UsagePair,
    #[serde(default)]
    pub uptime: u64,
    #[serde(default)]
    pub pveversion: Option<String>,
}

/// Detailed live status for one VM
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VmStatus {
    #[serde(default)]
    pub status: Option<String>,
    /// CPU utilization as a 0-1 fraction of the allocated vCPUs
    #[serde(default)]
    pub cpu: Option<f64>,
    #[serde(default)]
    pub mem: Option<u64>,
    #[serde(default)]
    pub maxmem: Option<u64>,
    #[serde(default)]
    pub disk: Option<u64>,
    #[serde(default)]
    pub maxdisk: Option<u64>,
    #[serde(default)]
    pub uptime: Option<u64>,
}

/// One storage pool on a node
#[derive(Debug, Clone, Deserialize)]
pub struct StoragePool {
    pub storage: String,
    /// Comma-separated content kinds this pool may hold (e.g. `images,rootdir`)
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub active: Option<u8>,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub used: Option<u64>,
}

impl StoragePool {
    /// Whether the pool can hold VM images or container root volumes
    pub fn holds_guest_volumes(&self) -> bool {
        self.content
            .split(',')
            .any(|c| matches!(c.trim(), "images" | "rootdir"))
    }
}

/// One volume inside a storage pool
#[derive(Debug, Clone, Deserialize)]
pub struct VolumeInfo {
    pub volid: String,
    /// Owning VM, absent for ISO images and the like
    #[serde(default)]
    pub vmid: Option<u32>,
    #[serde(default)]
    pub content: String,
    /// Allocated bytes
    #[serde(default)]
    pub size: Option<u64>,
    /// Used bytes (thin-provisioned pools report this separately)
    #[serde(default)]
    pub used: Option<u64>,
}

impl VolumeInfo {
    /// Whether this volume is a guest disk (image or container root)
    pub fn is_guest_volume(&self) -> bool {
        matches!(self.content.as_str(), "images" | "rootdir")
    }
}

/// Capability interface both transports satisfy.
///
/// Every call carries the transport's own request timeout; failures are
/// reported per call and never poison the transport.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// List all cluster resources (nodes, VMs, storage) in one call
    async fn list_resources(&self) -> Result<Vec<ClusterResource>, ApiError>;

    /// Get one node's detailed status
    async fn node_status(&self, node: &str) -> Result<NodeStatus, ApiError>;

    /// Get one VM's detailed live status
    async fn vm_status(
        &self,
        node: &str,
        vmid: u32,
        kind: GuestKind,
    ) -> Result<VmStatus, ApiError>;

    /// Get one VM's raw configuration as a key/value map
    async fn vm_config(
        &self,
        node: &str,
        vmid: u32,
        kind: GuestKind,
    ) -> Result<HashMap<String, String>, ApiError>;

    /// Get one VM's raw configuration as unstructured text, including
    /// comment lines and the structured `meta:` line
    async fn vm_config_text(
        &self,
        node: &str,
        vmid: u32,
        kind: GuestKind,
    ) -> Result<String, ApiError>;

    /// Get one node's own configuration as unstructured text
    async fn node_config_text(&self, node: &str) -> Result<String, ApiError>;

    /// List a node's storage pools
    async fn node_storages(&self, node: &str) -> Result<Vec<StoragePool>, ApiError>;

    /// List a storage pool's volume contents
    async fn storage_content(
        &self,
        node: &str,
        storage: &str,
    ) -> Result<Vec<VolumeInfo>, ApiError>;

    /// Test connectivity to the cluster
    async fn ping(&self) -> Result<(), ApiError>;

    /// Perform any required session authentication
    async fn login(&self) -> Result<(), ApiError>;
}
