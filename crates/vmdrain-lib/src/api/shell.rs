//! Local shell transport
//!
//! Runs the cluster management CLI (`pvesh`) on the node itself and reads
//! guest config files straight from the cluster filesystem. Useful when the
//! planner runs on a cluster node without API credentials.

use super::{
    ApiError, ClusterApi, ClusterResource, NodeStatus, StoragePool, VmStatus, VolumeInfo,
};
use crate::models::GuestKind;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Shell implementation of [`ClusterApi`]
pub struct ShellApi {
    /// Management CLI binary, normally `pvesh`
    command: String,
    /// Root of the cluster configuration filesystem
    config_root: PathBuf,
    timeout: Duration,
}

impl Default for ShellApi {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellApi {
    pub fn new() -> Self {
        Self {
            command: "pvesh".to_string(),
            config_root: PathBuf::from("/etc/pve"),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Override the CLI binary and config root (used in tests)
    pub fn with_paths(command: impl Into<String>, config_root: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            config_root: config_root.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    async fn run(&self, args: &[&str]) -> Result<Vec<u8>, ApiError> {
        debug!(command = %self.command, ?args, "running management CLI");
        let child = Command::new(&self.command)
            .args(args)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| ApiError::Timeout(self.timeout))?
            .map_err(|e| ApiError::Subprocess(format!("{}: {e}", self.command)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ApiError::Subprocess(format!(
                "{} {} exited with {}: {}",
                self.command,
                args.join(" "),
                output.status,
                stderr.trim()
            )));
        }
        Ok(output.stdout)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let stdout = self
            .run(&["get", path, "--output-format", "json"])
            .await?;
        serde_json::from_slice(&stdout).map_err(|e| ApiError::Decode(e.to_string()))
    }

    fn guest_config_path(&self, node: &str, vmid: u32, kind: GuestKind) -> PathBuf {
        let dir = match kind {
            GuestKind::Qemu => "qemu-server",
            GuestKind::Lxc => "lxc",
        };
        self.config_root
            .join("nodes")
            .join(node)
            .join(dir)
            .join(format!("{vmid}.conf"))
    }

    async fn read_text(&self, path: PathBuf) -> Result<String, ApiError> {
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ApiError::Subprocess(format!("read {}: {e}", path.display())))
    }
}

#[async_trait]
impl ClusterApi for ShellApi {
    async fn list_resources(&self) -> Result<Vec<ClusterResource>, ApiError> {
        // Records of other types (pools, SDN zones) are not our concern;
        // decode per record so they don't fail the whole call.
        let raw: Vec<serde_json::Value> = self.get("/cluster/resources").await?;
        Ok(raw
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect())
    }

    async fn node_status(&self, node: &str) -> Result<NodeStatus, ApiError> {
        self.get(&format!("/nodes/{node}/status")).await
    }

    async fn vm_status(
        &self,
        node: &str,
        vmid: u32,
        kind: GuestKind,
    ) -> Result<VmStatus, ApiError> {
        self.get(&format!(
            "/nodes/{node}/{}/{vmid}/status/current",
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
        let raw: HashMap<String, serde_json::Value> = self
            .get(&format!("/nodes/{node}/{}/{vmid}/config", kind.as_path()))
            .await?;
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

    async fn vm_config_text(
        &self,
        node: &str,
        vmid: u32,
        kind: GuestKind,
    ) -> Result<String, ApiError> {
        self.read_text(self.guest_config_path(node, vmid, kind)).await
    }

    async fn node_config_text(&self, node: &str) -> Result<String, ApiError> {
        self.read_text(self.config_root.join("nodes").join(node).join("config"))
            .await
    }

    async fn node_storages(&self, node: &str) -> Result<Vec<StoragePool>, ApiError> {
        self.get(&format!("/nodes/{node}/storage")).await
    }

    async fn storage_content(
        &self,
        node: &str,
        storage: &str,
    ) -> Result<Vec<VolumeInfo>, ApiError> {
        self.get(&format!("/nodes/{node}/storage/{storage}/content"))
            .await
    }

    async fn ping(&self) -> Result<(), ApiError> {
        let _: serde_json::Value = self.get("/version").await?;
        Ok(())
    }

    async fn login(&self) -> Result<(), ApiError> {
        // The CLI inherits root privileges on the node, nothing to do.
        Ok(())
    }
}
