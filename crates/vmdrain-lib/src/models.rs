//! Core data models for the drain planner

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Guest virtualization kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestKind {
    /// Full virtualization
    Qemu,
    /// Container
    Lxc,
}

impl GuestKind {
    /// API path segment for this guest kind
    pub fn as_path(&self) -> &'static str {
        match self {
            GuestKind::Qemu => "qemu",
            GuestKind::Lxc => "lxc",
        }
    }
}

/// Guest power state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    Running,
    Stopped,
}

impl PowerState {
    pub fn from_status(status: &str) -> Self {
        if status == "running" {
            PowerState::Running
        } else {
            PowerState::Stopped
        }
    }
}

/// Migration constraints attached to a VM via config metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrationConstraints {
    /// VM must never be suggested for migration
    pub no_migrate: bool,
    /// Target host's CPU model must contain this substring
    pub required_cpu_model: Option<String>,
    /// Names of VMs this VM must be co-located with
    pub affinity: Vec<String>,
    /// Names of VMs this VM must not be co-located with
    pub anti_affinity: Vec<String>,
}

/// One guest workload, resident on exactly one node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vm {
    /// Cluster-unique identifier
    pub vmid: u32,
    pub name: String,
    /// Name of the owning node
    pub node: String,
    pub state: PowerState,
    pub kind: GuestKind,
    /// Allocated vCPUs
    pub cpus: u32,
    /// CPU utilization in percent (0-100)
    pub cpu_percent: f64,
    /// Allocated memory in bytes
    pub max_mem: u64,
    /// Used memory in bytes
    pub used_mem: u64,
    /// Allocated disk in bytes
    pub max_disk: u64,
    /// Used disk in bytes
    pub used_disk: u64,
    /// Uptime in seconds
    pub uptime: u64,
    pub created_at: Option<DateTime<Utc>>,
    pub constraints: MigrationConstraints,
}

impl Vm {
    /// Storage footprint used for placement: allocated size, falling back
    /// to the used figure when allocation is unknown.
    pub fn storage_bytes(&self) -> u64 {
        if self.max_disk > 0 {
            self.max_disk
        } else {
            self.used_disk
        }
    }

    /// RAM footprint used for candidate ordering: used bytes, falling back
    /// to the allocated figure when usage is unknown.
    pub fn ram_bytes(&self) -> u64 {
        if self.used_mem > 0 {
            self.used_mem
        } else {
            self.max_mem
        }
    }
}

/// One hypervisor host in the cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub online: bool,
    /// Logical CPU count (threads)
    pub cpu_count: u32,
    pub cpu_model: String,
    pub sockets: u32,
    pub mhz: f64,
    /// CPU utilization as a 0-1 fraction
    pub cpu_usage: f64,
    /// 1/5/15-minute load averages
    pub loadavg: [f64; 3],
    /// Allocated memory in bytes
    pub max_mem: u64,
    pub used_mem: u64,
    /// Allocated disk in bytes (node-local storage totals when present,
    /// else the root filesystem)
    pub max_disk: u64,
    pub used_disk: u64,
    pub swap_total: u64,
    pub swap_used: u64,
    /// Uptime in seconds
    pub uptime: u64,
    /// Platform version string
    pub version: String,
    /// Node accepts newly provisioned workloads
    pub allow_provision: bool,
    /// Node hosts a storage-critical OSD workload
    pub has_osd_workload: bool,
    /// Node hosts VMs older than the age threshold (only evaluated for
    /// provisioning-allowed nodes)
    pub has_aged_vms: bool,
    /// VMs resident on this node
    pub vms: Vec<Vm>,
}

impl Node {
    pub fn cpu_percent(&self) -> f64 {
        self.cpu_usage * 100.0
    }

    pub fn ram_percent(&self) -> f64 {
        if self.max_mem == 0 {
            return 0.0;
        }
        self.used_mem as f64 / self.max_mem as f64 * 100.0
    }

    pub fn storage_percent(&self) -> f64 {
        if self.max_disk == 0 {
            return 0.0;
        }
        self.used_disk as f64 / self.max_disk as f64 * 100.0
    }

    pub fn running_vms(&self) -> usize {
        self.vms
            .iter()
            .filter(|v| v.state == PowerState::Running)
            .count()
    }
}

/// Cluster-wide derived totals
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterTotals {
    pub vm_count: usize,
    pub running: usize,
    pub stopped: usize,
    pub total_vcpus: u64,
    pub total_threads: u64,
    pub total_mem: u64,
    pub total_disk: u64,
    pub used_disk: u64,
}

/// Immutable snapshot of the cluster produced by one collection cycle.
///
/// Nodes are sorted by name; every VM appears in exactly one node's `vms`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub nodes: Vec<Node>,
    pub totals: ClusterTotals,
}

impl Cluster {
    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Iterate over all VMs in the cluster
    pub fn vms(&self) -> impl Iterator<Item = &Vm> {
        self.nodes.iter().flat_map(|n| n.vms.iter())
    }
}

/// Cached last-known disk allocation and usage for one VM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskCacheEntry {
    pub vmid: u32,
    pub node: String,
    /// Allocated size at verification time; a mismatch with the live
    /// figure invalidates the entry
    pub max_disk: u64,
    pub used_disk: u64,
    pub checked_at: DateTime<Utc>,
}
