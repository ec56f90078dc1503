//! Cluster inventory collection
//!
//! Turns a set of slow, unreliable, per-object remote calls into one
//! consistent in-memory cluster snapshot. Fetch stages run through a
//! bounded worker pool; per-item failures keep the item's best-known
//! values and only the initial resource enumeration is fatal.

mod config_text;
mod pool;


pub use pool::DEFAULT_WORKERS;

use crate::api::{ApiError, ClusterApi, ClusterResource, GuestRecord, NodeRecord};
use crate::cache::DiskUsageCache;
use crate::models::{
    Cluster, ClusterTotals, DiskCacheEntry, GuestKind, Node, PowerState, Vm,
};
use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Progress callback: `(stage, completed, total)`; `total == 0` signals an
/// indeterminate-length stage.
pub type ProgressFn = dyn Fn(&str, usize, usize) + Send + Sync;

const STAGE_RESOURCES: &str = "resources";
const STAGE_VM_STATUS: &str = "vm status";
const STAGE_VM_CONFIG: &str = "vm config";
const STAGE_VM_METADATA: &str = "vm metadata";
const STAGE_DISK_USAGE: &str = "disk usage";
const STAGE_NODE_METADATA: &str = "node metadata";
const STAGE_CPU_RETRY: &str = "cpu retry";
const STAGE_NODE_STATUS: &str = "node status";

/// Tuning knobs for a collection cycle
#[derive(Debug, Clone)]
pub struct CollectorOptions {
    /// Cap on concurrent in-flight requests per stage
    pub workers: usize,
    /// Retries for nodes reporting stale zero CPU
    pub cpu_retry_attempts: usize,
    /// Delay between CPU staleness retries
    pub cpu_retry_delay: Duration,
    /// VMs older than this mark their host with the aged-VMs flag
    pub vm_age_threshold: chrono::Duration,
}

impl Default for CollectorOptions {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            cpu_retry_attempts: 2,
            cpu_retry_delay: Duration::from_secs(2),
            vm_age_threshold: chrono::Duration::days(90),
        }
    }
}

/// Collects one consistent [`Cluster`] snapshot per call
pub struct Collector {
    api: Arc<dyn ClusterApi>,
    cache: Arc<DiskUsageCache>,
    opts: CollectorOptions,
}

impl Collector {
    pub fn new(
        api: Arc<dyn ClusterApi>,
        cache: Arc<DiskUsageCache>,
        opts: CollectorOptions,
    ) -> Self {
        Self { api, cache, opts }
    }

    /// Run a full collection cycle.
    ///
    /// Only a failure of the initial resource enumeration aborts; every
    /// later per-item failure is logged and the item keeps its prior
    /// values.
    pub async fn collect(&self, progress: &ProgressFn) -> Result<Cluster> {
        progress(STAGE_RESOURCES, 0, 0);
        let resources = self
            .api
            .list_resources()
            .await
            .context("cluster resource enumeration failed")?;

        let (mut nodes, mut vms) = ingest_resources(resources);
        info!(nodes = nodes.len(), vms = vms.len(), "Resource enumeration complete");

        let index: HashMap<u32, usize> =
            vms.iter().enumerate().map(|(i, v)| (v.vmid, i)).collect();

        self.backfill_missing_storage(&mut vms, &index, progress).await;
        self.fetch_vm_metadata(&mut vms, &index, progress).await;
        self.reconcile_disk_usage(&mut vms, &index, progress).await;
        self.fetch_node_metadata(&mut nodes, progress).await;
        self.retry_stale_cpu(&mut nodes, &vms, progress).await;
        self.fetch_node_details(&mut nodes, progress).await;

        attach_and_flag(&mut nodes, vms, self.opts.vm_age_threshold);
        let cluster = finalize(nodes);

        // Opportunistic maintenance; never blocks the collection path.
        Arc::clone(&self.cache).spawn_cleanup();
        Ok(cluster)
    }

    /// Stage 2: running VMs with an unknown allocated-disk figure get a
    /// live status fetch, then a config parse for the stubborn ones.
    async fn backfill_missing_storage(
        &self,
        vms: &mut [Vm],
        index: &HashMap<u32, usize>,
        progress: &ProgressFn,
    ) {
        let targets: Vec<(u32, String, GuestKind)> = vms
            .iter()
            .filter(|v| v.state == PowerState::Running && v.max_disk == 0)
            .map(|v| (v.vmid, v.node.clone(), v.kind))
            .collect();

        let api = Arc::clone(&self.api);
        let results = pool::run(
            STAGE_VM_STATUS,
            targets,
            self.opts.workers,
            progress,
            move |(vmid, node, kind): (u32, String, GuestKind)| {
                let api = Arc::clone(&api);
                async move { (vmid, api.vm_status(&node, vmid, kind).await) }
            },
        )
        .await;

        for (vmid, result) in results {
            let Some(&i) = index.get(&vmid) else { continue };
            match result {
                Ok(status) => {
                    let vm = &mut vms[i];
                    if let Some(maxdisk) = status.maxdisk.filter(|d| *d > 0) {
                        vm.max_disk = maxdisk;
                    }
                    if let Some(disk) = status.disk.filter(|d| *d > 0) {
                        vm.used_disk = disk;
                    }
                }
                Err(e) => {
                    warn!(vmid, error = %e, "Failed to fetch VM status, keeping known figures")
                }
            }
        }

        let still_zero: Vec<(u32, String, GuestKind)> = vms
            .iter()
            .filter(|v| v.state == PowerState::Running && v.max_disk == 0)
            .map(|v| (v.vmid, v.node.clone(), v.kind))
            .collect();

        let api = Arc::clone(&self.api);
        let results = pool::run(
            STAGE_VM_CONFIG,
            still_zero,
            self.opts.workers,
            progress,
            move |(vmid, node, kind): (u32, String, GuestKind)| {
                let api = Arc::clone(&api);
                async move { (vmid, api.vm_config(&node, vmid, kind).await) }
            },
        )
        .await;

        for (vmid, result) in results {
            let Some(&i) = index.get(&vmid) else { continue };
            match result {
                Ok(config) => {
                    let bytes = config_text::sum_disk_bytes(&config);
                    if bytes > 0 {
                        vms[i].max_disk = bytes;
                    }
                }
                Err(e) => {
                    warn!(vmid, error = %e, "Failed to fetch VM config, keeping known figures")
                }
            }
        }
    }

    /// Stage 3: migration constraints and creation time from config text
    async fn fetch_vm_metadata(
        &self,
        vms: &mut [Vm],
        index: &HashMap<u32, usize>,
        progress: &ProgressFn,
    ) {
        let targets: Vec<(u32, String, GuestKind)> = vms
            .iter()
            .map(|v| (v.vmid, v.node.clone(), v.kind))
            .collect();

        let api = Arc::clone(&self.api);
        let results = pool::run(
            STAGE_VM_METADATA,
            targets,
            self.opts.workers,
            progress,
            move |(vmid, node, kind): (u32, String, GuestKind)| {
                let api = Arc::clone(&api);
                async move { (vmid, api.vm_config_text(&node, vmid, kind).await) }
            },
        )
        .await;

        for (vmid, result) in results {
            let Some(&i) = index.get(&vmid) else { continue };
            match result {
                Ok(text) => {
                    let meta = config_text::parse_guest_metadata(&text);
                    let vm = &mut vms[i];
                    vm.constraints.no_migrate = meta.no_migrate;
                    vm.constraints.required_cpu_model = meta.cpu_model;
                    vm.constraints.affinity = meta.affinity;
                    vm.constraints.anti_affinity = meta.anti_affinity;
                    vm.created_at = meta.created_at;
                }
                Err(e) => {
                    warn!(vmid, error = %e, "Failed to fetch VM config text, keeping empty metadata")
                }
            }
        }
    }

    /// Stage 4: live disk usage for VMs with no fresh cache entry
    async fn reconcile_disk_usage(
        &self,
        vms: &mut [Vm],
        index: &HashMap<u32, usize>,
        progress: &ProgressFn,
    ) {
        let cached = self.cache.get_batch(vms);
        for (vmid, entry) in &cached {
            if let Some(&i) = index.get(vmid) {
                vms[i].used_disk = entry.used_disk;
            }
        }
        debug!(cached = cached.len(), total = vms.len(), "Disk usage cache consulted");

        let mut wanted: BTreeMap<String, HashSet<u32>> = BTreeMap::new();
        for vm in vms.iter().filter(|v| !cached.contains_key(&v.vmid)) {
            wanted.entry(vm.node.clone()).or_default().insert(vm.vmid);
        }
        if wanted.is_empty() {
            return;
        }

        let api = Arc::clone(&self.api);
        let items: Vec<(String, HashSet<u32>)> = wanted.into_iter().collect();
        let results = pool::run(
            STAGE_DISK_USAGE,
            items,
            self.opts.workers,
            progress,
            move |(node, wanted): (String, HashSet<u32>)| {
                let api = Arc::clone(&api);
                async move {
                    let scanned = scan_node_storage(api.as_ref(), &node, &wanted).await;
                    (node, scanned)
                }
            },
        )
        .await;

        let now = Utc::now();
        let mut fresh = Vec::new();
        for (node, result) in results {
            match result {
                Ok(used_by_vm) => {
                    for (vmid, used) in used_by_vm {
                        let Some(&i) = index.get(&vmid) else { continue };
                        let vm = &mut vms[i];
                        vm.used_disk = used;
                        fresh.push(DiskCacheEntry {
                            vmid,
                            node: node.clone(),
                            max_disk: vm.max_disk,
                            used_disk: used,
                            checked_at: now,
                        });
                    }
                }
                Err(e) => {
                    warn!(node = %node, error = %e, "Failed to scan node storage, keeping known figures")
                }
            }
        }
        self.cache.set_batch(fresh);
    }

    /// Stage 5: per-node provisioning flag from node config text
    async fn fetch_node_metadata(
        &self,
        nodes: &mut BTreeMap<String, Node>,
        progress: &ProgressFn,
    ) {
        let names: Vec<String> = nodes.keys().cloned().collect();

        let api = Arc::clone(&self.api);
        let results = pool::run(
            STAGE_NODE_METADATA,
            names,
            self.opts.workers,
            progress,
            move |name: String| {
                let api = Arc::clone(&api);
                async move {
                    let text = api.node_config_text(&name).await;
                    (name, text)
                }
            },
        )
        .await;

        for (name, result) in results {
            match result {
                Ok(text) => {
                    let meta = config_text::parse_node_metadata(&text);
                    if let Some(node) = nodes.get_mut(&name) {
                        node.allow_provision = meta.allow_provision;
                    }
                }
                Err(e) => {
                    warn!(node = %name, error = %e, "Failed to fetch node config, assuming provisioning disallowed")
                }
            }
        }
    }

    /// Stage 6: a node reporting zero CPU while hosting running VMs has
    /// returned stale data; re-fetch and overwrite only the flagged nodes.
    async fn retry_stale_cpu(
        &self,
        nodes: &mut BTreeMap<String, Node>,
        vms: &[Vm],
        progress: &ProgressFn,
    ) {
        let running_hosts: HashSet<&str> = vms
            .iter()
            .filter(|v| v.state == PowerState::Running)
            .map(|v| v.node.as_str())
            .collect();

        let mut suspect: HashSet<String> = nodes
            .values()
            .filter(|n| n.online && n.cpu_usage == 0.0 && running_hosts.contains(n.name.as_str()))
            .map(|n| n.name.clone())
            .collect();
        if suspect.is_empty() {
            return;
        }

        let attempts = self.opts.cpu_retry_attempts;
        for attempt in 1..=attempts {
            warn!(nodes = ?suspect, attempt, "Zero CPU reported on nodes with running VMs, retrying");
            tokio::time::sleep(self.opts.cpu_retry_delay).await;
            progress(STAGE_CPU_RETRY, attempt, attempts);

            match self.api.list_resources().await {
                Ok(resources) => {
                    for resource in resources {
                        if let ClusterResource::Node(rec) = resource {
                            if !suspect.contains(&rec.node) {
                                continue;
                            }
                            if let Some(cpu) = rec.cpu.filter(|c| *c > 0.0) {
                                if let Some(node) = nodes.get_mut(&rec.node) {
                                    node.cpu_usage = cpu;
                                }
                                suspect.remove(&rec.node);
                            }
                        }
                    }
                }
                Err(e) => warn!(error = %e, "CPU staleness retry fetch failed"),
            }
            if suspect.is_empty() {
                break;
            }
        }
    }

    /// Stage 7: hardware details, load and swap for online nodes
    async fn fetch_node_details(
        &self,
        nodes: &mut BTreeMap<String, Node>,
        progress: &ProgressFn,
    ) {
        let names: Vec<String> = nodes
            .values()
            .filter(|n| n.online)
            .map(|n| n.name.clone())
            .collect();

        let api = Arc::clone(&self.api);
        let results = pool::run(
            STAGE_NODE_STATUS,
            names,
            self.opts.workers,
            progress,
            move |name: String| {
                let api = Arc::clone(&api);
                async move {
                    let status = api.node_status(&name).await;
                    (name, status)
                }
            },
        )
        .await;

        for (name, result) in results {
            let Some(node) = nodes.get_mut(&name) else { continue };
            match result {
                Ok(status) => {
                    node.cpu_model = status.cpuinfo.model;
                    node.sockets = status.cpuinfo.sockets;
                    node.mhz = status.cpuinfo.mhz;
                    if status.cpuinfo.cpus > 0 {
                        node.cpu_count = status.cpuinfo.cpus;
                    }
                    if let Some(loadavg) = status.loadavg {
                        node.loadavg = loadavg;
                    }
                    node.swap_total = status.swap.total;
                    node.swap_used = status.swap.used;
                    if status.uptime > 0 {
                        node.uptime = status.uptime;
                    }
                    if let Some(version) = status.pveversion {
                        node.version = version;
                    }
                }
                Err(e) => {
                    warn!(node = %name, error = %e, "Failed to fetch node status, keeping known figures")
                }
            }
        }
    }
}

/// Whether a storage pool follows the node-local naming convention
fn is_node_local_pool(name: &str) -> bool {
    name == "local" || name.starts_with("local-")
}

/// Whether a pool may be queried through the given node: node-local pools
/// and pools prefixed with the node's own name; shared pools are skipped
/// so they are never enumerated from the wrong node.
fn pool_belongs_to_node(pool: &str, node: &str) -> bool {
    is_node_local_pool(pool) || pool.starts_with(node)
}

fn node_from_record(rec: &NodeRecord) -> Node {
    Node {
        name: rec.node.clone(),
        online: rec.status.as_deref() == Some("online"),
        cpu_count: rec.maxcpu.unwrap_or(0),
        cpu_model: String::new(),
        sockets: 0,
        mhz: 0.0,
        cpu_usage: rec.cpu.unwrap_or(0.0),
        loadavg: [0.0; 3],
        max_mem: rec.maxmem.unwrap_or(0),
        used_mem: rec.mem.unwrap_or(0),
        max_disk: rec.maxdisk.unwrap_or(0),
        used_disk: rec.disk.unwrap_or(0),
        swap_total: 0,
        swap_used: 0,
        uptime: rec.uptime.unwrap_or(0),
        version: String::new(),
        allow_provision: false,
        has_osd_workload: false,
        has_aged_vms: false,
        vms: Vec::new(),
    }
}

fn vm_from_record(rec: GuestRecord, kind: GuestKind) -> Vm {
    Vm {
        vmid: rec.vmid,
        name: rec.name.unwrap_or_else(|| format!("vm{}", rec.vmid)),
        node: rec.node,
        state: PowerState::from_status(rec.status.as_deref().unwrap_or("stopped")),
        kind,
        cpus: rec.maxcpu.unwrap_or(0),
        cpu_percent: rec.cpu.unwrap_or(0.0) * 100.0,
        max_mem: rec.maxmem.unwrap_or(0),
        used_mem: rec.mem.unwrap_or(0),
        max_disk: rec.maxdisk.unwrap_or(0),
        used_disk: rec.disk.unwrap_or(0),
        uptime: rec.uptime.unwrap_or(0),
        created_at: None,
        constraints: Default::default(),
    }
}

/// Stage 1: narrow the polymorphic resource records into nodes and VMs,
/// discarding templates and folding node-local storage totals over the
/// root-filesystem figures.
fn ingest_resources(resources: Vec<ClusterResource>) -> (BTreeMap<String, Node>, Vec<Vm>) {
    let mut nodes = BTreeMap::new();
    let mut vms = Vec::new();
    let mut local_storage: HashMap<String, (u64, u64)> = HashMap::new();

    for resource in resources {
        match resource {
            ClusterResource::Node(rec) => {
                nodes.insert(rec.node.clone(), node_from_record(&rec));
            }
            ClusterResource::Qemu(rec) => {
                if rec.is_template() {
                    debug!(vmid = rec.vmid, "Skipping template");
                } else {
                    vms.push(vm_from_record(rec, GuestKind::Qemu));
                }
            }
            ClusterResource::Lxc(rec) => {
                if rec.is_template() {
                    debug!(vmid = rec.vmid, "Skipping template");
                } else {
                    vms.push(vm_from_record(rec, GuestKind::Lxc));
                }
            }
            ClusterResource::Storage(rec) => {
                if is_node_local_pool(&rec.storage) {
                    let slot = local_storage.entry(rec.node).or_insert((0, 0));
                    slot.0 += rec.maxdisk.unwrap_or(0);
                    slot.1 += rec.disk.unwrap_or(0);
                }
            }
        }
    }

    for (name, (total, used)) in local_storage {
        if let Some(node) = nodes.get_mut(&name) {
            if total > 0 {
                node.max_disk = total;
                node.used_disk = used;
            }
        }
    }

    vms.sort_by_key(|v| v.vmid);
    (nodes, vms)
}

/// Sum used bytes per wanted VM across a node's local image-bearing pools
async fn scan_node_storage(
    api: &dyn ClusterApi,
    node: &str,
    wanted: &HashSet<u32>,
) -> Result<HashMap<u32, u64>, ApiError> {
    let pools = api.node_storages(node).await?;
    let mut used_by_vm = HashMap::new();

    for pool in pools {
        if !pool.holds_guest_volumes() || !pool_belongs_to_node(&pool.storage, node) {
            continue;
        }
        match api.storage_content(node, &pool.storage).await {
            Ok(volumes) => {
                for vol in volumes {
                    let Some(vmid) = vol.vmid else { continue };
                    if !wanted.contains(&vmid) || !vol.is_guest_volume() {
                        continue;
                    }
                    let bytes = vol.used.or(vol.size).unwrap_or(0);
                    *used_by_vm.entry(vmid).or_insert(0) += bytes;
                }
            }
            Err(e) => {
                warn!(node, storage = %pool.storage, error = %e, "Failed to list storage contents")
            }
        }
    }
    Ok(used_by_vm)
}

/// Stage 8: attach VMs to their owning nodes and compute the flags that
/// need the full VM list.
fn attach_and_flag(
    nodes: &mut BTreeMap<String, Node>,
    vms: Vec<Vm>,
    age_threshold: chrono::Duration,
) {
    for vm in vms {
        match nodes.get_mut(&vm.node) {
            Some(node) => node.vms.push(vm),
            None => warn!(vmid = vm.vmid, node = %vm.node, "VM references unknown node, dropping"),
        }
    }

    let age_cutoff = Utc::now() - age_threshold;
    for node in nodes.values_mut() {
        node.has_osd_workload = node
            .vms
            .iter()
            .any(|v| v.name.to_lowercase().contains("osd"));
        if node.allow_provision {
            node.has_aged_vms = node
                .vms
                .iter()
                .any(|v| v.created_at.map_or(false, |c| c < age_cutoff));
        }
    }
}

/// Stage 9: recompute cluster-wide totals over the final node list
fn finalize(nodes: BTreeMap<String, Node>) -> Cluster {
    let nodes: Vec<Node> = nodes.into_values().collect();
    let mut totals = ClusterTotals::default();

    for node in &nodes {
        totals.total_threads += node.cpu_count as u64;
        totals.total_mem += node.max_mem;
        totals.total_disk += node.max_disk;
        totals.used_disk += node.used_disk;
        for vm in &node.vms {
            totals.vm_count += 1;
            match vm.state {
                PowerState::Running => totals.running += 1,
                PowerState::Stopped => totals.stopped += 1,
            }
            totals.total_vcpus += vm.cpus as u64;
        }
    }

    Cluster { nodes, totals }
}
