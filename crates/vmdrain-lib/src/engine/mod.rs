//! Migration placement engine
//!
//! Consumes an immutable cluster snapshot and produces an ordered plan of
//! VM-to-node assignments. Placement is strictly greedy and sequential:
//! every accepted assignment updates running projections before the next
//! candidate is scored, which is part of the correctness contract.

mod score;

#[cfg(test)]
mod tests;

use crate::models::{Cluster, Node, PowerState, Vm};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use thiserror::Error;
use tracing::debug;

/// Allowed overshoot above the cluster average during evacuation, in
/// percentage points
pub const EVACUATION_MARGIN: f64 = 5.0;

const MAX_ALTERNATIVES: usize = 3;

/// What the migration target quantity measures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Move a number of VMs, lightest combined impact first
    VmCount,
    /// Move VMs until their vCPU total reaches the target
    Vcpu,
    /// Move VMs until their host CPU contribution reaches the target
    CpuPercent,
    /// Move VMs until their RAM total reaches the target
    Ram,
    /// Move VMs until their storage total reaches the target
    Storage,
    /// Move exactly the listed VMs
    SpecificVms,
    /// Move every eligible VM off the source
    EvacuateAll,
}

impl Mode {
    fn requires_target(&self) -> bool {
        matches!(
            self,
            Mode::VmCount | Mode::Vcpu | Mode::CpuPercent | Mode::Ram | Mode::Storage
        )
    }
}

/// Optional limits applied to every target node
#[derive(Debug, Clone, Default)]
pub struct Constraints {
    /// Node names that must not receive VMs
    pub excluded_nodes: Vec<String>,
    /// Cap on resident VMs per target
    pub max_vms_per_host: Option<usize>,
    /// Minimum free RAM a target must retain after placement
    pub min_free_ram_bytes: Option<u64>,
    /// Minimum free CPU% a target must retain after placement
    pub min_free_cpu_percent: Option<f64>,
}

/// Input errors surfaced before any planning work begins
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("unknown source node: {0}")]
    UnknownSourceNode(String),
    #[error("mode {0:?} requires a target quantity")]
    MissingTarget(Mode),
    #[error("target quantity must be positive, got {0}")]
    InvalidTarget(f64),
    #[error("explicit VM list is empty")]
    EmptyVmSelection,
    #[error("VM {0} is not resident on the source node")]
    VmNotOnSource(u32),
    #[error("VM {0} is tagged do-not-migrate")]
    VmPinned(u32),
}

/// Why a node was filtered out for a particular VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    InsufficientRam,
    InsufficientStorage,
    MinFreeRam,
    MinFreeCpu,
    VmLimitReached,
    AffinityViolation,
    CpuModelMismatch,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RejectReason::InsufficientRam => "insufficient RAM capacity",
            RejectReason::InsufficientStorage => "insufficient storage capacity",
            RejectReason::MinFreeRam => "would violate min-free-RAM",
            RejectReason::MinFreeCpu => "would violate min-free-CPU",
            RejectReason::VmLimitReached => "host VM-count limit reached",
            RejectReason::AffinityViolation => "affinity violation",
            RejectReason::CpuModelMismatch => "CPU-model mismatch",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetRejection {
    pub node: String,
    pub reason: RejectReason,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlternativeTarget {
    pub node: String,
    pub score: f64,
}

/// Whether an evacuation assignment stayed within the cluster-balance
/// bound or fell back to the best remaining node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    Balanced,
    BestAvailable,
}

/// One recommended VM move, immutable once produced
#[derive(Debug, Clone, Serialize)]
pub struct MigrationSuggestion {
    pub vmid: u32,
    pub name: String,
    pub source: String,
    pub target: String,
    pub cpus: u32,
    pub ram_bytes: u64,
    pub storage_bytes: u64,
    pub state: PowerState,
    pub cpu_percent: f64,
    pub score: f64,
    pub placement: Placement,
    /// Up to 3 next-best targets with their scores
    pub alternatives: Vec<AlternativeTarget>,
    /// Filtered-out nodes with the reason each was rejected
    pub rejections: Vec<TargetRejection>,
}

/// A candidate VM that no node could accept
#[derive(Debug, Clone, Serialize)]
pub struct OmittedVm {
    pub vmid: u32,
    pub name: String,
    pub rejections: Vec<TargetRejection>,
}

/// Point-in-time projection of one node's load
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStateSnapshot {
    pub vm_count: usize,
    pub vcpus: u64,
    pub cpu_percent: f64,
    pub ram_percent: f64,
    pub disk_used: u64,
    pub disk_total: u64,
}

/// Before/after projection for a node touched by the plan
#[derive(Debug, Clone, Serialize)]
pub struct NodeDelta {
    pub node: String,
    pub before: NodeStateSnapshot,
    pub after: NodeStateSnapshot,
}

/// Aggregate resources the plan would move
#[derive(Debug, Clone, Default, Serialize)]
pub struct MovedTotals {
    pub vms: usize,
    pub vcpus: u64,
    pub ram_bytes: u64,
    pub storage_bytes: u64,
}

/// Full output of one planning pass
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResult {
    pub suggestions: Vec<MigrationSuggestion>,
    pub omitted: Vec<OmittedVm>,
    pub source: NodeDelta,
    /// Nodes that received at least one VM, sorted by name
    pub targets: Vec<NodeDelta>,
    pub moved: MovedTotals,
}

/// Running projection of one node, mutated as assignments are applied
#[derive(Debug, Clone)]
struct NodeLoad {
    name: String,
    online: bool,
    excluded: bool,
    threads: u32,
    cpu_percent: f64,
    ram_used: u64,
    ram_total: u64,
    disk_used: u64,
    disk_total: u64,
    vm_count: usize,
    vcpus: u64,
    cpu_model: String,
    /// Names of resident VMs, for affinity checks
    resident: HashSet<String>,
}

impl NodeLoad {
    fn from_node(node: &Node, excluded: &HashSet<&str>) -> Self {
        Self {
            name: node.name.clone(),
            online: node.online,
            excluded: excluded.contains(node.name.as_str()),
            threads: node.cpu_count,
            cpu_percent: node.cpu_percent(),
            ram_used: node.used_mem,
            ram_total: node.max_mem,
            disk_used: node.used_disk,
            disk_total: node.max_disk,
            vm_count: node.vms.len(),
            vcpus: node.vms.iter().map(|v| v.cpus as u64).sum(),
            cpu_model: node.cpu_model.clone(),
            resident: node.vms.iter().map(|v| v.name.clone()).collect(),
        }
    }

    fn ram_percent(&self) -> f64 {
        if self.ram_total == 0 {
            return 0.0;
        }
        self.ram_used as f64 / self.ram_total as f64 * 100.0
    }

    fn ram_percent_with(&self, extra: u64) -> f64 {
        if self.ram_total == 0 {
            return 0.0;
        }
        (self.ram_used + extra) as f64 / self.ram_total as f64 * 100.0
    }

    fn storage_percent(&self) -> f64 {
        if self.disk_total == 0 {
            return 0.0;
        }
        self.disk_used as f64 / self.disk_total as f64 * 100.0
    }

    fn free_ram(&self) -> u64 {
        self.ram_total.saturating_sub(self.ram_used)
    }

    fn free_disk(&self) -> u64 {
        self.disk_total.saturating_sub(self.disk_used)
    }

    /// CPU percentage points this VM contributes on this host
    fn cpu_delta_for(&self, vm: &Vm) -> f64 {
        if self.threads == 0 {
            return 0.0;
        }
        vm.cpu_percent * vm.cpus as f64 / self.threads as f64
    }

    fn apply(&mut self, vm: &Vm) {
        self.cpu_percent += self.cpu_delta_for(vm);
        self.ram_used += vm.max_mem;
        self.disk_used += vm.storage_bytes();
        self.vm_count += 1;
        self.vcpus += vm.cpus as u64;
        self.resident.insert(vm.name.clone());
    }

    fn remove(&mut self, vm: &Vm) {
        self.cpu_percent = (self.cpu_percent - self.cpu_delta_for(vm)).max(0.0);
        self.ram_used = self.ram_used.saturating_sub(vm.max_mem);
        self.disk_used = self.disk_used.saturating_sub(vm.storage_bytes());
        self.vm_count = self.vm_count.saturating_sub(1);
        self.vcpus = self.vcpus.saturating_sub(vm.cpus as u64);
        self.resident.remove(&vm.name);
    }

    fn snapshot(&self) -> NodeStateSnapshot {
        NodeStateSnapshot {
            vm_count: self.vm_count,
            vcpus: self.vcpus,
            cpu_percent: self.cpu_percent,
            ram_percent: self.ram_percent(),
            disk_used: self.disk_used,
            disk_total: self.disk_total,
        }
    }
}

/// CPU percentage points the VM contributes on its source host
fn cpu_contribution(vm: &Vm, source: &Node) -> f64 {
    if source.cpu_count == 0 {
        return 0.0;
    }
    vm.cpu_percent * vm.cpus as f64 / source.cpu_count as f64
}

/// Combined weighted impact of one VM on its source host, in percent
fn impact_score(vm: &Vm, source: &Node) -> f64 {
    let cpu = cpu_contribution(vm, source);
    let ram = if source.max_mem == 0 {
        0.0
    } else {
        vm.max_mem as f64 / source.max_mem as f64 * 100.0
    };
    let storage = if source.max_disk == 0 {
        0.0
    } else {
        vm.storage_bytes() as f64 / source.max_disk as f64 * 100.0
    };
    0.4 * cpu + 0.4 * ram + 0.2 * storage
}

/// Pick and order the VMs to move off the source node
fn select_candidates(
    source: &Node,
    mode: Mode,
    target: Option<f64>,
    vmids: &[u32],
) -> Result<Vec<Vm>, PlanError> {
    match mode {
        Mode::SpecificVms => {
            if vmids.is_empty() {
                return Err(PlanError::EmptyVmSelection);
            }
            let mut seen = HashSet::new();
            let mut selected = Vec::new();
            for &vmid in vmids {
                if !seen.insert(vmid) {
                    continue;
                }
                let vm = source
                    .vms
                    .iter()
                    .find(|v| v.vmid == vmid)
                    .ok_or(PlanError::VmNotOnSource(vmid))?;
                if vm.constraints.no_migrate {
                    return Err(PlanError::VmPinned(vmid));
                }
                selected.push(vm.clone());
            }
            Ok(selected)
        }
        Mode::EvacuateAll => Ok(source
            .vms
            .iter()
            .filter(|v| !v.constraints.no_migrate)
            .cloned()
            .collect()),
        _ => {
            let target = target.expect("target validated by caller");
            let metric = |vm: &Vm| -> f64 {
                match mode {
                    Mode::VmCount => impact_score(vm, source),
                    Mode::Vcpu => vm.cpus as f64,
                    Mode::CpuPercent => cpu_contribution(vm, source),
                    Mode::Ram => vm.ram_bytes() as f64,
                    Mode::Storage => vm.storage_bytes() as f64,
                    Mode::SpecificVms | Mode::EvacuateAll => unreachable!(),
                }
            };

            let mut eligible: Vec<&Vm> = source
                .vms
                .iter()
                .filter(|v| !v.constraints.no_migrate)
                .collect();
            eligible.sort_by(|a, b| {
                metric(a)
                    .partial_cmp(&metric(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.vmid.cmp(&b.vmid))
            });

            let mut selected = Vec::new();
            let mut cumulative = 0.0;
            for vm in eligible {
                if cumulative >= target {
                    break;
                }
                // The VM crossing the threshold is included in full.
                cumulative += match mode {
                    Mode::VmCount => 1.0,
                    _ => metric(vm),
                };
                selected.push(vm.clone());
            }
            Ok(selected)
        }
    }
}

/// Mean CPU% and RAM% across every node except the source; fixed for the
/// whole evacuation pass.
fn cluster_averages(loads: &[NodeLoad], source: &str) -> (f64, f64) {
    let others: Vec<&NodeLoad> = loads.iter().filter(|l| l.name != source).collect();
    if others.is_empty() {
        return (0.0, 0.0);
    }
    let count = others.len() as f64;
    let cpu = others.iter().map(|l| l.cpu_percent).sum::<f64>() / count;
    let ram = others.iter().map(|l| l.ram_percent()).sum::<f64>() / count;
    (cpu, ram)
}

enum Selection {
    Chosen {
        index: usize,
        score: f64,
        placement: Placement,
        alternatives: Vec<AlternativeTarget>,
        rejections: Vec<TargetRejection>,
    },
    NoTarget(Vec<TargetRejection>),
}

/// Filter, score and select a target for one VM against the running
/// projections.
fn choose_target(
    loads: &[NodeLoad],
    source_idx: usize,
    vm: &Vm,
    averages: Option<(f64, f64)>,
    constraints: &Constraints,
) -> Selection {
    let mut rejections = Vec::new();
    // (load index, score, within the evacuation bound)
    let mut scored: Vec<(usize, f64, bool)> = Vec::new();

    for (i, load) in loads.iter().enumerate() {
        if i == source_idx || load.excluded || !load.online {
            continue;
        }

        let mut reject = |reason| {
            rejections.push(TargetRejection {
                node: load.name.clone(),
                reason,
            })
        };

        let vm_disk = vm.storage_bytes();
        if load.free_ram() < vm.max_mem {
            reject(RejectReason::InsufficientRam);
            continue;
        }
        if load.free_disk() < vm_disk {
            reject(RejectReason::InsufficientStorage);
            continue;
        }
        if let Some(min) = constraints.min_free_ram_bytes {
            if load.free_ram() - vm.max_mem < min {
                reject(RejectReason::MinFreeRam);
                continue;
            }
        }
        if let Some(min) = constraints.min_free_cpu_percent {
            let projected = load.cpu_percent + load.cpu_delta_for(vm);
            if 100.0 - projected < min {
                reject(RejectReason::MinFreeCpu);
                continue;
            }
        }
        if let Some(limit) = constraints.max_vms_per_host {
            if load.vm_count >= limit {
                reject(RejectReason::VmLimitReached);
                continue;
            }
        }
        if !vm
            .constraints
            .affinity
            .iter()
            .all(|name| load.resident.contains(name))
        {
            reject(RejectReason::AffinityViolation);
            continue;
        }
        if vm
            .constraints
            .anti_affinity
            .iter()
            .any(|name| load.resident.contains(name))
        {
            reject(RejectReason::AffinityViolation);
            continue;
        }
        if let Some(model) = &vm.constraints.required_cpu_model {
            if !load
                .cpu_model
                .to_lowercase()
                .contains(&model.to_lowercase())
            {
                reject(RejectReason::CpuModelMismatch);
                continue;
            }
        }

        match averages {
            None => {
                let score = score::standard(
                    load.cpu_percent,
                    load.ram_percent(),
                    load.storage_percent(),
                );
                scored.push((i, score, true));
            }
            Some((avg_cpu, avg_ram)) => {
                let projected_cpu = load.cpu_percent + load.cpu_delta_for(vm);
                let projected_ram = load.ram_percent_with(vm.max_mem);
                let in_bounds = projected_cpu <= avg_cpu + EVACUATION_MARGIN
                    && projected_ram <= avg_ram + EVACUATION_MARGIN;
                let balance =
                    score::balance(projected_cpu, projected_ram, load.storage_percent());
                let score =
                    score::evacuation(balance, avg_cpu, avg_ram, projected_cpu, projected_ram);
                scored.push((i, score, in_bounds));
            }
        }
    }

    if scored.is_empty() {
        return Selection::NoTarget(rejections);
    }

    // Highest score first; ties broken by node name for determinism.
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| loads[a.0].name.cmp(&loads[b.0].name))
    });

    // Evacuation prefers the best in-bounds node; when none qualifies the
    // best capacity-valid node is taken and marked accordingly.
    let (chosen_pos, placement) = match averages {
        Some(_) => match scored.iter().position(|(_, _, in_bounds)| *in_bounds) {
            Some(pos) => (pos, Placement::Balanced),
            None => (0, Placement::BestAvailable),
        },
        None => (0, Placement::Balanced),
    };

    let (index, score, _) = scored[chosen_pos];
    let alternatives = scored
        .iter()
        .enumerate()
        .filter(|(pos, _)| *pos != chosen_pos)
        .take(MAX_ALTERNATIVES)
        .map(|(_, (i, s, _))| AlternativeTarget {
            node: loads[*i].name.clone(),
            score: *s,
        })
        .collect();

    Selection::Chosen {
        index,
        score,
        placement,
        alternatives,
        rejections,
    }
}

/// Produce an ordered assignment plan for draining the source node.
///
/// Zero candidates or zero valid targets are reportable outcomes, not
/// errors; only invalid input fails.
pub fn plan(
    cluster: &Cluster,
    source: &str,
    mode: Mode,
    target: Option<f64>,
    vmids: &[u32],
    constraints: &Constraints,
) -> Result<AnalysisResult, PlanError> {
    let source_node = cluster
        .node(source)
        .ok_or_else(|| PlanError::UnknownSourceNode(source.to_string()))?;

    if mode.requires_target() {
        let quantity = target.ok_or(PlanError::MissingTarget(mode))?;
        if !quantity.is_finite() || quantity <= 0.0 {
            return Err(PlanError::InvalidTarget(quantity));
        }
    }

    let candidates = select_candidates(source_node, mode, target, vmids)?;
    debug!(
        source,
        mode = ?mode,
        candidates = candidates.len(),
        "Candidate selection complete"
    );

    let excluded: HashSet<&str> = constraints
        .excluded_nodes
        .iter()
        .map(String::as_str)
        .collect();
    let mut loads: Vec<NodeLoad> = cluster
        .nodes
        .iter()
        .map(|n| NodeLoad::from_node(n, &excluded))
        .collect();
    let source_idx = loads
        .iter()
        .position(|l| l.name == source)
        .expect("source resolved above");

    let before: HashMap<String, NodeStateSnapshot> =
        loads.iter().map(|l| (l.name.clone(), l.snapshot())).collect();

    let averages = match mode {
        Mode::EvacuateAll => Some(cluster_averages(&loads, source)),
        _ => None,
    };

    let mut suggestions = Vec::new();
    let mut omitted = Vec::new();
    let mut moved = MovedTotals::default();

    for vm in &candidates {
        match choose_target(&loads, source_idx, vm, averages, constraints) {
            Selection::Chosen {
                index,
                score,
                placement,
                alternatives,
                rejections,
            } => {
                loads[index].apply(vm);
                loads[source_idx].remove(vm);

                moved.vms += 1;
                moved.vcpus += vm.cpus as u64;
                moved.ram_bytes += vm.max_mem;
                moved.storage_bytes += vm.storage_bytes();

                suggestions.push(MigrationSuggestion {
                    vmid: vm.vmid,
                    name: vm.name.clone(),
                    source: source.to_string(),
                    target: loads[index].name.clone(),
                    cpus: vm.cpus,
                    ram_bytes: vm.max_mem,
                    storage_bytes: vm.storage_bytes(),
                    state: vm.state,
                    cpu_percent: vm.cpu_percent,
                    score,
                    placement,
                    alternatives,
                    rejections,
                });
            }
            Selection::NoTarget(rejections) => {
                debug!(vmid = vm.vmid, "No valid migration target, omitting");
                omitted.push(OmittedVm {
                    vmid: vm.vmid,
                    name: vm.name.clone(),
                    rejections,
                });
            }
        }
    }

    let delta = |name: &str| -> NodeDelta {
        let load = loads.iter().find(|l| l.name == name).expect("known node");
        NodeDelta {
            node: name.to_string(),
            before: before[name].clone(),
            after: load.snapshot(),
        }
    };

    let receiving: BTreeSet<&str> = suggestions.iter().map(|s| s.target.as_str()).collect();
    let source_delta = delta(source);
    let target_deltas: Vec<NodeDelta> = receiving.into_iter().map(&delta).collect();

    Ok(AnalysisResult {
        suggestions,
        omitted,
        source: source_delta,
        targets: target_deltas,
        moved,
    })
}
