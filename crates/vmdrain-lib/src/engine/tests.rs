//! Placement engine tests

use super::*;
use crate::models::{Cluster, ClusterTotals, GuestKind, Node, PowerState, Vm};

const GIB: u64 = 1 << 30;

fn vm(vmid: u32, name: &str, node: &str, cpus: u32, ram_gib: u64) -> Vm {
    Vm {
        vmid,
        name: name.to_string(),
        node: node.to_string(),
        state: PowerState::Running,
        kind: GuestKind::Qemu,
        cpus,
        cpu_percent: 10.0,
        max_mem: ram_gib * GIB,
        used_mem: ram_gib * GIB / 2,
        max_disk: 10 * GIB,
        used_disk: 5 * GIB,
        uptime: 3_600,
        created_at: None,
        constraints: Default::default(),
    }
}

fn node(name: &str, cpu: f64, ram_total_gib: u64, ram_used_gib: u64, vms: Vec<Vm>) -> Node {
    Node {
        name: name.to_string(),
        online: true,
        cpu_count: 32,
        cpu_model: "AMD EPYC 7543".to_string(),
        sockets: 2,
        mhz: 2_800.0,
        cpu_usage: cpu,
        loadavg: [0.0; 3],
        max_mem: ram_total_gib * GIB,
        used_mem: ram_used_gib * GIB,
        max_disk: 1_000 * GIB,
        used_disk: 100 * GIB,
        swap_total: 0,
        swap_used: 0,
        uptime: 86_400,
        version: String::new(),
        allow_provision: false,
        has_osd_workload: false,
        has_aged_vms: false,
        vms,
    }
}

fn cluster(nodes: Vec<Node>) -> Cluster {
    Cluster {
        nodes,
        totals: ClusterTotals::default(),
    }
}

fn suggested_vmids(result: &AnalysisResult) -> Vec<u32> {
    result.suggestions.iter().map(|s| s.vmid).collect()
}

#[test]
fn vcpu_target_includes_the_crossing_vm_in_full() {
    // kv01 hosts VMs with 2/4/8 vCPUs; target 5 vCPUs selects the 2- and
    // 4-vCPU VMs (cumulative 6 >= 5) and excludes the 8-vCPU one.
    let source = node(
        "kv01",
        0.5,
        256,
        128,
        vec![
            vm(101, "small", "kv01", 2, 4),
            vm(102, "medium", "kv01", 4, 8),
            vm(103, "large", "kv01", 8, 16),
        ],
    );
    let cluster = cluster(vec![source, node("kv02", 0.1, 256, 32, vec![])]);

    let result = plan(
        &cluster,
        "kv01",
        Mode::Vcpu,
        Some(5.0),
        &[],
        &Constraints::default(),
    )
    .unwrap();

    assert_eq!(suggested_vmids(&result), vec![101, 102]);
    assert_eq!(result.moved.vcpus, 6);
}

#[test]
fn ram_accumulation_never_overshoots_by_more_than_one_vm() {
    // Used RAM figures 1/2/3/4 GiB ascending; target 4 GiB.
    let source = node(
        "kv01",
        0.5,
        256,
        128,
        vec![
            vm(101, "a", "kv01", 2, 2),
            vm(102, "b", "kv01", 2, 4),
            vm(103, "c", "kv01", 2, 6),
            vm(104, "d", "kv01", 2, 8),
        ],
    );
    let cluster = cluster(vec![source, node("kv02", 0.1, 256, 32, vec![])]);

    let target_bytes = 4 * GIB;
    let result = plan(
        &cluster,
        "kv01",
        Mode::Ram,
        Some(target_bytes as f64),
        &[],
        &Constraints::default(),
    )
    .unwrap();

    assert_eq!(suggested_vmids(&result), vec![101, 102, 103]);

    // Boundary correctness: the selection meets the target, and dropping
    // the last accumulated VM would fall below it.
    let used: Vec<u64> = [1, 2, 3].iter().map(|g| g * GIB).collect();
    let total: u64 = used.iter().sum();
    assert!(total >= target_bytes);
    assert!(total - used.last().unwrap() < target_bytes);
}

#[test]
fn pinned_vms_are_never_candidates() {
    let mut pinned = vm(101, "pinned", "kv01", 2, 4);
    pinned.constraints.no_migrate = true;
    let source = node("kv01", 0.5, 256, 128, vec![pinned, vm(102, "free", "kv01", 2, 4)]);
    let cluster = cluster(vec![source, node("kv02", 0.1, 256, 32, vec![])]);

    for (mode, target) in [
        (Mode::VmCount, Some(10.0)),
        (Mode::Vcpu, Some(100.0)),
        (Mode::Ram, Some(1e15)),
        (Mode::EvacuateAll, None),
    ] {
        let result = plan(&cluster, "kv01", mode, target, &[], &Constraints::default()).unwrap();
        assert_eq!(suggested_vmids(&result), vec![102], "mode {mode:?}");
    }
}

#[test]
fn explicit_request_of_pinned_vm_is_rejected_not_dropped() {
    let mut pinned = vm(101, "pinned", "kv01", 2, 4);
    pinned.constraints.no_migrate = true;
    let source = node("kv01", 0.5, 256, 128, vec![pinned]);
    let cluster = cluster(vec![source, node("kv02", 0.1, 256, 32, vec![])]);

    let result = plan(
        &cluster,
        "kv01",
        Mode::SpecificVms,
        None,
        &[101],
        &Constraints::default(),
    );
    assert!(matches!(result, Err(PlanError::VmPinned(101))));
}

#[test]
fn specific_vm_must_be_resident_on_source() {
    let cluster = cluster(vec![
        node("kv01", 0.5, 256, 128, vec![vm(101, "a", "kv01", 2, 4)]),
        node("kv02", 0.1, 256, 32, vec![vm(200, "b", "kv02", 2, 4)]),
    ]);

    let result = plan(
        &cluster,
        "kv01",
        Mode::SpecificVms,
        None,
        &[200],
        &Constraints::default(),
    );
    assert!(matches!(result, Err(PlanError::VmNotOnSource(200))));
}

#[test]
fn input_validation_errors() {
    let cluster = cluster(vec![node("kv01", 0.5, 256, 128, vec![])]);

    assert!(matches!(
        plan(&cluster, "kv99", Mode::VmCount, Some(1.0), &[], &Constraints::default()),
        Err(PlanError::UnknownSourceNode(_))
    ));
    assert!(matches!(
        plan(&cluster, "kv01", Mode::Ram, None, &[], &Constraints::default()),
        Err(PlanError::MissingTarget(Mode::Ram))
    ));
    assert!(matches!(
        plan(&cluster, "kv01", Mode::Vcpu, Some(-3.0), &[], &Constraints::default()),
        Err(PlanError::InvalidTarget(_))
    ));
    assert!(matches!(
        plan(&cluster, "kv01", Mode::SpecificVms, None, &[], &Constraints::default()),
        Err(PlanError::EmptyVmSelection)
    ));
}

#[test]
fn empty_candidate_set_is_an_empty_plan() {
    let cluster = cluster(vec![
        node("kv01", 0.5, 256, 128, vec![]),
        node("kv02", 0.1, 256, 32, vec![]),
    ]);

    let result = plan(
        &cluster,
        "kv01",
        Mode::EvacuateAll,
        None,
        &[],
        &Constraints::default(),
    )
    .unwrap();
    assert!(result.suggestions.is_empty());
    assert!(result.omitted.is_empty());
    assert!(result.targets.is_empty());
}

#[test]
fn ram_filtering_is_monotonic() {
    // The only target has 3 GiB free; a 4 GiB VM is rejected, so the
    // 8 GiB VM must be rejected too.
    let source = node(
        "kv01",
        0.5,
        256,
        128,
        vec![vm(101, "small", "kv01", 2, 4), vm(102, "large", "kv01", 2, 8)],
    );
    let cluster = cluster(vec![source, node("kv02", 0.1, 100, 97, vec![])]);

    let result = plan(
        &cluster,
        "kv01",
        Mode::SpecificVms,
        None,
        &[101, 102],
        &Constraints::default(),
    )
    .unwrap();

    assert!(result.suggestions.is_empty());
    assert_eq!(result.omitted.len(), 2);
    for omitted in &result.omitted {
        assert_eq!(omitted.rejections.len(), 1);
        assert_eq!(omitted.rejections[0].node, "kv02");
        assert_eq!(omitted.rejections[0].reason, RejectReason::InsufficientRam);
    }
}

#[test]
fn evacuation_keeps_targets_within_the_balance_margin() {
    // Four 2 GiB VMs spread over two targets at 30% RAM: each target can
    // absorb two VMs while staying under average + 5 points.
    let source = node(
        "kv01",
        0.5,
        100,
        50,
        vec![
            vm(101, "a", "kv01", 2, 2),
            vm(102, "b", "kv01", 2, 2),
            vm(103, "c", "kv01", 2, 2),
            vm(104, "d", "kv01", 2, 2),
        ],
    );
    let cluster = cluster(vec![
        source,
        node("kv02", 0.30, 100, 30, vec![]),
        node("kv03", 0.30, 100, 30, vec![]),
    ]);

    let result = plan(
        &cluster,
        "kv01",
        Mode::EvacuateAll,
        None,
        &[],
        &Constraints::default(),
    )
    .unwrap();

    assert_eq!(result.suggestions.len(), 4);
    assert!(result
        .suggestions
        .iter()
        .all(|s| s.placement == Placement::Balanced));

    // avg RAM = 30%, margin 5: every receiving node ends at or below 35%.
    for delta in &result.targets {
        assert!(delta.after.ram_percent <= 35.0 + 1e-9, "{delta:?}");
        assert!(delta.after.cpu_percent <= 35.0 + 1e-9, "{delta:?}");
    }
    // Round-robin effect of the running projections.
    assert_eq!(result.targets.len(), 2);
    assert!(result.targets.iter().all(|d| d.after.vm_count == 2));
}

#[test]
fn evacuation_falls_back_to_best_available_when_no_node_is_in_bounds() {
    // Both targets sit at 60% RAM; a 20 GiB VM pushes either to 80%,
    // far over average + 5, but capacity still fits.
    let source = node("kv01", 0.5, 100, 50, vec![vm(101, "big", "kv01", 2, 20)]);
    let cluster = cluster(vec![
        source,
        node("kv02", 0.30, 100, 60, vec![]),
        node("kv03", 0.30, 100, 60, vec![]),
    ]);

    let result = plan(
        &cluster,
        "kv01",
        Mode::EvacuateAll,
        None,
        &[],
        &Constraints::default(),
    )
    .unwrap();

    assert_eq!(result.suggestions.len(), 1);
    let suggestion = &result.suggestions[0];
    assert_eq!(suggestion.placement, Placement::BestAvailable);
    // Equal scores resolve by node name.
    assert_eq!(suggestion.target, "kv02");
    assert!(result.omitted.is_empty());
}

#[test]
fn equal_scores_break_ties_by_node_name() {
    let source = node("kv01", 0.5, 256, 128, vec![vm(101, "a", "kv01", 2, 4)]);
    let cluster = cluster(vec![
        source,
        node("kv03", 0.10, 256, 32, vec![]),
        node("kv02", 0.10, 256, 32, vec![]),
    ]);

    let result = plan(
        &cluster,
        "kv01",
        Mode::VmCount,
        Some(1.0),
        &[],
        &Constraints::default(),
    )
    .unwrap();

    assert_eq!(result.suggestions[0].target, "kv02");
    assert_eq!(result.suggestions[0].alternatives.len(), 1);
    assert_eq!(result.suggestions[0].alternatives[0].node, "kv03");
}

#[test]
fn earlier_assignments_shift_later_scoring() {
    // Two identical VMs and two identical targets: the second VM must land
    // on the other node because the first assignment raised kv02's load.
    let source = node(
        "kv01",
        0.5,
        256,
        128,
        vec![vm(101, "a", "kv01", 4, 32), vm(102, "b", "kv01", 4, 32)],
    );
    let cluster = cluster(vec![
        source,
        node("kv02", 0.10, 256, 32, vec![]),
        node("kv03", 0.10, 256, 32, vec![]),
    ]);

    let result = plan(
        &cluster,
        "kv01",
        Mode::VmCount,
        Some(2.0),
        &[],
        &Constraints::default(),
    )
    .unwrap();

    let targets: Vec<&str> = result.suggestions.iter().map(|s| s.target.as_str()).collect();
    assert_eq!(targets, vec!["kv02", "kv03"]);
}

#[test]
fn affinity_restricts_targets_to_colocated_nodes() {
    let mut constrained = vm(101, "web1", "kv01", 2, 4);
    constrained.constraints.affinity = vec!["db1".to_string()];

    let source = node("kv01", 0.5, 256, 128, vec![constrained]);
    let cluster = cluster(vec![
        source,
        // Better score, but no db1 resident.
        node("kv02", 0.05, 256, 16, vec![]),
        node("kv03", 0.40, 256, 128, vec![vm(300, "db1", "kv03", 4, 16)]),
    ]);

    let result = plan(
        &cluster,
        "kv01",
        Mode::VmCount,
        Some(1.0),
        &[],
        &Constraints::default(),
    )
    .unwrap();

    let suggestion = &result.suggestions[0];
    assert_eq!(suggestion.target, "kv03");
    assert!(suggestion
        .rejections
        .iter()
        .any(|r| r.node == "kv02" && r.reason == RejectReason::AffinityViolation));
}

#[test]
fn anti_affinity_blocks_nodes_hosting_the_named_vm() {
    let mut constrained = vm(101, "web1", "kv01", 2, 4);
    constrained.constraints.anti_affinity = vec!["web2".to_string()];

    let source = node("kv01", 0.5, 256, 128, vec![constrained]);
    let cluster = cluster(vec![
        source,
        node("kv02", 0.05, 256, 16, vec![vm(200, "web2", "kv02", 2, 4)]),
        node("kv03", 0.40, 256, 128, vec![]),
    ]);

    let result = plan(
        &cluster,
        "kv01",
        Mode::VmCount,
        Some(1.0),
        &[],
        &Constraints::default(),
    )
    .unwrap();
    assert_eq!(result.suggestions[0].target, "kv03");
}

#[test]
fn required_cpu_model_is_a_substring_match() {
    let mut constrained = vm(101, "web1", "kv01", 2, 4);
    constrained.constraints.required_cpu_model = Some("EPYC".to_string());

    let source = node("kv01", 0.5, 256, 128, vec![constrained]);
    let mut intel = node("kv02", 0.05, 256, 16, vec![]);
    intel.cpu_model = "Intel Xeon Gold 6338".to_string();
    let cluster = cluster(vec![source, intel, node("kv03", 0.40, 256, 128, vec![])]);

    let result = plan(
        &cluster,
        "kv01",
        Mode::VmCount,
        Some(1.0),
        &[],
        &Constraints::default(),
    )
    .unwrap();

    let suggestion = &result.suggestions[0];
    assert_eq!(suggestion.target, "kv03");
    assert!(suggestion
        .rejections
        .iter()
        .any(|r| r.node == "kv02" && r.reason == RejectReason::CpuModelMismatch));
}

#[test]
fn max_vms_per_host_caps_targets() {
    let source = node("kv01", 0.5, 256, 128, vec![vm(101, "a", "kv01", 2, 4)]);
    let full = node("kv02", 0.05, 256, 16, vec![vm(200, "x", "kv02", 1, 1)]);
    let cluster = cluster(vec![source, full, node("kv03", 0.40, 256, 128, vec![])]);

    let constraints = Constraints {
        max_vms_per_host: Some(1),
        ..Default::default()
    };
    let result = plan(&cluster, "kv01", Mode::VmCount, Some(1.0), &[], &constraints).unwrap();

    let suggestion = &result.suggestions[0];
    assert_eq!(suggestion.target, "kv03");
    assert!(suggestion
        .rejections
        .iter()
        .any(|r| r.node == "kv02" && r.reason == RejectReason::VmLimitReached));
}

#[test]
fn min_free_ram_and_cpu_constraints_reject_targets() {
    let source = node("kv01", 0.5, 256, 128, vec![vm(101, "a", "kv01", 2, 8)]);
    // 20 GiB free: fits the 8 GiB VM but leaves only 12 GiB behind.
    let tight_ram = node("kv02", 0.10, 100, 80, vec![]);
    // Plenty of RAM but almost no CPU headroom.
    let tight_cpu = node("kv03", 0.92, 256, 32, vec![]);
    let cluster = cluster(vec![source, tight_ram, tight_cpu]);

    let constraints = Constraints {
        min_free_ram_bytes: Some(16 * GIB),
        min_free_cpu_percent: Some(15.0),
        ..Default::default()
    };
    let result = plan(&cluster, "kv01", Mode::VmCount, Some(1.0), &[], &constraints).unwrap();

    assert!(result.suggestions.is_empty());
    let rejections = &result.omitted[0].rejections;
    assert!(rejections
        .iter()
        .any(|r| r.node == "kv02" && r.reason == RejectReason::MinFreeRam));
    assert!(rejections
        .iter()
        .any(|r| r.node == "kv03" && r.reason == RejectReason::MinFreeCpu));
}

#[test]
fn excluded_and_offline_nodes_are_skipped_silently() {
    let source = node("kv01", 0.5, 256, 128, vec![vm(101, "a", "kv01", 2, 4)]);
    let mut offline = node("kv02", 0.05, 256, 16, vec![]);
    offline.online = false;
    let excluded = node("kv03", 0.05, 256, 16, vec![]);
    let cluster = cluster(vec![source, offline, excluded]);

    let constraints = Constraints {
        excluded_nodes: vec!["kv03".to_string()],
        ..Default::default()
    };
    let result = plan(&cluster, "kv01", Mode::VmCount, Some(1.0), &[], &constraints).unwrap();

    assert!(result.suggestions.is_empty());
    assert_eq!(result.omitted.len(), 1);
    // Neither node gets a recorded rejection reason.
    assert!(result.omitted[0].rejections.is_empty());
}

#[test]
fn before_after_deltas_track_the_moves() {
    let source = node(
        "kv01",
        0.5,
        256,
        128,
        vec![vm(101, "a", "kv01", 4, 8), vm(102, "b", "kv01", 2, 4)],
    );
    let cluster = cluster(vec![source, node("kv02", 0.1, 256, 32, vec![])]);

    let result = plan(
        &cluster,
        "kv01",
        Mode::EvacuateAll,
        None,
        &[],
        &Constraints::default(),
    )
    .unwrap();

    assert_eq!(result.source.before.vm_count, 2);
    assert_eq!(result.source.after.vm_count, 0);
    assert_eq!(result.source.after.vcpus, 0);

    assert_eq!(result.targets.len(), 1);
    let target = &result.targets[0];
    assert_eq!(target.node, "kv02");
    assert_eq!(target.before.vm_count, 0);
    assert_eq!(target.after.vm_count, 2);
    assert!(target.after.ram_percent > target.before.ram_percent);

    assert_eq!(result.moved.vms, 2);
    assert_eq!(result.moved.vcpus, 6);
    assert_eq!(result.moved.ram_bytes, 12 * GIB);
}

#[test]
fn alternatives_are_capped_at_three() {
    let source = node("kv01", 0.5, 256, 128, vec![vm(101, "a", "kv01", 2, 4)]);
    let cluster = cluster(vec![
        source,
        node("kv02", 0.10, 256, 32, vec![]),
        node("kv03", 0.15, 256, 32, vec![]),
        node("kv04", 0.20, 256, 32, vec![]),
        node("kv05", 0.25, 256, 32, vec![]),
        node("kv06", 0.30, 256, 32, vec![]),
    ]);

    let result = plan(
        &cluster,
        "kv01",
        Mode::VmCount,
        Some(1.0),
        &[],
        &Constraints::default(),
    )
    .unwrap();

    assert_eq!(result.suggestions[0].alternatives.len(), 3);
    // Ordered by descending score.
    let scores: Vec<f64> = result.suggestions[0]
        .alternatives
        .iter()
        .map(|a| a.score)
        .collect();
    assert!(scores.windows(2).all(|w| w[0] >= w[1]));
}

#[test]
fn vm_count_mode_moves_lightest_impact_first() {
    let source = node(
        "kv01",
        0.5,
        256,
        128,
        vec![vm(101, "heavy", "kv01", 16, 64), vm(102, "light", "kv01", 1, 2)],
    );
    let cluster = cluster(vec![source, node("kv02", 0.1, 256, 32, vec![])]);

    let result = plan(
        &cluster,
        "kv01",
        Mode::VmCount,
        Some(1.0),
        &[],
        &Constraints::default(),
    )
    .unwrap();
    assert_eq!(suggested_vmids(&result), vec![102]);
}
