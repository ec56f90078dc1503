//! Plan command: collect a snapshot and compute a migration plan

use crate::config::CliConfig;
use crate::output::{self, OutputFormat};
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::sync::Arc;
use tabled::Tabled;
use vmdrain_lib::collector::{Collector, CollectorOptions};
use vmdrain_lib::engine::{self, AnalysisResult, Constraints, Mode, NodeDelta, Placement};
use vmdrain_lib::{ClusterApi, DiskUsageCache};

/// Parsed-but-unvalidated plan parameters from the command line
pub struct PlanRequest {
    pub source: String,
    pub mode: Mode,
    pub target: Option<String>,
    pub vmids: Vec<u32>,
    pub excluded_nodes: Vec<String>,
    pub max_vms_per_host: Option<usize>,
    pub min_free_ram: Option<String>,
    pub min_free_cpu_percent: Option<f64>,
}

/// Interpret the target string per mode: byte sizes for RAM and storage,
/// plain numbers everywhere else.
fn parse_target(mode: Mode, raw: Option<&str>) -> Result<Option<f64>> {
    let Some(raw) = raw else { return Ok(None) };
    let value = match mode {
        Mode::Ram | Mode::Storage => output::parse_bytes(raw)? as f64,
        _ => raw
            .parse::<f64>()
            .with_context(|| format!("invalid target quantity: {raw}"))?,
    };
    Ok(Some(value))
}

#[derive(Tabled, Serialize)]
struct SuggestionRow {
    #[tabled(rename = "VMID")]
    vmid: u32,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Target")]
    target: String,
    #[tabled(rename = "vCPUs")]
    cpus: u32,
    #[tabled(rename = "RAM")]
    ram: String,
    #[tabled(rename = "Storage")]
    storage: String,
    #[tabled(rename = "Score")]
    score: String,
    #[tabled(rename = "Placement")]
    placement: String,
}

#[derive(Tabled, Serialize)]
struct DeltaRow {
    #[tabled(rename = "Node")]
    node: String,
    #[tabled(rename = "VMs")]
    vms: String,
    #[tabled(rename = "vCPUs")]
    vcpus: String,
    #[tabled(rename = "CPU")]
    cpu: String,
    #[tabled(rename = "RAM")]
    ram: String,
    #[tabled(rename = "Storage used")]
    storage: String,
}

fn delta_row(delta: &NodeDelta) -> DeltaRow {
    DeltaRow {
        node: delta.node.clone(),
        vms: format!("{} → {}", delta.before.vm_count, delta.after.vm_count),
        vcpus: format!("{} → {}", delta.before.vcpus, delta.after.vcpus),
        cpu: format!(
            "{} → {}",
            output::format_percent(delta.before.cpu_percent),
            output::format_percent(delta.after.cpu_percent)
        ),
        ram: format!(
            "{} → {}",
            output::format_percent(delta.before.ram_percent),
            output::format_percent(delta.after.ram_percent)
        ),
        storage: format!(
            "{} → {}",
            output::format_bytes(delta.before.disk_used),
            output::format_bytes(delta.after.disk_used)
        ),
    }
}

pub async fn run(
    api: Arc<dyn ClusterApi>,
    cache: Arc<DiskUsageCache>,
    config: &CliConfig,
    request: PlanRequest,
    format: OutputFormat,
) -> Result<()> {
    // Input validation happens before any collection work starts.
    let target = parse_target(request.mode, request.target.as_deref())?;
    if matches!(request.mode, Mode::SpecificVms) && request.vmids.is_empty() {
        bail!("--mode specific-vms requires --vms");
    }
    let constraints = Constraints {
        excluded_nodes: request.excluded_nodes,
        max_vms_per_host: request.max_vms_per_host,
        min_free_ram_bytes: request
            .min_free_ram
            .as_deref()
            .map(output::parse_bytes)
            .transpose()?,
        min_free_cpu_percent: request.min_free_cpu_percent,
    };

    api.login().await.context("authentication failed")?;
    let collector = Collector::new(
        api,
        cache,
        CollectorOptions {
            workers: config.workers,
            ..Default::default()
        },
    );
    let cluster = collector.collect(&output::report_progress).await?;

    let result = engine::plan(
        &cluster,
        &request.source,
        request.mode,
        target,
        &request.vmids,
        &constraints,
    )?;
    render(&result, format);
    Ok(())
}

fn render(result: &AnalysisResult, format: OutputFormat) {
    if matches!(format, OutputFormat::Json) {
        if let Ok(json) = serde_json::to_string_pretty(result) {
            println!("{}", json);
        }
        return;
    }

    if result.suggestions.is_empty() {
        output::print_warning("no migration suggestions");
    } else {
        let rows: Vec<SuggestionRow> = result
            .suggestions
            .iter()
            .map(|s| SuggestionRow {
                vmid: s.vmid,
                name: s.name.clone(),
                target: s.target.clone(),
                cpus: s.cpus,
                ram: output::format_bytes(s.ram_bytes),
                storage: output::format_bytes(s.storage_bytes),
                score: format!("{:.1}", s.score),
                placement: match s.placement {
                    Placement::Balanced => "balanced".to_string(),
                    Placement::BestAvailable => "best-available".to_string(),
                },
            })
            .collect();
        output::print_table(&rows, OutputFormat::Table);
    }

    for omitted in &result.omitted {
        let reasons: Vec<String> = omitted
            .rejections
            .iter()
            .map(|r| format!("{} ({})", r.node, r.reason))
            .collect();
        let reasons = if reasons.is_empty() {
            "no eligible target nodes".to_string()
        } else {
            reasons.join(", ")
        };
        output::print_warning(&format!(
            "VM {} ({}) has no valid target: {}",
            omitted.vmid, omitted.name, reasons
        ));
    }

    let mut deltas = vec![delta_row(&result.source)];
    deltas.extend(result.targets.iter().map(delta_row));
    println!();
    output::print_table(&deltas, OutputFormat::Table);

    println!(
        "would move {} VMs, {} vCPUs, {} RAM, {} storage",
        result.moved.vms,
        result.moved.vcpus,
        output::format_bytes(result.moved.ram_bytes),
        output::format_bytes(result.moved.storage_bytes),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_parsing_follows_the_mode() {
        assert_eq!(parse_target(Mode::Vcpu, Some("5")).unwrap(), Some(5.0));
        assert_eq!(
            parse_target(Mode::Ram, Some("16G")).unwrap(),
            Some((16u64 << 30) as f64)
        );
        assert_eq!(
            parse_target(Mode::CpuPercent, Some("12.5")).unwrap(),
            Some(12.5)
        );
        assert_eq!(parse_target(Mode::EvacuateAll, None).unwrap(), None);
        assert!(parse_target(Mode::Vcpu, Some("five")).is_err());
    }
}
