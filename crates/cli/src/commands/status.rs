//! Cluster inventory display

use crate::config::CliConfig;
use crate::output::{self, OutputFormat};
use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;
use tabled::Tabled;
use vmdrain_lib::collector::{Collector, CollectorOptions};
use vmdrain_lib::{ClusterApi, DiskUsageCache};

#[derive(Tabled, Serialize)]
struct NodeRow {
    #[tabled(rename = "Node")]
    name: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "VMs")]
    vms: usize,
    #[tabled(rename = "vCPUs")]
    vcpus: u64,
    #[tabled(rename = "CPU")]
    cpu: String,
    #[tabled(rename = "RAM")]
    ram: String,
    #[tabled(rename = "Storage")]
    storage: String,
    #[tabled(rename = "CPU model")]
    cpu_model: String,
}

pub async fn run(
    api: Arc<dyn ClusterApi>,
    cache: Arc<DiskUsageCache>,
    config: &CliConfig,
    format: OutputFormat,
) -> Result<()> {
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

    let rows: Vec<NodeRow> = cluster
        .nodes
        .iter()
        .map(|node| NodeRow {
            name: node.name.clone(),
            state: output::color_state(if node.online { "online" } else { "offline" }),
            vms: node.vms.len(),
            vcpus: node.vms.iter().map(|v| v.cpus as u64).sum(),
            cpu: output::format_percent(node.cpu_percent()),
            ram: output::format_percent(node.ram_percent()),
            storage: output::format_percent(node.storage_percent()),
            cpu_model: node.cpu_model.clone(),
        })
        .collect();
    output::print_table(&rows, format);

    if matches!(format, OutputFormat::Table) {
        let totals = &cluster.totals;
        println!(
            "{} VMs ({} running, {} stopped), {} vCPUs on {} threads, {} / {} storage used",
            totals.vm_count,
            totals.running,
            totals.stopped,
            totals.total_vcpus,
            totals.total_threads,
            output::format_bytes(totals.used_disk),
            output::format_bytes(totals.total_disk),
        );
    }
    Ok(())
}
