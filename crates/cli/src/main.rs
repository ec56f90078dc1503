//! vmdrain CLI
//!
//! A command-line tool that collects a utilization snapshot from a
//! hypervisor cluster and recommends a migration plan that drains load
//! off a chosen source node. It never performs migrations itself.

mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vmdrain_lib::api::{HttpApi, HttpApiConfig, ShellApi};
use vmdrain_lib::engine::Mode;
use vmdrain_lib::{ClusterApi, DiskUsageCache};

/// Migration planner for hypervisor clusters
#[derive(Parser)]
#[command(name = "vmdrain")]
#[command(author, version, about = "Drain planner for hypervisor clusters", long_about = None)]
pub struct Cli {
    /// Cluster API endpoint (can also be set via VMDRAIN_ENDPOINT)
    #[arg(long, env = "VMDRAIN_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Use the local management CLI instead of the HTTP API
    #[arg(long)]
    pub shell: bool,

    /// Skip TLS certificate verification
    #[arg(long)]
    pub insecure: bool,

    /// Path to a configuration file
    #[arg(long, env = "VMDRAIN_CONFIG")]
    pub config: Option<String>,

    /// Disk usage cache file (overrides the configured path)
    #[arg(long, env = "VMDRAIN_CACHE_FILE")]
    pub cache_file: Option<String>,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    /// Enable verbose output
    #[arg(long, short)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Compute a migration plan away from a source node
    Plan {
        /// Source node to drain
        source: String,

        /// What the target quantity measures
        #[arg(long, value_enum, default_value = "vm-count")]
        mode: PlanMode,

        /// Target quantity: a count, vCPUs, CPU percent, or bytes with an
        /// optional K/M/G/T suffix depending on the mode
        #[arg(long)]
        target: Option<String>,

        /// Explicit VM ids for --mode specific-vms
        #[arg(long, value_delimiter = ',')]
        vms: Vec<u32>,

        /// Node excluded as a migration target (repeatable)
        #[arg(long = "exclude")]
        excluded: Vec<String>,

        /// Cap on resident VMs per target node
        #[arg(long)]
        max_vms: Option<usize>,

        /// Minimum free RAM a target must retain (bytes, K/M/G/T suffix)
        #[arg(long)]
        min_free_ram: Option<String>,

        /// Minimum free CPU percentage a target must retain
        #[arg(long)]
        min_free_cpu: Option<f64>,
    },

    /// Collect and show the cluster inventory
    Status,

    /// Probe connectivity and authentication
    Check,

    /// Disk usage cache maintenance
    #[command(subcommand)]
    Cache(CacheCommands),
}

#[derive(Subcommand)]
pub enum CacheCommands {
    /// Drop expired entries
    Cleanup,
    /// Show cache statistics
    Stats,
}

/// CLI-facing spelling of the planning modes
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum PlanMode {
    VmCount,
    Vcpu,
    CpuPercent,
    Ram,
    Storage,
    SpecificVms,
    EvacuateAll,
}

impl From<PlanMode> for Mode {
    fn from(mode: PlanMode) -> Self {
        match mode {
            PlanMode::VmCount => Mode::VmCount,
            PlanMode::Vcpu => Mode::Vcpu,
            PlanMode::CpuPercent => Mode::CpuPercent,
            PlanMode::Ram => Mode::Ram,
            PlanMode::Storage => Mode::Storage,
            PlanMode::SpecificVms => Mode::SpecificVms,
            PlanMode::EvacuateAll => Mode::EvacuateAll,
        }
    }
}

fn build_api(cli: &Cli, config: &config::CliConfig) -> Result<Arc<dyn ClusterApi>> {
    if cli.shell {
        return Ok(Arc::new(ShellApi::new()));
    }
    let api = HttpApi::new(HttpApiConfig {
        base_url: cli
            .endpoint
            .clone()
            .unwrap_or_else(|| config.endpoint.clone()),
        user: config.user.clone(),
        password: config.password.clone(),
        token_id: config.token_id.clone(),
        token_secret: config.token_secret.clone(),
        insecure: cli.insecure || config.insecure,
        ..Default::default()
    })?;
    Ok(Arc::new(api))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = config::CliConfig::load(cli.config.as_deref())?;
    let api = build_api(&cli, &config)?;
    let cache_path = cli.cache_file.as_deref().unwrap_or(&config.cache_path);
    let cache = Arc::new(DiskUsageCache::open(cache_path));

    match &cli.command {
        Commands::Plan {
            source,
            mode,
            target,
            vms,
            excluded,
            max_vms,
            min_free_ram,
            min_free_cpu,
        } => {
            let request = commands::plan::PlanRequest {
                source: source.clone(),
                mode: (*mode).into(),
                target: target.clone(),
                vmids: vms.clone(),
                excluded_nodes: excluded.clone(),
                max_vms_per_host: *max_vms,
                min_free_ram: min_free_ram.clone(),
                min_free_cpu_percent: *min_free_cpu,
            };
            commands::plan::run(api, cache, &config, request, cli.format).await?;
        }
        Commands::Status => {
            commands::status::run(api, cache, &config, cli.format).await?;
        }
        Commands::Check => {
            commands::check::run(api).await?;
        }
        Commands::Cache(cache_cmd) => match cache_cmd {
            CacheCommands::Cleanup => commands::cache::cleanup(&cache),
            CacheCommands::Stats => commands::cache::stats(&cache),
        },
    }

    Ok(())
}
