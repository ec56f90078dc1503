//! CLI configuration
//!
//! Settings come from an optional TOML file with `VMDRAIN_`-prefixed
//! environment variables layered on top; command-line flags override both.

use anyhow::{Context, Result};
use serde::Deserialize;
use vmdrain_lib::collector::DEFAULT_WORKERS;

/// Planner configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CliConfig {
    /// Base URL of the cluster API
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Username including realm, e.g. `planner@pam`
    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// API token id; together with `token_secret` replaces password auth
    #[serde(default)]
    pub token_id: Option<String>,

    #[serde(default)]
    pub token_secret: Option<String>,

    /// Skip TLS certificate verification
    #[serde(default)]
    pub insecure: bool,

    /// Disk usage cache file
    #[serde(default = "default_cache_path")]
    pub cache_path: String,

    /// Cap on concurrent in-flight requests per collection stage
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_endpoint() -> String {
    "https://localhost:8006/api2/json/".to_string()
}

fn default_cache_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    format!("{home}/.cache/vmdrain/disk-usage.json")
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            user: None,
            password: None,
            token_id: None,
            token_secret: None,
            insecure: false,
            cache_path: default_cache_path(),
            workers: default_workers(),
        }
    }
}

impl CliConfig {
    /// Load configuration from the given file (if any) and the environment
    pub fn load(file: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(file) = file {
            builder = builder.add_source(config::File::with_name(file));
        }
        let config = builder
            .add_source(config::Environment::with_prefix("VMDRAIN"))
            .build()
            .context("failed to read configuration")?;

        Ok(config.try_deserialize().unwrap_or_default())
    }
}
