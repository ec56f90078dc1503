//! Connectivity probe

use crate::output;
use anyhow::{Context, Result};
use std::sync::Arc;
use vmdrain_lib::ClusterApi;

pub async fn run(api: Arc<dyn ClusterApi>) -> Result<()> {
    api.ping().await.context("cluster unreachable")?;
    output::print_success("cluster reachable");

    api.login().await.context("authentication failed")?;
    output::print_success("authentication ok");
    Ok(())
}
