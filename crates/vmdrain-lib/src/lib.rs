//! Core library for the vmdrain cluster drain planner
//!
//! This crate provides the core functionality for:
//! - Transport-agnostic cluster API access (HTTP or local shell)
//! - Bounded-concurrency inventory collection into a cluster snapshot
//! - Persistent caching of per-VM disk usage
//! - Greedy migration placement planning with evacuation support

pub mod api;
pub mod cache;
pub mod collector;
pub mod engine;
pub mod models;

pub use api::{ApiError, ClusterApi};
pub use cache::{CacheStats, DiskUsageCache};
pub use collector::{Collector, CollectorOptions, ProgressFn};
pub use engine::{plan, AnalysisResult, Constraints, Mode, PlanError};
pub use models::*;
