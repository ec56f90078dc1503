//! Persistent cache of per-VM disk usage
//!
//! Enumerating storage volume contents is the most expensive remote call
//! the collector makes, so last-known figures are kept in a JSON file with
//! a freshness window. The cache is a pure optimization: every failure
//! degrades to a live fetch and is never surfaced to the caller.

use crate::models::{DiskCacheEntry, Vm};
use chrono::{Duration, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Entries older than this are expired
pub const CACHE_TTL_HOURS: i64 = 24;

fn cache_ttl() -> Duration {
    Duration::hours(CACHE_TTL_HOURS)
}

/// Keyed store of last-known disk allocation/usage per VM.
///
/// Tolerates concurrent batch reads and writes from overlapping collection
/// cycles; writes are last-write-wins per vmid.
pub struct DiskUsageCache {
    entries: DashMap<u32, DiskCacheEntry>,
    path: Option<PathBuf>,
}

/// Summary of the cache contents
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub entries: usize,
    pub oldest: Option<chrono::DateTime<Utc>>,
    pub newest: Option<chrono::DateTime<Utc>>,
}

impl DiskUsageCache {
    /// Open a cache backed by the given file, loading any persisted
    /// entries. A missing or unreadable file starts an empty cache.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = DashMap::new();

        match std::fs::read(&path) {
            Ok(data) => match serde_json::from_slice::<Vec<DiskCacheEntry>>(&data) {
                Ok(loaded) => {
                    for entry in loaded {
                        entries.insert(entry.vmid, entry);
                    }
                    info!(path = %path.display(), entries = entries.len(), "Loaded disk usage cache");
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Corrupt disk usage cache, starting fresh");
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No disk usage cache yet");
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read disk usage cache, starting fresh");
            }
        }

        Self {
            entries,
            path: Some(path),
        }
    }

    /// A cache with no backing file
    pub fn in_memory() -> Self {
        Self {
            entries: DashMap::new(),
            path: None,
        }
    }

    fn is_fresh(entry: &DiskCacheEntry, vm: &Vm) -> bool {
        Utc::now() - entry.checked_at < cache_ttl() && entry.max_disk == vm.max_disk
    }

    /// Return still-fresh entries for the given VM set.
    ///
    /// An entry is fresh while younger than the TTL and while the cached
    /// allocated size still matches the VM's live figure; a mismatch means
    /// the disk was resized and the cached usage is dropped.
    pub fn get_batch(&self, vms: &[Vm]) -> HashMap<u32, DiskCacheEntry> {
        let mut fresh = HashMap::new();
        for vm in vms {
            let Some(entry) = self.entries.get(&vm.vmid).map(|e| e.value().clone()) else {
                continue;
            };
            if Self::is_fresh(&entry, vm) {
                fresh.insert(vm.vmid, entry);
            } else {
                debug!(vmid = vm.vmid, "Dropping stale disk usage entry");
                self.entries.remove(&vm.vmid);
            }
        }
        fresh
    }

    /// Idempotent keyed upsert; overwrites by vmid, then persists.
    pub fn set_batch(&self, entries: Vec<DiskCacheEntry>) {
        if entries.is_empty() {
            return;
        }
        for entry in entries {
            self.entries.insert(entry.vmid, entry);
        }
        self.flush();
    }

    /// Delete entries older than the TTL. Safe to run concurrently with
    /// reads and writes.
    pub fn cleanup(&self) {
        let cutoff = Utc::now() - cache_ttl();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.checked_at >= cutoff);
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(removed, "Expired disk usage entries removed");
            self.flush();
        }
    }

    /// Run `cleanup` on a detached task; completion is never awaited.
    pub fn spawn_cleanup(self: Arc<Self>) {
        tokio::task::spawn_blocking(move || self.cleanup());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let mut oldest = None;
        let mut newest = None;
        for entry in self.entries.iter() {
            let ts = entry.checked_at;
            if oldest.map_or(true, |o| ts < o) {
                oldest = Some(ts);
            }
            if newest.map_or(true, |n| ts > n) {
                newest = Some(ts);
            }
        }
        CacheStats {
            entries: self.entries.len(),
            oldest,
            newest,
        }
    }

    /// Persist to the backing file. Errors are logged and swallowed: the
    /// cache must never fail a collection cycle.
    fn flush(&self) {
        let Some(path) = &self.path else {
            return;
        };
        if let Err(e) = self.save_to(path) {
            warn!(path = %path.display(), error = %e, "Failed to persist disk usage cache");
        }
    }

    fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        use anyhow::Context;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {:?}", parent))?;
        }

        let mut entries: Vec<DiskCacheEntry> =
            self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by_key(|e| e.vmid);
        let json = serde_json::to_vec(&entries).context("failed to serialize cache")?;

        let temp_path = path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .with_context(|| format!("failed to create temp file {:?}", temp_path))?;
        file.write_all(&json).context("failed to write cache data")?;
        file.sync_all().context("failed to sync cache file")?;

        std::fs::rename(&temp_path, path)
            .with_context(|| format!("failed to rename {:?} to {:?}", temp_path, path))?;
        Ok(())
    }
}
