//! Parsing of guest and node configuration text
//!
//! Config files carry operator metadata as comma-separated `key=value`
//! pairs on `#` comment lines, a structured `meta:` line with the creation
//! time, and disk attachments as `slotN:` entries. All parsing here is
//! best-effort: malformed input degrades to empty metadata or zero sizes.

use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;

const KIB: u64 = 1024;
const MIB: u64 = KIB * 1024;
const GIB: u64 = MIB * 1024;
const TIB: u64 = GIB * 1024;

/// Metadata extracted from a guest's config text
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct GuestMetadata {
    pub no_migrate: bool,
    pub cpu_model: Option<String>,
    pub affinity: Vec<String>,
    pub anti_affinity: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Metadata extracted from a node's config text
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct NodeMetadata {
    pub allow_provision: bool,
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim(), "true" | "1" | "yes" | "on")
}

fn parse_name_list(value: &str) -> Vec<String> {
    value
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Split a comment or `meta:` payload into `key=value` pairs
fn pairs(payload: &str) -> impl Iterator<Item = (&str, &str)> {
    payload
        .split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim(), v.trim()))
}

/// Whether a line opens a snapshot section (`[name]`); config lines after
/// the first such header are duplicated snapshot state and must not be read.
fn is_snapshot_header(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.len() >= 2 && trimmed.starts_with('[') && trimmed.ends_with(']')
}

pub(crate) fn parse_guest_metadata(text: &str) -> GuestMetadata {
    let mut meta = GuestMetadata::default();

    for line in text.lines() {
        if is_snapshot_header(line) {
            break;
        }
        if let Some(payload) = line.strip_prefix('#') {
            for (key, value) in pairs(payload) {
                match key {
                    "nomigrate" => meta.no_migrate = parse_bool(value),
                    "cpumodel" => {
                        if !value.is_empty() {
                            meta.cpu_model = Some(value.to_string());
                        }
                    }
                    "affinity" => meta.affinity = parse_name_list(value),
                    "antiaffinity" => meta.anti_affinity = parse_name_list(value),
                    _ => {}
                }
            }
        } else if let Some(payload) = line.trim().strip_prefix("meta:") {
            for (key, value) in pairs(payload) {
                if key == "ctime" {
                    if let Ok(secs) = value.parse::<i64>() {
                        meta.created_at = Utc.timestamp_opt(secs, 0).single();
                    }
                }
            }
        }
    }
    meta
}

pub(crate) fn parse_node_metadata(text: &str) -> NodeMetadata {
    let mut meta = NodeMetadata::default();

    for line in text.lines() {
        if is_snapshot_header(line) {
            break;
        }
        if let Some(payload) = line.strip_prefix('#') {
            for (key, value) in pairs(payload) {
                if key == "provision" {
                    meta.allow_provision = parse_bool(value);
                }
            }
        }
    }
    meta
}

/// Whether a config key names a disk-bearing attachment slot
fn is_disk_slot(key: &str) -> bool {
    if key == "rootfs" {
        return true;
    }
    for prefix in ["ide", "sata", "scsi", "virtio", "mp", "efidisk", "tpmstate"] {
        if let Some(rest) = key.strip_prefix(prefix) {
            if !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()) {
                return true;
            }
        }
    }
    false
}

/// Parse a `size=` value; a bare number means gibibytes.
fn parse_size_bytes(value: &str) -> Option<u64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let (number, unit) = match value.chars().last()? {
        'K' | 'k' => (&value[..value.len() - 1], KIB),
        'M' | 'm' => (&value[..value.len() - 1], MIB),
        'G' | 'g' => (&value[..value.len() - 1], GIB),
        'T' | 't' => (&value[..value.len() - 1], TIB),
        _ => (value, GIB),
    };
    let number: f64 = number.parse().ok()?;
    if number < 0.0 {
        return None;
    }
    Some((number * unit as f64) as u64)
}

/// Sum the allocated sizes of all disk attachments in a config map.
///
/// CD-ROM and detached entries are skipped.
pub(crate) fn sum_disk_bytes(config: &HashMap<String, String>) -> u64 {
    let mut total = 0u64;
    for (key, value) in config {
        if !is_disk_slot(key) {
            continue;
        }
        if value.contains("media=cdrom") || value == "none" || value.starts_with("none,") {
            continue;
        }
        let size = value
            .split(',')
            .filter_map(|param| param.trim().strip_prefix("size="))
            .filter_map(parse_size_bytes)
            .next();
        if let Some(bytes) = size {
            total += bytes;
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn guest_metadata_full() {
        let text = "\
#nomigrate=true,cpumodel=EPYC
#affinity=web1;web2,antiaffinity=db1
meta: creation-qemu=8.0.2,ctime=1697040000
cores: 4
scsi0: local-lvm:vm-100-disk-0,size=32G
";
        let meta = parse_guest_metadata(text);
        assert!(meta.no_migrate);
        assert_eq!(meta.cpu_model.as_deref(), Some("EPYC"));
        assert_eq!(meta.affinity, vec!["web1", "web2"]);
        assert_eq!(meta.anti_affinity, vec!["db1"]);
        assert_eq!(
            meta.created_at,
            Utc.timestamp_opt(1_697_040_000, 0).single()
        );
    }

    #[test]
    fn metadata_parsing_stops_at_snapshot_section() {
        let text = "\
cores: 4
[pre-upgrade]
#nomigrate=true
meta: ctime=1697040000
";
        let meta = parse_guest_metadata(text);
        assert!(!meta.no_migrate);
        assert!(meta.created_at.is_none());
    }

    #[test]
    fn malformed_comment_lines_are_ignored() {
        let meta = parse_guest_metadata("#garbage with no pairs\n#=,=,=\n");
        assert_eq!(meta, GuestMetadata::default());
    }

    #[test]
    fn node_metadata_provision_flag() {
        assert!(parse_node_metadata("#provision=true\n").allow_provision);
        assert!(!parse_node_metadata("#provision=false\n").allow_provision);
        assert!(!parse_node_metadata("digest: abc\n").allow_provision);
    }

    #[test]
    fn disk_sum_skips_cdrom_and_defaults_to_gib() {
        let cfg = config(&[
            ("scsi0", "local-lvm:vm-100-disk-0,size=32G"),
            ("virtio1", "local-lvm:vm-100-disk-1,size=512M"),
            ("ide2", "local:iso/debian.iso,media=cdrom"),
            // no unit suffix means GiB
            ("sata0", "local-lvm:vm-100-disk-2,size=8"),
            ("net0", "virtio=AA:BB:CC:DD:EE:FF,bridge=vmbr0"),
            ("cores", "4"),
        ]);
        assert_eq!(sum_disk_bytes(&cfg), 32 * GIB + 512 * MIB + 8 * GIB);
    }

    #[test]
    fn disk_sum_container_rootfs_and_mounts() {
        let cfg = config(&[
            ("rootfs", "local-lvm:vm-200-disk-0,size=8G"),
            ("mp0", "local-lvm:vm-200-disk-1,mp=/data,size=100G"),
        ]);
        assert_eq!(sum_disk_bytes(&cfg), 108 * GIB);
    }

    #[test]
    fn disk_sum_without_sizes_is_zero() {
        let cfg = config(&[("scsi0", "local-lvm:vm-100-disk-0"), ("cores", "4")]);
        assert_eq!(sum_disk_bytes(&cfg), 0);
    }

    #[test]
    fn size_suffixes() {
        assert_eq!(parse_size_bytes("4K"), Some(4 * KIB));
        assert_eq!(parse_size_bytes("3M"), Some(3 * MIB));
        assert_eq!(parse_size_bytes("2T"), Some(2 * TIB));
        assert_eq!(parse_size_bytes("1.5G"), Some(GIB + GIB / 2));
        assert_eq!(parse_size_bytes(""), None);
        assert_eq!(parse_size_bytes("x"), None);
    }
}
