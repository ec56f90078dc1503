//! Target scoring
//!
//! Standard modes prefer under-utilized, evenly loaded nodes; evacuation
//! scoring prefers headroom below the cluster average.

/// Population standard deviation of three percentages
pub(crate) fn stddev3(a: f64, b: f64, c: f64) -> f64 {
    let mean = (a + b + c) / 3.0;
    let variance =
        ((a - mean).powi(2) + (b - mean).powi(2) + (c - mean).powi(2)) / 3.0;
    variance.sqrt()
}

/// 100 minus the weighted resource usage; higher means more headroom
pub(crate) fn utilization(cpu: f64, ram: f64, storage: f64) -> f64 {
    100.0 - (0.4 * cpu + 0.4 * ram + 0.2 * storage)
}

/// Penalizes nodes whose three resource percentages diverge
pub(crate) fn balance(cpu: f64, ram: f64, storage: f64) -> f64 {
    100.0 - 2.0 * stddev3(cpu, ram, storage)
}

/// Composite score for the standard placement modes
pub(crate) fn standard(cpu: f64, ram: f64, storage: f64) -> f64 {
    0.7 * utilization(cpu, ram, storage) + 0.3 * balance(cpu, ram, storage)
}

/// Composite score for evacuation: balance plus headroom below the
/// cluster averages, both computed on post-placement projections.
pub(crate) fn evacuation(
    balance: f64,
    avg_cpu: f64,
    avg_ram: f64,
    projected_cpu: f64,
    projected_ram: f64,
) -> f64 {
    let headroom = 0.4 * (avg_cpu - projected_cpu) + 0.4 * (avg_ram - projected_ram);
    0.2 * balance + headroom
}
