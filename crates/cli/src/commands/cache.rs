//! Disk usage cache maintenance

use crate::output;
use vmdrain_lib::DiskUsageCache;

pub fn cleanup(cache: &DiskUsageCache) {
    let before = cache.len();
    cache.cleanup();
    output::print_success(&format!(
        "cache cleanup complete ({before} -> {} entries)",
        cache.len()
    ));
}

pub fn stats(cache: &DiskUsageCache) {
    let stats = cache.stats();
    println!("entries: {}", stats.entries);
    match (stats.oldest, stats.newest) {
        (Some(oldest), Some(newest)) => {
            println!("oldest:  {}", oldest.to_rfc3339());
            println!("newest:  {}", newest.to_rfc3339());
        }
        _ => println!("cache is empty"),
    }
}
