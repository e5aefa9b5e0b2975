//! Throughput helpers for sync logging.

use std::ops::RangeInclusive;
use std::time::Duration;

/// Items per second, or `None` before any time has passed.
pub fn rate_per_sec(count: u64, elapsed: Duration) -> Option<f64> {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        Some(count as f64 / secs)
    } else {
        None
    }
}

/// Number of blocks in an inclusive range.
pub fn range_len(range: &RangeInclusive<u64>) -> u64 {
    range.end().saturating_sub(*range.start()).saturating_add(1)
}
