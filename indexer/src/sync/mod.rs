//! Block-range synchronization: window planning, log scanning, reconciliation, scheduling.

pub mod reconcile;
pub mod scanner;
pub mod scheduler;

use std::ops::RangeInclusive;

pub use reconcile::{ReconcileStats, Reconciler};
pub use scanner::{BlockTarget, RangeScan, ScannedEvent, Scanner};
pub use scheduler::{SyncOutcome, SyncReport, SyncSettings, SyncStatus, Synchronizer};

/// Plans contiguous windows covering `start_block..=end_block`.
#[derive(Debug, Clone)]
pub struct RangeSyncPlanner {
    next: u64,
    end: u64,
    done: bool,
    max_span: u64,
}

impl RangeSyncPlanner {
    /// Create a new planner for the inclusive range `start_block..=end_block`.
    pub fn new(start_block: u64, end_block: u64, max_span: u64) -> Self {
        Self {
            next: start_block,
            end: end_block,
            done: start_block > end_block,
            max_span: max_span.max(1),
        }
    }

    /// Returns the next inclusive window to process, or `None` when complete.
    pub fn next_batch(&mut self) -> Option<RangeInclusive<u64>> {
        if self.done {
            return None;
        }

        let batch_end = self
            .next
            .saturating_add(self.max_span - 1)
            .min(self.end);
        let range = self.next..=batch_end;
        if batch_end == self.end {
            self.done = true;
        } else {
            self.next = batch_end + 1;
        }
        Some(range)
    }

    /// Windows not yet handed out.
    pub fn remaining(&self) -> u64 {
        if self.done {
            0
        } else {
            let blocks = self.end - self.next + 1;
            blocks.div_ceil(self.max_span)
        }
    }
}

impl Iterator for RangeSyncPlanner {
    type Item = RangeInclusive<u64>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch()
    }
}

/// Splits `from..=to` into consecutive windows of at most `max_span` blocks.
///
/// Empty when `from > to`.
pub fn partition_range(from: u64, to: u64, max_span: u64) -> Vec<RangeInclusive<u64>> {
    RangeSyncPlanner::new(from, to, max_span).collect()
}
