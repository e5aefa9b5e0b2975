//! Cold start, polling, and manual sync passes.

use super::{BlockTarget, ReconcileStats, Reconciler, Scanner};
use crate::cache::{CounterCache, CounterSnapshot, Counters};
use crate::contract::EventKind;
use crate::error::{parse_address, IndexerError};
use crate::metrics::{range_len, rate_per_sec};
use alloy_primitives::Address;
use eyre::{Result, WrapErr};
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::{
    task::JoinHandle,
    time::{interval, sleep, MissedTickBehavior},
};
use tracing::{error, info, warn};

/// Fixed parameters of a synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    pub owner: Address,
    pub deployment_block: u64,
    pub counter_lookback_blocks: u64,
    pub poll_interval: Duration,
}

/// What a completed pass covered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub from_block: u64,
    pub to_block: u64,
    pub reconcile: ReconcileStats,
    pub counters: Counters,
}

/// Result of a sync pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncOutcome {
    UpToDate { head: u64 },
    Synced(SyncReport),
}

/// Point-in-time view for health checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub ready: bool,
    pub syncing: bool,
    pub last_synced_block: u64,
    pub next_counted_block: u64,
    pub on_fallback: bool,
}

/// Clears the syncing flag when a pass ends, however it ends.
struct SyncingGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Drives reconciliation and owns the aggregate counters.
pub struct Synchronizer {
    scanner: Scanner,
    reconciler: Reconciler,
    cache: Arc<dyn CounterCache>,
    settings: SyncSettings,
    counters: Mutex<Counters>,
    /// First block whose events are not yet written to the store.
    last_synced_block: AtomicU64,
    /// First block not yet added to `counters`.
    next_counted_block: AtomicU64,
    syncing: AtomicBool,
    ready: AtomicBool,
}

impl Synchronizer {
    pub fn new(
        scanner: Scanner,
        reconciler: Reconciler,
        cache: Arc<dyn CounterCache>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            scanner,
            reconciler,
            cache,
            settings,
            counters: Mutex::new(Counters::default()),
            last_synced_block: AtomicU64::new(settings.deployment_block),
            next_counted_block: AtomicU64::new(settings.deployment_block),
            syncing: AtomicBool::new(false),
            ready: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn scanner(&self) -> &Scanner {
        &self.scanner
    }

    pub fn counters(&self) -> Counters {
        self.counters.lock().clone()
    }

    /// First block the next pass will cover.
    pub fn last_synced_block(&self) -> u64 {
        self.last_synced_block.load(Ordering::SeqCst)
    }

    /// First block the next pass will add to the counters.
    pub fn next_counted_block(&self) -> u64 {
        self.next_counted_block.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            ready: self.ready.load(Ordering::SeqCst),
            syncing: self.syncing.load(Ordering::SeqCst),
            last_synced_block: self.last_synced_block(),
            next_counted_block: self.next_counted_block(),
            on_fallback: self.scanner.selector().is_on_fallback(),
        }
    }

    fn try_begin(&self) -> Result<SyncingGuard<'_>, IndexerError> {
        self.syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| IndexerError::SyncInProgress)?;
        Ok(SyncingGuard {
            flag: &self.syncing,
        })
    }

    fn advance_to(&self, block: u64) {
        self.last_synced_block.fetch_max(block, Ordering::SeqCst);
    }

    fn advance_counted_to(&self, block: u64) {
        self.next_counted_block.fetch_max(block, Ordering::SeqCst);
    }

    /// Initializes counters, replays rows from the deployment block, and marks
    /// the synchronizer ready for incremental passes.
    pub async fn cold_start(&self) -> Result<SyncReport, IndexerError> {
        let _guard = self.try_begin()?;
        let started = Instant::now();

        let counted_through = self.init_counters().await?;

        let head = self.scanner.head().await?;
        let reconcile = self
            .reconcile_range(self.settings.deployment_block, head)
            .await?;

        // Rows are written through head, counting resumes after the cached checkpoint.
        self.advance_to(head.saturating_add(1));
        self.advance_counted_to(counted_through.saturating_add(1));
        self.ready.store(true, Ordering::SeqCst);

        let report = SyncReport {
            from_block: self.settings.deployment_block,
            to_block: head,
            reconcile,
            counters: self.counters(),
        };
        info!(
            head,
            counted_through,
            events = report.reconcile.events,
            rows_inserted = report.reconcile.rows_inserted,
            users_created = report.reconcile.users_created,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "cold start complete"
        );
        Ok(report)
    }

    async fn init_counters(&self) -> Result<u64> {
        match self.cache.load().await {
            Ok(Some(snapshot)) => {
                info!(
                    total_users = snapshot.counters.total_users,
                    total_donations = %snapshot.counters.total_donations,
                    total_voluntary_donations = %snapshot.counters.total_voluntary_donations,
                    total_incentives = %snapshot.counters.total_incentives,
                    counted_through = snapshot.counted_through_block,
                    "restored counters from cache"
                );
                *self.counters.lock() = snapshot.counters;
                return Ok(snapshot.counted_through_block);
            }
            Ok(None) => {}
            Err(err) => warn!(error = %format!("{err:#}"), "counter cache unreadable, recounting"),
        }

        let head = self.scanner.head().await?;
        let start = self
            .settings
            .deployment_block
            .max(head.saturating_sub(self.settings.counter_lookback_blocks));
        info!(from = start, to = head, "initializing counters");
        let counters = self.tally(start, head, Counters::default()).await?;
        *self.counters.lock() = counters.clone();
        self.persist_counters(counters, head).await;
        Ok(head)
    }

    /// Row reconciliation as one full-range pass per event kind.
    async fn reconcile_range(&self, from: u64, to: u64) -> Result<ReconcileStats> {
        let mut total = ReconcileStats::default();
        for kind in EventKind::ALL {
            let started = Instant::now();
            let mut stats = ReconcileStats::default();
            let mut scan = self
                .scanner
                .scan(from, BlockTarget::Number(to), &[kind])
                .await?;
            while let Some(window) = scan.next_window().await? {
                for event in &window.events {
                    self.reconciler
                        .apply(window.connection.as_ref(), event, &mut stats)
                        .await
                        .wrap_err_with(|| {
                            format!("failed to reconcile {kind} in tx {}", event.transaction_hash)
                        })?;
                }
            }
            if stats.events > 0 {
                info!(
                    %kind,
                    from,
                    to,
                    events = stats.events,
                    rows_inserted = stats.rows_inserted,
                    events_per_sec = ?rate_per_sec(stats.events, started.elapsed()),
                    "reconciled events"
                );
            }
            total.merge(&stats);
        }
        Ok(total)
    }

    /// Adds counted events in `from..=to` onto `base`.
    async fn tally(&self, from: u64, to: u64, base: Counters) -> Result<Counters> {
        let mut counters = base;
        let mut scan = self
            .scanner
            .scan(from, BlockTarget::Number(to), &EventKind::COUNTED)
            .await?;
        while let Some(window) = scan.next_window().await? {
            for event in &window.events {
                counters.apply(&event.event);
            }
        }
        Ok(counters)
    }

    async fn persist_counters(&self, counters: Counters, through: u64) {
        let snapshot = CounterSnapshot {
            counters,
            counted_through_block: through,
        };
        if let Err(err) = self.cache.store(&snapshot).await {
            error!(error = %format!("{err:#}"), "failed to persist counters");
        }
    }

    /// One incremental pass: rows from `last_synced_block`, counters from
    /// `next_counted_block`, both through head.
    pub async fn sync_pass(&self) -> Result<SyncOutcome, IndexerError> {
        if !self.ready.load(Ordering::SeqCst) {
            return Err(IndexerError::SyncInProgress);
        }
        let _guard = self.try_begin()?;
        Ok(self.run_pass().await?)
    }

    async fn run_pass(&self) -> Result<SyncOutcome> {
        let rows_from = self.last_synced_block();
        let count_from = self.next_counted_block();
        let head = self.scanner.head().await?;
        if rows_from > head && count_from > head {
            return Ok(SyncOutcome::UpToDate { head });
        }
        let from = rows_from.min(count_from);
        let started = Instant::now();
        info!(from, to = head, blocks = range_len(&(from..=head)), "sync pass started");

        let reconcile = if rows_from <= head {
            self.reconcile_range(rows_from, head).await?
        } else {
            ReconcileStats::default()
        };
        let counters = if count_from <= head {
            let counters = self.tally(count_from, head, self.counters()).await?;
            *self.counters.lock() = counters.clone();
            self.persist_counters(counters.clone(), head).await;
            counters
        } else {
            self.counters()
        };
        self.advance_to(head.saturating_add(1));
        self.advance_counted_to(head.saturating_add(1));

        info!(
            from,
            to = head,
            events = reconcile.events,
            rows_inserted = reconcile.rows_inserted,
            total_users = counters.total_users,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "sync pass complete"
        );
        Ok(SyncOutcome::Synced(SyncReport {
            from_block: from,
            to_block: head,
            reconcile,
            counters,
        }))
    }

    /// Owner-triggered pass.
    pub async fn manual_sync(&self, requester: &str) -> Result<SyncOutcome, IndexerError> {
        let requester = parse_address(requester)?;
        if requester != self.settings.owner {
            return Err(IndexerError::Unauthorized(requester));
        }
        info!(%requester, "manual sync requested");
        self.sync_pass().await
    }

    async fn poll_once(&self) {
        match self.sync_pass().await {
            Ok(SyncOutcome::UpToDate { head }) => {
                info!(head, last_synced = self.last_synced_block(), "no new blocks to sync");
            }
            Ok(SyncOutcome::Synced(_)) => {}
            Err(IndexerError::SyncInProgress) => {
                info!("sync already in progress, skipping this tick");
            }
            Err(err) => error!(kind = err.kind(), error = %err, "polling pass failed"),
        }
    }

    /// Runs cold start until it succeeds, then polls on a fixed interval.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.cold_start().await {
                    Ok(_) => break,
                    Err(err) => {
                        error!(kind = err.kind(), error = %err, "cold start failed, retrying");
                        sleep(self.settings.poll_interval).await;
                    }
                }
            }

            let mut ticker = interval(self.settings.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.poll_once().await;
            }
        })
    }
}
