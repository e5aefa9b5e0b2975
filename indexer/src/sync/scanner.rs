//! Windowed `eth_getLogs` scanning over the contract's event filters.

use super::RangeSyncPlanner;
use crate::contract::{ContractEvent, EventKind};
use crate::rpc::{Connection, EndpointSelector, LogFilter, RpcLog};
use alloy_primitives::{Address, B256};
use eyre::{eyre, Result, WrapErr};
use futures::future::join_all;
use std::{ops::RangeInclusive, sync::Arc};
use tracing::{debug, warn};

/// Upper bound of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTarget {
    /// Chain head, resolved once when the scan starts.
    Latest,
    Number(u64),
}

/// A decoded event with its position on chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedEvent {
    pub block_number: u64,
    pub transaction_hash: B256,
    pub log_index: u64,
    pub event: ContractEvent,
}

impl ScannedEvent {
    fn from_log(kind: EventKind, log: &RpcLog) -> Result<Self> {
        let block_number: u64 = log
            .block_number
            .ok_or_else(|| eyre!("{kind} log has no block number"))?
            .to();
        let transaction_hash = log
            .transaction_hash
            .ok_or_else(|| eyre!("{kind} log has no transaction hash"))?;
        let log_index: u64 = log.log_index.map(|index| index.to()).unwrap_or_default();
        Ok(Self {
            block_number,
            transaction_hash,
            log_index,
            event: ContractEvent::decode(kind, log)?,
        })
    }
}

/// Events of one window, grouped by filter in the order the filters were given.
pub struct ScanWindow {
    pub range: RangeInclusive<u64>,
    pub events: Vec<ScannedEvent>,
    /// Connection the window was fetched over; reused for follow-up reads.
    pub connection: Connection,
}

/// Fetches contract logs in bounded windows.
pub struct Scanner {
    selector: Arc<EndpointSelector>,
    contract: Address,
    max_block_range: u64,
}

impl Scanner {
    pub fn new(selector: Arc<EndpointSelector>, contract: Address, max_block_range: u64) -> Self {
        Self {
            selector,
            contract,
            max_block_range: max_block_range.max(1),
        }
    }

    pub fn selector(&self) -> &Arc<EndpointSelector> {
        &self.selector
    }

    /// Current chain head.
    pub async fn head(&self) -> Result<u64> {
        let conn = self.selector.acquire().await?;
        conn.block_number().await
    }

    /// Starts a scan of `from..=to` for `kinds`.
    pub async fn scan(
        &self,
        from: u64,
        to: BlockTarget,
        kinds: &[EventKind],
    ) -> Result<RangeScan<'_>> {
        let end = match to {
            BlockTarget::Number(number) => number,
            BlockTarget::Latest => self.head().await?,
        };
        debug!(from, to = end, kinds = kinds.len(), "starting range scan");
        Ok(RangeScan {
            scanner: self,
            kinds: kinds.to_vec(),
            planner: RangeSyncPlanner::new(from, end, self.max_block_range),
            end,
        })
    }
}

/// An in-progress scan. Windows come out in increasing block order.
pub struct RangeScan<'a> {
    scanner: &'a Scanner,
    kinds: Vec<EventKind>,
    planner: RangeSyncPlanner,
    end: u64,
}

impl RangeScan<'_> {
    /// Resolved upper bound.
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Fetches the next window, one `eth_getLogs` per filter, concurrently.
    ///
    /// A failed registration fetch aborts the scan. Other failed fetches are
    /// logged and leave that filter's window empty.
    pub async fn next_window(&mut self) -> Result<Option<ScanWindow>> {
        let Some(range) = self.planner.next_batch() else {
            return Ok(None);
        };
        let connection = self.scanner.selector.acquire().await?;
        let filters: Vec<_> = self
            .kinds
            .iter()
            .map(|kind| LogFilter {
                address: self.scanner.contract,
                topic0: kind.topic0(),
                from_block: *range.start(),
                to_block: *range.end(),
            })
            .collect();
        let results = join_all(filters.iter().map(|filter| connection.get_logs(filter))).await;

        let mut events = Vec::new();
        for (kind, result) in self.kinds.iter().copied().zip(results) {
            let logs = match result {
                Ok(logs) => logs,
                Err(err) if kind.halts_scan_on_fetch_error() => {
                    return Err(err.wrap_err(format!(
                        "failed to query {kind} events in blocks {}..={}",
                        range.start(),
                        range.end()
                    )));
                }
                Err(err) => {
                    warn!(
                        %kind,
                        from = *range.start(),
                        to = *range.end(),
                        error = %format!("{err:#}"),
                        "log fetch failed, skipping window for this filter"
                    );
                    continue;
                }
            };
            debug!(%kind, from = *range.start(), to = *range.end(), count = logs.len(), "fetched logs");
            for log in &logs {
                match ScannedEvent::from_log(kind, log) {
                    Ok(event) => events.push(event),
                    Err(err) => warn!(
                        %kind,
                        tx = ?log.transaction_hash,
                        error = %format!("{err:#}"),
                        "skipping undecodable log"
                    ),
                }
            }
        }

        Ok(Some(ScanWindow {
            range,
            events,
            connection,
        }))
    }

    /// Drains the scan, returning all events.
    pub async fn collect(mut self) -> Result<Vec<ScannedEvent>> {
        let mut events = Vec::new();
        while let Some(window) = self
            .next_window()
            .await
            .wrap_err("range scan aborted")?
        {
            events.extend(window.events);
        }
        Ok(events)
    }
}
