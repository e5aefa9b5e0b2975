//! Applies decoded events to stored users and transaction rows.

use super::ScannedEvent;
use crate::contract::{units::Token, ContractEvent, ContractReader};
use crate::rpc::EvmRpc;
use crate::storage::{Method, Store, TransactionRecord, User};
use alloy_primitives::Address;
use chrono::{DateTime, Utc};
use eyre::{eyre, Result};
use lru::LruCache;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use std::{num::NonZeroUsize, sync::Arc};
use tracing::{debug, error, warn};

const BLOCK_TIMESTAMP_CACHE: usize = 4_096;

/// Per-pass counters of what reconciliation did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub events: u64,
    pub users_created: u64,
    pub users_updated: u64,
    pub rows_inserted: u64,
    pub rows_skipped: u64,
    pub missing_blocks: u64,
}

impl ReconcileStats {
    pub fn merge(&mut self, other: &ReconcileStats) {
        self.events += other.events;
        self.users_created += other.users_created;
        self.users_updated += other.users_updated;
        self.rows_inserted += other.rows_inserted;
        self.rows_skipped += other.rows_skipped;
        self.missing_blocks += other.missing_blocks;
    }
}

/// Create-or-update of users plus append-once transaction rows.
pub struct Reconciler {
    store: Arc<dyn Store>,
    reader: ContractReader,
    timestamps: Mutex<LruCache<u64, u64>>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn Store>, reader: ContractReader) -> Self {
        let capacity = NonZeroUsize::new(BLOCK_TIMESTAMP_CACHE).unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            reader,
            timestamps: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn reader(&self) -> &ContractReader {
        &self.reader
    }

    fn contract(&self) -> Address {
        self.reader.contract
    }

    /// Applies one event. Replaying the same event leaves the store unchanged,
    /// except for the donation counter on an existing user.
    pub async fn apply(
        &self,
        rpc: &dyn EvmRpc,
        scanned: &ScannedEvent,
        stats: &mut ReconcileStats,
    ) -> Result<()> {
        stats.events += 1;
        let Some(date) = self.block_date(rpc, scanned.block_number).await else {
            stats.missing_blocks += 1;
            warn!(
                block = scanned.block_number,
                tx = %scanned.transaction_hash,
                kind = %scanned.event.kind(),
                "block unavailable, skipping event"
            );
            return Ok(());
        };

        let record = match &scanned.event {
            ContractEvent::UserRegistered { user, sponsor } => {
                let entry_fee = self.reader.entry_fee(rpc).await?;
                match self.store.find_user(*user).await? {
                    Some(mut existing) => {
                        existing.sponsor = *sponsor;
                        existing.is_registered = true;
                        existing.registration_date = Some(date);
                        self.store.save_user(&existing).await?;
                        stats.users_updated += 1;
                    }
                    None => {
                        let mut created = User::new(*user);
                        created.sponsor = *sponsor;
                        created.is_registered = true;
                        created.registration_date = Some(date);
                        created.entry_fee = entry_fee;
                        created.current_level = 1;
                        self.store.save_user(&created).await?;
                        stats.users_created += 1;
                        debug!(user = %user, sponsor = %sponsor, "created user");
                    }
                }
                self.record(scanned, date, Method::Register, *user, self.contract())
                    .with_amount(entry_fee, Token::Usdt)
                    .with_level(1)
            }
            ContractEvent::DonationReceived {
                user,
                amount,
                level,
                new_balance,
            } => {
                if let Some(mut existing) = self.store.find_user(*user).await? {
                    existing.donations_received += 1;
                    existing.has_donated = true;
                    existing.current_level = *level;
                    existing.balance = *new_balance;
                    self.store.save_user(&existing).await?;
                    stats.users_updated += 1;
                }
                self.record(scanned, date, Method::DonationReceived, *user, self.contract())
                    .with_amount(*amount, Token::Usdt)
                    .with_level(*level)
            }
            ContractEvent::VoluntaryDonation {
                user,
                amount,
                reserve_pool,
            } => {
                let level = match self.store.find_user(*user).await? {
                    Some(existing) => {
                        self.store.save_user(&existing).await?;
                        existing.current_level
                    }
                    None => 0,
                };
                let mut row = self
                    .record(scanned, date, Method::VoluntaryDonation, *user, self.contract())
                    .with_amount(*amount, Token::Usdt)
                    .with_level(level);
                row.reserve_pool = Some(*reserve_pool);
                row
            }
            ContractEvent::Withdrawal {
                user,
                amount_usdt,
                remaining_balance,
                ..
            } => {
                if let Some(mut existing) = self.store.find_user(*user).await? {
                    existing.balance = *remaining_balance;
                    existing.help_balance = self.help_balance_or_zero(rpc, *user).await;
                    self.store.save_user(&existing).await?;
                    stats.users_updated += 1;
                }
                self.record(scanned, date, Method::Withdrawal, self.contract(), *user)
                    .with_amount(*amount_usdt, Token::Usdt)
            }
            ContractEvent::IncentiveGranted {
                user,
                amount,
                unlock_timestamp,
            } => {
                if let Some(mut existing) = self.store.find_user(*user).await? {
                    existing.locked_amount = *amount;
                    existing.unlock_timestamp = *unlock_timestamp;
                    self.store.save_user(&existing).await?;
                    stats.users_updated += 1;
                }
                self.record(scanned, date, Method::IncentiveGranted, self.contract(), *user)
                    .with_amount(*amount, Token::Help)
            }
            ContractEvent::IncentiveClaimed { user, amount } => {
                if let Some(mut existing) = self.store.find_user(*user).await? {
                    existing.locked_amount = Decimal::ZERO;
                    existing.unlock_timestamp = 0;
                    existing.help_balance = self.help_balance_or_zero(rpc, *user).await;
                    self.store.save_user(&existing).await?;
                    stats.users_updated += 1;
                }
                self.record(scanned, date, Method::IncentiveClaimed, self.contract(), *user)
                    .with_amount(*amount, Token::Help)
            }
            ContractEvent::LevelUp {
                user,
                new_level,
                remaining_balance,
            } => {
                if let Some(mut existing) = self.store.find_user(*user).await? {
                    existing.current_level = *new_level;
                    existing.balance = *remaining_balance;
                    self.store.save_user(&existing).await?;
                    stats.users_updated += 1;
                }
                self.record(scanned, date, Method::LevelUp, *user, self.contract())
                    .with_amount(Decimal::ZERO, Token::NotApplicable)
                    .with_level(*new_level)
            }
        };

        if self.store.transaction_exists(record.transaction_hash).await? {
            stats.rows_skipped += 1;
            return Ok(());
        }
        if self.store.insert_transaction(&record).await? {
            stats.rows_inserted += 1;
        } else {
            stats.rows_skipped += 1;
        }
        Ok(())
    }

    /// HELP balance, or zero when the token call fails.
    pub async fn help_balance_or_zero(&self, rpc: &dyn EvmRpc, user: Address) -> Decimal {
        match self.reader.help_balance(rpc, user).await {
            Ok(balance) => balance,
            Err(err) => {
                error!(user = %user, error = %format!("{err:#}"), "failed to read HELP balance");
                Decimal::ZERO
            }
        }
    }

    async fn block_date(&self, rpc: &dyn EvmRpc, number: u64) -> Option<DateTime<Utc>> {
        let cached = self.timestamps.lock().get(&number).copied();
        let timestamp = match cached {
            Some(timestamp) => timestamp,
            None => match rpc.block_timestamp(number).await {
                Ok(Some(timestamp)) => {
                    self.timestamps.lock().put(number, timestamp);
                    timestamp
                }
                Ok(None) => return None,
                Err(err) => {
                    error!(block = number, error = %format!("{err:#}"), "failed to get block");
                    return None;
                }
            },
        };
        match to_date(timestamp) {
            Ok(date) => Some(date),
            Err(err) => {
                error!(block = number, error = %err, "invalid block timestamp");
                None
            }
        }
    }

    fn record(
        &self,
        scanned: &ScannedEvent,
        date: DateTime<Utc>,
        method: Method,
        from: Address,
        to: Address,
    ) -> TransactionRecord {
        TransactionRecord {
            transaction_hash: scanned.transaction_hash,
            method,
            block: scanned.block_number,
            date,
            from,
            to,
            amount: Decimal::ZERO,
            token: Token::NotApplicable,
            level: 0,
            reserve_pool: None,
        }
    }
}

fn to_date(timestamp: u64) -> Result<DateTime<Utc>> {
    i64::try_from(timestamp)
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .ok_or_else(|| eyre!("timestamp {timestamp} out of range"))
}

impl TransactionRecord {
    fn with_amount(mut self, amount: Decimal, token: Token) -> Self {
        self.amount = amount;
        self.token = token;
        self
    }

    fn with_level(mut self, level: u64) -> Self {
        self.level = level;
        self
    }
}
