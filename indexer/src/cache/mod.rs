//! Running totals and their persisted snapshot.

use crate::contract::ContractEvent;
use async_trait::async_trait;
use eyre::Result;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Aggregate counters shown on the owner dashboard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub total_users: u64,
    /// USDT.
    pub total_donations: Decimal,
    /// USDT.
    pub total_voluntary_donations: Decimal,
    /// HELP.
    pub total_incentives: Decimal,
}

impl Counters {
    /// Adds one decoded event. Kinds that are not counted are ignored.
    pub fn apply(&mut self, event: &ContractEvent) {
        match event {
            ContractEvent::UserRegistered { .. } => self.total_users += 1,
            ContractEvent::DonationReceived { amount, .. } => self.total_donations += *amount,
            ContractEvent::VoluntaryDonation { amount, .. } => {
                self.total_voluntary_donations += *amount;
            }
            ContractEvent::IncentiveGranted { amount, .. } => self.total_incentives += *amount,
            ContractEvent::Withdrawal { .. }
            | ContractEvent::IncentiveClaimed { .. }
            | ContractEvent::LevelUp { .. } => {}
        }
    }
}

/// Counters together with the last block they include.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub counters: Counters,
    pub counted_through_block: u64,
}

/// Key-value home of the counter snapshot. Entries never expire.
#[async_trait]
pub trait CounterCache: Send + Sync {
    async fn load(&self) -> Result<Option<CounterSnapshot>>;
    async fn store(&self, snapshot: &CounterSnapshot) -> Result<()>;
}

/// Process-local cache; a restart starts from an empty cache.
#[derive(Debug, Default)]
pub struct MemoryCounterCache {
    snapshot: Mutex<Option<CounterSnapshot>>,
}

impl MemoryCounterCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterCache for MemoryCounterCache {
    async fn load(&self) -> Result<Option<CounterSnapshot>> {
        Ok(self.snapshot.lock().clone())
    }

    async fn store(&self, snapshot: &CounterSnapshot) -> Result<()> {
        *self.snapshot.lock() = Some(snapshot.clone());
        Ok(())
    }
}
