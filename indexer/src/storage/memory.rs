//! In-process store used when no database is configured, and by tests.

use super::{ChainState, Store, TransactionQuery, TransactionRecord, User};
use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use eyre::Result;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
struct Tables {
    users: HashMap<Address, User>,
    transactions: Vec<TransactionRecord>,
    hashes: HashSet<B256>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user_count(&self) -> usize {
        self.tables.read().users.len()
    }

    pub fn transaction_count(&self) -> usize {
        self.tables.read().transactions.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_user(&self, address: Address) -> Result<Option<User>> {
        Ok(self.tables.read().users.get(&address).cloned())
    }

    async fn save_user(&self, user: &User) -> Result<()> {
        self.tables.write().users.insert(user.address, user.clone());
        Ok(())
    }

    async fn insert_user(&self, user: &User) -> Result<bool> {
        let mut tables = self.tables.write();
        if tables.users.contains_key(&user.address) {
            return Ok(false);
        }
        tables.users.insert(user.address, user.clone());
        Ok(true)
    }

    async fn refresh_chain_state(
        &self,
        address: Address,
        state: &ChainState,
    ) -> Result<Option<User>> {
        let mut tables = self.tables.write();
        Ok(tables.users.get_mut(&address).map(|user| {
            user.apply_chain_state(state);
            user.clone()
        }))
    }

    async fn list_users(&self) -> Result<Vec<Address>> {
        let mut addresses: Vec<_> = self.tables.read().users.keys().copied().collect();
        addresses.sort();
        Ok(addresses)
    }

    async fn count_referrals(&self, sponsor: Address) -> Result<u64> {
        let tables = self.tables.read();
        Ok(tables.users.values().filter(|user| user.sponsor == sponsor).count() as u64)
    }

    async fn transaction_exists(&self, hash: B256) -> Result<bool> {
        Ok(self.tables.read().hashes.contains(&hash))
    }

    async fn insert_transaction(&self, record: &TransactionRecord) -> Result<bool> {
        let mut tables = self.tables.write();
        if !tables.hashes.insert(record.transaction_hash) {
            return Ok(false);
        }
        tables.transactions.push(record.clone());
        Ok(true)
    }

    async fn list_transactions(&self, query: &TransactionQuery) -> Result<Vec<TransactionRecord>> {
        let tables = self.tables.read();
        let mut rows: Vec<_> = tables
            .transactions
            .iter()
            .rev()
            .filter(|record| query.matches(record))
            .cloned()
            .collect();
        // Stable sort keeps later inserts first among equal timestamps.
        rows.sort_by(|a, b| b.date.cmp(&a.date).then(b.block.cmp(&a.block)));
        Ok(rows)
    }
}
