//! Persisted users and transaction rows.

pub mod memory;
pub mod postgres;

use crate::contract::units::Token;
use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eyre::{eyre, Result, WrapErr};
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{fmt, str::FromStr};

pub use memory::MemoryStore;
pub use postgres::PgStore;

const SCHEMA_VERSION: u64 = 1;

/// One participant of the scheme.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub address: Address,
    /// Zero address when no sponsor is known.
    pub sponsor: Address,
    pub is_registered: bool,
    pub current_level: u64,
    pub referrals: u64,
    pub balance: Decimal,
    pub donations_received: u64,
    pub has_donated: bool,
    pub queue_position: u64,
    pub is_in_queue: bool,
    pub locked_amount: Decimal,
    pub unlock_timestamp: u64,
    pub help_balance: Decimal,
    pub entry_fee: Decimal,
    pub registration_date: Option<DateTime<Utc>>,
}

impl User {
    /// A blank, unregistered row for `address`.
    pub fn new(address: Address) -> Self {
        Self {
            address,
            sponsor: Address::ZERO,
            is_registered: false,
            current_level: 0,
            referrals: 0,
            balance: Decimal::ZERO,
            donations_received: 0,
            has_donated: false,
            queue_position: 0,
            is_in_queue: false,
            locked_amount: Decimal::ZERO,
            unlock_timestamp: 0,
            help_balance: Decimal::ZERO,
            entry_fee: Decimal::ZERO,
            registration_date: None,
        }
    }
}

/// User fields read from chain on lookup rather than derived from events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainState {
    pub is_in_queue: bool,
    pub queue_position: u64,
    pub locked_amount: Decimal,
    pub unlock_timestamp: u64,
    pub help_balance: Decimal,
    pub referrals: u64,
}

impl User {
    pub fn apply_chain_state(&mut self, state: &ChainState) {
        self.is_in_queue = state.is_in_queue;
        self.queue_position = state.queue_position;
        self.locked_amount = state.locked_amount;
        self.unlock_timestamp = state.unlock_timestamp;
        self.help_balance = state.help_balance;
        self.referrals = state.referrals;
    }
}

/// Transaction row category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    Register,
    DonationReceived,
    VoluntaryDonation,
    Withdrawal,
    IncentiveGranted,
    IncentiveClaimed,
    LevelUp,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Register => "Register",
            Self::DonationReceived => "DonationReceived",
            Self::VoluntaryDonation => "VoluntaryDonation",
            Self::Withdrawal => "Withdrawal",
            Self::IncentiveGranted => "IncentiveGranted",
            Self::IncentiveClaimed => "IncentiveClaimed",
            Self::LevelUp => "LevelUp",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = eyre::Report;

    fn from_str(raw: &str) -> Result<Self> {
        Ok(match raw {
            "Register" => Self::Register,
            "DonationReceived" => Self::DonationReceived,
            "VoluntaryDonation" => Self::VoluntaryDonation,
            "Withdrawal" => Self::Withdrawal,
            "IncentiveGranted" => Self::IncentiveGranted,
            "IncentiveClaimed" => Self::IncentiveClaimed,
            "LevelUp" => Self::LevelUp,
            other => return Err(eyre!("unknown transaction method {other}")),
        })
    }
}

/// Immutable record of one event of interest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub transaction_hash: B256,
    pub method: Method,
    pub block: u64,
    pub date: DateTime<Utc>,
    pub from: Address,
    pub to: Address,
    /// Human units; see `Token::decimals`.
    pub amount: Decimal,
    pub token: Token,
    pub level: u64,
    pub reserve_pool: Option<Decimal>,
}

/// Which side of a transfer an address filter matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMatch {
    /// Sender or recipient.
    Either(Address),
    Sender(Address),
}

impl AddressMatch {
    pub fn matches(&self, record: &TransactionRecord) -> bool {
        match *self {
            Self::Either(address) => record.from == address || record.to == address,
            Self::Sender(address) => record.from == address,
        }
    }
}

/// Filters for listing transaction rows. Empty matches everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionQuery {
    pub address: Option<AddressMatch>,
    pub token: Option<Token>,
    pub method: Option<Method>,
}

impl TransactionQuery {
    pub fn matches(&self, record: &TransactionRecord) -> bool {
        self.address.map_or(true, |filter| filter.matches(record))
            && self.token.map_or(true, |token| record.token == token)
            && self.method.map_or(true, |method| record.method == method)
    }
}

/// Persistence seam for users and transaction rows.
///
/// Addresses compare by value, so lookups are case-insensitive regardless
/// of how a caller spelled the hex.
#[async_trait]
pub trait Store: Send + Sync {
    async fn find_user(&self, address: Address) -> Result<Option<User>>;
    /// Inserts or replaces the row keyed by `user.address`.
    async fn save_user(&self, user: &User) -> Result<()>;
    /// Inserts `user` unless a row for its address exists. Returns whether it was inserted.
    async fn insert_user(&self, user: &User) -> Result<bool>;
    /// Overwrites only the chain-read columns and returns the resulting row.
    /// Event-derived columns written concurrently are left alone.
    async fn refresh_chain_state(
        &self,
        address: Address,
        state: &ChainState,
    ) -> Result<Option<User>>;
    async fn list_users(&self) -> Result<Vec<Address>>;
    /// Number of stored users whose sponsor is `sponsor`.
    async fn count_referrals(&self, sponsor: Address) -> Result<u64>;
    async fn transaction_exists(&self, hash: B256) -> Result<bool>;
    /// Appends a row. Returns `false` when the hash is already stored.
    async fn insert_transaction(&self, record: &TransactionRecord) -> Result<bool>;
    /// Matching rows, newest first.
    async fn list_transactions(&self, query: &TransactionQuery) -> Result<Vec<TransactionRecord>>;
}

/// Identity a persistent store was bootstrapped for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
struct StoredIdentity {
    schema_version: u64,
    chain_id: u64,
    contract: Address,
}

impl StoredIdentity {
    fn new(chain_id: u64, contract: Address) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            chain_id,
            contract,
        }
    }

    /// Rejects a database that was filled for another chain or contract.
    fn check(&self, expected: &StoredIdentity) -> Result<()> {
        if self.schema_version != expected.schema_version {
            return Err(eyre!(
                "unsupported schema version {} (expected {})",
                self.schema_version,
                expected.schema_version
            ));
        }
        if self.chain_id != expected.chain_id {
            return Err(eyre!(
                "chain_id mismatch: db={} config={}",
                self.chain_id,
                expected.chain_id
            ));
        }
        if self.contract != expected.contract {
            return Err(eyre!(
                "contract mismatch: db={} config={}",
                self.contract,
                expected.contract
            ));
        }
        Ok(())
    }
}

fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).wrap_err("failed to serialize metadata")
}

fn decode_json<T: DeserializeOwned>(bytes: Vec<u8>) -> Result<T> {
    serde_json::from_slice(&bytes).wrap_err("failed to deserialize metadata")
}

/// Lowercase `0x`-prefixed hex, the canonical stored spelling.
fn hex_key(bytes: impl AsRef<[u8]>) -> String {
    alloy_primitives::hex::encode_prefixed(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(from: Address, to: Address, token: Token, method: Method) -> TransactionRecord {
        TransactionRecord {
            transaction_hash: B256::repeat_byte(1),
            method,
            block: 1,
            date: DateTime::from_timestamp(0, 0).expect("epoch"),
            from,
            to,
            amount: Decimal::ONE,
            token,
            level: 1,
            reserve_pool: None,
        }
    }

    #[test]
    fn query_filters_compose() {
        let alice = Address::repeat_byte(0xa1);
        let contract = Address::repeat_byte(0xcc);
        let withdrawal = record(contract, alice, Token::Usdt, Method::Withdrawal);

        assert!(TransactionQuery::default().matches(&withdrawal));
        let either = TransactionQuery {
            address: Some(AddressMatch::Either(alice)),
            ..Default::default()
        };
        assert!(either.matches(&withdrawal));
        let sender = TransactionQuery {
            address: Some(AddressMatch::Sender(alice)),
            ..Default::default()
        };
        assert!(!sender.matches(&withdrawal));
        let help_only = TransactionQuery {
            address: Some(AddressMatch::Either(alice)),
            token: Some(Token::Help),
            method: None,
        };
        assert!(!help_only.matches(&withdrawal));
    }

    #[test]
    fn identity_check_rejects_other_chain_and_contract() {
        let contract = Address::repeat_byte(0xcc);
        let expected = StoredIdentity::new(11_155_111, contract);
        expected.check(&expected).expect("same identity");

        let other_chain = StoredIdentity::new(1, contract);
        let err = other_chain.check(&expected).expect_err("chain mismatch");
        assert!(err.to_string().contains("chain_id mismatch"), "{err}");

        let other_contract = StoredIdentity::new(11_155_111, Address::repeat_byte(0xdd));
        let err = other_contract.check(&expected).expect_err("contract mismatch");
        assert!(err.to_string().contains("contract mismatch"), "{err}");
    }

    #[test]
    fn stored_keys_are_lowercase() {
        let address: Address = "0x52908400098527886E0F7030069857D2E4169EE7"
            .parse()
            .unwrap();
        assert_eq!(hex_key(address), "0x52908400098527886e0f7030069857d2e4169ee7");
        assert_eq!(
            "LevelUp".parse::<Method>().unwrap(),
            Method::LevelUp
        );
    }

    #[test]
    fn meta_json_round_trip() {
        let identity = StoredIdentity::new(5, Address::repeat_byte(0x01));
        let bytes = encode_json(&identity).unwrap();
        assert_eq!(decode_json::<StoredIdentity>(bytes).unwrap(), identity);
    }
}
