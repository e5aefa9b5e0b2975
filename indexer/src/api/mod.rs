//! Read service behind the REST routes, plus the JSON shapes it returns.

pub mod http;

use crate::contract::{
    units::{self, Token},
    ContractReader,
};
use crate::error::{parse_address, IndexerError};
use crate::rpc::EndpointSelector;
use crate::storage::{
    AddressMatch, ChainState, Method, Store, TransactionQuery, TransactionRecord, User,
};
use crate::sync::{SyncOutcome, SyncStatus, Synchronizer};
use alloy_primitives::Address;
use chrono::{DateTime, SecondsFormat, Utc};
use eyre::eyre;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

/// JavaScript-style ISO-8601 timestamp (`2024-01-01T00:00:00.000Z`).
fn iso_date(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfoDto {
    pub is_registered: bool,
    pub current_level: u64,
    pub sponsor: Address,
    pub referrals: u64,
    #[serde(with = "rust_decimal::serde::float")]
    pub balance: Decimal,
    pub donations_received: u64,
    pub has_donated: bool,
    pub queue_position: u64,
    /// Empty until the registration event has been seen.
    pub registration_date: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub entry_fee: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub help_balance: Decimal,
    pub is_in_queue: bool,
    #[serde(with = "rust_decimal::serde::float")]
    pub locked_amount: Decimal,
    pub unlock_timestamp: u64,
}

impl From<&User> for UserInfoDto {
    fn from(user: &User) -> Self {
        Self {
            is_registered: user.is_registered,
            current_level: user.current_level,
            sponsor: user.sponsor,
            referrals: user.referrals,
            balance: user.balance,
            donations_received: user.donations_received,
            has_donated: user.has_donated,
            queue_position: user.queue_position,
            registration_date: user.registration_date.as_ref().map(iso_date).unwrap_or_default(),
            entry_fee: user.entry_fee,
            help_balance: user.help_balance,
            is_in_queue: user.is_in_queue,
            locked_amount: user.locked_amount,
            unlock_timestamp: user.unlock_timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserAddressDto {
    pub address: Address,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionDto {
    pub transaction_hash: String,
    pub method: Method,
    pub block: u64,
    pub date: String,
    pub from: Address,
    pub to: Address,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub token: Token,
    pub level: u64,
    #[serde(with = "rust_decimal::serde::float_option")]
    pub reserve_pool: Option<Decimal>,
}

impl From<&TransactionRecord> for TransactionDto {
    fn from(row: &TransactionRecord) -> Self {
        Self {
            transaction_hash: row.transaction_hash.to_string(),
            method: row.method,
            block: row.block,
            date: iso_date(&row.date),
            from: row.from,
            to: row.to,
            amount: row.amount,
            token: row.token,
            level: row.level,
            reserve_pool: row.reserve_pool,
        }
    }
}

/// A donation row as seen by the donating user.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DonationDto {
    pub transaction_hash: String,
    pub method: Method,
    pub block: u64,
    pub date: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub level: u64,
}

impl From<&TransactionRecord> for DonationDto {
    fn from(row: &TransactionRecord) -> Self {
        Self {
            transaction_hash: row.transaction_hash.to_string(),
            method: row.method,
            block: row.block,
            date: iso_date(&row.date),
            amount: row.amount,
            level: row.level,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoluntaryDonationDto {
    pub transaction_hash: String,
    pub method: Method,
    pub block: u64,
    pub date: String,
    pub from: Address,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    #[serde(with = "rust_decimal::serde::float_option")]
    pub reserve_pool: Option<Decimal>,
}

impl From<&TransactionRecord> for VoluntaryDonationDto {
    fn from(row: &TransactionRecord) -> Self {
        Self {
            transaction_hash: row.transaction_hash.to_string(),
            method: row.method,
            block: row.block,
            date: iso_date(&row.date),
            from: row.from,
            amount: row.amount,
            reserve_pool: row.reserve_pool,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HelpTransactionDto {
    pub transaction_hash: String,
    pub method: Method,
    pub block: u64,
    pub date: String,
    pub from: Address,
    pub to: Address,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub token: Token,
    pub level: u64,
}

impl From<&TransactionRecord> for HelpTransactionDto {
    fn from(row: &TransactionRecord) -> Self {
        Self {
            transaction_hash: row.transaction_hash.to_string(),
            method: row.method,
            block: row.block,
            date: iso_date(&row.date),
            from: row.from,
            to: row.to,
            amount: row.amount,
            token: row.token,
            level: row.level,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractStatsDto {
    pub total_users: u64,
    #[serde(with = "rust_decimal::serde::float")]
    pub total_donations: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub total_voluntary_donations: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub total_incentives: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub contract_balance_usdt: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub contract_balance_help: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HelpPriceDto {
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LevelAmountDto {
    pub level: u64,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
}

/// Spending approval an owner has granted the scheme contract.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllowanceDto {
    pub owner: Address,
    pub token: Token,
    #[serde(with = "rust_decimal::serde::float")]
    pub allowance: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OwnerDto {
    pub owner: Address,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthDto {
    pub status: &'static str,
    pub sync: SyncStatus,
}

/// Query-side entry points shared by every route.
#[derive(Clone)]
pub struct ApiState {
    sync: Arc<Synchronizer>,
}

impl ApiState {
    pub fn new(sync: Arc<Synchronizer>) -> Self {
        Self { sync }
    }

    fn store(&self) -> &Arc<dyn Store> {
        self.sync.reconciler().store()
    }

    fn reader(&self) -> &ContractReader {
        self.sync.reconciler().reader()
    }

    fn selector(&self) -> &Arc<EndpointSelector> {
        self.sync.scanner().selector()
    }

    fn owner(&self) -> Address {
        self.sync.settings().owner
    }

    fn require_owner(&self, requester: Option<&str>) -> Result<Address, IndexerError> {
        let requester = parse_address(requester.unwrap_or_default())?;
        if requester != self.owner() {
            return Err(IndexerError::Unauthorized(requester));
        }
        Ok(requester)
    }

    /// Stored user row, created on first lookup and refreshed from chain.
    ///
    /// `queuePosition` is the contract's own queue index while the user is queued,
    /// not the user's rank among stored rows. Only the chain-read columns are
    /// written back, so a sync pass landing mid-request keeps its event fields.
    pub async fn user_info(&self, raw_address: &str) -> Result<UserInfoDto, IndexerError> {
        let address = parse_address(raw_address)?;
        let conn = self.selector().acquire().await?;

        if self.store().find_user(address).await?.is_none() {
            let mut user = User::new(address);
            user.entry_fee = self.reader().entry_fee(conn.as_ref()).await?;
            if self.store().insert_user(&user).await? {
                info!(user = %address, "created user on first lookup");
            }
        }

        let queue = self.reader().queue_info(conn.as_ref(), address).await?;
        let state = ChainState {
            is_in_queue: queue.is_in_queue,
            queue_position: if queue.is_in_queue {
                queue.queue_position
            } else {
                0
            },
            locked_amount: queue.locked_amount,
            unlock_timestamp: queue.unlock_timestamp,
            help_balance: self
                .sync
                .reconciler()
                .help_balance_or_zero(conn.as_ref(), address)
                .await,
            referrals: self.store().count_referrals(address).await?,
        };
        let user = self
            .store()
            .refresh_chain_state(address, &state)
            .await?
            .ok_or_else(|| eyre!("user {address} vanished during lookup"))?;

        debug!(user = %address, referrals = user.referrals, "served user info");
        Ok(UserInfoDto::from(&user))
    }

    pub async fn users(&self) -> Result<Vec<UserAddressDto>, IndexerError> {
        let users = self.store().list_users().await?;
        Ok(users
            .into_iter()
            .map(|address| UserAddressDto { address })
            .collect())
    }

    pub async fn help_price(&self) -> Result<HelpPriceDto, IndexerError> {
        let conn = self.selector().acquire().await?;
        let price = self.reader().help_price(conn.as_ref()).await?;
        Ok(HelpPriceDto { price })
    }

    /// USDT needed to donate at `level`.
    pub async fn level_amount(&self, level: u64) -> Result<LevelAmountDto, IndexerError> {
        let conn = self.selector().acquire().await?;
        let amount = self.reader().level_amount(conn.as_ref(), level).await?;
        Ok(LevelAmountDto { level, amount })
    }

    pub async fn allowance(
        &self,
        raw_owner: &str,
        raw_token: &str,
    ) -> Result<AllowanceDto, IndexerError> {
        let owner = parse_address(raw_owner)?;
        let token: Token = raw_token
            .parse()
            .map_err(|_| IndexerError::InvalidInput(format!("unknown token {raw_token:?}")))?;
        let (address, decimals) = match token {
            Token::Usdt => (self.reader().usdt_token, units::USDT_DECIMALS),
            Token::Help => (self.reader().help_token, units::HELP_DECIMALS),
            Token::NotApplicable => {
                return Err(IndexerError::InvalidInput(format!("{token} has no allowance")))
            }
        };
        let conn = self.selector().acquire().await?;
        let raw = self.reader().allowance(conn.as_ref(), address, owner).await?;
        Ok(AllowanceDto {
            owner,
            token,
            allowance: units::to_decimal(raw, decimals)?,
        })
    }

    pub fn owner_info(&self) -> OwnerDto {
        OwnerDto {
            owner: self.owner(),
        }
    }

    async fn rows(&self, query: TransactionQuery) -> Result<Vec<TransactionRecord>, IndexerError> {
        Ok(self.store().list_transactions(&query).await?)
    }

    /// Rows where the address is sender or recipient.
    pub async fn transactions(&self, raw_address: &str) -> Result<Vec<TransactionDto>, IndexerError> {
        let address = parse_address(raw_address)?;
        let rows = self
            .rows(TransactionQuery {
                address: Some(AddressMatch::Either(address)),
                ..Default::default()
            })
            .await?;
        Ok(rows.iter().map(TransactionDto::from).collect())
    }

    pub async fn user_donations(&self, raw_address: &str) -> Result<Vec<DonationDto>, IndexerError> {
        let address = parse_address(raw_address)?;
        let rows = self
            .rows(TransactionQuery {
                address: Some(AddressMatch::Sender(address)),
                method: Some(Method::DonationReceived),
                ..Default::default()
            })
            .await?;
        Ok(rows.iter().map(DonationDto::from).collect())
    }

    pub async fn voluntary_donations(
        &self,
        raw_address: &str,
    ) -> Result<Vec<VoluntaryDonationDto>, IndexerError> {
        let address = parse_address(raw_address)?;
        let rows = self
            .rows(TransactionQuery {
                address: Some(AddressMatch::Sender(address)),
                method: Some(Method::VoluntaryDonation),
                ..Default::default()
            })
            .await?;
        Ok(rows.iter().map(VoluntaryDonationDto::from).collect())
    }

    pub async fn help_transactions(
        &self,
        raw_address: &str,
    ) -> Result<Vec<HelpTransactionDto>, IndexerError> {
        let address = parse_address(raw_address)?;
        let rows = self
            .rows(TransactionQuery {
                address: Some(AddressMatch::Either(address)),
                token: Some(Token::Help),
                ..Default::default()
            })
            .await?;
        Ok(rows.iter().map(HelpTransactionDto::from).collect())
    }

    pub async fn all_contract_transactions(&self) -> Result<Vec<TransactionDto>, IndexerError> {
        let rows = self.rows(TransactionQuery::default()).await?;
        Ok(rows.iter().map(TransactionDto::from).collect())
    }

    /// Owner-only aggregate view: in-memory counters plus live contract balances.
    pub async fn contract_stats(
        &self,
        requester: Option<&str>,
    ) -> Result<ContractStatsDto, IndexerError> {
        self.require_owner(requester)?;
        let conn = self.selector().acquire().await?;
        let contract = self.reader().contract;
        let contract_balance_usdt = self.reader().usdt_balance(conn.as_ref(), contract).await?;
        let contract_balance_help = self.reader().help_balance(conn.as_ref(), contract).await?;
        let counters = self.sync.counters();
        Ok(ContractStatsDto {
            total_users: counters.total_users,
            total_donations: counters.total_donations,
            total_voluntary_donations: counters.total_voluntary_donations,
            total_incentives: counters.total_incentives,
            contract_balance_usdt,
            contract_balance_help,
        })
    }

    pub async fn sync(&self, requester: Option<&str>) -> Result<SyncOutcome, IndexerError> {
        self.sync.manual_sync(requester.unwrap_or_default()).await
    }

    pub fn health(&self) -> HealthDto {
        HealthDto {
            status: "ok",
            sync: self.sync.status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCounterCache;
    use crate::storage::MemoryStore;
    use crate::test_utils::{
        contract_address, help_units, synchronizer, usdt_units, MockRpc, ENTRY_FEE_USDT, OWNER,
    };
    use alloy_primitives::B256;

    struct Fixture {
        mock: Arc<MockRpc>,
        store: Arc<MemoryStore>,
        api: ApiState,
    }

    fn fixture() -> Fixture {
        let mock = Arc::new(MockRpc::new(5));
        mock.set_head(2_000);
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCounterCache::new());
        let sync = Arc::new(synchronizer(&mock, store.clone(), cache, 1_000));
        Fixture {
            mock,
            store,
            api: ApiState::new(sync),
        }
    }

    fn row(hash: u8, method: Method, from: Address, token: Token, secs: i64) -> TransactionRecord {
        TransactionRecord {
            transaction_hash: B256::repeat_byte(hash),
            method,
            block: 1_000 + secs as u64,
            date: DateTime::from_timestamp(1_700_000_000 + secs, 0).expect("date"),
            from,
            to: contract_address(),
            amount: Decimal::ONE,
            token,
            level: 1,
            reserve_pool: None,
        }
    }

    #[test]
    fn iso_dates_use_millis_and_z() {
        let date = DateTime::from_timestamp(1_704_067_200, 0).expect("date");
        assert_eq!(iso_date(&date), "2024-01-01T00:00:00.000Z");
    }

    #[tokio::test]
    async fn user_info_creates_and_refreshes() {
        let f = fixture();
        let user = Address::repeat_byte(0x11);
        f.mock.set_token_balance(crate::test_utils::help_token(), user, help_units(7));
        let mut referred = User::new(Address::repeat_byte(0x22));
        referred.sponsor = user;
        f.store.save_user(&referred).await.expect("save");

        let info = f.api.user_info(&user.to_string()).await.expect("user info");
        assert!(!info.is_registered);
        assert_eq!(info.entry_fee, Decimal::from(ENTRY_FEE_USDT));
        assert_eq!(info.help_balance, Decimal::from(7));
        assert_eq!(info.referrals, 1);
        assert_eq!(info.registration_date, "");

        let stored = f.store.find_user(user).await.expect("find").expect("created");
        assert_eq!(stored.referrals, 1);
        assert_eq!(stored.help_balance, Decimal::from(7));
    }

    #[tokio::test]
    async fn user_info_leaves_event_fields_of_existing_user() {
        let f = fixture();
        let user = Address::repeat_byte(0x12);
        let mut stored = User::new(user);
        stored.is_registered = true;
        stored.sponsor = Address::repeat_byte(0x13);
        stored.current_level = 3;
        stored.balance = Decimal::from(30);
        stored.donations_received = 2;
        stored.entry_fee = Decimal::from(15);
        f.store.save_user(&stored).await.expect("save");

        let info = f.api.user_info(&user.to_string()).await.expect("user info");
        assert_eq!(info.current_level, 3);
        assert_eq!(info.balance, Decimal::from(30));
        assert_eq!(info.entry_fee, Decimal::from(15));
        assert_eq!(info.sponsor, Address::repeat_byte(0x13));

        let after = f.store.find_user(user).await.expect("find").expect("user");
        assert_eq!(after, stored);
    }

    #[tokio::test]
    async fn user_info_rejects_bad_address_before_rpc() {
        let f = fixture();
        let err = f.api.user_info("0x1234").await.expect_err("malformed");
        assert_eq!(err.kind(), "invalid_input");
        assert_eq!(f.mock.chain_id_calls(), 0);
    }

    #[tokio::test]
    async fn listings_apply_their_filters() {
        let f = fixture();
        let alice = Address::repeat_byte(0xa1);
        let bob = Address::repeat_byte(0xb0);
        for record in [
            row(1, Method::DonationReceived, alice, Token::Usdt, 10),
            row(2, Method::VoluntaryDonation, alice, Token::Usdt, 20),
            row(3, Method::Withdrawal, alice, Token::Help, 30),
            row(4, Method::DonationReceived, bob, Token::Usdt, 40),
        ] {
            f.store.insert_transaction(&record).await.expect("insert");
        }
        let alice_raw = alice.to_string();

        let all = f.api.transactions(&alice_raw).await.expect("transactions");
        let hashes: Vec<_> = all.iter().map(|dto| dto.transaction_hash.clone()).collect();
        assert_eq!(
            hashes,
            vec![
                B256::repeat_byte(3).to_string(),
                B256::repeat_byte(2).to_string(),
                B256::repeat_byte(1).to_string(),
            ]
        );

        let donations = f.api.user_donations(&alice_raw).await.expect("donations");
        assert_eq!(donations.len(), 1);
        assert_eq!(donations[0].method, Method::DonationReceived);

        let voluntary = f.api.voluntary_donations(&alice_raw).await.expect("voluntary");
        assert_eq!(voluntary.len(), 1);

        let help = f.api.help_transactions(&alice_raw).await.expect("help");
        assert_eq!(help.len(), 1);
        assert_eq!(help[0].token, Token::Help);

        assert_eq!(f.api.all_contract_transactions().await.expect("all").len(), 4);
    }

    #[tokio::test]
    async fn contract_stats_is_owner_only() {
        let f = fixture();
        f.mock
            .set_token_balance(crate::test_utils::usdt_token(), contract_address(), usdt_units(250));
        f.mock
            .set_token_balance(crate::test_utils::help_token(), contract_address(), help_units(3));

        let stranger = Address::repeat_byte(0x42).to_string();
        assert!(matches!(
            f.api.contract_stats(Some(&stranger)).await,
            Err(IndexerError::Unauthorized(_))
        ));
        assert!(matches!(
            f.api.contract_stats(None).await,
            Err(IndexerError::InvalidInput(_))
        ));

        let stats = f
            .api
            .contract_stats(Some(&OWNER.to_string()))
            .await
            .expect("owner stats");
        assert_eq!(stats.contract_balance_usdt, Decimal::from(250));
        assert_eq!(stats.contract_balance_help, Decimal::from(3));
        assert_eq!(stats.total_users, 0);
    }

    #[tokio::test]
    async fn level_amount_and_allowance_are_read_from_chain() {
        let f = fixture();
        let price = f.api.help_price().await.expect("help price");
        assert_eq!(price.price, Decimal::new(5, 1));

        let level = f.api.level_amount(3).await.expect("level amount");
        assert_eq!(level.amount, Decimal::from(crate::test_utils::LEVEL_STEP_USDT * 3));

        let owner = Address::repeat_byte(0x12);
        f.mock.set_allowance(crate::test_utils::usdt_token(), owner, usdt_units(15));
        let allowance = f
            .api
            .allowance(&owner.to_string(), "USDT")
            .await
            .expect("allowance");
        assert_eq!(allowance.allowance, Decimal::from(15));

        assert!(matches!(
            f.api.allowance(&owner.to_string(), "N/A").await,
            Err(IndexerError::InvalidInput(_))
        ));
    }

    #[test]
    fn amounts_serialize_as_numbers() {
        let dto = HelpPriceDto {
            price: Decimal::new(125, 2),
        };
        assert_eq!(
            serde_json::to_value(&dto).expect("json"),
            serde_json::json!({ "price": 1.25 })
        );
    }

    #[test]
    fn transaction_dto_uses_camel_case() {
        let record = row(9, Method::LevelUp, Address::repeat_byte(1), Token::NotApplicable, 0);
        let value = serde_json::to_value(TransactionDto::from(&record)).expect("json");
        assert_eq!(value["method"], "LevelUp");
        assert_eq!(value["token"], "N/A");
        assert!(value.get("transactionHash").is_some());
        assert!(value["reservePool"].is_null());
    }
}
