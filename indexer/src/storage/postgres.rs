//! Postgres-backed store.

use super::{
    decode_json, encode_json, hex_key, AddressMatch, ChainState, Store, StoredIdentity,
    TransactionQuery, TransactionRecord, User,
};
use crate::cache::{CounterCache, CounterSnapshot};
use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use sqlx::{
    postgres::{PgPoolOptions, PgRow},
    PgPool, Postgres, QueryBuilder, Row,
};
use tracing::info;

const META_IDENTITY_KEY: &str = "identity";
const META_COUNTERS_KEY: &str = "counters";

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        address TEXT PRIMARY KEY,
        sponsor TEXT NOT NULL,
        is_registered BOOLEAN NOT NULL,
        current_level BIGINT NOT NULL,
        referrals BIGINT NOT NULL,
        balance NUMERIC NOT NULL,
        donations_received BIGINT NOT NULL,
        has_donated BOOLEAN NOT NULL,
        queue_position BIGINT NOT NULL,
        is_in_queue BOOLEAN NOT NULL,
        locked_amount NUMERIC NOT NULL,
        unlock_timestamp BIGINT NOT NULL,
        help_balance NUMERIC NOT NULL,
        entry_fee NUMERIC NOT NULL,
        registration_date TIMESTAMPTZ
    )",
    "CREATE INDEX IF NOT EXISTS users_sponsor_idx ON users (sponsor)",
    "CREATE TABLE IF NOT EXISTS transactions (
        transaction_hash TEXT PRIMARY KEY,
        method TEXT NOT NULL,
        block BIGINT NOT NULL,
        date TIMESTAMPTZ NOT NULL,
        from_address TEXT NOT NULL,
        to_address TEXT NOT NULL,
        amount NUMERIC NOT NULL,
        token TEXT NOT NULL,
        level BIGINT NOT NULL,
        reserve_pool NUMERIC
    )",
    "CREATE INDEX IF NOT EXISTS transactions_from_idx ON transactions (from_address)",
    "CREATE INDEX IF NOT EXISTS transactions_to_idx ON transactions (to_address)",
    "CREATE TABLE IF NOT EXISTS sync_meta (
        key TEXT PRIMARY KEY,
        value BYTEA NOT NULL
    )",
];

const USER_COLUMNS: &str = "address, sponsor, is_registered, current_level, referrals, balance, \
    donations_received, has_donated, queue_position, is_in_queue, locked_amount, \
    unlock_timestamp, help_balance, entry_fee, registration_date";

const TRANSACTION_COLUMNS: &str = "transaction_hash, method, block, date, from_address, \
    to_address, amount, token, level, reserve_pool";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connects, creates missing tables, and checks the stored chain identity.
    pub async fn connect(url: &str, chain_id: u64, contract: Address) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(url)
            .await
            .wrap_err("failed to connect to postgres")?;
        let store = Self { pool };
        store.bootstrap(StoredIdentity::new(chain_id, contract)).await?;
        Ok(store)
    }

    async fn bootstrap(&self, expected: StoredIdentity) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .wrap_err("failed to create schema")?;
        }

        match self.read_meta(META_IDENTITY_KEY).await? {
            None => {
                self.write_meta(META_IDENTITY_KEY, encode_json(&expected)?).await?;
                info!(
                    chain_id = expected.chain_id,
                    contract = %expected.contract,
                    "initialized storage metadata"
                );
            }
            Some(bytes) => {
                let stored: StoredIdentity = decode_json(bytes)?;
                stored.check(&expected)?;
            }
        }
        Ok(())
    }

    /// Inserts a full user row with the given conflict clause. Returns rows affected.
    async fn write_user(&self, user: &User, on_conflict: &str) -> Result<u64> {
        let result = sqlx::query(&format!(
            "INSERT INTO users ({USER_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
             {on_conflict}"
        ))
        .bind(hex_key(user.address))
        .bind(hex_key(user.sponsor))
        .bind(user.is_registered)
        .bind(to_i64(user.current_level, "current_level")?)
        .bind(to_i64(user.referrals, "referrals")?)
        .bind(user.balance)
        .bind(to_i64(user.donations_received, "donations_received")?)
        .bind(user.has_donated)
        .bind(to_i64(user.queue_position, "queue_position")?)
        .bind(user.is_in_queue)
        .bind(user.locked_amount)
        .bind(to_i64(user.unlock_timestamp, "unlock_timestamp")?)
        .bind(user.help_balance)
        .bind(user.entry_fee)
        .bind(user.registration_date)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn read_meta(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as("SELECT value FROM sync_meta WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .wrap_err_with(|| format!("failed to read metadata {key}"))?;
        Ok(row.map(|(value,)| value))
    }

    async fn write_meta(&self, key: &str, value: Vec<u8>) -> Result<()> {
        sqlx::query(
            "INSERT INTO sync_meta (key, value) VALUES ($1, $2)
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .wrap_err_with(|| format!("failed to write metadata {key}"))?;
        Ok(())
    }
}

fn to_i64(value: u64, field: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| eyre!("{field} value {value} exceeds BIGINT"))
}

fn to_u64(value: i64, field: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| eyre!("negative {field} value {value} in database"))
}

fn parse_address(raw: &str) -> Result<Address> {
    raw.parse()
        .map_err(|err| eyre!("invalid address {raw:?} in database: {err}"))
}

fn user_from_row(row: &PgRow) -> Result<User> {
    Ok(User {
        address: parse_address(row.try_get("address")?)?,
        sponsor: parse_address(row.try_get("sponsor")?)?,
        is_registered: row.try_get("is_registered")?,
        current_level: to_u64(row.try_get("current_level")?, "current_level")?,
        referrals: to_u64(row.try_get("referrals")?, "referrals")?,
        balance: row.try_get("balance")?,
        donations_received: to_u64(row.try_get("donations_received")?, "donations_received")?,
        has_donated: row.try_get("has_donated")?,
        queue_position: to_u64(row.try_get("queue_position")?, "queue_position")?,
        is_in_queue: row.try_get("is_in_queue")?,
        locked_amount: row.try_get("locked_amount")?,
        unlock_timestamp: to_u64(row.try_get("unlock_timestamp")?, "unlock_timestamp")?,
        help_balance: row.try_get("help_balance")?,
        entry_fee: row.try_get("entry_fee")?,
        registration_date: row.try_get("registration_date")?,
    })
}

fn transaction_from_row(row: &PgRow) -> Result<TransactionRecord> {
    let hash: &str = row.try_get("transaction_hash")?;
    let method: &str = row.try_get("method")?;
    let token: &str = row.try_get("token")?;
    Ok(TransactionRecord {
        transaction_hash: hash
            .parse::<B256>()
            .map_err(|err| eyre!("invalid transaction hash {hash:?} in database: {err}"))?,
        method: method.parse()?,
        block: to_u64(row.try_get("block")?, "block")?,
        date: row.try_get("date")?,
        from: parse_address(row.try_get("from_address")?)?,
        to: parse_address(row.try_get("to_address")?)?,
        amount: row.try_get("amount")?,
        token: token.parse()?,
        level: to_u64(row.try_get("level")?, "level")?,
        reserve_pool: row.try_get("reserve_pool")?,
    })
}

/// `SELECT` for `query`, newest rows first.
fn transaction_list_query(query: &TransactionQuery) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::<Postgres>::new(format!(
        "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE TRUE"
    ));
    if let Some(filter) = query.address {
        push_address_filter(&mut builder, filter);
    }
    if let Some(token) = query.token {
        builder.push(" AND token = ").push_bind(token.as_str());
    }
    if let Some(method) = query.method {
        builder.push(" AND method = ").push_bind(method.as_str());
    }
    builder.push(" ORDER BY date DESC, block DESC");
    builder
}

fn push_address_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: AddressMatch) {
    match filter {
        AddressMatch::Either(address) => {
            let key = hex_key(address);
            builder
                .push(" AND (from_address = ")
                .push_bind(key.clone())
                .push(" OR to_address = ")
                .push_bind(key)
                .push(")");
        }
        AddressMatch::Sender(address) => {
            builder.push(" AND from_address = ").push_bind(hex_key(address));
        }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn find_user(&self, address: Address) -> Result<Option<User>> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE address = $1"))
            .bind(hex_key(address))
            .fetch_optional(&self.pool)
            .await
            .wrap_err_with(|| format!("failed to load user {address}"))?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn save_user(&self, user: &User) -> Result<()> {
        self.write_user(
            user,
            "ON CONFLICT (address) DO UPDATE SET
                sponsor = EXCLUDED.sponsor,
                is_registered = EXCLUDED.is_registered,
                current_level = EXCLUDED.current_level,
                referrals = EXCLUDED.referrals,
                balance = EXCLUDED.balance,
                donations_received = EXCLUDED.donations_received,
                has_donated = EXCLUDED.has_donated,
                queue_position = EXCLUDED.queue_position,
                is_in_queue = EXCLUDED.is_in_queue,
                locked_amount = EXCLUDED.locked_amount,
                unlock_timestamp = EXCLUDED.unlock_timestamp,
                help_balance = EXCLUDED.help_balance,
                entry_fee = EXCLUDED.entry_fee,
                registration_date = EXCLUDED.registration_date",
        )
        .await
        .wrap_err_with(|| format!("failed to save user {}", user.address))?;
        Ok(())
    }

    async fn insert_user(&self, user: &User) -> Result<bool> {
        let inserted = self
            .write_user(user, "ON CONFLICT (address) DO NOTHING")
            .await
            .wrap_err_with(|| format!("failed to insert user {}", user.address))?;
        Ok(inserted == 1)
    }

    async fn refresh_chain_state(
        &self,
        address: Address,
        state: &ChainState,
    ) -> Result<Option<User>> {
        let row = sqlx::query(&format!(
            "UPDATE users SET
                is_in_queue = $2,
                queue_position = $3,
                locked_amount = $4,
                unlock_timestamp = $5,
                help_balance = $6,
                referrals = $7
             WHERE address = $1
             RETURNING {USER_COLUMNS}"
        ))
        .bind(hex_key(address))
        .bind(state.is_in_queue)
        .bind(to_i64(state.queue_position, "queue_position")?)
        .bind(state.locked_amount)
        .bind(to_i64(state.unlock_timestamp, "unlock_timestamp")?)
        .bind(state.help_balance)
        .bind(to_i64(state.referrals, "referrals")?)
        .fetch_optional(&self.pool)
        .await
        .wrap_err_with(|| format!("failed to refresh user {address}"))?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn list_users(&self) -> Result<Vec<Address>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT address FROM users ORDER BY address")
            .fetch_all(&self.pool)
            .await
            .wrap_err("failed to list users")?;
        rows.iter().map(|(raw,)| parse_address(raw)).collect()
    }

    async fn count_referrals(&self, sponsor: Address) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users WHERE sponsor = $1")
            .bind(hex_key(sponsor))
            .fetch_one(&self.pool)
            .await
            .wrap_err_with(|| format!("failed to count referrals of {sponsor}"))?;
        to_u64(count, "referrals")
    }

    async fn transaction_exists(&self, hash: B256) -> Result<bool> {
        let row: Option<(i32,)> =
            sqlx::query_as("SELECT 1 FROM transactions WHERE transaction_hash = $1")
                .bind(hex_key(hash))
                .fetch_optional(&self.pool)
                .await
                .wrap_err_with(|| format!("failed to look up transaction {hash}"))?;
        Ok(row.is_some())
    }

    async fn insert_transaction(&self, record: &TransactionRecord) -> Result<bool> {
        let result = sqlx::query(&format!(
            "INSERT INTO transactions ({TRANSACTION_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (transaction_hash) DO NOTHING"
        ))
        .bind(hex_key(record.transaction_hash))
        .bind(record.method.as_str())
        .bind(to_i64(record.block, "block")?)
        .bind(record.date)
        .bind(hex_key(record.from))
        .bind(hex_key(record.to))
        .bind(record.amount)
        .bind(record.token.as_str())
        .bind(to_i64(record.level, "level")?)
        .bind(record.reserve_pool)
        .execute(&self.pool)
        .await
        .wrap_err_with(|| format!("failed to insert transaction {}", record.transaction_hash))?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_transactions(&self, query: &TransactionQuery) -> Result<Vec<TransactionRecord>> {
        let mut builder = transaction_list_query(query);
        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .wrap_err("failed to list transactions")?;
        rows.iter().map(transaction_from_row).collect()
    }
}

#[async_trait]
impl CounterCache for PgStore {
    async fn load(&self) -> Result<Option<CounterSnapshot>> {
        self.read_meta(META_COUNTERS_KEY)
            .await?
            .map(decode_json::<CounterSnapshot>)
            .transpose()
    }

    async fn store(&self, snapshot: &CounterSnapshot) -> Result<()> {
        self.write_meta(META_COUNTERS_KEY, encode_json(snapshot)?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Counters;
    use crate::contract::units::Token;
    use crate::storage::Method;
    use chrono::DateTime;
    use rust_decimal::Decimal;

    /// Scratch database for the round-trip test. Its tables are dropped first.
    const TEST_DATABASE_ENV: &str = "HELP_INDEXER_TEST_DATABASE_URL";

    #[test]
    fn unfiltered_listing_orders_newest_first() {
        let builder = transaction_list_query(&TransactionQuery::default());
        assert_eq!(
            builder.sql(),
            format!(
                "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE TRUE \
                 ORDER BY date DESC, block DESC"
            )
        );
    }

    #[test]
    fn listing_filters_bind_in_order() {
        let alice = Address::repeat_byte(0xa1);
        let either = transaction_list_query(&TransactionQuery {
            address: Some(AddressMatch::Either(alice)),
            token: Some(Token::Help),
            method: None,
        });
        assert!(either.sql().ends_with(
            "WHERE TRUE AND (from_address = $1 OR to_address = $2) AND token = $3 \
             ORDER BY date DESC, block DESC"
        ));

        let sender = transaction_list_query(&TransactionQuery {
            address: Some(AddressMatch::Sender(alice)),
            token: None,
            method: Some(Method::DonationReceived),
        });
        assert!(sender.sql().ends_with(
            "WHERE TRUE AND from_address = $1 AND method = $2 ORDER BY date DESC, block DESC"
        ));
    }

    async fn scratch_store(url: &str, contract: Address) -> PgStore {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await
            .expect("connect");
        for table in ["users", "transactions", "sync_meta"] {
            sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
                .execute(&pool)
                .await
                .expect("drop");
        }
        PgStore::connect(url, 5, contract).await.expect("store")
    }

    #[tokio::test]
    async fn round_trip_against_database() {
        let Ok(url) = std::env::var(TEST_DATABASE_ENV) else {
            return;
        };
        let contract = Address::repeat_byte(0xc0);
        let store = scratch_store(&url, contract).await;

        let alice = Address::repeat_byte(0xa1);
        let mut user = User::new(alice);
        user.balance = Decimal::new(30_500_000, 6);
        user.registration_date = DateTime::from_timestamp(1_700_000_000, 0);
        assert!(store.insert_user(&user).await.unwrap());
        assert!(!store.insert_user(&User::new(alice)).await.unwrap());

        let state = ChainState {
            is_in_queue: true,
            queue_position: 3,
            locked_amount: Decimal::from(2),
            unlock_timestamp: 1_800_000_000,
            help_balance: Decimal::new(15, 1),
            referrals: 1,
        };
        let refreshed = store
            .refresh_chain_state(alice, &state)
            .await
            .unwrap()
            .expect("user");
        assert_eq!(refreshed.balance, user.balance);
        assert_eq!(refreshed.registration_date, user.registration_date);
        assert_eq!(refreshed.queue_position, 3);
        assert_eq!(store.find_user(alice).await.unwrap(), Some(refreshed));

        let record = TransactionRecord {
            transaction_hash: B256::repeat_byte(7),
            method: Method::VoluntaryDonation,
            block: 1_200,
            date: DateTime::from_timestamp(1_700_000_100, 0).expect("date"),
            from: alice,
            to: contract,
            amount: Decimal::from(5),
            token: Token::Usdt,
            level: 1,
            reserve_pool: Some(Decimal::new(125, 2)),
        };
        assert!(store.insert_transaction(&record).await.unwrap());
        assert!(!store.insert_transaction(&record).await.unwrap());
        let listed = store
            .list_transactions(&TransactionQuery {
                address: Some(AddressMatch::Either(contract)),
                token: Some(Token::Usdt),
                method: Some(Method::VoluntaryDonation),
            })
            .await
            .unwrap();
        assert_eq!(listed, vec![record]);

        assert!(store.load().await.unwrap().is_none());
        let snapshot = CounterSnapshot {
            counters: Counters {
                total_users: 4,
                total_donations: Decimal::new(405, 1),
                ..Default::default()
            },
            counted_through_block: 1_250,
        };
        store.store(&snapshot).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(snapshot));

        let err = PgStore::connect(&url, 6, contract).await.expect_err("wrong chain");
        assert!(format!("{err:#}").contains("chain_id mismatch"));
        let err = PgStore::connect(&url, 5, Address::repeat_byte(0xc1))
            .await
            .expect_err("wrong contract");
        assert!(format!("{err:#}").contains("contract mismatch"));
    }
}
