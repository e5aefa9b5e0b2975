use crate::cache::MemoryCounterCache;
use crate::cli::{
    IndexerConfig, DEFAULT_API_BIND, DEFAULT_COUNTER_LOOKBACK_BLOCKS, DEFAULT_DEPLOYMENT_BLOCK,
    DEFAULT_LOG_JSON_FILTER, DEFAULT_MAX_BLOCK_RANGE, DEFAULT_POLL_INTERVAL_SECS,
    DEFAULT_RPC_TIMEOUT_SECS,
};
use crate::contract::{ContractReader, EventKind, IHelpContract, IERC20};
use crate::rpc::{EndpointSelector, EvmRpc, LogFilter, RpcLog};
use crate::storage::MemoryStore;
use crate::sync::{Reconciler, Scanner, SyncSettings, Synchronizer};
use alloy_primitives::{address, Address, Bytes, B256, U256, U64};
use alloy_sol_types::{SolCall, SolEvent, SolValue};
use async_trait::async_trait;
use eyre::{eyre, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const OWNER: Address = address!("8617e340b3d01fa5f11f306f4090fd50e238070d");
/// Entry fee the mock contract reports, in whole USDT.
pub const ENTRY_FEE_USDT: u64 = 20;
/// `levelAmounts(n)` on the mock is `n` times this, in whole USDT.
pub const LEVEL_STEP_USDT: u64 = 10;
/// 0.5 USD at 8 decimals.
pub const HELP_PRICE_RAW: u64 = 50_000_000;

pub fn contract_address() -> Address {
    Address::repeat_byte(0xc0)
}

pub fn usdt_token() -> Address {
    Address::repeat_byte(0xd0)
}

pub fn help_token() -> Address {
    Address::repeat_byte(0xe0)
}

pub fn usdt_units(whole: u64) -> U256 {
    U256::from(whole) * U256::from(10u64).pow(U256::from(6u64))
}

pub fn help_units(whole: u64) -> U256 {
    U256::from(whole) * U256::from(10u64).pow(U256::from(18u64))
}

pub fn reader() -> ContractReader {
    ContractReader {
        contract: contract_address(),
        usdt_token: usdt_token(),
        help_token: help_token(),
    }
}

/// Position of a fabricated log.
#[derive(Debug, Clone, Copy)]
pub struct LogMeta {
    pub block: u64,
    pub tx: B256,
    pub log_index: u64,
}

impl LogMeta {
    pub fn at(block: u64, tx_byte: u8) -> Self {
        Self {
            block,
            tx: B256::repeat_byte(tx_byte),
            log_index: 0,
        }
    }
}

/// Encodes `event` as emitted by the mock contract.
pub fn event_log<E: SolEvent>(event: &E, meta: LogMeta) -> RpcLog {
    RpcLog {
        address: contract_address(),
        topics: event
            .encode_topics()
            .into_iter()
            .map(|topic| B256::from(topic.0))
            .collect(),
        data: Bytes::from(event.encode_data()),
        block_number: Some(U64::from(meta.block)),
        transaction_hash: Some(meta.tx),
        log_index: Some(U64::from(meta.log_index)),
    }
}

pub fn synchronizer(
    mock: &Arc<MockRpc>,
    store: Arc<MemoryStore>,
    cache: Arc<MemoryCounterCache>,
    deployment_block: u64,
) -> Synchronizer {
    let selector = EndpointSelector::new(mock.clone(), None, mock.chain_id_value());
    let scanner = Scanner::new(Arc::new(selector), contract_address(), 5_000);
    let reconciler = Reconciler::new(store, reader());
    Synchronizer::new(
        scanner,
        reconciler,
        cache,
        SyncSettings {
            owner: OWNER,
            deployment_block,
            counter_lookback_blocks: DEFAULT_COUNTER_LOOKBACK_BLOCKS,
            poll_interval: Duration::from_millis(20),
        },
    )
}

pub fn base_config() -> IndexerConfig {
    IndexerConfig {
        rpc_url: "http://127.0.0.1:8545".to_string(),
        rpc_url_alternative: None,
        contract_address: contract_address(),
        owner_address: OWNER,
        database_url: None,
        api_bind: DEFAULT_API_BIND.parse().expect("valid bind"),
        port: None,
        chain_id: 5,
        deployment_block: DEFAULT_DEPLOYMENT_BLOCK,
        max_block_range: DEFAULT_MAX_BLOCK_RANGE,
        poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
        counter_lookback_blocks: DEFAULT_COUNTER_LOOKBACK_BLOCKS,
        rpc_timeout_secs: DEFAULT_RPC_TIMEOUT_SECS,
        verbosity: 0,
        log_json: None,
        log_json_filter: DEFAULT_LOG_JSON_FILTER.to_string(),
    }
}

/// Scripted in-process endpoint serving the scheme contract and both tokens.
pub struct MockRpc {
    label: String,
    chain_id: u64,
    fail_chain_id: AtomicBool,
    chain_id_calls: AtomicU64,
    head: AtomicU64,
    logs: Mutex<Vec<RpcLog>>,
    log_requests: Mutex<Vec<LogFilter>>,
    failing_topics: Mutex<HashSet<B256>>,
    timestamps: Mutex<HashMap<u64, u64>>,
    block_requests: AtomicU64,
    balances: Mutex<HashMap<(Address, Address), U256>>,
    allowances: Mutex<HashMap<(Address, Address), U256>>,
    fail_calls: AtomicBool,
}

impl MockRpc {
    pub fn new(chain_id: u64) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(0);
        Self {
            label: format!("mock-{}", NEXT_ID.fetch_add(1, Ordering::SeqCst)),
            chain_id,
            fail_chain_id: AtomicBool::new(false),
            chain_id_calls: AtomicU64::new(0),
            head: AtomicU64::new(0),
            logs: Mutex::new(Vec::new()),
            log_requests: Mutex::new(Vec::new()),
            failing_topics: Mutex::new(HashSet::new()),
            timestamps: Mutex::new(HashMap::new()),
            block_requests: AtomicU64::new(0),
            balances: Mutex::new(HashMap::new()),
            allowances: Mutex::new(HashMap::new()),
            fail_calls: AtomicBool::new(false),
        }
    }

    pub fn chain_id_value(&self) -> u64 {
        self.chain_id
    }

    pub fn fail_chain_id(&self, fail: bool) {
        self.fail_chain_id.store(fail, Ordering::SeqCst);
    }

    pub fn chain_id_calls(&self) -> u64 {
        self.chain_id_calls.load(Ordering::SeqCst)
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    pub fn push_log(&self, log: RpcLog) {
        self.logs.lock().push(log);
    }

    pub fn log_requests(&self) -> Vec<LogFilter> {
        self.log_requests.lock().clone()
    }

    pub fn fail_logs_for(&self, kind: EventKind) {
        self.failing_topics.lock().insert(kind.topic0());
    }

    pub fn set_block_timestamp(&self, block: u64, timestamp: u64) {
        self.timestamps.lock().insert(block, timestamp);
    }

    pub fn block_requests(&self) -> u64 {
        self.block_requests.load(Ordering::SeqCst)
    }

    pub fn set_token_balance(&self, token: Address, holder: Address, amount: U256) {
        self.balances.lock().insert((token, holder), amount);
    }

    pub fn set_allowance(&self, token: Address, owner: Address, amount: U256) {
        self.allowances.lock().insert((token, owner), amount);
    }

    /// Makes every `eth_call` fail.
    pub fn fail_calls(&self, fail: bool) {
        self.fail_calls.store(fail, Ordering::SeqCst);
    }

    fn answer_call(&self, to: Address, data: &[u8]) -> Result<Vec<u8>> {
        let selector: [u8; 4] = data
            .get(..4)
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| eyre!("calldata shorter than a selector"))?;

        if to == contract_address() {
            if selector == IHelpContract::ENTRY_FEECall::SELECTOR {
                return Ok(usdt_units(ENTRY_FEE_USDT).abi_encode());
            }
            if selector == IHelpContract::getHelpPriceCall::SELECTOR {
                return Ok(U256::from(HELP_PRICE_RAW).abi_encode());
            }
            if selector == IHelpContract::levelAmountsCall::SELECTOR {
                let call = IHelpContract::levelAmountsCall::abi_decode(data, true)?;
                return Ok((call.level * usdt_units(LEVEL_STEP_USDT)).abi_encode());
            }
            if selector == IHelpContract::getUserQueueAndIncentiveInfoCall::SELECTOR {
                return Ok((false, U256::ZERO, U256::ZERO, U256::ZERO).abi_encode_params());
            }
            if selector == IHelpContract::usdtCall::SELECTOR {
                return Ok(usdt_token().abi_encode());
            }
            if selector == IHelpContract::helpTokenCall::SELECTOR {
                return Ok(help_token().abi_encode());
            }
        } else if to == usdt_token() || to == help_token() {
            if selector == IERC20::balanceOfCall::SELECTOR {
                let call = IERC20::balanceOfCall::abi_decode(data, true)?;
                let balance = self
                    .balances
                    .lock()
                    .get(&(to, call.account))
                    .copied()
                    .unwrap_or_default();
                return Ok(balance.abi_encode());
            }
            if selector == IERC20::allowanceCall::SELECTOR {
                let call = IERC20::allowanceCall::abi_decode(data, true)?;
                let allowance = self
                    .allowances
                    .lock()
                    .get(&(to, call.owner))
                    .copied()
                    .unwrap_or_default();
                return Ok(allowance.abi_encode());
            }
            if selector == IERC20::decimalsCall::SELECTOR {
                let decimals = if to == usdt_token() { 6u64 } else { 18u64 };
                return Ok(U256::from(decimals).abi_encode());
            }
        }
        Err(eyre!("mock has no answer for selector {selector:02x?} on {to}"))
    }
}

#[async_trait]
impl EvmRpc for MockRpc {
    fn label(&self) -> &str {
        &self.label
    }

    async fn chain_id(&self) -> Result<u64> {
        self.chain_id_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_chain_id.load(Ordering::SeqCst) {
            return Err(eyre!("{} is unreachable", self.label));
        }
        Ok(self.chain_id)
    }

    async fn block_number(&self) -> Result<u64> {
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RpcLog>> {
        self.log_requests.lock().push(*filter);
        if self.failing_topics.lock().contains(&filter.topic0) {
            return Err(eyre!("{} rejected eth_getLogs", self.label));
        }
        let range = filter.from_block..=filter.to_block;
        Ok(self
            .logs
            .lock()
            .iter()
            .filter(|log| {
                log.address == filter.address
                    && log.topics.first() == Some(&filter.topic0)
                    && log
                        .block_number
                        .is_some_and(|number| range.contains(&number.to::<u64>()))
            })
            .cloned()
            .collect())
    }

    async fn block_timestamp(&self, number: u64) -> Result<Option<u64>> {
        self.block_requests.fetch_add(1, Ordering::SeqCst);
        Ok(self.timestamps.lock().get(&number).copied())
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes> {
        if self.fail_calls.load(Ordering::SeqCst) {
            return Err(eyre!("{} rejected eth_call", self.label));
        }
        self.answer_call(to, &data).map(Bytes::from)
    }
}
