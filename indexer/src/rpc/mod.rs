//! JSON-RPC client and endpoint failover.

use crate::error::IndexerError;
use alloy_primitives::{Address, Bytes, B256, U64};
use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use jsonrpsee::{
    core::client::ClientT,
    http_client::{HttpClient, HttpClientBuilder},
    rpc_params,
};
use serde::Deserialize;
use serde_json::json;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, warn};

/// Log entry as returned by `eth_getLogs`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    #[serde(default)]
    pub block_number: Option<U64>,
    #[serde(default)]
    pub transaction_hash: Option<B256>,
    #[serde(default)]
    pub log_index: Option<U64>,
}

#[derive(Debug, Deserialize)]
struct BlockHeader {
    timestamp: U64,
}

/// Single-topic log filter over an inclusive block window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogFilter {
    pub address: Address,
    pub topic0: B256,
    pub from_block: u64,
    pub to_block: u64,
}

/// The subset of the Ethereum JSON-RPC API the indexer needs.
#[async_trait]
pub trait EvmRpc: Send + Sync {
    /// Endpoint label for logs.
    fn label(&self) -> &str;
    async fn chain_id(&self) -> Result<u64>;
    async fn block_number(&self) -> Result<u64>;
    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RpcLog>>;
    /// Timestamp of block `number`, or `None` when the node does not know it.
    async fn block_timestamp(&self, number: u64) -> Result<Option<u64>>;
    /// `eth_call` against the latest block.
    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes>;
}

/// A live connection handed out by the selector.
pub type Connection = Arc<dyn EvmRpc>;

/// HTTP JSON-RPC endpoint.
#[derive(Debug)]
pub struct HttpRpc {
    label: String,
    client: HttpClient,
}

impl HttpRpc {
    pub fn new(label: impl Into<String>, url: &str, timeout: Duration) -> Result<Self> {
        let label = label.into();
        let client = HttpClientBuilder::default()
            .request_timeout(timeout)
            .build(url)
            .wrap_err_with(|| format!("failed to build {label} RPC client"))?;
        Ok(Self { label, client })
    }
}

fn quantity(value: u64) -> String {
    format!("0x{value:x}")
}

#[async_trait]
impl EvmRpc for HttpRpc {
    fn label(&self) -> &str {
        &self.label
    }

    async fn chain_id(&self) -> Result<u64> {
        let id: U64 = self
            .client
            .request("eth_chainId", rpc_params![])
            .await
            .wrap_err("eth_chainId failed")?;
        Ok(id.to())
    }

    async fn block_number(&self) -> Result<u64> {
        let number: U64 = self
            .client
            .request("eth_blockNumber", rpc_params![])
            .await
            .wrap_err("eth_blockNumber failed")?;
        Ok(number.to())
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RpcLog>> {
        let params = json!({
            "address": filter.address,
            "topics": [filter.topic0],
            "fromBlock": quantity(filter.from_block),
            "toBlock": quantity(filter.to_block),
        });
        self.client
            .request("eth_getLogs", rpc_params![params])
            .await
            .wrap_err_with(|| {
                format!(
                    "eth_getLogs failed for blocks {}..={}",
                    filter.from_block, filter.to_block
                )
            })
    }

    async fn block_timestamp(&self, number: u64) -> Result<Option<u64>> {
        let header: Option<BlockHeader> = self
            .client
            .request("eth_getBlockByNumber", rpc_params![quantity(number), false])
            .await
            .wrap_err_with(|| format!("eth_getBlockByNumber failed for block {number}"))?;
        Ok(header.map(|header| header.timestamp.to()))
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes> {
        let request = json!({ "to": to, "data": data });
        self.client
            .request("eth_call", rpc_params![request, "latest"])
            .await
            .wrap_err_with(|| format!("eth_call to {to} failed"))
    }
}

/// Primary endpoint with a one-way switch to a fallback.
///
/// Every acquisition verifies the chain id. A wrong chain counts as an
/// unreachable endpoint. Once the fallback is selected it stays selected.
pub struct EndpointSelector {
    primary: Connection,
    fallback: Option<Connection>,
    expected_chain_id: u64,
    on_fallback: AtomicBool,
}

impl EndpointSelector {
    pub fn new(primary: Connection, fallback: Option<Connection>, expected_chain_id: u64) -> Self {
        Self {
            primary,
            fallback,
            expected_chain_id,
            on_fallback: AtomicBool::new(false),
        }
    }

    pub fn is_on_fallback(&self) -> bool {
        self.on_fallback.load(Ordering::SeqCst)
    }

    /// Returns a verified connection, failing over at most once.
    pub async fn acquire(&self) -> Result<Connection, IndexerError> {
        if self.is_on_fallback() {
            return match &self.fallback {
                Some(fallback) => self.verify(fallback).await.map_err(unavailable),
                None => Err(IndexerError::EndpointUnavailable(
                    "fallback selected but not configured".to_string(),
                )),
            };
        }

        let primary_err = match self.verify(&self.primary).await {
            Ok(conn) => return Ok(conn),
            Err(err) => err,
        };
        let Some(fallback) = &self.fallback else {
            return Err(unavailable(primary_err));
        };
        warn!(
            endpoint = self.primary.label(),
            error = %format!("{primary_err:#}"),
            "primary RPC unavailable, switching to fallback"
        );
        self.on_fallback.store(true, Ordering::SeqCst);
        self.verify(fallback).await.map_err(|fallback_err| {
            IndexerError::EndpointUnavailable(format!(
                "primary: {primary_err:#}; fallback: {fallback_err:#}"
            ))
        })
    }

    async fn verify(&self, conn: &Connection) -> Result<Connection> {
        let chain_id = conn.chain_id().await?;
        if chain_id != self.expected_chain_id {
            return Err(eyre!(
                "{} reports chain id {chain_id}, expected {}",
                conn.label(),
                self.expected_chain_id
            ));
        }
        debug!(endpoint = conn.label(), chain_id, "rpc endpoint verified");
        Ok(Arc::clone(conn))
    }
}

fn unavailable(err: eyre::Report) -> IndexerError {
    IndexerError::EndpointUnavailable(format!("{err:#}"))
}
