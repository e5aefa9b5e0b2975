//! CLI and config handling.

use alloy_primitives::Address;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, path::PathBuf, time::Duration};

/// Sepolia.
pub const DEFAULT_CHAIN_ID: u64 = 11_155_111;
/// Block the scheme contract was deployed in.
pub const DEFAULT_DEPLOYMENT_BLOCK: u64 = 7_989_112;
/// Widest `eth_getLogs` window most public endpoints accept.
pub const DEFAULT_MAX_BLOCK_RANGE: u64 = 500;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 50;
/// How far back a cold start counts events when no counters are cached.
pub const DEFAULT_COUNTER_LOOKBACK_BLOCKS: u64 = 100_000;
pub const DEFAULT_RPC_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_API_BIND: &str = "0.0.0.0:3001";
pub const DEFAULT_LOG_JSON_FILTER: &str = "debug";

/// Event indexer configuration.
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(name = "help-indexer", about = "Event indexer and read API for the HELP contract")]
pub struct IndexerConfig {
    /// Primary JSON-RPC endpoint.
    #[arg(long, env = "RPC_URL")]
    pub rpc_url: String,
    /// Fallback endpoint, used for the rest of the run once the primary fails.
    #[arg(long, env = "RPC_URL_ALTERNATIVE")]
    pub rpc_url_alternative: Option<String>,
    /// Scheme contract address.
    #[arg(long, env = "CONTRACT_ADDRESS")]
    pub contract_address: Address,
    /// Address allowed to trigger manual syncs and read contract stats.
    #[arg(long, env = "OWNER_ADDRESS")]
    pub owner_address: Address,
    /// Postgres URL. Without it everything is kept in memory.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,
    /// REST API bind address.
    #[arg(long, env = "API_BIND", default_value = DEFAULT_API_BIND)]
    pub api_bind: SocketAddr,
    /// Port override for the REST API, as used by hosted deployments.
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,
    /// Chain id both endpoints must report.
    #[arg(long, default_value_t = DEFAULT_CHAIN_ID)]
    pub chain_id: u64,
    #[arg(long, default_value_t = DEFAULT_DEPLOYMENT_BLOCK)]
    pub deployment_block: u64,
    /// Maximum blocks per `eth_getLogs` request.
    #[arg(long, default_value_t = DEFAULT_MAX_BLOCK_RANGE)]
    pub max_block_range: u64,
    #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL_SECS)]
    pub poll_interval_secs: u64,
    #[arg(long, default_value_t = DEFAULT_COUNTER_LOOKBACK_BLOCKS)]
    pub counter_lookback_blocks: u64,
    /// Per-request RPC timeout.
    #[arg(long, default_value_t = DEFAULT_RPC_TIMEOUT_SECS)]
    pub rpc_timeout_secs: u64,
    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,
    /// Also write JSON-lines logs to this file.
    #[arg(long)]
    pub log_json: Option<PathBuf>,
    /// Filter for the JSON log file.
    #[arg(long, default_value = DEFAULT_LOG_JSON_FILTER)]
    pub log_json_filter: String,
}

impl IndexerConfig {
    /// Parse configuration from CLI args and the environment.
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Bind address with `PORT` applied.
    pub fn api_addr(&self) -> SocketAddr {
        match self.port {
            Some(port) => SocketAddr::new(self.api_bind.ip(), port),
            None => self.api_bind,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs.max(1))
    }
}
