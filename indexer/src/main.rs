mod api;
mod cache;
mod cli;
mod contract;
mod error;
mod logging;
mod metrics;
mod rpc;
mod storage;
mod sync;
#[cfg(test)]
mod test_utils;

use api::ApiState;
use cache::{CounterCache, MemoryCounterCache};
use cli::IndexerConfig;
use contract::ContractReader;
use eyre::{Result, WrapErr};
use rpc::{Connection, EndpointSelector, HttpRpc};
use std::sync::Arc;
use storage::{MemoryStore, PgStore, Store};
use sync::{Reconciler, Scanner, SyncSettings, Synchronizer};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = IndexerConfig::from_args();
    let guards = logging::init_tracing(&config);
    let result = run(config).await;
    if let Err(err) = &result {
        tracing::error!(error = %format!("{err:#}"), "indexer stopped");
    }
    guards.finish();
    result
}

async fn run(config: IndexerConfig) -> Result<()> {
    info!(
        chain_id = config.chain_id,
        contract = %config.contract_address,
        owner = %config.owner_address,
        deployment_block = config.deployment_block,
        fallback = config.rpc_url_alternative.is_some(),
        "starting help indexer"
    );

    let selector = Arc::new(build_selector(&config)?);
    let conn = selector
        .acquire()
        .await
        .wrap_err("no usable RPC endpoint at startup")?;
    let reader = ContractReader::resolve(conn.as_ref(), config.contract_address).await?;
    info!(usdt = %reader.usdt_token, help = %reader.help_token, "resolved token addresses");

    let (store, cache) = open_store(&config).await?;
    let scanner = Scanner::new(selector, config.contract_address, config.max_block_range);
    let reconciler = Reconciler::new(store, reader);
    let synchronizer = Arc::new(Synchronizer::new(
        scanner,
        reconciler,
        cache,
        SyncSettings {
            owner: config.owner_address,
            deployment_block: config.deployment_block,
            counter_lookback_blocks: config.counter_lookback_blocks,
            poll_interval: config.poll_interval(),
        },
    ));
    let sync_handle = Arc::clone(&synchronizer).spawn();

    let router = api::http::router(ApiState::new(synchronizer));
    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for shutdown signal");
        }
        warn!("shutdown signal received");
    };
    let served = api::http::serve(config.api_addr(), router, shutdown).await;
    sync_handle.abort();
    served
}

fn build_selector(config: &IndexerConfig) -> Result<EndpointSelector> {
    let timeout = config.rpc_timeout();
    let primary: Connection = Arc::new(HttpRpc::new("primary", &config.rpc_url, timeout)?);
    let fallback = match &config.rpc_url_alternative {
        Some(url) => Some(Arc::new(HttpRpc::new("fallback", url, timeout)?) as Connection),
        None => None,
    };
    Ok(EndpointSelector::new(primary, fallback, config.chain_id))
}

/// Postgres when a database URL is configured, otherwise process memory.
async fn open_store(config: &IndexerConfig) -> Result<(Arc<dyn Store>, Arc<dyn CounterCache>)> {
    match &config.database_url {
        Some(url) => {
            let pg = Arc::new(
                PgStore::connect(url, config.chain_id, config.contract_address)
                    .await
                    .wrap_err("failed to open postgres store")?,
            );
            info!("using postgres store");
            let store: Arc<dyn Store> = pg.clone();
            let cache: Arc<dyn CounterCache> = pg;
            Ok((store, cache))
        }
        None => {
            warn!("DATABASE_URL not set, users and transactions are kept in memory only");
            let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
            let cache: Arc<dyn CounterCache> = Arc::new(MemoryCounterCache::new());
            Ok((store, cache))
        }
    }
}
