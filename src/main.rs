//! nBTC Indexer - minimal launcher
//!
//! Loads configuration from the environment, opens the SQLite store and
//! runs the periodic scan/finalize/mint cycles. Block ingestion and the
//! HTTP query façade are separate collaborators; this binary is only the
//! indexing core.

use std::sync::Arc;

use nbtc_indexer::logging::{init_logging, LogLevel};
use nbtc_indexer::{
    EsploraClient, HttpLedgerClient, Indexer, IndexerConfig, IndexerError, SqliteStorage,
};

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    if let Err(e) = run().await {
        eprintln!("fatal: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), IndexerError> {
    let config = IndexerConfig::from_env()?;
    let registry = IndexerConfig::registry_from_env()?;

    init_logging(LogLevel::from(config.log_level.as_str()), config.log_json);
    tracing::info!(
        network = %config.network,
        addresses = registry.len(),
        database = %config.database_path,
        "starting nbtc-indexer"
    );

    let storage = Arc::new(SqliteStorage::new(&config.database_path)?);
    let ledger = Arc::new(HttpLedgerClient::new(&config.ledger_rpc_url));
    let esplora = Arc::new(EsploraClient::new(&config.esplora_url));

    let indexer = Indexer::new(config, registry, storage, ledger, esplora);
    indexer.run().await;
    Ok(())
}
