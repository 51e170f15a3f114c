//! Storage Trait Definitions
//!
//! The persistent-store contract the indexer core runs against: a blob
//! store for raw block bytes plus a relational store for block references,
//! deposit rows and the chain-tip watermark. All coordination between
//! invocations goes through these operations as idempotent upserts keyed by
//! natural keys (`(height, network)` for blocks, `(tx_id, vout)` for
//! deposits).
//!
//! Implementations:
//! - `SqliteStorage` - production storage with pooled SQLite
//! - `MemoryStorage` - in-memory storage for tests

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{
    BlockInfo, BroadcastedDeposit, BtcNet, ConfirmingTx, DepositInsertion, DepositRow,
    FinalizedTx, MintStatus, SenderDeposit, TxUpdate,
};

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("connection error: {0}")]
    Connection(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Persistent store consumed by the indexer core
#[async_trait]
pub trait Storage: Send + Sync {
    // -- Block operations --

    /// Upsert a block reference keyed by `(height, network)` and store its
    /// raw bytes. A different hash at the same height replaces the stored
    /// hash; that replacement is the reorg signal the tracker reads.
    async fn put_block(
        &self,
        height: u64,
        network: BtcNet,
        hash: &str,
        raw: &[u8],
    ) -> StorageResult<()>;

    /// Record a block reference announced by the ingestion pipeline. Same
    /// upsert semantics as [`Storage::put_block`], but the raw bytes travel
    /// separately and may not be visible yet.
    async fn insert_block_info(
        &self,
        height: u64,
        network: BtcNet,
        hash: &str,
    ) -> StorageResult<()>;

    /// Raw block bytes by hash, if the blob store has them
    async fn get_block(&self, hash: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Block reference stored at `(height, network)`
    async fn get_block_info(&self, height: u64, network: BtcNet)
        -> StorageResult<Option<BlockInfo>>;

    /// Unscanned block references, lowest height first
    async fn get_blocks_to_process(&self, limit: u32) -> StorageResult<Vec<BlockInfo>>;

    /// Mark block references as fully scanned
    async fn mark_blocks_scanned(&self, heights: &[u64]) -> StorageResult<()>;

    /// Highest block height known to the indexer
    async fn get_latest_block_height(&self) -> StorageResult<Option<u64>>;

    /// Chain-tip watermark: highest fully-scanned height
    async fn get_chain_tip(&self) -> StorageResult<Option<u64>>;

    /// Advance the chain-tip watermark (monotonic)
    async fn set_chain_tip(&self, height: u64) -> StorageResult<()>;

    /// Distinct block hashes referenced by confirming rows
    async fn get_confirming_blocks(&self) -> StorageResult<Vec<String>>;

    // -- Deposit operations --

    /// Upsert deposit rows found by the scanner, keyed by `(tx_id, vout)`;
    /// new and existing rows end up `Confirming` with the given block ref
    async fn insert_or_update_txs(&self, txs: &[DepositInsertion]) -> StorageResult<()>;

    /// Rows eligible for minting: `Finalized`, plus `MintFailed` with
    /// `retry_count <= max_retries`
    async fn get_finalized_txs(&self, max_retries: u32) -> StorageResult<Vec<FinalizedTx>>;

    /// Transition every row of the given transactions to `status`
    async fn update_txs_status(&self, tx_ids: &[String], status: MintStatus) -> StorageResult<()>;

    /// Apply per-row mint results; failures bump `retry_count`
    async fn batch_update_txs(&self, updates: &[TxUpdate]) -> StorageResult<()>;

    /// Move confirming rows referencing reorged-out blocks to `Reorg`
    async fn update_confirming_txs_to_reorg(&self, block_hashes: &[String]) -> StorageResult<()>;

    /// All rows currently `Confirming`
    async fn get_confirming_txs(&self) -> StorageResult<Vec<ConfirmingTx>>;

    /// Transition confirming rows of the given transactions to `Finalized`
    async fn finalize_txs(&self, tx_ids: &[String]) -> StorageResult<()>;

    /// All rows currently `Minted` (minted-reorg sweep input)
    async fn get_minted_txs(&self) -> StorageResult<Vec<FinalizedTx>>;

    /// Insert `Broadcasting` rows for a directly-registered transaction;
    /// rows that already exist are left untouched
    async fn register_broadcasted_tx(&self, deposits: &[BroadcastedDeposit]) -> StorageResult<()>;

    /// Record sender addresses recovered during enrichment
    async fn insert_sender_deposits(&self, senders: &[SenderDeposit]) -> StorageResult<()>;

    // -- Query surface --

    /// Current status of a transaction's rows (all share one status)
    async fn get_tx_status(&self, tx_id: &str) -> StorageResult<Option<MintStatus>>;

    /// All rows of a transaction
    async fn get_txs_by_id(&self, tx_id: &str) -> StorageResult<Vec<DepositRow>>;

    /// Rows crediting a destination-ledger recipient, newest first
    async fn get_txs_by_recipient(&self, recipient: &str) -> StorageResult<Vec<DepositRow>>;

    /// Rows whose parent transaction spent from a Bitcoin address, newest first
    async fn get_txs_by_sender(&self, btc_address: &str) -> StorageResult<Vec<DepositRow>>;
}
