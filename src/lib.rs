//! nBTC Indexer - Bitcoin Deposit Indexing and Finalization Core
//!
//! Watches a Bitcoin chain for deposits paying a fixed set of monitored
//! addresses, proves their block inclusion with Merkle proofs, tracks
//! confirmation depth through chain reorganizations, and drives batched
//! mint calls on the destination ledger.
//!
//! ## Pipeline
//!
//! 1. **Ingestion** (external) delivers block references; raw bytes land in
//!    the blob store
//! 2. **Scanner** decodes blocks and records deposits as confirming rows
//! 3. **Tracker** verifies blocks against the destination chain's light
//!    client, detects reorgs, and finalizes rows past the confirmation depth
//! 4. **Batcher** groups finalized rows, builds inclusion proofs, and
//!    submits batched mint calls
//!
//! Everything coordinates through the persistent store with idempotent
//! upserts; any cycle can be re-run safely.

pub mod common;
pub mod config;
pub mod esplora;
pub mod indexer;
pub mod ledger;
pub mod logging;
pub mod merkle;
pub mod storage;
pub mod types;

// Re-exports: core service
pub use indexer::{
    BlockScanner, BroadcastRegistration, ConfirmationTracker, DepositDetector, Indexer,
    MintBatcher,
};

// Re-exports: configuration
pub use config::{ConfigError, DepositAddressEntry, DepositAddressRegistry, IndexerConfig};

// Re-exports: errors
pub use common::{IndexerError, Result};

// Re-exports: merkle engine
pub use merkle::{fold_proof, MerkleError, MerkleTree};

// Re-exports: storage
pub use storage::{MemoryStorage, SqliteStorage, Storage, StorageError};

// Re-exports: clients
pub use esplora::{EsploraClient, EsploraError, TxLookup};
pub use ledger::{HttpLedgerClient, LedgerClient, LedgerError, MintBatchArg, ProofResult};

// Re-exports: data model
pub use types::{BlockQueueMessage, BtcNet, DepositRow, DepositStatusResponse, MintStatus};
