//! Common Error Types for the nBTC Indexer
//!
//! Provides unified error handling across all modules. Per-item processing
//! failures never escape to abort a whole batch; callers log them and move
//! on to the next item, so most variants here surface only at the edges
//! (registration, configuration, startup).

use thiserror::Error;

/// Root error type for the indexer
#[derive(Debug, Error)]
pub enum IndexerError {
    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Storage errors
    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    /// Merkle engine errors
    #[error("merkle error: {0}")]
    Merkle(#[from] crate::merkle::MerkleError),

    /// Referenced block bytes missing from the blob store; the caller
    /// leaves the work item for redelivery
    #[error("block not found: {0}")]
    BlockNotFound(String),

    /// Malformed or unqualifying input rejected synchronously
    #[error("validation error: {0}")]
    Validation(String),

    /// Destination-ledger transport errors (SPV checks, mint submission)
    #[error("ledger error: {0}")]
    Ledger(#[from] crate::ledger::LedgerError),

    /// Auxiliary chain-data lookups (sender enrichment)
    #[error("esplora error: {0}")]
    Esplora(#[from] crate::esplora::EsploraError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl IndexerError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Whether retrying the same operation later can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IndexerError::Storage(_)
                | IndexerError::BlockNotFound(_)
                | IndexerError::Ledger(_)
                | IndexerError::Esplora(_)
                | IndexerError::Io(_)
        )
    }
}

/// Result type alias using IndexerError
pub type Result<T> = std::result::Result<T, IndexerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(IndexerError::BlockNotFound("abc".into()).is_retryable());
        assert!(!IndexerError::validation("no valid deposits").is_retryable());
    }

    #[test]
    fn test_validation_message() {
        let err = IndexerError::validation("transaction contains no valid deposits");
        assert!(err.to_string().contains("no valid deposits"));
    }
}
