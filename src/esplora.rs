//! Esplora API Client for Sender Enrichment
//!
//! The indexer looks up the previous transaction of every deposit input to
//! recover the spending address. The lookup is best-effort: a failure only
//! costs the sender association, never the deposit itself.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

/// Esplora error types
#[derive(Debug, thiserror::Error)]
pub enum EsploraError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("transaction not found: {0}")]
    TxNotFound(String),
}

/// A transaction as reported by Esplora, trimmed to what enrichment needs
#[derive(Debug, Clone, Deserialize)]
pub struct EsploraTx {
    pub txid: String,
    pub vout: Vec<EsploraTxOutput>,
}

/// One output of an Esplora transaction
#[derive(Debug, Clone, Deserialize)]
pub struct EsploraTxOutput {
    pub scriptpubkey: String,
    /// Absent for outputs Esplora cannot resolve to an address
    pub scriptpubkey_address: Option<String>,
    pub value: u64,
}

/// Previous-transaction lookup used by the block scanner
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TxLookup: Send + Sync {
    /// Fetch a transaction with per-output resolved addresses
    async fn get_tx(&self, txid: &str) -> Result<EsploraTx, EsploraError>;
}

/// Esplora HTTP client
#[derive(Debug, Clone)]
pub struct EsploraClient {
    client: Client,
    base_url: String,
}

impl EsploraClient {
    /// Create a new client with the API base URL
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl TxLookup for EsploraClient {
    async fn get_tx(&self, txid: &str) -> Result<EsploraTx, EsploraError> {
        let url = format!("{}/tx/{}", self.base_url, txid);
        let resp = self.client.get(&url).send().await?;

        if !resp.status().is_success() {
            return Err(EsploraError::TxNotFound(txid.to_string()));
        }

        let tx: EsploraTx = resp.json().await?;
        Ok(tx)
    }
}
