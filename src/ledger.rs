//! Destination-Ledger Client
//!
//! The indexer talks to the destination ledger through the bridge's
//! JSON-RPC endpoint for two things: SPV attestation of block hashes
//! against the on-chain light client, and batched mint submission for
//! finalized deposits. Mint submission deliberately never returns an
//! error; a failed batch is an `None` result the caller books as
//! `MintFailed` with a retry bump.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Ledger client errors
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("RPC error: {0}")]
    Rpc(String),
}

/// Merkle proof shipped with a mint call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofResult {
    /// Sibling single-round hashes, leaf to root, internal byte order
    pub path: Vec<[u8; 32]>,
    /// Tree root (double-round), internal byte order
    pub root: [u8; 32],
}

/// One transaction's contribution to a batched mint call
#[derive(Debug, Clone)]
pub struct MintBatchArg {
    /// Canonical transaction bytes (witness-stripped serialization)
    pub tx_bytes: Vec<u8>,
    pub block_height: u64,
    /// Index of the transaction within its block
    pub tx_index: u32,
    pub proof: ProofResult,
    /// Destination package the batch targets
    pub package_id: String,
    pub ledger_network: String,
}

/// Destination-ledger operations consumed by the indexer core
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Ask the on-chain light client whether each block hash is still part
    /// of the canonical chain. Result order matches the input order.
    async fn verify_blocks(&self, block_hashes: &[String]) -> Result<Vec<bool>, LedgerError>;

    /// Submit one batched mint call. Returns the destination transaction id
    /// on success, `None` on any failure; never errors.
    async fn try_mint_batch(&self, args: &[MintBatchArg]) -> Option<String>;
}

#[derive(Serialize)]
struct MintArgWire {
    tx_bytes: String,
    block_height: u64,
    tx_index: u32,
    proof_path: Vec<String>,
    merkle_root: String,
    package_id: String,
    ledger_network: String,
}

impl From<&MintBatchArg> for MintArgWire {
    fn from(arg: &MintBatchArg) -> Self {
        Self {
            tx_bytes: hex::encode(&arg.tx_bytes),
            block_height: arg.block_height,
            tx_index: arg.tx_index,
            // the on-chain verifier consumes hashes in internal byte order,
            // the same order the tree is built in
            proof_path: arg.proof.path.iter().map(hex::encode).collect(),
            merkle_root: hex::encode(arg.proof.root),
            package_id: arg.package_id.clone(),
            ledger_network: arg.ledger_network.clone(),
        }
    }
}

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    message: String,
}

/// JSON-RPC client for the bridge endpoint
#[derive(Debug, Clone)]
pub struct HttpLedgerClient {
    client: Client,
    url: String,
}

impl HttpLedgerClient {
    pub fn new(url: &str) -> Self {
        Self {
            client: Client::new(),
            url: url.to_string(),
        }
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, LedgerError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let resp: RpcResponse<T> = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await?
            .json()
            .await?;

        if let Some(err) = resp.error {
            return Err(LedgerError::Rpc(err.message));
        }
        resp.result
            .ok_or_else(|| LedgerError::Rpc(format!("{}: empty result", method)))
    }
}

#[async_trait]
impl LedgerClient for HttpLedgerClient {
    async fn verify_blocks(&self, block_hashes: &[String]) -> Result<Vec<bool>, LedgerError> {
        self.call("nbtc_verifyBlocks", json!([block_hashes])).await
    }

    async fn try_mint_batch(&self, args: &[MintBatchArg]) -> Option<String> {
        let wire: Vec<MintArgWire> = args.iter().map(MintArgWire::from).collect();
        match self
            .call::<String>("nbtc_mintNbtcBatch", json!([wire]))
            .await
        {
            Ok(digest) => Some(digest),
            Err(e) => {
                error!(error = %e, count = args.len(), "batch mint call failed");
                None
            }
        }
    }
}
