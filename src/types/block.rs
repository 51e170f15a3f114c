//! Block-level data model
//!
//! A block reference is keyed by `(height, network)`. The hash stored at a
//! given height can be replaced when the chain reorganizes; that replacement
//! is the reorg signal the confirmation tracker acts on.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Error for parsing network / block-status strings
#[derive(Debug, Error)]
#[error("invalid {kind}: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Bitcoin network the indexer is watching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BtcNet {
    Mainnet,
    Testnet,
    Signet,
    Regtest,
}

impl BtcNet {
    /// Corresponding `bitcoin` crate network (address encoding rules)
    pub fn bitcoin_network(&self) -> bitcoin::Network {
        match self {
            BtcNet::Mainnet => bitcoin::Network::Bitcoin,
            BtcNet::Testnet => bitcoin::Network::Testnet,
            BtcNet::Signet => bitcoin::Network::Signet,
            BtcNet::Regtest => bitcoin::Network::Regtest,
        }
    }
}

impl std::fmt::Display for BtcNet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BtcNet::Mainnet => write!(f, "mainnet"),
            BtcNet::Testnet => write!(f, "testnet"),
            BtcNet::Signet => write!(f, "signet"),
            BtcNet::Regtest => write!(f, "regtest"),
        }
    }
}

impl FromStr for BtcNet {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" => Ok(BtcNet::Mainnet),
            "testnet" => Ok(BtcNet::Testnet),
            "signet" => Ok(BtcNet::Signet),
            "regtest" => Ok(BtcNet::Regtest),
            _ => Err(ParseEnumError {
                kind: "bitcoin network",
                value: s.to_string(),
            }),
        }
    }
}

/// Processing status of an ingested block reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    /// Ingested, not yet scanned for deposits
    New,
    /// Fully scanned; chain tip advanced past it
    Scanned,
}

impl std::fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockStatus::New => write!(f, "new"),
            BlockStatus::Scanned => write!(f, "scanned"),
        }
    }
}

impl FromStr for BlockStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(BlockStatus::New),
            "scanned" => Ok(BlockStatus::Scanned),
            _ => Err(ParseEnumError {
                kind: "block status",
                value: s.to_string(),
            }),
        }
    }
}

/// Inbound message announcing a block the relayer has made available
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockQueueMessage {
    /// Block hash (display hex, big-endian)
    pub hash: String,
    /// Block height
    pub height: u64,
    /// Network the block belongs to
    pub network: BtcNet,
    /// Relayer-side observation time, unix milliseconds
    pub timestamp_ms: i64,
}

/// A block reference as stored in the relational store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    pub height: u64,
    pub hash: String,
}
