//! Environment-based Configuration for the nBTC Indexer
//!
//! # Environment Variables
//!
//! ## Chain configuration
//! - `NBTC_NETWORK` - "mainnet", "testnet", "signet" or "regtest" (required)
//! - `NBTC_CONFIRMATION_DEPTH` - confirmations required before finalization (default: 8)
//! - `NBTC_MAX_MINT_RETRIES` - retry budget for failed mint submissions (default: 1)
//! - `NBTC_SCAN_BATCH_SIZE` - blocks scanned per cycle (default: 10)
//!
//! ## Deposit routing
//! - `NBTC_DEPOSIT_ADDRESSES` - JSON array of monitored deposit addresses
//!   (`[{"btc_address": "...", "package_id": "0x...", "ledger_network": "testnet", "active": true}]`)
//! - `NBTC_FALLBACK_RECIPIENT` - destination-ledger address credited when a
//!   deposit carries no marker output (required)
//!
//! ## Endpoints
//! - `NBTC_LEDGER_RPC_URL` - bridge JSON-RPC endpoint on the destination ledger
//! - `NBTC_ESPLORA_URL` - Esplora-compatible API for sender enrichment
//!
//! ## Operational settings
//! - `NBTC_DATABASE_PATH` - SQLite database file (default: "nbtc-indexer.db")
//! - `NBTC_POLL_INTERVAL_SECS` - scan/finalize/mint cycle period (default: 30)
//! - `NBTC_LOG_LEVEL` - trace|debug|info|warn|error (default: "info")
//! - `NBTC_LOG_JSON` - "1" for JSON log output

use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use thiserror::Error;

use crate::types::BtcNet;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("no deposit addresses configured")]
    NoDepositAddresses,
}

/// A monitored deposit address and the destination package it belongs to
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DepositAddressEntry {
    /// Bitcoin address receiving deposits
    pub btc_address: String,
    /// Destination-ledger package (contract) credited for this address
    pub package_id: String,
    /// Destination-ledger network of that package
    pub ledger_network: String,
    /// Inactive addresses are still matched during scanning, but their
    /// finalized deposits are parked instead of minted
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// Registry of monitored deposit addresses.
///
/// Constructed once at startup and injected into the detector and the mint
/// batcher; never mutated within a processing cycle.
#[derive(Debug, Clone)]
pub struct DepositAddressRegistry {
    entries: HashMap<String, DepositAddressEntry>,
}

impl DepositAddressRegistry {
    /// Build a registry from entries; at least one is required.
    pub fn new(entries: Vec<DepositAddressEntry>) -> Result<Self, ConfigError> {
        if entries.is_empty() {
            return Err(ConfigError::NoDepositAddresses);
        }
        let entries = entries
            .into_iter()
            .map(|e| (e.btc_address.clone(), e))
            .collect();
        Ok(Self { entries })
    }

    /// Parse a registry from its JSON representation
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let entries: Vec<DepositAddressEntry> = serde_json::from_str(json).map_err(|e| {
            ConfigError::InvalidValue("NBTC_DEPOSIT_ADDRESSES".to_string(), e.to_string())
        })?;
        Self::new(entries)
    }

    /// Look up an address, active or not
    pub fn get(&self, btc_address: &str) -> Option<&DepositAddressEntry> {
        self.entries.get(btc_address)
    }

    /// All monitored Bitcoin addresses
    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Whether a destination package still has an active deposit address.
    /// Deposits routed to a fully-deactivated package are parked at mint
    /// time instead of submitted.
    pub fn is_package_active(&self, package_id: &str, ledger_network: &str) -> bool {
        self.entries.values().any(|e| {
            e.active && e.package_id == package_id && e.ledger_network == ledger_network
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Main configuration struct
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    /// Bitcoin network being indexed
    pub network: BtcNet,

    /// Confirmations required before a deposit is finalized
    pub confirmation_depth: u64,

    /// Retry budget for failed mint submissions
    pub max_mint_retries: u32,

    /// Blocks scanned per cycle
    pub scan_batch_size: u32,

    /// Destination-ledger address credited when no marker output is found
    pub fallback_recipient: String,

    /// Bridge JSON-RPC endpoint on the destination ledger
    pub ledger_rpc_url: String,

    /// Esplora-compatible API for sender enrichment
    pub esplora_url: String,

    /// SQLite database file path
    pub database_path: String,

    /// Seconds between processing cycles
    pub poll_interval_secs: u64,

    /// Log level
    pub log_level: String,

    /// JSON log output
    pub log_json: bool,
}

impl IndexerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let network: BtcNet = require_env("NBTC_NETWORK")?
            .parse()
            .map_err(|e: crate::types::block::ParseEnumError| {
                ConfigError::InvalidValue("NBTC_NETWORK".to_string(), e.to_string())
            })?;

        let confirmation_depth = parse_env("NBTC_CONFIRMATION_DEPTH", 8u64)?;
        if confirmation_depth < 1 {
            return Err(ConfigError::InvalidValue(
                "NBTC_CONFIRMATION_DEPTH".to_string(),
                "must be a number greater than 0".to_string(),
            ));
        }

        let max_mint_retries = parse_env("NBTC_MAX_MINT_RETRIES", 1u32)?;

        let scan_batch_size = parse_env("NBTC_SCAN_BATCH_SIZE", 10u32)?;
        if scan_batch_size < 1 {
            return Err(ConfigError::InvalidValue(
                "NBTC_SCAN_BATCH_SIZE".to_string(),
                "must be a number greater than 0".to_string(),
            ));
        }

        let fallback_recipient = require_env("NBTC_FALLBACK_RECIPIENT")?;
        let ledger_rpc_url = require_env("NBTC_LEDGER_RPC_URL")?;
        let esplora_url = env::var("NBTC_ESPLORA_URL")
            .unwrap_or_else(|_| default_esplora_url(network).to_string());

        let database_path =
            env::var("NBTC_DATABASE_PATH").unwrap_or_else(|_| "nbtc-indexer.db".to_string());
        let poll_interval_secs = parse_env("NBTC_POLL_INTERVAL_SECS", 30u64)?;
        let log_level = env::var("NBTC_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let log_json = env::var("NBTC_LOG_JSON").map(|v| v == "1").unwrap_or(false);

        Ok(Self {
            network,
            confirmation_depth,
            max_mint_retries,
            scan_batch_size,
            fallback_recipient,
            ledger_rpc_url,
            esplora_url,
            database_path,
            poll_interval_secs,
            log_level,
            log_json,
        })
    }

    /// Load the deposit-address registry from the environment
    pub fn registry_from_env() -> Result<DepositAddressRegistry, ConfigError> {
        let json = require_env("NBTC_DEPOSIT_ADDRESSES")?;
        DepositAddressRegistry::from_json(&json)
    }
}

fn default_esplora_url(network: BtcNet) -> &'static str {
    match network {
        BtcNet::Mainnet => "https://blockstream.info/api",
        BtcNet::Testnet => "https://blockstream.info/testnet/api",
        // signet/regtest deployments run their own instance
        BtcNet::Signet | BtcNet::Regtest => "http://localhost:3002",
    }
}

fn require_env(name: &str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.to_string()))
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue(name.to_string(), value)),
        Err(_) => Ok(default),
    }
}
