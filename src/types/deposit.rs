//! Deposit transaction lifecycle types
//!
//! One row per `(tx_id, vout)` pair: a single Bitcoin transaction can carry
//! several outputs paying a monitored deposit address, and each becomes its
//! own row sharing the transaction's recipient. Rows are never deleted;
//! their full history is the sequence of status transitions:
//!
//! broadcasting → confirming → {reorg | finalized}
//!             → {minted | mint_failed | finalized_non_active | finalized_reorg}
//!             → minted_reorg

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::block::ParseEnumError;

/// Status of a deposit row through its mint lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MintStatus {
    /// Registered from a raw broadcast, not yet seen in a block
    Broadcasting,
    /// Seen in a block, accumulating confirmations
    Confirming,
    /// Block dropped from the canonical chain before finalization
    Reorg,
    /// Reached confirmation depth, eligible for minting
    Finalized,
    /// Transaction vanished from its block after finalization; deeper than
    /// the confirmation depth, excluded from minting permanently
    FinalizedReorg,
    /// Finalized, but its deposit address is no longer active; parked until
    /// an operator intervenes
    FinalizedNonActive,
    /// Mint call succeeded on the destination ledger
    Minted,
    /// Mint call failed; retried while the retry budget lasts
    MintFailed,
    /// Minted, then its block was reorged out. Manual remediation only.
    MintedReorg,
}

impl MintStatus {
    /// Whether a transition from `self` to `next` is part of the lifecycle.
    ///
    /// Storage implementations consult this before applying status updates,
    /// so a stale sweep cannot e.g. pull a minted row back to confirming.
    pub fn can_transition_to(&self, next: MintStatus) -> bool {
        use MintStatus::*;
        match (self, next) {
            (Broadcasting, Confirming) => true,
            (Confirming, Confirming) => true, // re-scan upsert of the same row
            (Confirming, Reorg) | (Confirming, Finalized) => true,
            (Finalized, Minted)
            | (Finalized, MintFailed)
            | (Finalized, FinalizedReorg)
            | (Finalized, FinalizedNonActive) => true,
            (MintFailed, Minted) | (MintFailed, MintFailed) => true,
            (MintFailed, FinalizedReorg) | (MintFailed, FinalizedNonActive) => true,
            // a reorged-out tx can be re-mined in a later block
            (Reorg, Confirming) => true,
            (Minted, MintedReorg) => true,
            _ => false,
        }
    }

    /// Terminal states requiring operator attention; nothing selects them
    /// for further automatic processing.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MintStatus::Minted
                | MintStatus::MintedReorg
                | MintStatus::FinalizedReorg
                | MintStatus::FinalizedNonActive
        )
    }
}

impl std::fmt::Display for MintStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MintStatus::Broadcasting => "broadcasting",
            MintStatus::Confirming => "confirming",
            MintStatus::Reorg => "reorg",
            MintStatus::Finalized => "finalized",
            MintStatus::FinalizedReorg => "finalized_reorg",
            MintStatus::FinalizedNonActive => "finalized_non_active",
            MintStatus::Minted => "minted",
            MintStatus::MintFailed => "mint_failed",
            MintStatus::MintedReorg => "minted_reorg",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for MintStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "broadcasting" => Ok(MintStatus::Broadcasting),
            "confirming" => Ok(MintStatus::Confirming),
            "reorg" => Ok(MintStatus::Reorg),
            "finalized" => Ok(MintStatus::Finalized),
            "finalized_reorg" => Ok(MintStatus::FinalizedReorg),
            "finalized_non_active" => Ok(MintStatus::FinalizedNonActive),
            "minted" => Ok(MintStatus::Minted),
            "mint_failed" => Ok(MintStatus::MintFailed),
            "minted_reorg" => Ok(MintStatus::MintedReorg),
            _ => Err(ParseEnumError {
                kind: "mint status",
                value: s.to_string(),
            }),
        }
    }
}

/// A deposit detected inside a transaction's outputs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deposit {
    /// Output index within the parent transaction
    pub vout: u32,
    /// Output value in satoshis
    pub amount_sats: u64,
    /// Destination-ledger recipient (marker payload or configured fallback)
    pub recipient: String,
    /// Destination package the deposit address belongs to
    pub package_id: String,
    /// Destination-ledger network of that package
    pub ledger_network: String,
}

/// A persisted deposit row, keyed by `(tx_id, vout)`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositRow {
    pub tx_id: String,
    pub vout: u32,
    /// Null until the transaction is seen in a block
    pub block_hash: Option<String>,
    pub block_height: Option<u64>,
    pub recipient: String,
    pub amount_sats: u64,
    pub status: MintStatus,
    pub package_id: String,
    pub ledger_network: String,
    pub retry_count: u32,
    /// Destination-ledger transaction id, set on mint success
    pub ledger_tx_id: Option<String>,
    /// Unix milliseconds
    pub created_at: i64,
    pub updated_at: i64,
}

/// Upsert payload produced by the block scanner
#[derive(Debug, Clone)]
pub struct DepositInsertion {
    pub tx_id: String,
    pub vout: u32,
    pub block_hash: String,
    pub block_height: u64,
    pub recipient: String,
    pub amount_sats: u64,
    pub package_id: String,
    pub ledger_network: String,
}

/// Insert payload for a directly-registered (pre-mine) broadcast
#[derive(Debug, Clone)]
pub struct BroadcastedDeposit {
    pub tx_id: String,
    pub vout: u32,
    pub recipient: String,
    pub amount_sats: u64,
    pub package_id: String,
    pub ledger_network: String,
}

/// Row view used by the confirmation tracker
#[derive(Debug, Clone)]
pub struct ConfirmingTx {
    pub tx_id: String,
    pub block_hash: Option<String>,
    pub block_height: u64,
}

/// Row view selected for minting (or for the minted-reorg sweep)
#[derive(Debug, Clone)]
pub struct FinalizedTx {
    pub tx_id: String,
    pub vout: u32,
    pub block_hash: String,
    pub block_height: u64,
    pub retry_count: u32,
    pub package_id: String,
    pub ledger_network: String,
}

/// Per-row status update applied after a mint batch completes
#[derive(Debug, Clone)]
pub struct TxUpdate {
    pub tx_id: String,
    pub vout: u32,
    pub status: MintStatus,
    /// Shared by every row of a successful batch
    pub ledger_tx_id: Option<String>,
}

/// Sender-address association recorded during enrichment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderDeposit {
    pub tx_id: String,
    pub sender: String,
}

/// Confirmation count for a row, floored at zero for unmined rows
pub fn confirmations(block_height: Option<u64>, chain_tip: Option<u64>) -> u64 {
    match (block_height, chain_tip) {
        (Some(h), Some(tip)) if tip >= h => tip - h + 1,
        _ => 0,
    }
}

/// Query-surface view of a deposit row with a live confirmation count
#[derive(Debug, Clone, Serialize)]
pub struct DepositStatusResponse {
    pub btc_tx_id: String,
    pub vout: u32,
    pub status: MintStatus,
    pub block_height: Option<u64>,
    pub confirmations: u64,
    pub recipient: String,
    pub amount_sats: u64,
    pub ledger_tx_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl DepositStatusResponse {
    pub fn from_row(row: DepositRow, chain_tip: Option<u64>) -> Self {
        Self {
            confirmations: confirmations(row.block_height, chain_tip),
            btc_tx_id: row.tx_id,
            vout: row.vout,
            status: row.status,
            block_height: row.block_height,
            recipient: row.recipient,
            amount_sats: row.amount_sats,
            ledger_tx_id: row.ledger_tx_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Current unix-millisecond timestamp for row bookkeeping
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
