//! Mint Batcher
//!
//! Consumes finalized (and retryable mint-failed) rows and drives the
//! batched mint calls on the destination ledger. Rows are grouped twice:
//! first by parent transaction, because an inclusion proof covers the whole
//! transaction rather than a single output; then by destination package,
//! because one submission targets one contract. Submission is all or
//! nothing per package batch.

use bitcoin::consensus::encode::{deserialize, serialize};
use bitcoin::hashes::Hash;
use bitcoin::{Block, Witness};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::common::Result;
use crate::config::DepositAddressRegistry;
use crate::ledger::{LedgerClient, MintBatchArg, ProofResult};
use crate::merkle::MerkleTree;
use crate::storage::Storage;
use crate::types::{FinalizedTx, MintStatus, TxUpdate};

/// Batches finalized deposits into mint calls
pub struct MintBatcher {
    storage: Arc<dyn Storage>,
    ledger: Arc<dyn LedgerClient>,
    registry: DepositAddressRegistry,
    max_retries: u32,
}

/// Rows of one parent transaction, sharing a single proof
struct TxGroup {
    block_hash: String,
    block_height: u64,
    deposits: Vec<FinalizedTx>,
}

struct PreparedGroup {
    package_key: String,
    arg: MintBatchArg,
    row_keys: Vec<(String, u32)>,
}

impl MintBatcher {
    pub fn new(
        storage: Arc<dyn Storage>,
        ledger: Arc<dyn LedgerClient>,
        registry: DepositAddressRegistry,
        max_retries: u32,
    ) -> Self {
        Self {
            storage,
            ledger,
            registry,
            max_retries,
        }
    }

    /// One minting sweep over everything currently eligible.
    ///
    /// Preparation failures (missing block bytes, decode problems) leave the
    /// group's status untouched so the next sweep retries it without
    /// spending retry budget; only a completed submission moves rows to
    /// `Minted` or `MintFailed`.
    pub async fn process_finalized_transactions(&self) -> Result<()> {
        let selected = self.storage.get_finalized_txs(self.max_retries).await?;
        if selected.is_empty() {
            return Ok(());
        }
        info!(count = selected.len(), "found deposits to process for minting");

        // pass 1: group rows by parent transaction
        let mut groups: BTreeMap<String, TxGroup> = BTreeMap::new();
        for row in selected {
            groups
                .entry(row.tx_id.clone())
                .or_insert_with(|| TxGroup {
                    block_hash: row.block_hash.clone(),
                    block_height: row.block_height,
                    deposits: Vec::new(),
                })
                .deposits
                .push(row);
        }

        // pass 2: bucket prepared groups by destination package
        let mut args_by_pkg: BTreeMap<String, Vec<MintBatchArg>> = BTreeMap::new();
        let mut keys_by_pkg: BTreeMap<String, Vec<(String, u32)>> = BTreeMap::new();

        for (tx_id, group) in &groups {
            match self.prepare_group(tx_id, group).await {
                Ok(Some(prepared)) => {
                    args_by_pkg
                        .entry(prepared.package_key.clone())
                        .or_default()
                        .push(prepared.arg);
                    keys_by_pkg
                        .entry(prepared.package_key)
                        .or_default()
                        .extend(prepared.row_keys);
                }
                Ok(None) => {}
                Err(e) => {
                    error!(
                        tx_id = %tx_id,
                        error = %e,
                        "error preparing transaction for minting batch, will retry"
                    );
                }
            }
        }

        // buckets are submitted sequentially, bounding resource usage per cycle
        for (package_key, args) in args_by_pkg {
            let Some(row_keys) = keys_by_pkg.remove(&package_key) else {
                continue;
            };
            info!(
                count = args.len(),
                package = %package_key,
                "sending batch of mints to destination ledger"
            );

            match self.ledger.try_mint_batch(&args).await {
                Some(ledger_tx_id) => {
                    info!(ledger_tx_id = %ledger_tx_id, package = %package_key, "batch mint successful");
                    let updates: Vec<TxUpdate> = row_keys
                        .into_iter()
                        .map(|(tx_id, vout)| TxUpdate {
                            tx_id,
                            vout,
                            status: MintStatus::Minted,
                            ledger_tx_id: Some(ledger_tx_id.clone()),
                        })
                        .collect();
                    self.storage.batch_update_txs(&updates).await?;
                }
                None => {
                    error!(package = %package_key, "batch mint failed");
                    let updates: Vec<TxUpdate> = row_keys
                        .into_iter()
                        .map(|(tx_id, vout)| TxUpdate {
                            tx_id,
                            vout,
                            status: MintStatus::MintFailed,
                            ledger_tx_id: None,
                        })
                        .collect();
                    self.storage.batch_update_txs(&updates).await?;
                }
            }
        }
        Ok(())
    }

    /// Build the proof-carrying mint argument for one transaction group.
    ///
    /// Returns `Ok(None)` when the group is withheld this cycle: parked as
    /// non-active, transitioned as a reorg, waiting for block bytes, or
    /// failing the root soundness check.
    async fn prepare_group(&self, tx_id: &str, group: &TxGroup) -> Result<Option<PreparedGroup>> {
        let Some(first) = group.deposits.first() else {
            return Ok(None);
        };

        if !self
            .registry
            .is_package_active(&first.package_id, &first.ledger_network)
        {
            warn!(
                tx_id = %tx_id,
                package_id = %first.package_id,
                "destination package has no active deposit address, parking transaction"
            );
            self.storage
                .update_txs_status(&[tx_id.to_string()], MintStatus::FinalizedNonActive)
                .await?;
            return Ok(None);
        }

        let Some(raw) = self.storage.get_block(&group.block_hash).await? else {
            warn!(
                tx_id = %tx_id,
                block_hash = %group.block_hash,
                "block bytes not found, skipping transaction"
            );
            return Ok(None);
        };
        let block: Block = match deserialize(&raw) {
            Ok(block) => block,
            Err(e) => {
                error!(block_hash = %group.block_hash, error = %e, "stored block bytes do not decode");
                return Ok(None);
            }
        };
        let tree = MerkleTree::build(&block.txdata)?;

        let Some(tx_index) = block
            .txdata
            .iter()
            .position(|tx| tx.compute_txid().to_string() == tx_id)
        else {
            // the transaction vanished from the block it finalized in: a
            // reorg deeper than the confirmation window
            error!(tx_id = %tx_id, "could not find transaction within its block, detecting reorg");
            self.mark_deep_reorg(tx_id).await?;
            return Ok(None);
        };
        let target_tx = &block.txdata[tx_index];

        let proof = tree.proof(target_tx)?;
        let root = tree.root(false);

        // Soundness check. A mismatch between the computed root and the one
        // committed in the block header must never happen; it means the tree
        // implementation is wrong, the stored block bytes are corrupted, or
        // the relayer fed us bad data. Withhold the group without touching
        // its status: a local computation fault is not evidence against the
        // deposit.
        let committed = block.header.merkle_root.to_byte_array();
        if committed != root {
            error!(
                tx_id = %tx_id,
                block_root = %hex::encode(committed),
                calculated_root = %hex::encode(root),
                "merkle root mismatch, withholding group from submission"
            );
            return Ok(None);
        }

        // ship the witness-stripped bytes the txid commits to
        let mut stripped = target_tx.clone();
        for input in &mut stripped.input {
            input.witness = Witness::default();
        }

        let package_key = format!("{}-{}", first.package_id, first.ledger_network);
        let row_keys = group
            .deposits
            .iter()
            .map(|d| (d.tx_id.clone(), d.vout))
            .collect();

        Ok(Some(PreparedGroup {
            package_key,
            arg: MintBatchArg {
                tx_bytes: serialize(&stripped),
                block_height: group.block_height,
                tx_index: tx_index as u32,
                proof: ProofResult { path: proof, root },
                package_id: first.package_id.clone(),
                ledger_network: first.ledger_network.clone(),
            },
            row_keys,
        }))
    }

    /// Transition a vanished transaction to the reorg state matching its
    /// current status
    async fn mark_deep_reorg(&self, tx_id: &str) -> Result<()> {
        let status = self.storage.get_tx_status(tx_id).await?;
        let reorg_status = match status {
            Some(MintStatus::Minted) => MintStatus::MintedReorg,
            Some(MintStatus::Finalized) | Some(MintStatus::MintFailed) => {
                MintStatus::FinalizedReorg
            }
            other => {
                error!(
                    tx_id = %tx_id,
                    status = ?other,
                    "unexpected status during reorg detection, skipping"
                );
                return Ok(());
            }
        };
        self.storage
            .update_txs_status(&[tx_id.to_string()], reorg_status)
            .await?;
        warn!(tx_id = %tx_id, new_status = %reorg_status, "transaction reorged");
        debug!(tx_id = %tx_id, "transaction excluded from future mint attempts");
        Ok(())
    }
}
