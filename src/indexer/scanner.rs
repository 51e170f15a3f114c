//! Block Scanner
//!
//! Per-block driver: pulls unscanned block references in height order,
//! decodes the raw bytes from the blob store, runs the deposit detector
//! over every transaction, persists the results as confirming rows and
//! advances the chain-tip watermark.

use bitcoin::consensus::encode::deserialize;
use bitcoin::{Block, Transaction};
use futures_util::future::join_all;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::detector::DepositDetector;
use crate::common::Result;
use crate::esplora::TxLookup;
use crate::storage::Storage;
use crate::types::{DepositInsertion, SenderDeposit};

/// Scans ingested blocks for deposits
pub struct BlockScanner {
    storage: Arc<dyn Storage>,
    detector: DepositDetector,
    tx_lookup: Arc<dyn TxLookup>,
    batch_size: u32,
}

impl BlockScanner {
    pub fn new(
        storage: Arc<dyn Storage>,
        detector: DepositDetector,
        tx_lookup: Arc<dyn TxLookup>,
        batch_size: u32,
    ) -> Self {
        Self {
            storage,
            detector,
            tx_lookup,
            batch_size,
        }
    }

    /// Scan up to `batch_size` unscanned blocks.
    ///
    /// A block whose bytes are not yet visible in the blob store is skipped
    /// without being marked scanned, so the next cycle picks it up again.
    /// Deposit rows are upserted by `(tx_id, vout)`, which makes rescanning
    /// the same block a no-op.
    pub async fn scan_new_blocks(&self) -> Result<()> {
        let blocks = self.storage.get_blocks_to_process(self.batch_size).await?;
        if blocks.is_empty() {
            debug!("no new blocks to scan");
            return Ok(());
        }
        debug!(count = blocks.len(), "found blocks to process");

        let mut insertions: Vec<DepositInsertion> = Vec::new();
        let mut senders: Vec<SenderDeposit> = Vec::new();
        let mut scanned_heights: Vec<u64> = Vec::new();

        for block_info in &blocks {
            info!(height = block_info.height, hash = %block_info.hash, "processing block");

            let Some(raw) = self.storage.get_block(&block_info.hash).await? else {
                warn!(
                    block_hash = %block_info.hash,
                    block_height = block_info.height,
                    "block bytes not found in blob store, skipping scan for this block"
                );
                continue;
            };
            let block: Block = match deserialize(&raw) {
                Ok(block) => block,
                Err(e) => {
                    warn!(
                        block_hash = %block_info.hash,
                        error = %e,
                        "stored block bytes do not decode, skipping"
                    );
                    continue;
                }
            };

            for tx in &block.txdata {
                let deposits = self.detector.find_deposits(tx);
                if deposits.is_empty() {
                    continue;
                }
                let tx_id = tx.compute_txid().to_string();

                for sender in self.sender_addresses(tx).await {
                    senders.push(SenderDeposit {
                        tx_id: tx_id.clone(),
                        sender,
                    });
                }

                for deposit in deposits {
                    info!(
                        tx_id = %tx_id,
                        vout = deposit.vout,
                        amount_sats = deposit.amount_sats,
                        recipient = %deposit.recipient,
                        package_id = %deposit.package_id,
                        "found new deposit"
                    );
                    insertions.push(DepositInsertion {
                        tx_id: tx_id.clone(),
                        vout: deposit.vout,
                        block_hash: block_info.hash.clone(),
                        block_height: block_info.height,
                        recipient: deposit.recipient,
                        amount_sats: deposit.amount_sats,
                        package_id: deposit.package_id,
                        ledger_network: deposit.ledger_network,
                    });
                }
            }
            scanned_heights.push(block_info.height);
        }

        if !insertions.is_empty() {
            self.storage.insert_or_update_txs(&insertions).await?;
        } else {
            debug!("no new deposits found in scanned blocks");
        }
        if !senders.is_empty() {
            self.storage.insert_sender_deposits(&senders).await?;
        }

        if let Some(max_height) = scanned_heights.iter().max() {
            self.storage.set_chain_tip(*max_height).await?;
            info!(latest_height = max_height, "updated chain tip");
            self.storage.mark_blocks_scanned(&scanned_heights).await?;
        }
        Ok(())
    }

    /// Best-effort sender recovery: look up every input's previous
    /// transaction concurrently and collect the spending addresses. A single
    /// failed lookup is logged and ignored; it never blocks the others or
    /// the deposit itself.
    async fn sender_addresses(&self, tx: &Transaction) -> Vec<String> {
        let fetches = tx
            .input
            .iter()
            .filter(|input| !input.previous_output.is_null())
            .map(|input| {
                let prev_txid = input.previous_output.txid.to_string();
                let prev_vout = input.previous_output.vout as usize;
                let lookup = Arc::clone(&self.tx_lookup);
                async move {
                    match lookup.get_tx(&prev_txid).await {
                        Ok(prev_tx) => prev_tx
                            .vout
                            .get(prev_vout)
                            .and_then(|out| out.scriptpubkey_address.clone()),
                        Err(e) => {
                            warn!(
                                prev_txid = %prev_txid,
                                error = %e,
                                "failed to fetch previous tx for sender address"
                            );
                            None
                        }
                    }
                }
            });

        let addresses: BTreeSet<String> = join_all(fetches).await.into_iter().flatten().collect();
        addresses.into_iter().collect()
    }
}
