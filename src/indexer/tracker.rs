//! Confirmation Tracker
//!
//! Drives confirming rows toward finalization and catches reorgs at both
//! ends of the window: before finalization (SPV attestation and
//! height→hash comparison) and after minting (deep-reorg sweep over minted
//! rows). Every check derives purely from persisted state plus external
//! truth, so re-running a sweep is always safe.

use bitcoin::consensus::encode::deserialize;
use bitcoin::Block;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::common::Result;
use crate::ledger::LedgerClient;
use crate::storage::Storage;
use crate::types::{confirmations, BtcNet, ConfirmingTx, MintStatus};

/// Tracks deposit confirmations and reorgs
pub struct ConfirmationTracker {
    storage: Arc<dyn Storage>,
    ledger: Arc<dyn LedgerClient>,
    network: BtcNet,
    confirmation_depth: u64,
}

impl ConfirmationTracker {
    pub fn new(
        storage: Arc<dyn Storage>,
        ledger: Arc<dyn LedgerClient>,
        network: BtcNet,
        confirmation_depth: u64,
    ) -> Self {
        Self {
            storage,
            ledger,
            network,
            confirmation_depth,
        }
    }

    /// One finalization sweep: SPV-check confirming blocks, move reorged
    /// rows aside, finalize everything that has reached the confirmation
    /// depth relative to `latest_height`.
    pub async fn update_confirmations_and_finalize(&self, latest_height: u64) -> Result<()> {
        self.verify_confirming_blocks().await?;

        let pending = self.storage.get_confirming_txs().await?;
        if pending.is_empty() {
            return Ok(());
        }
        debug!(
            count = pending.len(),
            chain_tip = latest_height,
            "checking confirming transactions"
        );

        let reorged = self.handle_reorgs(&pending).await?;
        if !reorged.is_empty() {
            debug!(count = reorged.len(), "updating reorged transactions");
            self.storage
                .update_txs_status(&reorged, MintStatus::Reorg)
                .await?;
        }

        // a reorged tx must never finalize in the same sweep
        let finalizable: Vec<String> = pending
            .iter()
            .filter(|tx| !reorged.contains(&tx.tx_id))
            .filter(|tx| self.has_enough_confirmations(tx, latest_height))
            .map(|tx| tx.tx_id.clone())
            .collect();

        if !finalizable.is_empty() {
            info!(count = finalizable.len(), "finalizing transactions");
            self.storage.finalize_txs(&finalizable).await?;
        }
        Ok(())
    }

    /// Ask the destination chain's light client whether the blocks holding
    /// confirming rows are still canonical; rows in de-attested blocks go to
    /// `Reorg`. A transport failure is transient: logged, sweep continues.
    pub async fn verify_confirming_blocks(&self) -> Result<()> {
        let block_hashes = self.storage.get_confirming_blocks().await?;
        if block_hashes.is_empty() {
            debug!("no confirming blocks to verify");
            return Ok(());
        }

        match self.ledger.verify_blocks(&block_hashes).await {
            Ok(results) => {
                let invalid: Vec<String> = block_hashes
                    .into_iter()
                    .zip(results)
                    .filter(|(_, attested)| !attested)
                    .map(|(hash, _)| hash)
                    .collect();

                if invalid.is_empty() {
                    debug!("all confirming blocks attested");
                } else {
                    warn!(
                        reorged_blocks = ?invalid,
                        "light client no longer attests blocks, marking their transactions"
                    );
                    self.storage.update_confirming_txs_to_reorg(&invalid).await?;
                }
            }
            Err(e) => {
                error!(error = %e, "failed to verify blocks with light client");
            }
        }
        Ok(())
    }

    /// Height→hash comparison: a row whose recorded block hash no longer
    /// matches what is stored at that height has been reorged out.
    pub async fn handle_reorgs(&self, pending: &[ConfirmingTx]) -> Result<Vec<String>> {
        let mut reorged = Vec::new();
        for tx in pending {
            let Some(stored_hash) = &tx.block_hash else {
                continue;
            };
            let Some(current) = self
                .storage
                .get_block_info(tx.block_height, self.network)
                .await?
            else {
                continue;
            };
            if &current.hash != stored_hash {
                warn!(
                    tx_id = %tx.tx_id,
                    height = tx.block_height,
                    old_hash = %stored_hash,
                    new_hash = %current.hash,
                    "reorg detected"
                );
                reorged.push(tx.tx_id.clone());
            }
        }
        Ok(reorged)
    }

    fn has_enough_confirmations(&self, tx: &ConfirmingTx, latest_height: u64) -> bool {
        let confs = confirmations(Some(tx.block_height), Some(latest_height));
        if confs >= self.confirmation_depth {
            info!(
                tx_id = %tx.tx_id,
                confirmations = confs,
                required = self.confirmation_depth,
                "transaction has enough confirmations"
            );
            true
        } else {
            false
        }
    }

    /// Deep-reorg sweep over minted rows: a minted transaction that can no
    /// longer be located inside its recorded block moves to `MintedReorg`.
    /// There is no automatic remediation; the error-level log is the signal
    /// for operator intervention.
    pub async fn detect_minted_reorgs(&self) -> Result<()> {
        debug!("checking for reorgs on minted transactions");
        let minted = self.storage.get_minted_txs().await?;

        for tx in minted {
            let raw = match self.storage.get_block(&tx.block_hash).await {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    warn!(
                        tx_id = %tx.tx_id,
                        block_hash = %tx.block_hash,
                        "block bytes missing for minted transaction"
                    );
                    continue;
                }
                Err(e) => {
                    error!(tx_id = %tx.tx_id, error = %e, "failed to load block for minted transaction");
                    continue;
                }
            };
            let block: Block = match deserialize(&raw) {
                Ok(block) => block,
                Err(e) => {
                    error!(block_hash = %tx.block_hash, error = %e, "stored block bytes do not decode");
                    continue;
                }
            };

            let present = block
                .txdata
                .iter()
                .any(|t| t.compute_txid().to_string() == tx.tx_id);
            if !present {
                error!(
                    tx_id = %tx.tx_id,
                    block_hash = %tx.block_hash,
                    block_height = tx.block_height,
                    "CRITICAL: deep reorg detected on minted transaction"
                );
                if let Err(e) = self
                    .storage
                    .update_txs_status(&[tx.tx_id.clone()], MintStatus::MintedReorg)
                    .await
                {
                    error!(tx_id = %tx.tx_id, error = %e, "failed to record minted reorg");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::test_utils::{block_with, coinbase_tx, p2wpkh_script, tx_with_outputs};
    use crate::ledger::MockLedgerClient;
    use crate::storage::MemoryStorage;
    use crate::types::{DepositInsertion, TxUpdate};

    const NET: BtcNet = BtcNet::Regtest;
    const DEPTH: u64 = 8;

    fn insertion(tx_id: &str, block_hash: &str, height: u64) -> DepositInsertion {
        DepositInsertion {
            tx_id: tx_id.to_string(),
            vout: 0,
            block_hash: block_hash.to_string(),
            block_height: height,
            recipient: "0xrecipient".to_string(),
            amount_sats: 50_000,
            package_id: "0xpkg-a".to_string(),
            ledger_network: "testnet".to_string(),
        }
    }

    fn attesting_ledger() -> MockLedgerClient {
        let mut ledger = MockLedgerClient::new();
        ledger
            .expect_verify_blocks()
            .returning(|hashes| Ok(vec![true; hashes.len()]));
        ledger
    }

    fn tracker(storage: Arc<MemoryStorage>, ledger: MockLedgerClient) -> ConfirmationTracker {
        ConfirmationTracker::new(storage, Arc::new(ledger), NET, DEPTH)
    }

    #[tokio::test]
    async fn test_finalization_boundary_is_inclusive() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .insert_block_info(100, NET, "hashA")
            .await
            .unwrap();
        storage
            .insert_or_update_txs(&[insertion("tx1", "hashA", 100)])
            .await
            .unwrap();

        let tracker = tracker(Arc::clone(&storage), attesting_ledger());

        // 107 - 100 + 1 = 8 = depth → finalizable; 106 is one short
        tracker.update_confirmations_and_finalize(106).await.unwrap();
        assert_eq!(
            storage.get_tx_status("tx1").await.unwrap(),
            Some(MintStatus::Confirming)
        );

        tracker.update_confirmations_and_finalize(107).await.unwrap();
        assert_eq!(
            storage.get_tx_status("tx1").await.unwrap(),
            Some(MintStatus::Finalized)
        );
    }

    #[tokio::test]
    async fn test_height_hash_mismatch_marks_reorg() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .insert_block_info(100, NET, "hashA")
            .await
            .unwrap();
        storage
            .insert_or_update_txs(&[insertion("tx1", "hashA", 100)])
            .await
            .unwrap();
        // the block at height 100 is replaced: reorg
        storage
            .insert_block_info(100, NET, "hashA2")
            .await
            .unwrap();

        let tracker = tracker(Arc::clone(&storage), attesting_ledger());
        tracker.update_confirmations_and_finalize(200).await.unwrap();

        // despite 100+ confirmations the row must not finalize
        assert_eq!(
            storage.get_tx_status("tx1").await.unwrap(),
            Some(MintStatus::Reorg)
        );
    }

    #[tokio::test]
    async fn test_spv_deattestation_marks_reorg() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .insert_block_info(100, NET, "hashA")
            .await
            .unwrap();
        storage
            .insert_or_update_txs(&[insertion("tx1", "hashA", 100)])
            .await
            .unwrap();

        let mut ledger = MockLedgerClient::new();
        ledger
            .expect_verify_blocks()
            .returning(|hashes| Ok(vec![false; hashes.len()]));

        let tracker = tracker(Arc::clone(&storage), ledger);
        tracker.update_confirmations_and_finalize(200).await.unwrap();

        assert_eq!(
            storage.get_tx_status("tx1").await.unwrap(),
            Some(MintStatus::Reorg)
        );
    }

    #[tokio::test]
    async fn test_spv_transport_failure_is_transient() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .insert_block_info(100, NET, "hashA")
            .await
            .unwrap();
        storage
            .insert_or_update_txs(&[insertion("tx1", "hashA", 100)])
            .await
            .unwrap();

        let mut ledger = MockLedgerClient::new();
        ledger
            .expect_verify_blocks()
            .returning(|_| Err(crate::ledger::LedgerError::Rpc("unavailable".to_string())));

        let tracker = tracker(Arc::clone(&storage), ledger);
        // the sweep continues; the row still finalizes on chain evidence
        tracker.update_confirmations_and_finalize(200).await.unwrap();
        assert_eq!(
            storage.get_tx_status("tx1").await.unwrap(),
            Some(MintStatus::Finalized)
        );
    }

    #[tokio::test]
    async fn test_minted_reorg_sweep() {
        let storage = Arc::new(MemoryStorage::new());

        // block contains only the coinbase; the minted tx is *not* in it
        let vanished_tx = tx_with_outputs(vec![(50_000, p2wpkh_script(1))]);
        let block = block_with(vec![coinbase_tx(100)]);
        let block_hash = block.block_hash().to_string();
        storage
            .put_block(100, NET, &block_hash, &bitcoin::consensus::encode::serialize(&block))
            .await
            .unwrap();

        let tx_id = vanished_tx.compute_txid().to_string();
        storage
            .insert_or_update_txs(&[insertion(&tx_id, &block_hash, 100)])
            .await
            .unwrap();
        storage.finalize_txs(&[tx_id.clone()]).await.unwrap();
        storage
            .batch_update_txs(&[TxUpdate {
                tx_id: tx_id.clone(),
                vout: 0,
                status: MintStatus::Minted,
                ledger_tx_id: Some("0xdigest".to_string()),
            }])
            .await
            .unwrap();

        let tracker = tracker(Arc::clone(&storage), MockLedgerClient::new());
        tracker.detect_minted_reorgs().await.unwrap();

        assert_eq!(
            storage.get_tx_status(&tx_id).await.unwrap(),
            Some(MintStatus::MintedReorg)
        );
    }

    #[tokio::test]
    async fn test_minted_tx_still_present_is_untouched() {
        let storage = Arc::new(MemoryStorage::new());

        let tx = tx_with_outputs(vec![(50_000, p2wpkh_script(1))]);
        let block = block_with(vec![coinbase_tx(100), tx.clone()]);
        let block_hash = block.block_hash().to_string();
        storage
            .put_block(100, NET, &block_hash, &bitcoin::consensus::encode::serialize(&block))
            .await
            .unwrap();

        let tx_id = tx.compute_txid().to_string();
        storage
            .insert_or_update_txs(&[insertion(&tx_id, &block_hash, 100)])
            .await
            .unwrap();
        storage.finalize_txs(&[tx_id.clone()]).await.unwrap();
        storage
            .batch_update_txs(&[TxUpdate {
                tx_id: tx_id.clone(),
                vout: 0,
                status: MintStatus::Minted,
                ledger_tx_id: Some("0xdigest".to_string()),
            }])
            .await
            .unwrap();

        let tracker = tracker(Arc::clone(&storage), MockLedgerClient::new());
        tracker.detect_minted_reorgs().await.unwrap();

        assert_eq!(
            storage.get_tx_status(&tx_id).await.unwrap(),
            Some(MintStatus::Minted)
        );
    }
}
