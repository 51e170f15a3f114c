//! In-memory Storage
//!
//! Thread-safe in-memory implementation of the [`Storage`] contract, used by
//! tests and local development. Uses `Arc<RwLock<>>` maps keyed by the same
//! natural keys as the SQLite implementation.

use async_trait::async_trait;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

use super::traits::{Storage, StorageError, StorageResult};
use crate::types::{
    now_ms, BlockInfo, BlockStatus, BroadcastedDeposit, BtcNet, ConfirmingTx, DepositInsertion,
    DepositRow, FinalizedTx, MintStatus, SenderDeposit, TxUpdate,
};

#[derive(Debug, Clone)]
struct BlockEntry {
    hash: String,
    status: BlockStatus,
}

#[derive(Default)]
struct Inner {
    /// Raw block bytes by hash
    blobs: HashMap<String, Vec<u8>>,
    /// Block references by natural key
    blocks: HashMap<(u64, BtcNet), BlockEntry>,
    /// Deposit rows by natural key
    rows: HashMap<(String, u32), DepositRow>,
    /// Sender address → transaction ids
    senders: HashMap<String, HashSet<String>>,
    chain_tip: Option<u64>,
}

/// In-memory store
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a status transition to a row, rejecting paths outside the
    /// lifecycle instead of silently overwriting.
    fn transition(row: &mut DepositRow, next: MintStatus) -> bool {
        if row.status.can_transition_to(next) {
            row.status = next;
            row.updated_at = now_ms();
            true
        } else {
            warn!(
                tx_id = %row.tx_id,
                vout = row.vout,
                from = %row.status,
                to = %next,
                "rejected invalid status transition"
            );
            false
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn put_block(
        &self,
        height: u64,
        network: BtcNet,
        hash: &str,
        raw: &[u8],
    ) -> StorageResult<()> {
        {
            let mut inner = self.inner.write().await;
            inner.blobs.insert(hash.to_string(), raw.to_vec());
        }
        self.insert_block_info(height, network, hash).await
    }

    async fn insert_block_info(
        &self,
        height: u64,
        network: BtcNet,
        hash: &str,
    ) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        match inner.blocks.entry((height, network)) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                // a different hash at a known height is a reorg replacement
                // and needs a fresh scan; same hash is idempotent redelivery
                if entry.hash != hash {
                    entry.hash = hash.to_string();
                    entry.status = BlockStatus::New;
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(BlockEntry {
                    hash: hash.to_string(),
                    status: BlockStatus::New,
                });
            }
        }
        Ok(())
    }

    async fn get_block(&self, hash: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.inner.read().await.blobs.get(hash).cloned())
    }

    async fn get_block_info(
        &self,
        height: u64,
        network: BtcNet,
    ) -> StorageResult<Option<BlockInfo>> {
        Ok(self
            .inner
            .read()
            .await
            .blocks
            .get(&(height, network))
            .map(|e| BlockInfo {
                height,
                hash: e.hash.clone(),
            }))
    }

    async fn get_blocks_to_process(&self, limit: u32) -> StorageResult<Vec<BlockInfo>> {
        let inner = self.inner.read().await;
        let mut blocks: Vec<BlockInfo> = inner
            .blocks
            .iter()
            .filter(|(_, e)| e.status == BlockStatus::New)
            .map(|((height, _), e)| BlockInfo {
                height: *height,
                hash: e.hash.clone(),
            })
            .collect();
        blocks.sort_by_key(|b| b.height);
        blocks.truncate(limit as usize);
        Ok(blocks)
    }

    async fn mark_blocks_scanned(&self, heights: &[u64]) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        for ((height, _), entry) in inner.blocks.iter_mut() {
            if heights.contains(height) {
                entry.status = BlockStatus::Scanned;
            }
        }
        Ok(())
    }

    async fn get_latest_block_height(&self) -> StorageResult<Option<u64>> {
        Ok(self
            .inner
            .read()
            .await
            .blocks
            .keys()
            .map(|(height, _)| *height)
            .max())
    }

    async fn get_chain_tip(&self) -> StorageResult<Option<u64>> {
        Ok(self.inner.read().await.chain_tip)
    }

    async fn set_chain_tip(&self, height: u64) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        // the watermark only moves forward
        inner.chain_tip = Some(inner.chain_tip.map_or(height, |t| t.max(height)));
        Ok(())
    }

    async fn get_confirming_blocks(&self) -> StorageResult<Vec<String>> {
        let inner = self.inner.read().await;
        let mut hashes: HashSet<String> = HashSet::new();
        for row in inner.rows.values() {
            if row.status == MintStatus::Confirming {
                if let Some(hash) = &row.block_hash {
                    hashes.insert(hash.clone());
                }
            }
        }
        Ok(hashes.into_iter().collect())
    }

    async fn insert_or_update_txs(&self, txs: &[DepositInsertion]) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let now = now_ms();
        for tx in txs {
            match inner.rows.entry((tx.tx_id.clone(), tx.vout)) {
                Entry::Occupied(mut occupied) => {
                    let row = occupied.get_mut();
                    if MemoryStorage::transition(row, MintStatus::Confirming) {
                        row.block_hash = Some(tx.block_hash.clone());
                        row.block_height = Some(tx.block_height);
                    }
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(DepositRow {
                        tx_id: tx.tx_id.clone(),
                        vout: tx.vout,
                        block_hash: Some(tx.block_hash.clone()),
                        block_height: Some(tx.block_height),
                        recipient: tx.recipient.clone(),
                        amount_sats: tx.amount_sats,
                        status: MintStatus::Confirming,
                        package_id: tx.package_id.clone(),
                        ledger_network: tx.ledger_network.clone(),
                        retry_count: 0,
                        ledger_tx_id: None,
                        created_at: now,
                        updated_at: now,
                    });
                }
            }
        }
        Ok(())
    }

    async fn get_finalized_txs(&self, max_retries: u32) -> StorageResult<Vec<FinalizedTx>> {
        let inner = self.inner.read().await;
        let mut txs: Vec<FinalizedTx> = inner
            .rows
            .values()
            .filter(|row| {
                row.status == MintStatus::Finalized
                    || (row.status == MintStatus::MintFailed && row.retry_count <= max_retries)
            })
            .filter_map(row_to_finalized)
            .collect();
        txs.sort_by(|a, b| (&a.tx_id, a.vout).cmp(&(&b.tx_id, b.vout)));
        Ok(txs)
    }

    async fn update_txs_status(&self, tx_ids: &[String], status: MintStatus) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        for row in inner.rows.values_mut() {
            if tx_ids.contains(&row.tx_id) {
                MemoryStorage::transition(row, status);
            }
        }
        Ok(())
    }

    async fn batch_update_txs(&self, updates: &[TxUpdate]) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        for update in updates {
            let key = (update.tx_id.clone(), update.vout);
            let row = inner
                .rows
                .get_mut(&key)
                .ok_or_else(|| StorageError::NotFound(format!("{}:{}", update.tx_id, update.vout)))?;
            if !MemoryStorage::transition(row, update.status) {
                continue;
            }
            match update.status {
                MintStatus::Minted => row.ledger_tx_id = update.ledger_tx_id.clone(),
                MintStatus::MintFailed => row.retry_count += 1,
                _ => {}
            }
        }
        Ok(())
    }

    async fn update_confirming_txs_to_reorg(&self, block_hashes: &[String]) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        for row in inner.rows.values_mut() {
            if row.status == MintStatus::Confirming
                && row
                    .block_hash
                    .as_ref()
                    .is_some_and(|h| block_hashes.contains(h))
            {
                MemoryStorage::transition(row, MintStatus::Reorg);
            }
        }
        Ok(())
    }

    async fn get_confirming_txs(&self) -> StorageResult<Vec<ConfirmingTx>> {
        let inner = self.inner.read().await;
        let mut txs: Vec<ConfirmingTx> = inner
            .rows
            .values()
            .filter(|row| row.status == MintStatus::Confirming)
            .filter_map(|row| {
                row.block_height.map(|height| ConfirmingTx {
                    tx_id: row.tx_id.clone(),
                    block_hash: row.block_hash.clone(),
                    block_height: height,
                })
            })
            .collect();
        txs.sort_by(|a, b| a.tx_id.cmp(&b.tx_id));
        txs.dedup_by(|a, b| a.tx_id == b.tx_id);
        Ok(txs)
    }

    async fn finalize_txs(&self, tx_ids: &[String]) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        for row in inner.rows.values_mut() {
            if row.status == MintStatus::Confirming && tx_ids.contains(&row.tx_id) {
                MemoryStorage::transition(row, MintStatus::Finalized);
            }
        }
        Ok(())
    }

    async fn get_minted_txs(&self) -> StorageResult<Vec<FinalizedTx>> {
        let inner = self.inner.read().await;
        Ok(inner
            .rows
            .values()
            .filter(|row| row.status == MintStatus::Minted)
            .filter_map(row_to_finalized)
            .collect())
    }

    async fn register_broadcasted_tx(
        &self,
        deposits: &[BroadcastedDeposit],
    ) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let now = now_ms();
        for deposit in deposits {
            let key = (deposit.tx_id.clone(), deposit.vout);
            // a row already observed by the scanner wins over a late registration
            inner.rows.entry(key).or_insert_with(|| DepositRow {
                tx_id: deposit.tx_id.clone(),
                vout: deposit.vout,
                block_hash: None,
                block_height: None,
                recipient: deposit.recipient.clone(),
                amount_sats: deposit.amount_sats,
                status: MintStatus::Broadcasting,
                package_id: deposit.package_id.clone(),
                ledger_network: deposit.ledger_network.clone(),
                retry_count: 0,
                ledger_tx_id: None,
                created_at: now,
                updated_at: now,
            });
        }
        Ok(())
    }

    async fn insert_sender_deposits(&self, senders: &[SenderDeposit]) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        for s in senders {
            inner
                .senders
                .entry(s.sender.clone())
                .or_default()
                .insert(s.tx_id.clone());
        }
        Ok(())
    }

    async fn get_tx_status(&self, tx_id: &str) -> StorageResult<Option<MintStatus>> {
        let inner = self.inner.read().await;
        Ok(inner
            .rows
            .values()
            .find(|row| row.tx_id == tx_id)
            .map(|row| row.status))
    }

    async fn get_txs_by_id(&self, tx_id: &str) -> StorageResult<Vec<DepositRow>> {
        let inner = self.inner.read().await;
        let mut rows: Vec<DepositRow> = inner
            .rows
            .values()
            .filter(|row| row.tx_id == tx_id)
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.vout);
        Ok(rows)
    }

    async fn get_txs_by_recipient(&self, recipient: &str) -> StorageResult<Vec<DepositRow>> {
        let inner = self.inner.read().await;
        let mut rows: Vec<DepositRow> = inner
            .rows
            .values()
            .filter(|row| row.recipient == recipient)
            .cloned()
            .collect();
        rows.sort_by_key(|row| std::cmp::Reverse(row.created_at));
        Ok(rows)
    }

    async fn get_txs_by_sender(&self, btc_address: &str) -> StorageResult<Vec<DepositRow>> {
        let inner = self.inner.read().await;
        let Some(tx_ids) = inner.senders.get(btc_address) else {
            return Ok(Vec::new());
        };
        let mut rows: Vec<DepositRow> = inner
            .rows
            .values()
            .filter(|row| tx_ids.contains(&row.tx_id))
            .cloned()
            .collect();
        rows.sort_by_key(|row| std::cmp::Reverse(row.created_at));
        Ok(rows)
    }
}

fn row_to_finalized(row: &DepositRow) -> Option<FinalizedTx> {
    let (block_hash, block_height) = match (&row.block_hash, row.block_height) {
        (Some(hash), Some(height)) => (hash.clone(), height),
        _ => return None,
    };
    Some(FinalizedTx {
        tx_id: row.tx_id.clone(),
        vout: row.vout,
        block_hash,
        block_height,
        retry_count: row.retry_count,
        package_id: row.package_id.clone(),
        ledger_network: row.ledger_network.clone(),
    })
}
