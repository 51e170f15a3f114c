//! Indexer Core
//!
//! Wires the block scanner, confirmation tracker and mint batcher over
//! shared storage and clients, accepts inbound block-reference batches from
//! the ingestion collaborator, and exposes the deposit status query
//! surface.
//!
//! # Flow
//! 1. Ingestion delivers block references; [`Indexer::process_block_batch`]
//!    records them (at-least-once, failures redelivered)
//! 2. Scan cycle decodes blocks and persists deposits as confirming rows
//! 3. Finalization cycle SPV-checks blocks, handles reorgs and finalizes
//!    rows past the confirmation depth
//! 4. Mint cycle batches finalized rows into mint calls per package
//! 5. Minted-reorg sweep watches for deep reorgs under minted rows

pub mod batcher;
pub mod detector;
pub mod scanner;
#[cfg(test)]
pub mod test_utils;
pub mod tracker;

pub use batcher::MintBatcher;
pub use detector::DepositDetector;
pub use scanner::BlockScanner;
pub use tracker::ConfirmationTracker;

use bitcoin::consensus::encode::deserialize;
use bitcoin::Transaction;
use serde::Serialize;
use std::sync::Arc;
use tokio::time::{interval, Duration};
use tracing::{error, info, warn};

use crate::common::{IndexerError, Result};
use crate::config::{DepositAddressRegistry, IndexerConfig};
use crate::esplora::TxLookup;
use crate::ledger::LedgerClient;
use crate::storage::Storage;
use crate::types::{BlockQueueMessage, BroadcastedDeposit, DepositStatusResponse};

/// Delay before the single in-process retry of a failed block message;
/// anything still failing after that goes back to the queue
const BATCH_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Result of registering a broadcasted deposit transaction
#[derive(Debug, Clone, Serialize)]
pub struct BroadcastRegistration {
    pub tx_id: String,
    pub registered_deposits: usize,
}

/// The deposit-indexing core
pub struct Indexer {
    storage: Arc<dyn Storage>,
    detector: DepositDetector,
    scanner: BlockScanner,
    tracker: ConfirmationTracker,
    batcher: MintBatcher,
    config: IndexerConfig,
}

impl Indexer {
    pub fn new(
        config: IndexerConfig,
        registry: DepositAddressRegistry,
        storage: Arc<dyn Storage>,
        ledger: Arc<dyn LedgerClient>,
        tx_lookup: Arc<dyn TxLookup>,
    ) -> Self {
        let detector = DepositDetector::new(
            registry.clone(),
            config.fallback_recipient.clone(),
            config.network,
        );
        let scanner = BlockScanner::new(
            Arc::clone(&storage),
            detector.clone(),
            tx_lookup,
            config.scan_batch_size,
        );
        let tracker = ConfirmationTracker::new(
            Arc::clone(&storage),
            Arc::clone(&ledger),
            config.network,
            config.confirmation_depth,
        );
        let batcher = MintBatcher::new(
            Arc::clone(&storage),
            ledger,
            registry,
            config.max_mint_retries,
        );
        Self {
            storage,
            detector,
            scanner,
            tracker,
            batcher,
            config,
        }
    }

    /// Handle a batch of inbound block references.
    ///
    /// Delivery is at-least-once: each message records the block reference
    /// and verifies the raw bytes are visible in the blob store. Messages
    /// that fail (typically blob-store replication lag) are retried once
    /// after a short fixed delay; whatever still fails is returned to the
    /// caller for redelivery.
    pub async fn process_block_batch(
        &self,
        messages: &[BlockQueueMessage],
    ) -> Vec<BlockQueueMessage> {
        let mut failed = Vec::new();
        for message in messages {
            if let Err(e) = self.process_block_message(message).await {
                warn!(
                    block_hash = %message.hash,
                    height = message.height,
                    error = %e,
                    "failed to process block message, will retry"
                );
                failed.push(message.clone());
            }
        }

        if failed.is_empty() {
            return failed;
        }
        tokio::time::sleep(BATCH_RETRY_DELAY).await;

        let mut still_failed = Vec::new();
        for message in failed {
            if let Err(e) = self.process_block_message(&message).await {
                error!(
                    block_hash = %message.hash,
                    height = message.height,
                    error = %e,
                    "block message failed again, leaving for redelivery"
                );
                still_failed.push(message);
            }
        }
        still_failed
    }

    async fn process_block_message(&self, message: &BlockQueueMessage) -> Result<()> {
        if message.network != self.config.network {
            warn!(
                message_network = %message.network,
                indexer_network = %self.config.network,
                "dropping block message for foreign network"
            );
            return Ok(());
        }
        self.storage
            .insert_block_info(message.height, message.network, &message.hash)
            .await?;
        // the scan cycle needs the bytes; surface replication lag here so
        // the message is redelivered instead of silently lost
        if self.storage.get_block(&message.hash).await?.is_none() {
            return Err(IndexerError::BlockNotFound(message.hash.clone()));
        }
        Ok(())
    }

    /// One full processing cycle. Every step runs even if an earlier one
    /// fails; failures are logged and retried next cycle.
    pub async fn process_cycle(&self) {
        if let Err(e) = self.scanner.scan_new_blocks().await {
            error!(error = %e, "block scan cycle failed");
        }

        match self.storage.get_chain_tip().await {
            Ok(Some(tip)) => {
                if let Err(e) = self.tracker.update_confirmations_and_finalize(tip).await {
                    error!(error = %e, "finalization cycle failed");
                }
            }
            Ok(None) => {}
            Err(e) => error!(error = %e, "failed to read chain tip"),
        }

        if let Err(e) = self.batcher.process_finalized_transactions().await {
            error!(error = %e, "mint cycle failed");
        }

        if let Err(e) = self.tracker.detect_minted_reorgs().await {
            error!(error = %e, "minted reorg sweep failed");
        }
    }

    /// Run the indexer's periodic cycles until the task is cancelled
    pub async fn run(&self) {
        info!(
            network = %self.config.network,
            confirmation_depth = self.config.confirmation_depth,
            max_mint_retries = self.config.max_mint_retries,
            poll_interval_secs = self.config.poll_interval_secs,
            "starting indexer cycles"
        );
        let mut ticker = interval(Duration::from_secs(self.config.poll_interval_secs));
        loop {
            ticker.tick().await;
            self.process_cycle().await;
        }
    }

    // -- Query surface --

    /// Highest block height known to the indexer
    pub async fn latest_height(&self) -> Result<Option<u64>> {
        Ok(self.storage.get_latest_block_height().await?)
    }

    /// Deposit rows of a Bitcoin transaction, with live confirmation counts
    pub async fn get_tx(&self, tx_id: &str) -> Result<Vec<DepositStatusResponse>> {
        let chain_tip = self.storage.get_chain_tip().await?;
        let rows = self.storage.get_txs_by_id(tx_id).await?;
        Ok(rows
            .into_iter()
            .map(|row| DepositStatusResponse::from_row(row, chain_tip))
            .collect())
    }

    /// Deposits crediting a destination-ledger recipient
    pub async fn get_txs_by_recipient(
        &self,
        recipient: &str,
    ) -> Result<Vec<DepositStatusResponse>> {
        let chain_tip = self.storage.get_chain_tip().await?;
        let rows = self.storage.get_txs_by_recipient(recipient).await?;
        Ok(rows
            .into_iter()
            .map(|row| DepositStatusResponse::from_row(row, chain_tip))
            .collect())
    }

    /// Deposits whose parent transaction spent from a Bitcoin address
    pub async fn get_txs_by_sender(&self, btc_address: &str) -> Result<Vec<DepositStatusResponse>> {
        let chain_tip = self.storage.get_chain_tip().await?;
        let rows = self.storage.get_txs_by_sender(btc_address).await?;
        Ok(rows
            .into_iter()
            .map(|row| DepositStatusResponse::from_row(row, chain_tip))
            .collect())
    }

    /// Register a deposit transaction that was broadcast directly, before
    /// it is seen in a block. Rejects transactions that decode badly or
    /// contain no qualifying deposit output.
    pub async fn register_broadcasted_tx(&self, tx_hex: &str) -> Result<BroadcastRegistration> {
        let raw = hex::decode(tx_hex)
            .map_err(|e| IndexerError::validation(format!("invalid transaction hex: {}", e)))?;
        let tx: Transaction = deserialize(&raw)
            .map_err(|e| IndexerError::validation(format!("malformed transaction bytes: {}", e)))?;
        let tx_id = tx.compute_txid().to_string();

        let deposits = self.detector.find_deposits(&tx);
        if deposits.is_empty() {
            return Err(IndexerError::validation(
                "transaction does not contain any valid deposits",
            ));
        }

        let rows: Vec<BroadcastedDeposit> = deposits
            .into_iter()
            .map(|d| BroadcastedDeposit {
                tx_id: tx_id.clone(),
                vout: d.vout,
                recipient: d.recipient,
                amount_sats: d.amount_sats,
                package_id: d.package_id,
                ledger_network: d.ledger_network,
            })
            .collect();
        self.storage.register_broadcasted_tx(&rows).await?;

        info!(
            tx_id = %tx_id,
            registered_count = rows.len(),
            "new deposit transaction registered"
        );
        Ok(BroadcastRegistration {
            tx_id,
            registered_deposits: rows.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::esplora::MockTxLookup;
    use crate::indexer::test_utils::{
        block_with, coinbase_tx, marker_script, p2wpkh_script, test_registry, tx_with_outputs,
    };
    use crate::ledger::MockLedgerClient;
    use crate::storage::MemoryStorage;
    use crate::types::{BtcNet, MintStatus};

    const NET: BtcNet = BtcNet::Regtest;

    fn test_config() -> IndexerConfig {
        IndexerConfig {
            network: NET,
            confirmation_depth: 8,
            max_mint_retries: 1,
            scan_batch_size: 10,
            fallback_recipient: "0xfallback".to_string(),
            ledger_rpc_url: "http://localhost:9000".to_string(),
            esplora_url: "http://localhost:3002".to_string(),
            database_path: ":memory:".to_string(),
            poll_interval_secs: 30,
            log_level: "info".to_string(),
            log_json: false,
        }
    }

    fn quiet_lookup() -> Arc<MockTxLookup> {
        let mut lookup = MockTxLookup::new();
        lookup
            .expect_get_tx()
            .returning(|txid| Err(crate::esplora::EsploraError::TxNotFound(txid.to_string())));
        Arc::new(lookup)
    }

    fn indexer_with(
        storage: Arc<MemoryStorage>,
        ledger: MockLedgerClient,
    ) -> Indexer {
        Indexer::new(
            test_config(),
            test_registry(NET),
            storage,
            Arc::new(ledger),
            quiet_lookup(),
        )
    }

    fn attesting_ledger() -> MockLedgerClient {
        let mut ledger = MockLedgerClient::new();
        ledger
            .expect_verify_blocks()
            .returning(|hashes| Ok(vec![true; hashes.len()]));
        ledger
    }

    #[tokio::test]
    async fn test_register_broadcasted_tx() {
        let storage = Arc::new(MemoryStorage::new());
        let indexer = indexer_with(Arc::clone(&storage), MockLedgerClient::new());

        let tx = tx_with_outputs(vec![
            (0, marker_script(0x00, [0xab; 32])),
            (70_000, p2wpkh_script(1)),
            (30_000, p2wpkh_script(2)),
        ]);
        let tx_hex = hex::encode(bitcoin::consensus::encode::serialize(&tx));

        let registration = indexer.register_broadcasted_tx(&tx_hex).await.unwrap();
        assert_eq!(registration.tx_id, tx.compute_txid().to_string());
        assert_eq!(registration.registered_deposits, 2);

        let rows = storage.get_txs_by_id(&registration.tx_id).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.status == MintStatus::Broadcasting));
        assert!(rows.iter().all(|r| r.block_hash.is_none()));
    }

    #[tokio::test]
    async fn test_register_rejects_tx_without_deposits() {
        let indexer = indexer_with(Arc::new(MemoryStorage::new()), MockLedgerClient::new());

        let stranger = tx_with_outputs(vec![(50_000, p2wpkh_script(9))]);
        let tx_hex = hex::encode(bitcoin::consensus::encode::serialize(&stranger));

        let err = indexer.register_broadcasted_tx(&tx_hex).await.unwrap_err();
        assert!(matches!(err, IndexerError::Validation(_)));
        assert!(err.to_string().contains("valid deposits"));
    }

    #[tokio::test]
    async fn test_register_rejects_malformed_input() {
        let indexer = indexer_with(Arc::new(MemoryStorage::new()), MockLedgerClient::new());

        assert!(matches!(
            indexer.register_broadcasted_tx("zz").await.unwrap_err(),
            IndexerError::Validation(_)
        ));
        assert!(matches!(
            indexer.register_broadcasted_tx("deadbeef").await.unwrap_err(),
            IndexerError::Validation(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_batch_redelivery_on_missing_blob() {
        let storage = Arc::new(MemoryStorage::new());
        let indexer = indexer_with(Arc::clone(&storage), MockLedgerClient::new());

        let message = BlockQueueMessage {
            hash: "deadbeef".to_string(),
            height: 100,
            network: NET,
            timestamp_ms: 1_700_000_000_000,
        };
        // bytes never arrive: returned for redelivery after the retry
        let failed = indexer.process_block_batch(&[message.clone()]).await;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].hash, "deadbeef");

        // the reference was still recorded
        let info = storage.get_block_info(100, NET).await.unwrap().unwrap();
        assert_eq!(info.hash, "deadbeef");
    }

    #[tokio::test]
    async fn test_block_batch_accepts_visible_blocks() {
        let storage = Arc::new(MemoryStorage::new());
        let indexer = indexer_with(Arc::clone(&storage), MockLedgerClient::new());

        let block = block_with(vec![coinbase_tx(100)]);
        let hash = block.block_hash().to_string();
        storage
            .put_block(100, NET, &hash, &bitcoin::consensus::encode::serialize(&block))
            .await
            .unwrap();

        let failed = indexer
            .process_block_batch(&[BlockQueueMessage {
                hash,
                height: 100,
                network: NET,
                timestamp_ms: 1_700_000_000_000,
            }])
            .await;
        assert!(failed.is_empty());
    }

    #[tokio::test]
    async fn test_foreign_network_message_dropped() {
        let storage = Arc::new(MemoryStorage::new());
        let indexer = indexer_with(Arc::clone(&storage), MockLedgerClient::new());

        let failed = indexer
            .process_block_batch(&[BlockQueueMessage {
                hash: "deadbeef".to_string(),
                height: 100,
                network: BtcNet::Mainnet,
                timestamp_ms: 1_700_000_000_000,
            }])
            .await;
        // misrouted, not retried
        assert!(failed.is_empty());
        assert!(storage.get_block_info(100, NET).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_full_pipeline_scan_finalize_mint() {
        let storage = Arc::new(MemoryStorage::new());

        // deposit transaction mined at height 100
        let deposit = tx_with_outputs(vec![
            (0, marker_script(0x00, [0xab; 32])),
            (70_000, p2wpkh_script(1)),
        ]);
        let deposit_block = block_with(vec![coinbase_tx(100), deposit.clone()]);
        storage
            .put_block(
                100,
                NET,
                &deposit_block.block_hash().to_string(),
                &bitcoin::consensus::encode::serialize(&deposit_block),
            )
            .await
            .unwrap();
        // seven more blocks bring the tip to 107 = depth 8 inclusive
        for height in 101..=107 {
            let filler = block_with(vec![coinbase_tx(height)]);
            storage
                .put_block(
                    height,
                    NET,
                    &filler.block_hash().to_string(),
                    &bitcoin::consensus::encode::serialize(&filler),
                )
                .await
                .unwrap();
        }

        let mut ledger = attesting_ledger();
        ledger
            .expect_try_mint_batch()
            .times(1)
            .returning(|_| Some("0xdigest".to_string()));

        let indexer = indexer_with(Arc::clone(&storage), ledger);
        indexer.process_cycle().await;

        let tx_id = deposit.compute_txid().to_string();
        let responses = indexer.get_tx(&tx_id).await.unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].status, MintStatus::Minted);
        assert_eq!(responses[0].confirmations, 8);
        assert_eq!(responses[0].ledger_tx_id.as_deref(), Some("0xdigest"));
        assert_eq!(responses[0].recipient, format!("0x{}", "ab".repeat(32)));

        // recipient query sees the same deposit
        let by_recipient = indexer
            .get_txs_by_recipient(&format!("0x{}", "ab".repeat(32)))
            .await
            .unwrap();
        assert_eq!(by_recipient.len(), 1);
        assert_eq!(by_recipient[0].btc_tx_id, tx_id);

        assert_eq!(indexer.latest_height().await.unwrap(), Some(107));
    }

    #[tokio::test]
    async fn test_cycle_stops_short_of_confirmation_depth() {
        let storage = Arc::new(MemoryStorage::new());

        let deposit = tx_with_outputs(vec![(70_000, p2wpkh_script(1))]);
        let deposit_block = block_with(vec![coinbase_tx(100), deposit.clone()]);
        storage
            .put_block(
                100,
                NET,
                &deposit_block.block_hash().to_string(),
                &bitcoin::consensus::encode::serialize(&deposit_block),
            )
            .await
            .unwrap();
        // tip reaches only 106: seven confirmations, one short of depth 8
        for height in 101..=106 {
            let filler = block_with(vec![coinbase_tx(height)]);
            storage
                .put_block(
                    height,
                    NET,
                    &filler.block_hash().to_string(),
                    &bitcoin::consensus::encode::serialize(&filler),
                )
                .await
                .unwrap();
        }

        let indexer = indexer_with(Arc::clone(&storage), attesting_ledger());
        indexer.process_cycle().await;

        let tx_id = deposit.compute_txid().to_string();
        let responses = indexer.get_tx(&tx_id).await.unwrap();
        assert_eq!(responses[0].status, MintStatus::Confirming);
        assert_eq!(responses[0].confirmations, 7);
    }
}
