//! SQLite Persistent Storage
//!
//! Durable implementation of the [`Storage`] contract. Raw block bytes live
//! inline in `btc_blocks` next to the reference row, so blob and reference
//! are written in one statement. Connection pooling via r2d2.
//!
//! Status updates carry a `WHERE status IN (...)` guard derived from the
//! lifecycle, so a stale sweep can never apply a transition the state
//! machine forbids.

use async_trait::async_trait;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, params_from_iter, OptionalExtension};
use std::path::Path;
use std::str::FromStr;

use super::traits::{Storage, StorageError, StorageResult};
use crate::types::{
    now_ms, BlockInfo, BroadcastedDeposit, BtcNet, ConfirmingTx, DepositInsertion, DepositRow,
    FinalizedTx, MintStatus, SenderDeposit, TxUpdate,
};

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

impl From<r2d2::Error> for StorageError {
    fn from(e: r2d2::Error) -> Self {
        StorageError::Connection(e.to_string())
    }
}

/// SQLite-backed store with connection pooling
#[derive(Clone)]
pub struct SqliteStorage {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteStorage {
    /// Create a store with the given database path.
    ///
    /// Creates the database file and runs migrations if needed.
    pub fn new<P: AsRef<Path>>(db_path: P) -> StorageResult<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let manager = SqliteConnectionManager::file(db_path);
        let pool = Pool::builder().max_size(10).build(manager)?;

        let store = Self { pool };
        store.run_migrations()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> StorageResult<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager)?;

        let store = Self { pool };
        store.run_migrations()?;
        Ok(store)
    }

    fn conn(&self) -> StorageResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    fn run_migrations(&self) -> StorageResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS btc_blocks (
                height INTEGER NOT NULL,
                network TEXT NOT NULL,
                hash TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'new',
                processed_at INTEGER NOT NULL,
                PRIMARY KEY (height, network)
            );

            CREATE INDEX IF NOT EXISTS idx_btc_blocks_hash ON btc_blocks(hash);
            CREATE INDEX IF NOT EXISTS idx_btc_blocks_status ON btc_blocks(status);

            CREATE TABLE IF NOT EXISTS btc_block_data (
                hash TEXT PRIMARY KEY,
                raw BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS nbtc_minting (
                tx_id TEXT NOT NULL,
                vout INTEGER NOT NULL,
                block_hash TEXT,
                block_height INTEGER,
                recipient TEXT NOT NULL,
                amount_sats INTEGER NOT NULL,
                status TEXT NOT NULL,
                package_id TEXT NOT NULL,
                ledger_network TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                ledger_tx_id TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (tx_id, vout)
            );

            CREATE INDEX IF NOT EXISTS idx_nbtc_minting_status ON nbtc_minting(status);
            CREATE INDEX IF NOT EXISTS idx_nbtc_minting_recipient ON nbtc_minting(recipient);
            CREATE INDEX IF NOT EXISTS idx_nbtc_minting_block_hash ON nbtc_minting(block_hash);

            CREATE TABLE IF NOT EXISTS nbtc_sender_deposits (
                tx_id TEXT NOT NULL,
                sender TEXT NOT NULL,
                PRIMARY KEY (tx_id, sender)
            );

            CREATE INDEX IF NOT EXISTS idx_sender_deposits_sender ON nbtc_sender_deposits(sender);

            CREATE TABLE IF NOT EXISTS chain_state (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    fn row_to_deposit(row: &rusqlite::Row) -> rusqlite::Result<DepositRow> {
        let status_str: String = row.get("status")?;
        let status = MintStatus::from_str(&status_str).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })?;

        Ok(DepositRow {
            tx_id: row.get("tx_id")?,
            vout: row.get::<_, i64>("vout")? as u32,
            block_hash: row.get("block_hash")?,
            block_height: row.get::<_, Option<i64>>("block_height")?.map(|v| v as u64),
            recipient: row.get("recipient")?,
            amount_sats: row.get::<_, i64>("amount_sats")? as u64,
            status,
            package_id: row.get("package_id")?,
            ledger_network: row.get("ledger_network")?,
            retry_count: row.get::<_, i64>("retry_count")? as u32,
            ledger_tx_id: row.get("ledger_tx_id")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    fn row_to_finalized(row: &rusqlite::Row) -> rusqlite::Result<FinalizedTx> {
        Ok(FinalizedTx {
            tx_id: row.get("tx_id")?,
            vout: row.get::<_, i64>("vout")? as u32,
            block_hash: row.get("block_hash")?,
            block_height: row.get::<_, i64>("block_height")? as u64,
            retry_count: row.get::<_, i64>("retry_count")? as u32,
            package_id: row.get("package_id")?,
            ledger_network: row.get("ledger_network")?,
        })
    }
}

/// SQL `IN (...)` guard listing the statuses allowed to transition to `next`
fn predecessor_guard(next: MintStatus) -> String {
    let all = [
        MintStatus::Broadcasting,
        MintStatus::Confirming,
        MintStatus::Reorg,
        MintStatus::Finalized,
        MintStatus::FinalizedReorg,
        MintStatus::FinalizedNonActive,
        MintStatus::Minted,
        MintStatus::MintFailed,
        MintStatus::MintedReorg,
    ];
    let allowed: Vec<String> = all
        .iter()
        .filter(|s| s.can_transition_to(next))
        .map(|s| format!("'{}'", s))
        .collect();
    allowed.join(",")
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn put_block(
        &self,
        height: u64,
        network: BtcNet,
        hash: &str,
        raw: &[u8],
    ) -> StorageResult<()> {
        {
            let conn = self.conn()?;
            conn.execute(
                "INSERT OR REPLACE INTO btc_block_data (hash, raw) VALUES (?1, ?2)",
                params![hash, raw],
            )?;
        }
        self.insert_block_info(height, network, hash).await
    }

    async fn insert_block_info(
        &self,
        height: u64,
        network: BtcNet,
        hash: &str,
    ) -> StorageResult<()> {
        let conn = self.conn()?;
        // a differing hash at a known height replaces the row and reopens it
        // for scanning; redelivery of the same hash is a no-op
        conn.execute(
            r#"
            INSERT INTO btc_blocks (height, network, hash, status, processed_at)
            VALUES (?1, ?2, ?3, 'new', ?4)
            ON CONFLICT(height, network) DO UPDATE SET
                hash = excluded.hash,
                status = 'new',
                processed_at = excluded.processed_at
            WHERE btc_blocks.hash IS NOT excluded.hash
            "#,
            params![height as i64, network.to_string(), hash, now_ms()],
        )?;
        Ok(())
    }

    async fn get_block(&self, hash: &str) -> StorageResult<Option<Vec<u8>>> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                "SELECT raw FROM btc_block_data WHERE hash = ?1",
                params![hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw)
    }

    async fn get_block_info(
        &self,
        height: u64,
        network: BtcNet,
    ) -> StorageResult<Option<BlockInfo>> {
        let conn = self.conn()?;
        let info = conn
            .query_row(
                "SELECT height, hash FROM btc_blocks WHERE height = ?1 AND network = ?2",
                params![height as i64, network.to_string()],
                |row| {
                    Ok(BlockInfo {
                        height: row.get::<_, i64>(0)? as u64,
                        hash: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(info)
    }

    async fn get_blocks_to_process(&self, limit: u32) -> StorageResult<Vec<BlockInfo>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT height, hash FROM btc_blocks WHERE status = 'new' ORDER BY height ASC LIMIT ?1",
        )?;
        let blocks = stmt
            .query_map(params![limit as i64], |row| {
                Ok(BlockInfo {
                    height: row.get::<_, i64>(0)? as u64,
                    hash: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(blocks)
    }

    async fn mark_blocks_scanned(&self, heights: &[u64]) -> StorageResult<()> {
        if heights.is_empty() {
            return Ok(());
        }
        let conn = self.conn()?;
        let sql = format!(
            "UPDATE btc_blocks SET status = 'scanned' WHERE height IN ({})",
            placeholders(heights.len())
        );
        conn.execute(&sql, params_from_iter(heights.iter().map(|h| *h as i64)))?;
        Ok(())
    }

    async fn get_latest_block_height(&self) -> StorageResult<Option<u64>> {
        let conn = self.conn()?;
        let height: Option<i64> =
            conn.query_row("SELECT MAX(height) FROM btc_blocks", [], |row| row.get(0))?;
        Ok(height.map(|h| h as u64))
    }

    async fn get_chain_tip(&self) -> StorageResult<Option<u64>> {
        let conn = self.conn()?;
        let tip: Option<i64> = conn
            .query_row(
                "SELECT value FROM chain_state WHERE key = 'chain_tip'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(tip.map(|t| t as u64))
    }

    async fn set_chain_tip(&self, height: u64) -> StorageResult<()> {
        let conn = self.conn()?;
        // the watermark only moves forward
        conn.execute(
            r#"
            INSERT INTO chain_state (key, value) VALUES ('chain_tip', ?1)
            ON CONFLICT(key) DO UPDATE SET value = MAX(chain_state.value, excluded.value)
            "#,
            params![height as i64],
        )?;
        Ok(())
    }

    async fn get_confirming_blocks(&self) -> StorageResult<Vec<String>> {
        let conn = self.conn()?;
        // block_hash IS NOT NULL is a safety measure: rows registered from a
        // raw broadcast exist before their transaction is mined
        let mut stmt = conn.prepare(
            "SELECT DISTINCT block_hash FROM nbtc_minting
             WHERE status = 'confirming' AND block_hash IS NOT NULL",
        )?;
        let hashes = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(hashes)
    }

    async fn insert_or_update_txs(&self, txs: &[DepositInsertion]) -> StorageResult<()> {
        if txs.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn()?;
        let now = now_ms();
        let guard = predecessor_guard(MintStatus::Confirming);
        let sql = format!(
            r#"
            INSERT INTO nbtc_minting
                (tx_id, vout, block_hash, block_height, recipient, amount_sats,
                 status, package_id, ledger_network, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'confirming', ?7, ?8, ?9, ?9)
            ON CONFLICT(tx_id, vout) DO UPDATE SET
                block_hash = excluded.block_hash,
                block_height = excluded.block_height,
                status = 'confirming',
                updated_at = excluded.updated_at
            WHERE nbtc_minting.status IN ({guard})
            "#
        );
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(&sql)?;
            for t in txs {
                stmt.execute(params![
                    t.tx_id,
                    t.vout as i64,
                    t.block_hash,
                    t.block_height as i64,
                    t.recipient,
                    t.amount_sats as i64,
                    t.package_id,
                    t.ledger_network,
                    now,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn get_finalized_txs(&self, max_retries: u32) -> StorageResult<Vec<FinalizedTx>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT tx_id, vout, block_hash, block_height, retry_count, package_id, ledger_network
            FROM nbtc_minting
            WHERE (status = 'finalized'
                OR (status = 'mint_failed' AND retry_count <= ?1))
              AND block_hash IS NOT NULL
            ORDER BY tx_id, vout
            "#,
        )?;
        let txs = stmt
            .query_map(params![max_retries as i64], Self::row_to_finalized)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(txs)
    }

    async fn update_txs_status(&self, tx_ids: &[String], status: MintStatus) -> StorageResult<()> {
        if tx_ids.is_empty() {
            return Ok(());
        }
        let conn = self.conn()?;
        let guard = predecessor_guard(status);
        let sql = format!(
            "UPDATE nbtc_minting SET status = ?1, updated_at = ?2
             WHERE tx_id IN ({}) AND status IN ({guard})",
            placeholders(tx_ids.len())
        );
        let mut args: Vec<rusqlite::types::Value> = vec![
            status.to_string().into(),
            now_ms().into(),
        ];
        args.extend(tx_ids.iter().map(|id| id.clone().into()));
        conn.execute(&sql, params_from_iter(args))?;
        Ok(())
    }

    async fn batch_update_txs(&self, updates: &[TxUpdate]) -> StorageResult<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn()?;
        let now = now_ms();
        let tx = conn.transaction()?;
        for update in updates {
            let guard = predecessor_guard(update.status);
            match update.status {
                MintStatus::Minted => {
                    let sql = format!(
                        "UPDATE nbtc_minting SET status = 'minted', ledger_tx_id = ?1, updated_at = ?2
                         WHERE tx_id = ?3 AND vout = ?4 AND status IN ({guard})"
                    );
                    tx.execute(
                        &sql,
                        params![update.ledger_tx_id, now, update.tx_id, update.vout as i64],
                    )?;
                }
                MintStatus::MintFailed => {
                    let sql = format!(
                        "UPDATE nbtc_minting SET status = 'mint_failed',
                                retry_count = retry_count + 1, updated_at = ?1
                         WHERE tx_id = ?2 AND vout = ?3 AND status IN ({guard})"
                    );
                    tx.execute(&sql, params![now, update.tx_id, update.vout as i64])?;
                }
                other => {
                    let sql = format!(
                        "UPDATE nbtc_minting SET status = ?1, updated_at = ?2
                         WHERE tx_id = ?3 AND vout = ?4 AND status IN ({guard})"
                    );
                    tx.execute(
                        &sql,
                        params![other.to_string(), now, update.tx_id, update.vout as i64],
                    )?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn update_confirming_txs_to_reorg(&self, block_hashes: &[String]) -> StorageResult<()> {
        if block_hashes.is_empty() {
            return Ok(());
        }
        let conn = self.conn()?;
        let sql = format!(
            "UPDATE nbtc_minting SET status = 'reorg', updated_at = ?1
             WHERE status = 'confirming' AND block_hash IN ({})",
            placeholders(block_hashes.len())
        );
        let mut args: Vec<rusqlite::types::Value> = vec![now_ms().into()];
        args.extend(block_hashes.iter().map(|h| h.clone().into()));
        conn.execute(&sql, params_from_iter(args))?;
        Ok(())
    }

    async fn get_confirming_txs(&self) -> StorageResult<Vec<ConfirmingTx>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT tx_id, block_hash, block_height FROM nbtc_minting
             WHERE status = 'confirming' AND block_height IS NOT NULL
             ORDER BY tx_id",
        )?;
        let txs = stmt
            .query_map([], |row| {
                Ok(ConfirmingTx {
                    tx_id: row.get(0)?,
                    block_hash: row.get(1)?,
                    block_height: row.get::<_, i64>(2)? as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(txs)
    }

    async fn finalize_txs(&self, tx_ids: &[String]) -> StorageResult<()> {
        if tx_ids.is_empty() {
            return Ok(());
        }
        let conn = self.conn()?;
        let sql = format!(
            "UPDATE nbtc_minting SET status = 'finalized', updated_at = ?1
             WHERE status = 'confirming' AND tx_id IN ({})",
            placeholders(tx_ids.len())
        );
        let mut args: Vec<rusqlite::types::Value> = vec![now_ms().into()];
        args.extend(tx_ids.iter().map(|id| id.clone().into()));
        conn.execute(&sql, params_from_iter(args))?;
        Ok(())
    }

    async fn get_minted_txs(&self) -> StorageResult<Vec<FinalizedTx>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT tx_id, vout, block_hash, block_height, retry_count, package_id, ledger_network
            FROM nbtc_minting
            WHERE status = 'minted' AND block_hash IS NOT NULL
            "#,
        )?;
        let txs = stmt
            .query_map([], Self::row_to_finalized)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(txs)
    }

    async fn register_broadcasted_tx(
        &self,
        deposits: &[BroadcastedDeposit],
    ) -> StorageResult<()> {
        if deposits.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn()?;
        let now = now_ms();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT OR IGNORE INTO nbtc_minting
                    (tx_id, vout, recipient, amount_sats, status,
                     package_id, ledger_network, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, 'broadcasting', ?5, ?6, ?7, ?7)
                "#,
            )?;
            for d in deposits {
                stmt.execute(params![
                    d.tx_id,
                    d.vout as i64,
                    d.recipient,
                    d.amount_sats as i64,
                    d.package_id,
                    d.ledger_network,
                    now,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn insert_sender_deposits(&self, senders: &[SenderDeposit]) -> StorageResult<()> {
        if senders.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO nbtc_sender_deposits (tx_id, sender) VALUES (?1, ?2)",
            )?;
            for s in senders {
                stmt.execute(params![s.tx_id, s.sender])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn get_tx_status(&self, tx_id: &str) -> StorageResult<Option<MintStatus>> {
        let conn = self.conn()?;
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM nbtc_minting WHERE tx_id = ?1 LIMIT 1",
                params![tx_id],
                |row| row.get(0),
            )
            .optional()?;
        match status {
            Some(s) => Ok(Some(MintStatus::from_str(&s).map_err(|e| {
                StorageError::InvalidData(e.to_string())
            })?)),
            None => Ok(None),
        }
    }

    async fn get_txs_by_id(&self, tx_id: &str) -> StorageResult<Vec<DepositRow>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT * FROM nbtc_minting WHERE tx_id = ?1 ORDER BY vout ASC")?;
        let rows = stmt
            .query_map(params![tx_id], Self::row_to_deposit)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn get_txs_by_recipient(&self, recipient: &str) -> StorageResult<Vec<DepositRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM nbtc_minting WHERE recipient = ?1 ORDER BY created_at DESC",
        )?;
        let rows = stmt
            .query_map(params![recipient], Self::row_to_deposit)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn get_txs_by_sender(&self, btc_address: &str) -> StorageResult<Vec<DepositRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT m.* FROM nbtc_minting m
            JOIN nbtc_sender_deposits s ON m.tx_id = s.tx_id
            WHERE s.sender = ?1
            ORDER BY m.created_at DESC
            "#,
        )?;
        let rows = stmt
            .query_map(params![btc_address], Self::row_to_deposit)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
