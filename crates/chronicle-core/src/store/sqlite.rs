use async_trait::async_trait;
use chrono::DateTime;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::str::FromStr;
use tokio::sync::Mutex;

use super::{
    transfer_save_outcome,
    types::{
        Asset, BlockRange, BlockRangeUpdate, DiscoveredBlock, Direction, QuotaUsage, RangeKind,
        SaveOutcome, TransferRecord, TransferRef,
    },
    HistoryStore, ProgressStore, StoreError,
};
use crate::types::{Address, Hash32, Word};

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS block_ranges (
    chain_id INTEGER NOT NULL,
    account TEXT NOT NULL,
    kind TEXT NOT NULL,
    start_block INTEGER,
    first_known INTEGER,
    last_known INTEGER,
    balance_fingerprint TEXT,
    PRIMARY KEY (chain_id, account, kind)
);

CREATE TABLE IF NOT EXISTS discovered_blocks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    chain_id INTEGER NOT NULL,
    account TEXT NOT NULL,
    block_number INTEGER NOT NULL,
    block_hash TEXT NOT NULL,
    refs TEXT NOT NULL,
    loaded INTEGER NOT NULL DEFAULT 0,
    UNIQUE (chain_id, account, block_hash)
);

CREATE INDEX IF NOT EXISTS idx_discovered_unresolved
    ON discovered_blocks (chain_id, account, loaded, id);

CREATE TABLE IF NOT EXISTS transfers (
    chain_id INTEGER NOT NULL,
    tx_hash TEXT NOT NULL,
    account TEXT NOT NULL,
    log_index INTEGER NOT NULL,
    counterpart TEXT,
    direction TEXT NOT NULL,
    asset TEXT NOT NULL,
    amount TEXT NOT NULL,
    status TEXT NOT NULL,
    block_number INTEGER NOT NULL,
    block_hash TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    PRIMARY KEY (chain_id, tx_hash, account, log_index)
);

CREATE INDEX IF NOT EXISTS idx_transfers_account
    ON transfers (chain_id, account, block_number DESC);

CREATE TABLE IF NOT EXISTS rate_limits (
    tag TEXT PRIMARY KEY,
    used INTEGER NOT NULL,
    window_start INTEGER NOT NULL
);
";

/// Native transfers have no log index; SQLite treats NULLs in a primary key as distinct.
const NATIVE_LOG_INDEX: i64 = -1;

/// SQLite-backed [`ProgressStore`] and [`HistoryStore`].
///
/// Writes are serialized through `write_lock` and run inside a transaction, so a
/// range merge never interleaves with another writer's read.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    write_lock: Mutex<()>,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `database_url` and applies the schema.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the database cannot be opened or migrated.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // every connection to :memory: is a separate database
        let max_connections =
            if database_url.contains(":memory:") { 1 } else { max_connections.max(1) };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    /// Wraps an existing pool and applies the schema.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the schema cannot be applied.
    pub async fn from_pool(pool: Pool<Sqlite>) -> Result<Self, StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool, write_lock: Mutex::new(()) })
    }

    fn get_required<'r, T>(row: &'r SqliteRow, column: &str) -> Result<T, StoreError>
    where
        T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
    {
        row.try_get::<T, _>(column)
            .map_err(|e| StoreError::Database(format!("column '{column}': {e}")))
    }

    fn get_block(row: &SqliteRow, column: &str) -> Result<u64, StoreError> {
        let value: i64 = Self::get_required(row, column)?;
        from_db_block(value)
    }

    fn get_optional_block(row: &SqliteRow, column: &str) -> Result<Option<u64>, StoreError> {
        let value: Option<i64> = Self::get_required(row, column)?;
        value.map(from_db_block).transpose()
    }

    fn get_parsed<T>(row: &SqliteRow, column: &str) -> Result<T, StoreError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let raw: String = Self::get_required(row, column)?;
        raw.parse::<T>().map_err(|e| StoreError::Corrupt(format!("column '{column}': {e}")))
    }

    fn row_to_range(row: &SqliteRow) -> Result<BlockRange, StoreError> {
        let fingerprint: Option<String> = Self::get_required(row, "balance_fingerprint")?;
        Ok(BlockRange {
            start: Self::get_optional_block(row, "start_block")?,
            first_known: Self::get_optional_block(row, "first_known")?,
            last_known: Self::get_optional_block(row, "last_known")?,
            balance_fingerprint: fingerprint
                .map(|f| f.parse::<Hash32>())
                .transpose()
                .map_err(|e| StoreError::Corrupt(format!("balance_fingerprint: {e}")))?,
        })
    }

    fn row_to_block(row: &SqliteRow) -> Result<DiscoveredBlock, StoreError> {
        let refs: String = Self::get_required(row, "refs")?;
        Ok(DiscoveredBlock {
            chain_id: Self::get_block(row, "chain_id")?,
            account: Self::get_parsed(row, "account")?,
            number: Self::get_block(row, "block_number")?,
            hash: Self::get_parsed(row, "block_hash")?,
            refs: serde_json::from_str::<Vec<TransferRef>>(&refs)?,
        })
    }

    fn row_to_quota(row: &SqliteRow) -> Result<QuotaUsage, StoreError> {
        let used: i64 = Self::get_required(row, "used")?;
        let window_start: i64 = Self::get_required(row, "window_start")?;
        Ok(QuotaUsage {
            tag: Self::get_required(row, "tag")?,
            used: u64::try_from(used).map_err(|e| StoreError::Corrupt(format!("used {used}: {e}")))?,
            window_start: DateTime::from_timestamp_millis(window_start)
                .ok_or_else(|| StoreError::Corrupt(format!("window_start {window_start}")))?,
        })
    }

    fn row_to_transfer(row: &SqliteRow) -> Result<TransferRecord, StoreError> {
        let log_index: i64 = Self::get_required(row, "log_index")?;
        let counterpart: Option<String> = Self::get_required(row, "counterpart")?;
        let direction: String = Self::get_required(row, "direction")?;
        let asset: String = Self::get_required(row, "asset")?;
        let amount: String = Self::get_required(row, "amount")?;
        let status: String = Self::get_required(row, "status")?;
        let timestamp: i64 = Self::get_required(row, "timestamp")?;

        Ok(TransferRecord {
            chain_id: Self::get_block(row, "chain_id")?,
            tx_hash: Self::get_parsed(row, "tx_hash")?,
            log_index: if log_index == NATIVE_LOG_INDEX {
                None
            } else {
                Some(u32::try_from(log_index).map_err(|e| {
                    StoreError::Corrupt(format!("log_index {log_index}: {e}"))
                })?)
            },
            account: Self::get_parsed(row, "account")?,
            counterpart: counterpart
                .map(|c| c.parse::<Address>())
                .transpose()
                .map_err(|e| StoreError::Corrupt(format!("counterpart: {e}")))?,
            direction: serde_json::from_value(serde_json::Value::String(direction))?,
            asset: serde_json::from_str::<Asset>(&asset)?,
            amount: Word::from_quantity(&amount)
                .map_err(|e| StoreError::Corrupt(format!("amount: {e}")))?,
            status: serde_json::from_value(serde_json::Value::String(status))?,
            block_number: Self::get_block(row, "block_number")?,
            block_hash: Self::get_parsed(row, "block_hash")?,
            timestamp: DateTime::from_timestamp(timestamp, 0)
                .ok_or_else(|| StoreError::Corrupt(format!("timestamp {timestamp}")))?,
        })
    }

    async fn fetch_range<'e, E>(
        executor: E,
        chain_id: u64,
        account: Address,
        kind: RangeKind,
    ) -> Result<BlockRange, StoreError>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        let row = sqlx::query(
            r"
            SELECT start_block, first_known, last_known, balance_fingerprint
            FROM block_ranges
            WHERE chain_id = ? AND account = ? AND kind = ?
            ",
        )
        .bind(to_db_block(chain_id)?)
        .bind(account.to_hex_lower())
        .bind(kind.as_str())
        .fetch_optional(executor)
        .await?;

        row.as_ref().map(Self::row_to_range).transpose().map(Option::unwrap_or_default)
    }
}

fn to_db_block(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::InvalidRange(format!("{value} exceeds i64")))
}

fn from_db_block(value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative block {value}")))
}

fn to_db_opt(value: Option<u64>) -> Result<Option<i64>, StoreError> {
    value.map(to_db_block).transpose()
}

fn direction_str(direction: Direction) -> &'static str {
    match direction {
        Direction::Incoming => "incoming",
        Direction::Outgoing => "outgoing",
        Direction::SelfTransfer => "selftransfer",
    }
}

#[async_trait]
impl ProgressStore for SqliteStore {
    async fn get_range(
        &self,
        chain_id: u64,
        account: Address,
        kind: RangeKind,
    ) -> Result<BlockRange, StoreError> {
        Self::fetch_range(&self.pool, chain_id, account, kind).await
    }

    async fn upsert_range(
        &self,
        chain_id: u64,
        account: Address,
        kind: RangeKind,
        update: BlockRangeUpdate,
    ) -> Result<BlockRange, StoreError> {
        update.validate()?;
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let existing = Self::fetch_range(&mut *tx, chain_id, account, kind).await?;
        let merged = existing.merged(&update);

        sqlx::query(
            r"
            INSERT INTO block_ranges
                (chain_id, account, kind, start_block, first_known, last_known, balance_fingerprint)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (chain_id, account, kind) DO UPDATE SET
                start_block = excluded.start_block,
                first_known = excluded.first_known,
                last_known = excluded.last_known,
                balance_fingerprint = excluded.balance_fingerprint
            ",
        )
        .bind(to_db_block(chain_id)?)
        .bind(account.to_hex_lower())
        .bind(kind.as_str())
        .bind(to_db_opt(merged.start)?)
        .bind(to_db_opt(merged.first_known)?)
        .bind(to_db_opt(merged.last_known)?)
        .bind(merged.balance_fingerprint.map(|f| f.to_string()))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(merged)
    }

    async fn remove_account(&self, chain_id: u64, account: Address) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("DELETE FROM block_ranges WHERE chain_id = ? AND account = ?")
            .bind(to_db_block(chain_id)?)
            .bind(account.to_hex_lower())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_quotas(&self) -> Result<Vec<QuotaUsage>, StoreError> {
        let rows = sqlx::query("SELECT tag, used, window_start FROM rate_limits")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_quota).collect()
    }

    async fn save_quotas(&self, usages: &[QuotaUsage]) -> Result<(), StoreError> {
        if usages.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        for usage in usages {
            sqlx::query(
                r"
                INSERT INTO rate_limits (tag, used, window_start)
                VALUES (?, ?, ?)
                ON CONFLICT (tag) DO UPDATE SET
                    used = excluded.used,
                    window_start = excluded.window_start
                ",
            )
            .bind(&usage.tag)
            .bind(i64::try_from(usage.used).unwrap_or(i64::MAX))
            .bind(usage.window_start.timestamp_millis())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn remove_quota(&self, tag: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("DELETE FROM rate_limits WHERE tag = ?").bind(tag).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for SqliteStore {
    async fn save_blocks(
        &self,
        blocks: &[DiscoveredBlock],
    ) -> Result<Vec<DiscoveredBlock>, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let mut changed = Vec::new();

        for block in blocks {
            let chain_id = to_db_block(block.chain_id)?;
            let account = block.account.to_hex_lower();
            let hash = block.hash.to_string();

            let existing = sqlx::query(
                r"
                SELECT id, chain_id, account, block_number, block_hash, refs
                FROM discovered_blocks
                WHERE chain_id = ? AND account = ? AND block_hash = ?
                ",
            )
            .bind(chain_id)
            .bind(&account)
            .bind(&hash)
            .fetch_optional(&mut *tx)
            .await?;

            match existing {
                Some(row) => {
                    let id: i64 = Self::get_required(&row, "id")?;
                    let mut stored = Self::row_to_block(&row)?;
                    if stored.absorb(block.refs.iter().cloned()) {
                        sqlx::query("UPDATE discovered_blocks SET refs = ?, loaded = 0 WHERE id = ?")
                            .bind(serde_json::to_string(&stored.refs)?)
                            .bind(id)
                            .execute(&mut *tx)
                            .await?;
                        changed.push(stored);
                    }
                }
                None => {
                    sqlx::query(
                        r"
                        INSERT INTO discovered_blocks
                            (chain_id, account, block_number, block_hash, refs, loaded)
                        VALUES (?, ?, ?, ?, ?, 0)
                        ",
                    )
                    .bind(chain_id)
                    .bind(&account)
                    .bind(to_db_block(block.number)?)
                    .bind(&hash)
                    .bind(serde_json::to_string(&block.refs)?)
                    .execute(&mut *tx)
                    .await?;
                    changed.push(block.clone());
                }
            }
        }

        tx.commit().await?;
        Ok(changed)
    }

    async fn get_unresolved_blocks(
        &self,
        chain_id: u64,
        account: Address,
        limit: usize,
    ) -> Result<Vec<DiscoveredBlock>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            r"
            SELECT chain_id, account, block_number, block_hash, refs
            FROM discovered_blocks
            WHERE chain_id = ? AND account = ? AND loaded = 0
            ORDER BY id ASC
            LIMIT ?
            ",
        )
        .bind(to_db_block(chain_id)?)
        .bind(account.to_hex_lower())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_block).collect()
    }

    async fn mark_block_loaded(
        &self,
        chain_id: u64,
        account: Address,
        block_hash: Hash32,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "UPDATE discovered_blocks SET loaded = 1 WHERE chain_id = ? AND account = ? AND block_hash = ?",
        )
        .bind(to_db_block(chain_id)?)
        .bind(account.to_hex_lower())
        .bind(block_hash.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn unresolved_count(&self, chain_id: u64, account: Address) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM discovered_blocks WHERE chain_id = ? AND account = ? AND loaded = 0",
        )
        .bind(to_db_block(chain_id)?)
        .bind(account.to_hex_lower())
        .fetch_one(&self.pool)
        .await?;
        usize::try_from(count).map_err(|e| StoreError::Corrupt(format!("count {count}: {e}")))
    }

    async fn save_transfer(&self, record: &TransferRecord) -> Result<SaveOutcome, StoreError> {
        let chain_id = to_db_block(record.chain_id)?;
        let tx_hash = record.tx_hash.to_string();
        let account = record.account.to_hex_lower();
        let log_index = record.log_index.map_or(NATIVE_LOG_INDEX, i64::from);

        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            r"
            SELECT * FROM transfers
            WHERE chain_id = ? AND tx_hash = ? AND account = ? AND log_index = ?
            ",
        )
        .bind(chain_id)
        .bind(&tx_hash)
        .bind(&account)
        .bind(log_index)
        .fetch_optional(&mut *tx)
        .await?
        .as_ref()
        .map(Self::row_to_transfer)
        .transpose()?;

        let outcome = transfer_save_outcome(existing.as_ref(), record);
        if outcome.is_new_data() {
            sqlx::query(
                r"
                INSERT OR REPLACE INTO transfers
                    (chain_id, tx_hash, account, log_index, counterpart, direction, asset,
                     amount, status, block_number, block_hash, timestamp)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ",
            )
            .bind(chain_id)
            .bind(&tx_hash)
            .bind(&account)
            .bind(log_index)
            .bind(record.counterpart.map(|c| c.to_hex_lower()))
            .bind(direction_str(record.direction))
            .bind(serde_json::to_string(&record.asset)?)
            .bind(record.amount.to_quantity())
            .bind(record.status.as_str())
            .bind(to_db_block(record.block_number)?)
            .bind(record.block_hash.to_string())
            .bind(record.timestamp.timestamp())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn transfers_for_account(
        &self,
        chain_id: u64,
        account: Address,
        limit: usize,
    ) -> Result<Vec<TransferRecord>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            r"
            SELECT * FROM transfers
            WHERE chain_id = ? AND account = ?
            ORDER BY block_number DESC, log_index DESC
            LIMIT ?
            ",
        )
        .bind(to_db_block(chain_id)?)
        .bind(account.to_hex_lower())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_transfer).collect()
    }

    async fn remove_account(&self, chain_id: u64, account: Address) -> Result<(), StoreError> {
        let chain_id = to_db_block(chain_id)?;
        let account = account.to_hex_lower();

        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM discovered_blocks WHERE chain_id = ? AND account = ?")
            .bind(chain_id)
            .bind(&account)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM transfers WHERE chain_id = ? AND account = ?")
            .bind(chain_id)
            .bind(&account)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}
