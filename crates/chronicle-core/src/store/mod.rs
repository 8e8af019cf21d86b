//! Persistence for scan progress and discovered history.
//!
//! Two repositories back the indexer:
//!
//! - [`ProgressStore`]: one [`BlockRange`] per `(chain, account, kind)`. Upserts are
//!   monotonic merges (see [`BlockRange::merged`]) so concurrent writers can never
//!   move a boundary backwards.
//!   The same store keeps rate limiter usage ([`QuotaUsage`]) so lifetime quotas
//!   survive restarts.
//! - [`HistoryStore`]: discovered blocks waiting for detail loading, and the
//!   resolved [`TransferRecord`]s.
//!
//! [`memory`] implements both for tests and ephemeral runs; [`sqlite`] is the
//! production backend.

pub mod memory;
pub mod sqlite;
pub mod types;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{Address, Hash32};

pub use memory::{MemoryHistoryStore, MemoryProgressStore};
pub use sqlite::SqliteStore;
pub use types::{
    Asset, BlockRange, BlockRangeUpdate, DiscoveredBlock, Direction, QuotaUsage, RangeKind,
    SaveOutcome, TransferKey, TransferRecord, TransferRef, TransferStatus,
};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("invalid range update: {0}")]
    InvalidRange(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}

/// Scan progress per account.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Returns the stored range, or an empty one if the account was never scanned.
    async fn get_range(
        &self,
        chain_id: u64,
        account: Address,
        kind: RangeKind,
    ) -> Result<BlockRange, StoreError>;

    /// Merges `update` into the stored range atomically and returns the result.
    async fn upsert_range(
        &self,
        chain_id: u64,
        account: Address,
        kind: RangeKind,
        update: BlockRangeUpdate,
    ) -> Result<BlockRange, StoreError>;

    /// Drops both ranges of an account on one chain.
    async fn remove_account(&self, chain_id: u64, account: Address) -> Result<(), StoreError>;

    async fn load_quotas(&self) -> Result<Vec<QuotaUsage>, StoreError>;

    /// Inserts or replaces usage rows by tag.
    async fn save_quotas(&self, usages: &[QuotaUsage]) -> Result<(), StoreError>;

    async fn remove_quota(&self, tag: &str) -> Result<(), StoreError>;
}

/// Discovered blocks and resolved transfers.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Persists discovered blocks, deduplicating by `(chain, account, block hash)`.
    ///
    /// A block seen again with new references gains those references and becomes
    /// unresolved again. Returns the blocks that are new or changed, in input order.
    async fn save_blocks(
        &self,
        blocks: &[DiscoveredBlock],
    ) -> Result<Vec<DiscoveredBlock>, StoreError>;

    /// Unresolved blocks of an account in discovery order.
    async fn get_unresolved_blocks(
        &self,
        chain_id: u64,
        account: Address,
        limit: usize,
    ) -> Result<Vec<DiscoveredBlock>, StoreError>;

    async fn mark_block_loaded(
        &self,
        chain_id: u64,
        account: Address,
        block_hash: Hash32,
    ) -> Result<(), StoreError>;

    async fn unresolved_count(&self, chain_id: u64, account: Address) -> Result<usize, StoreError>;

    /// Inserts or refreshes a transfer. A terminal stored status is never overwritten.
    async fn save_transfer(&self, record: &TransferRecord) -> Result<SaveOutcome, StoreError>;

    /// Most recent transfers first.
    async fn transfers_for_account(
        &self,
        chain_id: u64,
        account: Address,
        limit: usize,
    ) -> Result<Vec<TransferRecord>, StoreError>;

    /// Drops every block and transfer of an account on one chain.
    async fn remove_account(&self, chain_id: u64, account: Address) -> Result<(), StoreError>;
}

/// Decides whether `incoming` should replace `stored` for the same transfer key.
pub(crate) fn transfer_save_outcome(
    stored: Option<&TransferRecord>,
    incoming: &TransferRecord,
) -> SaveOutcome {
    match stored {
        None => SaveOutcome::Inserted,
        Some(existing) if existing == incoming => SaveOutcome::Unchanged,
        Some(existing) if existing.status.is_terminal() => SaveOutcome::Unchanged,
        Some(_) => SaveOutcome::Updated,
    }
}
