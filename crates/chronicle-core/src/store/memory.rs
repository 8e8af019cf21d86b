use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;

use super::{
    transfer_save_outcome,
    types::{
        BlockRange, BlockRangeUpdate, DiscoveredBlock, QuotaUsage, RangeKind, SaveOutcome,
        TransferKey, TransferRecord,
    },
    HistoryStore, ProgressStore, StoreError,
};
use crate::types::{Address, Hash32};

/// In-memory [`ProgressStore`].
///
/// The `DashMap` entry API holds the shard lock for the whole read-merge-write,
/// which gives the same atomicity as the SQLite transaction.
#[derive(Default)]
pub struct MemoryProgressStore {
    ranges: DashMap<(u64, Address, RangeKind), BlockRange>,
    quotas: DashMap<String, QuotaUsage>,
}

impl MemoryProgressStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

#[async_trait]
impl ProgressStore for MemoryProgressStore {
    async fn get_range(
        &self,
        chain_id: u64,
        account: Address,
        kind: RangeKind,
    ) -> Result<BlockRange, StoreError> {
        Ok(self.ranges.get(&(chain_id, account, kind)).map(|r| *r).unwrap_or_default())
    }

    async fn upsert_range(
        &self,
        chain_id: u64,
        account: Address,
        kind: RangeKind,
        update: BlockRangeUpdate,
    ) -> Result<BlockRange, StoreError> {
        update.validate()?;
        let mut entry = self.ranges.entry((chain_id, account, kind)).or_default();
        let merged = entry.merged(&update);
        *entry = merged;
        Ok(merged)
    }

    async fn remove_account(&self, chain_id: u64, account: Address) -> Result<(), StoreError> {
        self.ranges.remove(&(chain_id, account, RangeKind::Native));
        self.ranges.remove(&(chain_id, account, RangeKind::Token));
        Ok(())
    }

    async fn load_quotas(&self) -> Result<Vec<QuotaUsage>, StoreError> {
        Ok(self.quotas.iter().map(|entry| entry.value().clone()).collect())
    }

    async fn save_quotas(&self, usages: &[QuotaUsage]) -> Result<(), StoreError> {
        for usage in usages {
            self.quotas.insert(usage.tag.clone(), usage.clone());
        }
        Ok(())
    }

    async fn remove_quota(&self, tag: &str) -> Result<(), StoreError> {
        self.quotas.remove(tag);
        Ok(())
    }
}

struct StoredBlock {
    block: DiscoveredBlock,
    loaded: bool,
}

#[derive(Default)]
struct HistoryState {
    /// Discovery order is the vector order.
    blocks: Vec<StoredBlock>,
    block_index: HashMap<(u64, Address, Hash32), usize>,
    transfers: HashMap<TransferKey, TransferRecord>,
}

/// In-memory [`HistoryStore`].
#[derive(Default)]
pub struct MemoryHistoryStore {
    state: Mutex<HistoryState>,
}

impl MemoryHistoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blocks, loaded or not.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.state.lock().blocks.len()
    }

    #[must_use]
    pub fn transfer_count(&self) -> usize {
        self.state.lock().transfers.len()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn save_blocks(
        &self,
        blocks: &[DiscoveredBlock],
    ) -> Result<Vec<DiscoveredBlock>, StoreError> {
        let mut state = self.state.lock();
        let mut changed = Vec::new();

        for block in blocks {
            let key = (block.chain_id, block.account, block.hash);
            if let Some(&idx) = state.block_index.get(&key) {
                let stored = &mut state.blocks[idx];
                if stored.block.absorb(block.refs.iter().cloned()) {
                    stored.loaded = false;
                    changed.push(stored.block.clone());
                }
            } else {
                let idx = state.blocks.len();
                state.blocks.push(StoredBlock { block: block.clone(), loaded: false });
                state.block_index.insert(key, idx);
                changed.push(block.clone());
            }
        }

        Ok(changed)
    }

    async fn get_unresolved_blocks(
        &self,
        chain_id: u64,
        account: Address,
        limit: usize,
    ) -> Result<Vec<DiscoveredBlock>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .blocks
            .iter()
            .filter(|b| !b.loaded && b.block.chain_id == chain_id && b.block.account == account)
            .take(limit)
            .map(|b| b.block.clone())
            .collect())
    }

    async fn mark_block_loaded(
        &self,
        chain_id: u64,
        account: Address,
        block_hash: Hash32,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if let Some(&idx) = state.block_index.get(&(chain_id, account, block_hash)) {
            state.blocks[idx].loaded = true;
        }
        Ok(())
    }

    async fn unresolved_count(&self, chain_id: u64, account: Address) -> Result<usize, StoreError> {
        let state = self.state.lock();
        Ok(state
            .blocks
            .iter()
            .filter(|b| !b.loaded && b.block.chain_id == chain_id && b.block.account == account)
            .count())
    }

    async fn save_transfer(&self, record: &TransferRecord) -> Result<SaveOutcome, StoreError> {
        let mut state = self.state.lock();
        let key = record.key();
        let outcome = transfer_save_outcome(state.transfers.get(&key), record);
        if outcome.is_new_data() {
            state.transfers.insert(key, record.clone());
        }
        Ok(outcome)
    }

    async fn transfers_for_account(
        &self,
        chain_id: u64,
        account: Address,
        limit: usize,
    ) -> Result<Vec<TransferRecord>, StoreError> {
        let state = self.state.lock();
        let mut records: Vec<_> = state
            .transfers
            .values()
            .filter(|r| r.chain_id == chain_id && r.account == account)
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            b.block_number.cmp(&a.block_number).then_with(|| b.log_index.cmp(&a.log_index))
        });
        records.truncate(limit);
        Ok(records)
    }

    async fn remove_account(&self, chain_id: u64, account: Address) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.blocks.retain(|b| !(b.block.chain_id == chain_id && b.block.account == account));
        let index = state
            .blocks
            .iter()
            .enumerate()
            .map(|(i, b)| ((b.block.chain_id, b.block.account, b.block.hash), i))
            .collect();
        state.block_index = index;
        state.transfers.retain(|k, _| !(k.chain_id == chain_id && k.account == account));
        Ok(())
    }
}
