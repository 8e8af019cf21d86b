use parking_lot::Mutex;
use std::{collections::HashSet, sync::Arc};
use tracing::info;

use crate::{
    errors::IndexerError,
    events::{EventFeed, IndexerEvent},
    store::{HistoryStore, ProgressStore, RangeKind},
    types::Address,
};

/// Announces `RecentHistoryReady` once per account.
///
/// An account is ready when both its native and token ranges are fully
/// backfilled and no discovered block is waiting for the loader.
pub struct ReadinessTracker {
    chain_id: u64,
    progress: Arc<dyn ProgressStore>,
    history: Arc<dyn HistoryStore>,
    events: EventFeed,
    announced: Mutex<HashSet<Address>>,
}

impl ReadinessTracker {
    #[must_use]
    pub fn new(
        chain_id: u64,
        progress: Arc<dyn ProgressStore>,
        history: Arc<dyn HistoryStore>,
        events: EventFeed,
    ) -> Self {
        Self { chain_id, progress, history, events, announced: Mutex::new(HashSet::new()) }
    }

    pub async fn is_ready(&self, account: Address) -> Result<bool, IndexerError> {
        let native = self.progress.get_range(self.chain_id, account, RangeKind::Native).await?;
        let token = self.progress.get_range(self.chain_id, account, RangeKind::Token).await?;
        if !native.is_fully_backfilled() || !token.is_fully_backfilled() {
            return Ok(false);
        }
        Ok(self.history.unresolved_count(self.chain_id, account).await? == 0)
    }

    /// Emits the event if `account` just became ready. Returns `true` when emitted.
    pub async fn check(&self, account: Address) -> Result<bool, IndexerError> {
        let already = self.announced.lock().contains(&account);
        if already || !self.is_ready(account).await? {
            return Ok(false);
        }
        if !self.announced.lock().insert(account) {
            return Ok(false);
        }
        info!(chain_id = self.chain_id, %account, "recent history ready");
        self.events.emit(IndexerEvent::RecentHistoryReady { chain_id: self.chain_id, account });
        Ok(true)
    }

    /// Allows a future announcement, e.g. after the account was removed and re-added.
    pub fn forget(&self, account: &Address) {
        self.announced.lock().remove(account);
    }
}
