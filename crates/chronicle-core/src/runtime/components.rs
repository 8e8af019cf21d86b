//! Core component container for the indexer runtime.

use crate::{
    events::EventFeed,
    indexer::MultiChainIndexer,
    rate_limit::RateLimiter,
    store::{HistoryStore, ProgressStore},
};
use std::sync::Arc;

/// Container for the initialized runtime components.
///
/// All components are cheap to clone and share state with the chain groups.
#[derive(Clone)]
pub struct IndexerComponents {
    progress: Arc<dyn ProgressStore>,
    history: Arc<dyn HistoryStore>,
    limiter: RateLimiter,
    events: EventFeed,
    indexer: Arc<MultiChainIndexer>,
}

impl IndexerComponents {
    /// Called by `IndexerRuntimeBuilder` during initialization.
    #[must_use]
    pub fn new(
        progress: Arc<dyn ProgressStore>,
        history: Arc<dyn HistoryStore>,
        limiter: RateLimiter,
        events: EventFeed,
        indexer: Arc<MultiChainIndexer>,
    ) -> Self {
        Self { progress, history, limiter, events, indexer }
    }

    #[must_use]
    pub fn progress_store(&self) -> &Arc<dyn ProgressStore> {
        &self.progress
    }

    #[must_use]
    pub fn history_store(&self) -> &Arc<dyn HistoryStore> {
        &self.history
    }

    #[must_use]
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    #[must_use]
    pub fn events(&self) -> &EventFeed {
        &self.events
    }

    #[must_use]
    pub fn indexer(&self) -> &Arc<MultiChainIndexer> {
        &self.indexer
    }
}
