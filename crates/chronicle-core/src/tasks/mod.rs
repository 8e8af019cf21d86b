//! Long-running work of one chain group.
//!
//! ```text
//!   HistoricalBackfillTask ──┐
//!      (finite, backward)    │  Vec<DiscoveredBlock>   ┌──────────────────────┐
//!                            ├──────► BlockQueue ─────►│ TransferDetailLoader │─► HistoryStore
//!   LiveWatchTask ───────────┘      (bounded)          └──────────────────────┘     │
//!      (infinite, forward)                                                          ▼
//!                                                                              EventFeed
//! ```
//!
//! Every task shares one [`ChainContext`] and takes a cancellation token; only
//! the rate limiter is shared across chains.

pub mod backfill;
pub mod live_watch;
pub mod loader;
pub mod queue;
pub mod readiness;

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::{
    chain::ChainHead,
    config::IndexerConfig,
    events::EventFeed,
    rate_limit::{account_tag, chain_group_tag, RateLimiter},
    registry::AccountRegistry,
    rpc::{CallGuard, ChainClient, LimitedChainClient},
    scan::{RangeScanner, ScanSettings},
    store::{HistoryStore, ProgressStore},
    types::Address,
};

pub use backfill::{BackfillReport, BackfillState, HistoricalBackfillTask};
pub use live_watch::{LiveWatchTask, NonceSnapshot, TickReport};
pub use loader::{LoadReport, TransferDetailLoader};
pub use queue::{BlockQueue, BlockReceiver, BlockSender};
pub use readiness::ReadinessTracker;

/// Everything a chain group's tasks share.
#[derive(Clone)]
pub struct ChainContext {
    pub chain_id: u64,
    pub client: Arc<dyn ChainClient>,
    pub progress: Arc<dyn ProgressStore>,
    pub history: Arc<dyn HistoryStore>,
    pub accounts: AccountRegistry,
    /// Tracked token contracts of this chain, in fingerprint order.
    pub tokens: Vec<Address>,
    pub limiter: RateLimiter,
    pub head: ChainHead,
    pub events: EventFeed,
    pub config: IndexerConfig,
    pub scan: ScanSettings,
}

impl ChainContext {
    /// Guard with the regular RPC timeout.
    #[must_use]
    pub fn guard(&self, cancel: &CancellationToken) -> CallGuard {
        CallGuard::new(cancel.clone(), self.config.rpc_timeout())
    }

    /// Guard with the short latest-header timeout.
    #[must_use]
    pub fn head_guard(&self, cancel: &CancellationToken) -> CallGuard {
        self.guard(cancel).with_timeout(self.config.head_timeout())
    }

    /// Rate limiter tags charged for historical work on behalf of `account`.
    #[must_use]
    pub fn history_tags(&self, account: &Address) -> [String; 2] {
        [account_tag(account), chain_group_tag(self.chain_id)]
    }

    /// `true` if any history quota of `account` is already used up. Does not consume.
    #[must_use]
    pub fn history_budget_exhausted(&self, account: &Address) -> bool {
        self.history_tags(account).iter().any(|tag| self.limiter.remaining(tag) == Some(0))
    }

    /// Scanner whose calls are charged to the account and chain group quotas.
    #[must_use]
    pub fn history_scanner(&self, account: &Address) -> RangeScanner {
        let client: Arc<dyn ChainClient> = Arc::new(LimitedChainClient::new(
            Arc::clone(&self.client),
            self.limiter.clone(),
            self.history_tags(account).to_vec(),
        ));
        RangeScanner::new(client, Arc::clone(&self.progress), Arc::clone(&self.history), self.scan.clone())
    }

    /// Scanner for forward watching; not charged to history quotas.
    #[must_use]
    pub fn live_scanner(&self) -> RangeScanner {
        RangeScanner::new(
            Arc::clone(&self.client),
            Arc::clone(&self.progress),
            Arc::clone(&self.history),
            self.scan.clone(),
        )
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl ChainContext {
    /// In-memory context over a simulated chain, with test-friendly settings.
    #[must_use]
    pub fn for_tests(client: Arc<dyn ChainClient>, accounts: AccountRegistry, tokens: Vec<Address>) -> Self {
        let config = IndexerConfig { backfill_retry_interval_seconds: 0, ..IndexerConfig::default() };
        Self {
            chain_id: client.chain_id(),
            head: ChainHead::new(client.chain_id()),
            client,
            progress: Arc::new(crate::store::MemoryProgressStore::new()),
            history: Arc::new(crate::store::MemoryHistoryStore::new()),
            accounts,
            tokens,
            limiter: RateLimiter::new(),
            events: EventFeed::default(),
            scan: config.scan_settings(None),
            config,
        }
    }
}
