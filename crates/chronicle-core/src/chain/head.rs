use arc_swap::ArcSwapOption;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::trace;

use crate::{
    errors::IndexerError,
    metrics,
    rpc::{BlockHeader, CallGuard, ChainClient},
};

fn current_unix_timestamp() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Latest observed head of one chain.
///
/// Reads are wait-free. The head only moves forward through [`ChainHead::update`];
/// an older header observed from a lagging node is ignored.
#[derive(Clone)]
pub struct ChainHead {
    chain_id: u64,
    head: Arc<ArcSwapOption<BlockHeader>>,
    /// Unix timestamp (seconds) of the last accepted update.
    last_update: Arc<AtomicU64>,
}

impl ChainHead {
    #[must_use]
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            head: Arc::new(ArcSwapOption::empty()),
            last_update: Arc::new(AtomicU64::new(0)),
        }
    }

    #[inline]
    #[must_use]
    pub fn current(&self) -> Option<Arc<BlockHeader>> {
        self.head.load_full()
    }

    #[inline]
    #[must_use]
    pub fn number(&self) -> Option<u64> {
        (*self.head.load()).as_ref().map(|h| h.number)
    }

    /// Seconds since the last accepted update; `None` before the first one.
    #[must_use]
    pub fn age_seconds(&self) -> Option<u64> {
        match self.last_update.load(Ordering::Acquire) {
            0 => None,
            at => Some(current_unix_timestamp().saturating_sub(at)),
        }
    }

    /// Stores `header` if it is newer than the current head. Returns whether it was stored.
    pub fn update(&self, header: BlockHeader) -> bool {
        let number = header.number;
        let new = Arc::new(header);
        let previous = self.head.rcu(|current| match current {
            Some(current) if current.number >= number => Some(Arc::clone(current)),
            _ => Some(Arc::clone(&new)),
        });

        let accepted = previous.as_ref().map_or(true, |p| p.number < number);
        if accepted {
            self.last_update.store(current_unix_timestamp(), Ordering::Release);
            metrics::set_chain_head(self.chain_id, number);
            trace!(chain_id = self.chain_id, block = number, "chain head updated");
        }
        accepted
    }

    /// Fetches the latest header and records it. Returns the highest head seen,
    /// which may be the stored one if the node lags behind it.
    pub async fn refresh(
        &self,
        client: &dyn ChainClient,
        guard: &CallGuard,
    ) -> Result<Arc<BlockHeader>, IndexerError> {
        let header = guard.call(client.header_by_number(None)).await?;
        let fetched = header.number;
        self.update(header);
        self.current().ok_or_else(|| {
            IndexerError::Malformed(format!("head {fetched} was not recorded"))
        })
    }
}
