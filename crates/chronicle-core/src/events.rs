use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::types::Address;

/// Signals the indexer emits for the wallet layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum IndexerEvent {
    FetchingRecentHistoryStarted { chain_id: u64, accounts: Vec<Address> },
    RecentHistoryReady { chain_id: u64, account: Address },
    NewTransfersAvailable { chain_id: u64, accounts: Vec<Address> },
}

impl IndexerEvent {
    #[must_use]
    pub fn chain_id(&self) -> u64 {
        match self {
            Self::FetchingRecentHistoryStarted { chain_id, .. } |
            Self::RecentHistoryReady { chain_id, .. } |
            Self::NewTransfersAvailable { chain_id, .. } => *chain_id,
        }
    }
}

/// Fire-and-forget broadcast feed. Emitting with no subscribers is not an error,
/// and slow subscribers lag instead of blocking the indexer.
#[derive(Debug, Clone)]
pub struct EventFeed {
    sender: broadcast::Sender<IndexerEvent>,
}

impl EventFeed {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<IndexerEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: IndexerEvent) {
        trace!(?event, "emitting indexer event");
        let _ = self.sender.send(event);
    }
}

impl Default for EventFeed {
    fn default() -> Self {
        Self::new(256)
    }
}
