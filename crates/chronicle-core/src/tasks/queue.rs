use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{errors::IndexerError, store::DiscoveredBlock};

/// Bounded handoff between discovery and detail loading.
///
/// Each message is one batch of blocks as produced by a scan. A full queue
/// blocks the producer, which is how loading applies backpressure to scanning.
pub struct BlockQueue;

impl BlockQueue {
    #[must_use]
    pub fn bounded(capacity: usize) -> (BlockSender, BlockReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (BlockSender { tx }, BlockReceiver { rx })
    }
}

#[derive(Clone, Debug)]
pub struct BlockSender {
    tx: mpsc::Sender<Vec<DiscoveredBlock>>,
}

impl BlockSender {
    /// Enqueues a batch, waiting for room. Empty batches are dropped.
    ///
    /// # Errors
    ///
    /// [`IndexerError::Cancelled`] if `cancel` fires while waiting or the loader is gone.
    pub async fn send(
        &self,
        blocks: Vec<DiscoveredBlock>,
        cancel: &CancellationToken,
    ) -> Result<(), IndexerError> {
        if blocks.is_empty() {
            return Ok(());
        }
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(IndexerError::Cancelled),
            sent = self.tx.send(blocks) => sent.map_err(|_| IndexerError::Cancelled),
        }
    }

    /// Free slots right now.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.tx.capacity()
    }
}

#[derive(Debug)]
pub struct BlockReceiver {
    rx: mpsc::Receiver<Vec<DiscoveredBlock>>,
}

impl BlockReceiver {
    /// Next batch in arrival order; `None` once every sender is dropped.
    pub async fn recv(&mut self) -> Option<Vec<DiscoveredBlock>> {
        self.rx.recv().await
    }

    /// Next batch if one is already queued.
    pub fn try_recv(&mut self) -> Option<Vec<DiscoveredBlock>> {
        self.rx.try_recv().ok()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
