//! Runtime lifecycle: starting the chain groups and graceful shutdown.

use crate::{
    config::AppConfig, errors::IndexerError, events::IndexerEvent, indexer::MultiChainIndexer,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{builder::IndexerRuntimeBuilder, IndexerComponents};

/// Owns the initialized components and coordinates shutdown.
///
/// `shutdown()` stops every chain group and waits for its tasks before
/// returning. Listeners obtained from [`shutdown_receiver`](Self::shutdown_receiver)
/// are signalled first.
pub struct IndexerRuntime {
    components: IndexerComponents,
    shutdown_tx: broadcast::Sender<()>,
    config: AppConfig,
    shutdown_initiated: Arc<AtomicBool>,
}

impl IndexerRuntime {
    #[must_use]
    pub fn builder() -> IndexerRuntimeBuilder {
        IndexerRuntimeBuilder::new()
    }

    pub(super) fn new(components: IndexerComponents, config: AppConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self { components, shutdown_tx, config, shutdown_initiated: Arc::new(AtomicBool::new(false)) }
    }

    #[must_use]
    pub fn components(&self) -> &IndexerComponents {
        &self.components
    }

    #[must_use]
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Convenience accessor for the multi-chain indexer.
    #[must_use]
    pub fn indexer(&self) -> &Arc<MultiChainIndexer> {
        self.components.indexer()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<IndexerEvent> {
        self.components.events().subscribe()
    }

    /// Starts every chain group.
    ///
    /// # Errors
    ///
    /// The first chain start failure, e.g. a configuration error.
    pub async fn start(&self) -> Result<(), IndexerError> {
        self.indexer().start().await?;
        info!(chains = self.indexer().chain_ids().len(), "Indexer runtime started");
        Ok(())
    }

    /// Creates a new shutdown receiver for external shutdown coordination.
    #[must_use]
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Signals listeners, stops all chain groups and waits for them. Idempotent.
    pub async fn shutdown(&self) {
        if self
            .shutdown_initiated
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Shutdown already initiated, ignoring duplicate call");
            return;
        }

        info!("Initiating indexer runtime shutdown");
        if self.shutdown_tx.send(()).is_err() {
            debug!("No shutdown listeners");
        }
        self.indexer().stop().await;
        info!("Indexer runtime shutdown complete");
    }
}

const _: () = {
    const fn assert_send<T: Send>() {}
    const fn assert_sync<T: Sync>() {}
    let _ = assert_send::<IndexerRuntime>;
    let _ = assert_sync::<IndexerRuntime>;
};
