//! Builder for the indexer runtime.

use crate::{
    config::{AppConfig, StorageBackend},
    events::EventFeed,
    indexer::{IndexerDeps, MultiChainIndexer},
    rate_limit::RateLimiter,
    registry::{AccountRegistry, TokenRegistry},
    rpc::{ChainClient, HttpClient, HttpClientConfig, JsonRpcChainClient},
    store::{HistoryStore, MemoryHistoryStore, MemoryProgressStore, ProgressStore, SqliteStore},
};
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tracing::{debug, info};

use super::{lifecycle::IndexerRuntime, IndexerComponents};

/// Errors that can occur during runtime initialization.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    #[error("No enabled chains configured")]
    NoChains,

    #[error("Failed to open storage: {0}")]
    Storage(String),

    /// Generic initialization error
    #[error("Runtime initialization failed: {0}")]
    Initialization(String),
}

/// Builder for an [`IndexerRuntime`].
///
/// Stores and chain clients come from the configuration unless overridden,
/// which is how tests and embedders plug in their own.
///
/// # Examples
///
/// ```no_run
/// # use chronicle_core::{config::AppConfig, runtime::IndexerRuntimeBuilder};
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = AppConfig::load()?;
/// let runtime = IndexerRuntimeBuilder::new().with_config(config).build().await?;
/// runtime.start().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct IndexerRuntimeBuilder {
    config: Option<AppConfig>,
    progress: Option<Arc<dyn ProgressStore>>,
    history: Option<Arc<dyn HistoryStore>>,
    clients: HashMap<u64, Arc<dyn ChainClient>>,
    event_capacity: Option<usize>,
}

impl IndexerRuntimeBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_config(mut self, config: AppConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Uses the given stores instead of the configured backend.
    #[must_use]
    pub fn with_stores(mut self, progress: Arc<dyn ProgressStore>, history: Arc<dyn HistoryStore>) -> Self {
        self.progress = Some(progress);
        self.history = Some(history);
        self
    }

    /// Serves the chain with `client` instead of a JSON-RPC client built from its URL.
    #[must_use]
    pub fn with_client(mut self, client: Arc<dyn ChainClient>) -> Self {
        self.clients.insert(client.chain_id(), client);
        self
    }

    /// Sets the event feed capacity (default: 256).
    #[must_use]
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = Some(capacity);
        self
    }

    /// Builds the runtime. Nothing runs until [`IndexerRuntime::start`].
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError` if configuration is missing or invalid, no chain is
    /// enabled, storage cannot be opened, or a chain cannot be registered.
    pub async fn build(mut self) -> Result<IndexerRuntime, RuntimeError> {
        let config = self.config.take().ok_or_else(|| {
            RuntimeError::ConfigValidation("No configuration provided".to_string())
        })?;
        config.validate().map_err(RuntimeError::ConfigValidation)?;
        if config.enabled_chains().next().is_none() {
            return Err(RuntimeError::NoChains);
        }

        info!(
            chains = config.enabled_chains().count(),
            accounts = config.accounts.len(),
            storage = ?config.storage.backend,
            omit_history = config.indexer.omit_history,
            "Initializing indexer runtime"
        );

        let (progress, history) = self.stores(&config).await?;
        debug!("Stores initialized");

        let tokens = TokenRegistry::new();
        for chain in config.enabled_chains() {
            tokens.set_tokens(chain.chain_id, chain.tokens.iter().copied());
        }
        let deps = IndexerDeps {
            progress: Arc::clone(&progress),
            history: Arc::clone(&history),
            accounts: AccountRegistry::new(config.tracked_accounts()),
            tokens,
            limiter: RateLimiter::new(),
            events: self.event_capacity.map_or_else(EventFeed::default, EventFeed::new),
        };
        let indexer = MultiChainIndexer::new(deps.clone(), config.indexer.clone(), config.rate_limits.clone());

        let http = if config.enabled_chains().all(|c| self.clients.contains_key(&c.chain_id)) {
            None
        } else {
            let client = HttpClient::with_config(HttpClientConfig::from(&config.rpc))
                .map_err(|e| RuntimeError::Initialization(format!("HTTP client: {e}")))?;
            Some(Arc::new(client))
        };

        for chain in config.enabled_chains() {
            let client: Arc<dyn ChainClient> = match (self.clients.remove(&chain.chain_id), &http) {
                (Some(client), _) => client,
                (None, Some(http)) => Arc::new(JsonRpcChainClient::new(
                    chain.chain_id,
                    chain.rpc_url.clone(),
                    Arc::clone(http),
                    config.indexer.rpc_timeout(),
                )),
                (None, None) => {
                    return Err(RuntimeError::Initialization(format!(
                        "no client for chain {}",
                        chain.chain_id
                    )))
                }
            };
            indexer
                .add_chain(client, chain.token_batch_size)
                .map_err(|e| RuntimeError::Initialization(e.to_string()))?;
            debug!(chain_id = chain.chain_id, name = %chain.name, tokens = chain.tokens.len(), "Chain registered");
        }
        indexer
            .restore_quotas()
            .await
            .map_err(|e| RuntimeError::Storage(format!("rate limit usage: {e}")))?;

        let components = IndexerComponents::new(progress, history, deps.limiter, deps.events, Arc::new(indexer));
        info!("Indexer runtime initialization complete");
        Ok(IndexerRuntime::new(components, config))
    }

    async fn stores(
        &mut self,
        config: &AppConfig,
    ) -> Result<(Arc<dyn ProgressStore>, Arc<dyn HistoryStore>), RuntimeError> {
        if let (Some(progress), Some(history)) = (self.progress.take(), self.history.take()) {
            return Ok((progress, history));
        }
        match config.storage.backend {
            StorageBackend::Memory => {
                let progress: Arc<dyn ProgressStore> = Arc::new(MemoryProgressStore::new());
                let history: Arc<dyn HistoryStore> = Arc::new(MemoryHistoryStore::new());
                Ok((progress, history))
            }
            StorageBackend::Sqlite => {
                let store = SqliteStore::connect(&config.storage.database_url, config.storage.max_connections)
                    .await
                    .map_err(|e| RuntimeError::Storage(e.to_string()))?;
                let store = Arc::new(store);
                let progress: Arc<dyn ProgressStore> = store.clone();
                let history: Arc<dyn HistoryStore> = store;
                Ok((progress, history))
            }
        }
    }
}
