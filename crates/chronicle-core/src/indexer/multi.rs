use futures_util::future::{join_all, try_join_all};
use parking_lot::RwLock;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::ChainIndexer;
use crate::{
    chain::ChainHead,
    config::{IndexerConfig, RateLimitsConfig},
    errors::IndexerError,
    events::{EventFeed, IndexerEvent},
    metrics,
    rate_limit::{account_tag, chain_group_tag, RateLimiter},
    registry::{AccountRegistry, TokenRegistry, TrackedAccount},
    rpc::ChainClient,
    store::{HistoryStore, ProgressStore},
    tasks::ChainContext,
    types::Address,
};

/// Shared collaborators of every chain group.
#[derive(Clone)]
pub struct IndexerDeps {
    pub progress: Arc<dyn ProgressStore>,
    pub history: Arc<dyn HistoryStore>,
    pub accounts: AccountRegistry,
    pub tokens: TokenRegistry,
    pub limiter: RateLimiter,
    pub events: EventFeed,
}

/// One [`ChainIndexer`] per active chain, started and stopped together.
///
/// Chains share the stores, the registries and the rate limiter; nothing else
/// crosses a chain boundary.
pub struct MultiChainIndexer {
    deps: IndexerDeps,
    config: IndexerConfig,
    rate_limits: RateLimitsConfig,
    chains: RwLock<BTreeMap<u64, Arc<ChainIndexer>>>,
    cancel: CancellationToken,
}

impl MultiChainIndexer {
    #[must_use]
    pub fn new(deps: IndexerDeps, config: IndexerConfig, rate_limits: RateLimitsConfig) -> Self {
        let indexer = Self {
            deps,
            config,
            rate_limits,
            chains: RwLock::new(BTreeMap::new()),
            cancel: CancellationToken::new(),
        };
        for account in indexer.deps.accounts.addresses() {
            indexer.apply_account_limit(&account);
        }
        indexer
    }

    /// Reloads persisted quota usage onto the configured limits. Called once
    /// every chain is registered, so chain group tags exist.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn restore_quotas(&self) -> Result<usize, IndexerError> {
        let restored = self.deps.limiter.restore_from(self.deps.progress.as_ref()).await?;
        if restored > 0 {
            info!(restored, "rate limit usage restored");
        }
        Ok(restored)
    }

    /// Registers a chain served by `client`.
    ///
    /// # Errors
    ///
    /// [`IndexerError::Config`] when the token registry has no entry for the
    /// chain or the chain is already registered.
    pub fn add_chain(
        &self,
        client: Arc<dyn ChainClient>,
        token_batch_size: Option<u64>,
    ) -> Result<Arc<ChainIndexer>, IndexerError> {
        let chain_id = client.chain_id();
        let tokens = self
            .deps
            .tokens
            .tokens(chain_id)
            .ok_or_else(|| IndexerError::Config(format!("no token registry entry for chain {chain_id}")))?;
        if self.chains.read().contains_key(&chain_id) {
            return Err(IndexerError::Config(format!("chain {chain_id} registered twice")));
        }

        let ctx = ChainContext {
            chain_id,
            client,
            progress: Arc::clone(&self.deps.progress),
            history: Arc::clone(&self.deps.history),
            accounts: self.deps.accounts.clone(),
            tokens,
            limiter: self.deps.limiter.clone(),
            head: ChainHead::new(chain_id),
            events: self.deps.events.clone(),
            config: self.config.clone(),
            scan: self.config.scan_settings(token_batch_size),
        };
        self.apply_chain_limit(chain_id);

        let chain = Arc::new(ChainIndexer::new(ctx));
        self.chains.write().insert(chain_id, Arc::clone(&chain));
        metrics::set_tracked_accounts(chain_id, self.deps.accounts.len());
        Ok(chain)
    }

    #[must_use]
    pub fn chain(&self, chain_id: u64) -> Option<Arc<ChainIndexer>> {
        self.chains.read().get(&chain_id).cloned()
    }

    #[must_use]
    pub fn chain_ids(&self) -> Vec<u64> {
        self.chains.read().keys().copied().collect()
    }

    #[must_use]
    pub fn accounts(&self) -> &AccountRegistry {
        &self.deps.accounts
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<IndexerEvent> {
        self.deps.events.subscribe()
    }

    fn all(&self) -> Vec<Arc<ChainIndexer>> {
        self.chains.read().values().cloned().collect()
    }

    /// Starts every registered chain concurrently.
    ///
    /// # Errors
    ///
    /// The first chain start failure; chains already started keep running
    /// until [`stop`](Self::stop).
    pub async fn start(&self) -> Result<(), IndexerError> {
        let chains = self.all();
        info!(chains = chains.len(), accounts = self.deps.accounts.len(), "starting indexer");
        try_join_all(chains.iter().map(|chain| chain.start(&self.cancel))).await?;
        Ok(())
    }

    /// Stops every chain and waits for all task groups to finish. Stopping is final.
    pub async fn stop(&self) {
        self.cancel.cancel();
        join_all(self.all().iter().map(|chain| chain.stop())).await;
        info!("indexer stopped");
    }

    /// Tracks `account` on every chain and resumes backfills to cover it.
    ///
    /// # Errors
    ///
    /// Store failures while anchoring the account.
    pub async fn add_account(&self, account: TrackedAccount) -> Result<(), IndexerError> {
        let address = account.address;
        let added = self.deps.accounts.add(account);
        self.apply_account_limit(&address);

        for chain in self.all() {
            chain.track_account(&account).await?;
            metrics::set_tracked_accounts(chain.chain_id(), self.deps.accounts.len());
        }
        info!(%address, new = added, externally_fundable = account.externally_fundable, "account tracked");
        Ok(())
    }

    /// Untracks `account` and deletes its progress and history on every chain.
    /// Returns `false` if it was not tracked.
    ///
    /// # Errors
    ///
    /// Store failures while deleting.
    pub async fn remove_account(&self, address: Address) -> Result<bool, IndexerError> {
        if !self.deps.accounts.remove(&address) {
            return Ok(false);
        }
        for chain in self.all() {
            chain.forget_account(address).await?;
            metrics::set_tracked_accounts(chain.chain_id(), self.deps.accounts.len());
        }
        let tag = account_tag(&address);
        self.deps.limiter.remove_limit(&tag);
        self.deps.progress.remove_quota(&tag).await?;
        info!(%address, "account untracked");
        Ok(true)
    }

    /// Retries the backfill of every chain whose backfill has stopped.
    pub async fn retry_backfill(&self) -> usize {
        let mut restarted = 0;
        for chain in self.all() {
            if chain.retry_backfill().await {
                restarted += 1;
            }
        }
        restarted
    }

    fn apply_chain_limit(&self, chain_id: u64) {
        if self.rate_limits.enabled {
            self.deps.limiter.set_limit(
                &chain_group_tag(chain_id),
                self.rate_limits.chain_group_limit,
                self.rate_limits.chain_group_period_seconds.map(Duration::from_secs),
            );
        }
    }

    fn apply_account_limit(&self, account: &Address) {
        if self.rate_limits.enabled {
            self.deps.limiter.set_limit(
                &account_tag(account),
                self.rate_limits.account_limit,
                self.rate_limits.account_period_seconds.map(Duration::from_secs),
            );
        }
    }
}
