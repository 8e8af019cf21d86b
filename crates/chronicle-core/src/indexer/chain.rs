use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    errors::IndexerError,
    registry::TrackedAccount,
    rpc::{BlockHeader, CallGuard},
    store::{BlockRangeUpdate, RangeKind},
    tasks::{
        BackfillReport, BlockQueue, BlockSender, ChainContext, HistoricalBackfillTask, LiveWatchTask,
        LoadReport, ReadinessTracker, TransferDetailLoader,
    },
    types::Address,
};

type BackfillHandle = JoinHandle<Result<BackfillReport, IndexerError>>;

struct Running {
    cancel: CancellationToken,
    sender: BlockSender,
    backfill: Option<BackfillHandle>,
    live: JoinHandle<u64>,
    loader: JoinHandle<LoadReport>,
}

/// Orchestrates one chain: a backfill, a live watcher and a loader joined by
/// a bounded [`BlockQueue`].
pub struct ChainIndexer {
    ctx: ChainContext,
    readiness: Arc<ReadinessTracker>,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for ChainIndexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainIndexer").field("chain_id", &self.ctx.chain_id).finish_non_exhaustive()
    }
}

impl ChainIndexer {
    #[must_use]
    pub fn new(ctx: ChainContext) -> Self {
        let readiness = Arc::new(ReadinessTracker::new(
            ctx.chain_id,
            Arc::clone(&ctx.progress),
            Arc::clone(&ctx.history),
            ctx.events.clone(),
        ));
        Self { ctx, readiness, running: Mutex::new(None) }
    }

    #[must_use]
    pub fn chain_id(&self) -> u64 {
        self.ctx.chain_id
    }

    #[must_use]
    pub fn context(&self) -> &ChainContext {
        &self.ctx
    }

    #[must_use]
    pub fn readiness(&self) -> &Arc<ReadinessTracker> {
        &self.readiness
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// `true` while a backfill task is still working.
    #[must_use]
    pub fn is_backfilling(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .and_then(|r| r.backfill.as_ref())
            .is_some_and(|h| !h.is_finished())
    }

    /// Starts the task group under a child of `parent`. A no-op when already running.
    ///
    /// # Errors
    ///
    /// [`IndexerError::Config`] when the client serves another chain, or any
    /// store failure while preparing the tracked accounts. A failing head fetch
    /// is retried every `start_retry_interval` until `parent` is cancelled.
    pub async fn start(&self, parent: &CancellationToken) -> Result<(), IndexerError> {
        if self.is_running() {
            return Ok(());
        }
        let served = self.ctx.client.chain_id();
        if served != self.ctx.chain_id {
            return Err(IndexerError::Config(format!(
                "client for chain {} serves chain {served}",
                self.ctx.chain_id
            )));
        }

        let cancel = parent.child_token();
        let head = self.wait_for_head(&cancel).await?;
        for account in self.ctx.accounts.addresses() {
            self.prepare_account(account, head.number).await?;
        }

        let (sender, rx) = BlockQueue::bounded(self.ctx.config.queue_capacity);
        let loader = {
            let task = TransferDetailLoader::new(self.ctx.clone(), Arc::clone(&self.readiness));
            let cancel = cancel.clone();
            tokio::spawn(async move { task.run(rx, cancel).await })
        };

        let preloaded = self.preload_unresolved(&sender, &cancel).await;
        if let Err(e) = preloaded {
            cancel.cancel();
            let _ = loader.await;
            return Err(e);
        }

        let live = {
            let task = LiveWatchTask::new(self.ctx.clone(), sender.clone());
            let cancel = cancel.clone();
            tokio::spawn(async move { task.run(cancel).await })
        };
        let backfill = (!self.ctx.config.omit_history).then(|| self.spawn_backfill(&sender, &cancel));

        info!(
            chain_id = self.ctx.chain_id,
            head = head.number,
            accounts = self.ctx.accounts.len(),
            omit_history = self.ctx.config.omit_history,
            "chain indexer started"
        );
        *self.running.lock() = Some(Running { cancel, sender, backfill, live, loader });
        Ok(())
    }

    /// Cancels the task group and waits for every child to finish.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        running.cancel.cancel();
        drop(running.sender);

        if let Some(backfill) = running.backfill {
            log_backfill_exit(self.ctx.chain_id, backfill.await);
        }
        match running.live.await {
            Ok(ticks) => debug!(chain_id = self.ctx.chain_id, ticks, "live watch joined"),
            Err(e) => error!(chain_id = self.ctx.chain_id, error = %e, "live watch panicked"),
        }
        match running.loader.await {
            Ok(report) => debug!(chain_id = self.ctx.chain_id, records = report.records, "loader joined"),
            Err(e) => error!(chain_id = self.ctx.chain_id, error = %e, "loader panicked"),
        }
        info!(chain_id = self.ctx.chain_id, "chain indexer stopped");
    }

    /// Restarts the backfill from persisted progress if it is not running.
    /// Returns `true` when a new backfill was spawned.
    pub async fn retry_backfill(&self) -> bool {
        if self.ctx.config.omit_history {
            return false;
        }
        let finished = {
            let mut guard = self.running.lock();
            let Some(running) = guard.as_mut() else {
                return false;
            };
            if running.backfill.as_ref().is_some_and(|h| !h.is_finished()) {
                return false;
            }
            let next = self.spawn_backfill(&running.sender, &running.cancel);
            running.backfill.replace(next)
        };

        if let Some(previous) = finished {
            log_backfill_exit(self.ctx.chain_id, previous.await);
        }
        info!(chain_id = self.ctx.chain_id, "backfill restarted");
        true
    }

    /// Anchors a newly tracked account and resumes the backfill to cover it.
    ///
    /// # Errors
    ///
    /// Store failures while writing the initial ranges.
    pub async fn track_account(&self, account: &TrackedAccount) -> Result<(), IndexerError> {
        let Some(head) = self.ctx.head.number() else {
            // picked up by the next start
            return Ok(());
        };
        self.prepare_account(account.address, head).await?;
        self.retry_backfill().await;
        Ok(())
    }

    /// Deletes the progress and history of `account` on this chain.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn forget_account(&self, account: Address) -> Result<(), IndexerError> {
        self.ctx.progress.remove_account(self.ctx.chain_id, account).await?;
        self.ctx.history.remove_account(self.ctx.chain_id, account).await?;
        self.readiness.forget(&account);
        Ok(())
    }

    async fn wait_for_head(&self, cancel: &CancellationToken) -> Result<BlockHeader, IndexerError> {
        let guard = self.ctx.head_guard(cancel);
        loop {
            match self.ctx.head.refresh(self.ctx.client.as_ref(), &guard).await {
                Ok(header) => return Ok(*header),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(
                        chain_id = self.ctx.chain_id,
                        error = %e,
                        retry_in = ?self.ctx.config.start_retry_interval(),
                        "head unavailable, chain start delayed"
                    );
                    guard.sleep(self.ctx.config.start_retry_interval()).await?;
                }
            }
        }
    }

    /// Gives a never-seen account an upper boundary at `head`, or marks both
    /// ranges complete when history is omitted.
    async fn prepare_account(&self, account: Address, head: u64) -> Result<(), IndexerError> {
        let chain_id = self.ctx.chain_id;
        for kind in [RangeKind::Native, RangeKind::Token] {
            let range = self.ctx.progress.get_range(chain_id, account, kind).await?;
            let update = if self.ctx.config.omit_history {
                if range.is_fully_backfilled() {
                    continue;
                }
                BlockRangeUpdate::scanned(0, range.last_known.unwrap_or(head).max(head)).with_start(0)
            } else if range.last_known.is_none() {
                BlockRangeUpdate::up_to(head)
            } else {
                continue;
            };
            self.ctx.progress.upsert_range(chain_id, account, kind, update).await?;
        }
        Ok(())
    }

    async fn preload_unresolved(
        &self,
        sender: &BlockSender,
        cancel: &CancellationToken,
    ) -> Result<(), IndexerError> {
        for account in self.ctx.accounts.addresses() {
            let blocks = self.ctx.history.get_unresolved_blocks(self.ctx.chain_id, account, usize::MAX).await?;
            if !blocks.is_empty() {
                debug!(chain_id = self.ctx.chain_id, %account, blocks = blocks.len(), "re-enqueueing unresolved blocks");
                sender.send(blocks, cancel).await?;
            }
        }
        Ok(())
    }

    fn spawn_backfill(&self, sender: &BlockSender, cancel: &CancellationToken) -> BackfillHandle {
        let task = HistoricalBackfillTask::new(self.ctx.clone(), sender.clone(), Arc::clone(&self.readiness));
        let cancel = cancel.clone();
        tokio::spawn(async move { task.run(cancel).await })
    }

    /// Guard bound to the running group, for callers driving work by hand.
    #[must_use]
    pub fn guard(&self) -> Option<CallGuard> {
        self.running.lock().as_ref().map(|r| self.ctx.guard(&r.cancel))
    }
}

fn log_backfill_exit(chain_id: u64, exit: Result<Result<BackfillReport, IndexerError>, tokio::task::JoinError>) {
    match exit {
        Ok(Ok(report)) => debug!(chain_id, chunks = report.chunks, "backfill joined"),
        Ok(Err(e)) if e.is_cancelled() => debug!(chain_id, "backfill cancelled"),
        Ok(Err(e)) => warn!(chain_id, error = %e, "backfill ended with error"),
        Err(e) => error!(chain_id, error = %e, "backfill panicked"),
    }
}
