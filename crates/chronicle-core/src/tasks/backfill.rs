use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{BlockSender, ChainContext, ReadinessTracker};
use crate::{
    errors::IndexerError,
    events::IndexerEvent,
    metrics,
    rpc::CallGuard,
    scan::{ScanMode, TokenBisector},
    store::{BlockRange, BlockRangeUpdate, RangeKind},
    types::Address,
};

/// Per-account backfill progress, derived from the persisted ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillState {
    /// Native history not yet walked down to its genesis.
    Scanning,
    /// Native side complete; tracked tokens still need the tail below the token range.
    TailCheck,
    Done,
}

impl BackfillState {
    #[must_use]
    pub fn derive(native: &BlockRange, token: &BlockRange) -> Self {
        if !native.is_fully_backfilled() {
            Self::Scanning
        } else if !token.is_fully_backfilled() {
            Self::TailCheck
        } else {
            Self::Done
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub rounds: usize,
    /// Backward chunks scanned, across all accounts.
    pub chunks: usize,
    pub blocks: usize,
    /// Accounts that reached `Done` during this run.
    pub completed: Vec<Address>,
    /// Accounts whose history quota ran out at some point during this run.
    pub exhausted: Vec<Address>,
}

enum Step {
    AlreadyDone,
    Denied,
    Advanced { done: bool },
}

#[derive(Debug, Default)]
struct RoundOutcome {
    pending: usize,
    denied: Vec<Address>,
    failure: Option<IndexerError>,
}

/// Walks every tracked account's history backward, one chunk per account per round.
///
/// Rounds interleave accounts so a long history cannot starve the others. The
/// state of each account is re-derived from the progress store at the top of
/// every round, which makes the task restartable at any chunk boundary.
pub struct HistoricalBackfillTask {
    ctx: ChainContext,
    queue: BlockSender,
    readiness: Arc<ReadinessTracker>,
}

impl HistoricalBackfillTask {
    #[must_use]
    pub fn new(ctx: ChainContext, queue: BlockSender, readiness: Arc<ReadinessTracker>) -> Self {
        Self { ctx, queue, readiness }
    }

    pub async fn state(&self, account: Address) -> Result<BackfillState, IndexerError> {
        let (native, token) = self.ranges(account).await?;
        Ok(BackfillState::derive(&native, &token))
    }

    async fn ranges(&self, account: Address) -> Result<(BlockRange, BlockRange), IndexerError> {
        let native = self.ctx.progress.get_range(self.ctx.chain_id, account, RangeKind::Native).await?;
        let token = self.ctx.progress.get_range(self.ctx.chain_id, account, RangeKind::Token).await?;
        Ok((native, token))
    }

    /// Runs rounds until every account is `Done`.
    ///
    /// When every pending account is out of history quota the task pauses for
    /// `backfill_retry_interval` and checks again, so a periodic quota that
    /// renews lets the backfill carry on without a restart.
    ///
    /// # Errors
    ///
    /// The last error after `backfill_max_failures` consecutive failed rounds, or
    /// [`IndexerError::Cancelled`].
    pub async fn run(&self, cancel: CancellationToken) -> Result<BackfillReport, IndexerError> {
        let guard = self.ctx.guard(&cancel);
        let head_guard = self.ctx.head_guard(&cancel);
        let mut report = BackfillReport::default();

        let mut pending = Vec::new();
        for account in self.ctx.accounts.addresses() {
            if self.state(account).await? != BackfillState::Done {
                pending.push(account);
            }
        }
        if pending.is_empty() {
            debug!(chain_id = self.ctx.chain_id, "nothing to backfill");
            return Ok(report);
        }

        let start_head = match self.ctx.head.number() {
            Some(head) => head,
            None => self.ctx.head.refresh(self.ctx.client.as_ref(), &head_guard).await?.number,
        };
        info!(chain_id = self.ctx.chain_id, accounts = pending.len(), start_head, "backfill started");
        self.ctx.events.emit(IndexerEvent::FetchingRecentHistoryStarted {
            chain_id: self.ctx.chain_id,
            accounts: pending.clone(),
        });

        let mut failures = 0u32;
        let mut paused = false;
        loop {
            guard.checkpoint()?;
            report.rounds += 1;
            let round = self.round(&guard, start_head, &mut report).await?;
            self.persist_quotas().await;

            if let Some(e) = round.failure {
                failures += 1;
                metrics::record_task_error("backfill", e.kind());
                if failures >= self.ctx.config.backfill_max_failures {
                    error!(
                        chain_id = self.ctx.chain_id,
                        failures,
                        error = %e,
                        "backfill given up"
                    );
                    return Err(e);
                }
                warn!(chain_id = self.ctx.chain_id, failures, error = %e, "backfill round failed, retrying");
                guard.sleep(self.ctx.config.backfill_retry_interval()).await?;
                continue;
            }
            failures = 0;

            if round.pending == 0 {
                break;
            }
            if round.denied.len() == round.pending {
                if !paused {
                    warn!(
                        chain_id = self.ctx.chain_id,
                        accounts = round.denied.len(),
                        retry_in = ?self.ctx.config.backfill_retry_interval(),
                        "history quota exhausted, backfill paused"
                    );
                }
                paused = true;
                for account in round.denied {
                    if !report.exhausted.contains(&account) {
                        report.exhausted.push(account);
                    }
                }
                guard.sleep(self.ctx.config.backfill_retry_interval()).await?;
                continue;
            }
            if paused {
                info!(chain_id = self.ctx.chain_id, "history quota available, backfill resumed");
                paused = false;
            }
        }

        info!(
            chain_id = self.ctx.chain_id,
            rounds = report.rounds,
            chunks = report.chunks,
            blocks = report.blocks,
            "backfill finished"
        );
        Ok(report)
    }

    async fn persist_quotas(&self) {
        if let Err(e) = self.ctx.limiter.persist(self.ctx.progress.as_ref()).await {
            warn!(chain_id = self.ctx.chain_id, error = %e, "failed to persist rate limit usage");
        }
    }

    async fn round(
        &self,
        guard: &CallGuard,
        start_head: u64,
        report: &mut BackfillReport,
    ) -> Result<RoundOutcome, IndexerError> {
        let mut outcome = RoundOutcome::default();

        for account in self.ctx.accounts.addresses() {
            guard.checkpoint()?;
            match self.advance(guard, account, start_head, report).await {
                Ok(Step::AlreadyDone) => {}
                Ok(Step::Denied) => {
                    outcome.pending += 1;
                    outcome.denied.push(account);
                }
                Ok(Step::Advanced { done: false }) => outcome.pending += 1,
                Ok(Step::Advanced { done: true }) => {
                    report.completed.push(account);
                    info!(chain_id = self.ctx.chain_id, %account, "account backfilled");
                    if let Err(e) = self.readiness.check(account).await {
                        warn!(chain_id = self.ctx.chain_id, %account, error = %e, "readiness check failed");
                    }
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) if e.is_rate_limited() => {
                    debug!(chain_id = self.ctx.chain_id, %account, error = %e, "history quota ran out mid-chunk");
                    outcome.pending += 1;
                    outcome.denied.push(account);
                }
                Err(e) => {
                    warn!(chain_id = self.ctx.chain_id, %account, error = %e, "backfill step failed");
                    outcome.pending += 1;
                    outcome.failure = Some(e);
                }
            }
        }

        Ok(outcome)
    }

    async fn advance(
        &self,
        guard: &CallGuard,
        account: Address,
        start_head: u64,
        report: &mut BackfillReport,
    ) -> Result<Step, IndexerError> {
        let (native, token) = self.ranges(account).await?;
        match BackfillState::derive(&native, &token) {
            BackfillState::Done => return Ok(Step::AlreadyDone),
            _ if self.ctx.history_budget_exhausted(&account) => {
                debug!(chain_id = self.ctx.chain_id, %account, "history quota exhausted, skipping round");
                return Ok(Step::Denied);
            }
            BackfillState::Scanning => self.scan_step(guard, account, &native, start_head, report).await?,
            BackfillState::TailCheck => self.tail_check(guard, account, &token, report).await?,
        }
        let done = self.state(account).await? == BackfillState::Done;
        Ok(Step::Advanced { done })
    }

    async fn scan_step(
        &self,
        guard: &CallGuard,
        account: Address,
        native: &BlockRange,
        start_head: u64,
        report: &mut BackfillReport,
    ) -> Result<(), IndexerError> {
        let to = native.first_known.or(native.last_known).unwrap_or(start_head);
        let from = to.saturating_sub(self.ctx.scan.chunk_size.max(1));

        let chunk = self
            .ctx
            .history_scanner(&account)
            .scan_chunk(guard, ScanMode::Backfill, account, from, to)
            .await?;
        report.chunks += 1;
        report.blocks += chunk.new_blocks.len();
        debug!(
            chain_id = self.ctx.chain_id,
            %account,
            from,
            to,
            genesis = ?chunk.genesis,
            "backfill chunk done"
        );
        self.queue.send(chunk.new_blocks, guard.token()).await
    }

    /// Resolves token history below the token range, where no log scan ran.
    ///
    /// Below the native genesis the account never sent a transaction, so its
    /// token balances there can only have grown; a zero balance at the top of
    /// the tail means the token was never received.
    async fn tail_check(
        &self,
        guard: &CallGuard,
        account: Address,
        token_range: &BlockRange,
        report: &mut BackfillReport,
    ) -> Result<(), IndexerError> {
        let first = token_range.first_known.unwrap_or(0);
        let top = first.saturating_sub(1);
        let scanner = self.ctx.history_scanner(&account);
        let client = scanner.client();

        if first > 0 {
            for token in &self.ctx.tokens {
                let balance = guard.call(client.token_balance_at(account, *token, top)).await?;
                if balance.is_zero() {
                    continue;
                }
                let ranges = TokenBisector::new(client.as_ref(), guard, scanner.settings().token_batch_size)
                    .find_changed_ranges(account, *token, 0, top)
                    .await?;
                debug!(chain_id = self.ctx.chain_id, %account, %token, ranges = ranges.len(), "token tail bisected");

                for (lo, hi) in ranges {
                    let outcome = scanner.scan(guard, ScanMode::TokenTail, account, lo, hi).await?;
                    report.blocks += outcome.blocks.len();
                    self.queue.send(outcome.blocks, guard.token()).await?;
                }
            }
        }

        let last = token_range.last_known.unwrap_or(top);
        self.ctx
            .progress
            .upsert_range(self.ctx.chain_id, account, RangeKind::Token, BlockRangeUpdate::scanned(0, last))
            .await?;
        Ok(())
    }
}
