use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{BlockSender, ChainContext};
use crate::{
    errors::IndexerError,
    metrics,
    registry::TrackedAccount,
    rpc::CallGuard,
    scan::ScanMode,
    store::{BlockRange, BlockRangeUpdate, RangeKind},
    types::{Address, Hash32},
};

/// Cached nonce of an account at a block, kept between ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonceSnapshot {
    pub nonce: u64,
    pub at_block: u64,
}

/// What one live tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub tick: u64,
    /// Block the balance fingerprints were read at; scans end here.
    pub head: u64,
    /// Accounts seen for the first time and anchored at `head`.
    pub initialized: Vec<Address>,
    /// Accounts whose fingerprint changed.
    pub dirty: Vec<Address>,
    pub nonce_checked: Vec<Address>,
    pub nonce_changed: Vec<Address>,
    /// Targeted native scans issued (dirty plus nonce-changed accounts).
    pub native_scans: usize,
    pub token_log_scan: bool,
    pub new_blocks: usize,
    pub failed: Vec<Address>,
}

enum Verdict {
    Scan,
    Advance,
    Wait,
}

/// Watches the head for new activity at a fixed interval.
///
/// One `balance_fingerprints` round trip per tick decides which accounts need a
/// scan; everything else just moves its `last_known` forward.
pub struct LiveWatchTask {
    ctx: ChainContext,
    queue: BlockSender,
    nonces: DashMap<Address, NonceSnapshot>,
    ticks: AtomicU64,
}

impl LiveWatchTask {
    #[must_use]
    pub fn new(ctx: ChainContext, queue: BlockSender) -> Self {
        Self { ctx, queue, nonces: DashMap::new(), ticks: AtomicU64::new(0) }
    }

    #[must_use]
    pub fn nonce_snapshot(&self, account: &Address) -> Option<NonceSnapshot> {
        self.nonces.get(account).map(|s| *s)
    }

    /// Ticks until cancelled. A failed tick is logged and the next one proceeds.
    /// Returns the number of ticks run.
    ///
    /// The first tick is preceded by a [`catch_up`](Self::catch_up); no tick
    /// runs until it has succeeded.
    pub async fn run(&self, cancel: CancellationToken) -> u64 {
        let guard = self.ctx.guard(&cancel);
        let head_guard = self.ctx.head_guard(&cancel);
        let mut interval = tokio::time::interval(self.ctx.config.live_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(chain_id = self.ctx.chain_id, interval = ?self.ctx.config.live_interval(), "live watch started");

        let mut caught_up = false;
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            if !caught_up {
                match self.catch_up(&guard, &head_guard).await {
                    Ok(_) => caught_up = true,
                    Err(e) if e.is_cancelled() => break,
                    Err(e) => {
                        warn!(chain_id = self.ctx.chain_id, error = %e, "catch-up scan failed, retrying next tick");
                        metrics::record_task_error("live_watch", e.kind());
                        continue;
                    }
                }
            }

            match self.tick(&guard, &head_guard).await {
                Ok(report) => debug!(
                    chain_id = self.ctx.chain_id,
                    tick = report.tick,
                    head = report.head,
                    dirty = report.dirty.len(),
                    nonce_changed = report.nonce_changed.len(),
                    new_blocks = report.new_blocks,
                    "live tick done"
                ),
                Err(e) if e.is_cancelled() => break,
                Err(e) => {
                    warn!(chain_id = self.ctx.chain_id, error = %e, "live tick failed");
                    metrics::record_task_error("live_watch", e.kind());
                }
            }
        }

        let ticks = self.ticks.load(Ordering::SeqCst);
        debug!(chain_id = self.ctx.chain_id, ticks, "live watch stopped");
        ticks
    }

    /// Scans `[last_known, head]` of every account whose stored progress lags
    /// the head, which covers blocks mined while the indexer was stopped.
    /// Activity there may leave the fingerprint unchanged, so ticks alone would
    /// skip it. Returns the number of accounts scanned.
    ///
    /// # Errors
    ///
    /// The first scan or store failure; accounts already scanned keep their progress.
    pub async fn catch_up(&self, guard: &CallGuard, head_guard: &CallGuard) -> Result<usize, IndexerError> {
        let head = self.ctx.head.refresh(self.ctx.client.as_ref(), head_guard).await?.number;
        let scanner = self.ctx.live_scanner();
        let mut scanned = 0;

        for account in self.ctx.accounts.addresses() {
            guard.checkpoint()?;
            let native = self.ctx.progress.get_range(self.ctx.chain_id, account, RangeKind::Native).await?;
            let Some(from) = native.last_known.filter(|from| *from < head) else {
                continue;
            };
            let outcome = scanner.scan(guard, ScanMode::Live, account, from, head).await?;
            info!(
                chain_id = self.ctx.chain_id,
                %account,
                from,
                head,
                blocks = outcome.blocks.len(),
                "caught up with blocks mined since last run"
            );
            self.queue.send(outcome.blocks, guard.token()).await?;
            scanned += 1;
        }
        Ok(scanned)
    }

    /// Runs one tick.
    ///
    /// # Errors
    ///
    /// Fails as a whole only when the head or the fingerprints cannot be read;
    /// per-account failures are reported in [`TickReport::failed`].
    pub async fn tick(&self, guard: &CallGuard, head_guard: &CallGuard) -> Result<TickReport, IndexerError> {
        let tick = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
        let mut report = TickReport { tick, ..TickReport::default() };

        let accounts = self.ctx.accounts.accounts();
        if accounts.is_empty() {
            return Ok(report);
        }
        let addresses: Vec<Address> = accounts.iter().map(|a| a.address).collect();

        self.ctx.head.refresh(self.ctx.client.as_ref(), head_guard).await?;
        let fingerprints =
            guard.call(self.ctx.client.balance_fingerprints(&addresses, &self.ctx.tokens)).await?;
        let head = fingerprints.block_number;
        report.head = head;
        let nonce_tick = tick % self.ctx.config.nonce_check_every.max(1) == 0;

        for account in &accounts {
            let Some(fingerprint) = fingerprints.get(&account.address) else {
                warn!(chain_id = self.ctx.chain_id, account = %account.address, "no fingerprint returned");
                report.failed.push(account.address);
                continue;
            };
            match self.watch_account(guard, account, fingerprint, head, nonce_tick, &mut report).await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(chain_id = self.ctx.chain_id, account = %account.address, error = %e, "live scan failed");
                    report.failed.push(account.address);
                }
            }
        }

        let log_tick = tick % self.ctx.config.log_check_every.max(1) == 0;
        if log_tick || !report.dirty.is_empty() {
            self.token_log_safety_net(guard, &addresses, head, &mut report).await?;
        }

        metrics::record_live_tick(self.ctx.chain_id, report.dirty.len());
        Ok(report)
    }

    async fn watch_account(
        &self,
        guard: &CallGuard,
        account: &TrackedAccount,
        fingerprint: Hash32,
        head: u64,
        nonce_tick: bool,
        report: &mut TickReport,
    ) -> Result<(), IndexerError> {
        let address = account.address;
        let native = self.ctx.progress.get_range(self.ctx.chain_id, address, RangeKind::Native).await?;

        let Some(from) = native.last_known else {
            // history below `head` belongs to the backfill
            self.anchor(address, head, fingerprint).await?;
            report.initialized.push(address);
            return Ok(());
        };

        let verdict = if native.balance_fingerprint != Some(fingerprint) {
            report.dirty.push(address);
            Verdict::Scan
        } else if !account.externally_fundable {
            Verdict::Advance
        } else if nonce_tick {
            report.nonce_checked.push(address);
            if self.nonce_changed(guard, address, from, head).await? {
                report.nonce_changed.push(address);
                Verdict::Scan
            } else {
                Verdict::Advance
            }
        } else {
            Verdict::Wait
        };

        match verdict {
            Verdict::Scan => self.scan_account(guard, address, &native, head, fingerprint, report).await,
            Verdict::Advance => {
                if head > from {
                    self.ctx
                        .progress
                        .upsert_range(self.ctx.chain_id, address, RangeKind::Native, BlockRangeUpdate::up_to(head))
                        .await?;
                }
                Ok(())
            }
            Verdict::Wait => Ok(()),
        }
    }

    async fn anchor(&self, account: Address, head: u64, fingerprint: Hash32) -> Result<(), IndexerError> {
        let native = BlockRangeUpdate::up_to(head).with_fingerprint(fingerprint);
        self.ctx.progress.upsert_range(self.ctx.chain_id, account, RangeKind::Native, native).await?;
        self.ctx
            .progress
            .upsert_range(self.ctx.chain_id, account, RangeKind::Token, BlockRangeUpdate::up_to(head))
            .await?;
        Ok(())
    }

    /// Compares the nonce at `head` with the cached nonce at `from`.
    async fn nonce_changed(
        &self,
        guard: &CallGuard,
        account: Address,
        from: u64,
        head: u64,
    ) -> Result<bool, IndexerError> {
        let cached = self.nonce_snapshot(&account).filter(|s| s.at_block == from);
        let nonce_then = match cached {
            Some(snapshot) => snapshot.nonce,
            None => guard.call(self.ctx.client.nonce_at(account, from)).await?,
        };
        let nonce_now = guard.call(self.ctx.client.nonce_at(account, head)).await?;

        if nonce_now == nonce_then {
            self.nonces.insert(account, NonceSnapshot { nonce: nonce_now, at_block: head });
            Ok(false)
        } else {
            debug!(chain_id = self.ctx.chain_id, %account, nonce_then, nonce_now, "nonce moved");
            self.nonces.remove(&account);
            Ok(true)
        }
    }

    async fn scan_account(
        &self,
        guard: &CallGuard,
        account: Address,
        native: &BlockRange,
        head: u64,
        fingerprint: Hash32,
        report: &mut TickReport,
    ) -> Result<(), IndexerError> {
        let from = native.last_known.unwrap_or(head);
        report.native_scans += 1;
        if from < head {
            let outcome = self.ctx.live_scanner().scan(guard, ScanMode::Live, account, from, head).await?;
            report.new_blocks += outcome.blocks.len();
            self.queue.send(outcome.blocks, guard.token()).await?;
        }
        let update = BlockRangeUpdate::up_to(head).with_fingerprint(fingerprint);
        self.ctx.progress.upsert_range(self.ctx.chain_id, account, RangeKind::Native, update).await?;
        self.nonces.remove(&account);
        Ok(())
    }

    /// Log-only scan over `[lowest token last_known, head]` for every account.
    async fn token_log_safety_net(
        &self,
        guard: &CallGuard,
        accounts: &[Address],
        head: u64,
        report: &mut TickReport,
    ) -> Result<(), IndexerError> {
        let mut from = head;
        for account in accounts {
            let token = self.ctx.progress.get_range(self.ctx.chain_id, *account, RangeKind::Token).await?;
            from = from.min(token.last_known.unwrap_or(head));
        }
        if from >= head {
            return Ok(());
        }

        let outcome = self.ctx.live_scanner().scan_token_logs(guard, accounts, from, head).await?;
        report.token_log_scan = true;
        report.new_blocks += outcome.blocks.len();
        self.queue.send(outcome.blocks, guard.token()).await
    }
}
