use std::{sync::Arc, time::Instant};
use tracing::{debug, warn};

use super::{
    chunk_ranges, BlockCollector, LogDirection, LogScanner, NativeProbe, ScanMode, ScanOutcome,
    ScanSettings,
};
use crate::{
    errors::IndexerError,
    metrics,
    rpc::{CallGuard, ChainClient},
    store::{
        BlockRangeUpdate, DiscoveredBlock, HistoryStore, ProgressStore, RangeKind, TransferRef,
    },
    types::Address,
};

/// Result of one persisted chunk.
#[derive(Debug, Clone, Default)]
pub struct ChunkResult {
    pub from: u64,
    pub to: u64,
    /// Where the next chunk continues: backward scans resume below it, forward
    /// scans above it.
    pub boundary: u64,
    pub genesis: Option<u64>,
    /// Blocks that were new to the history store or gained references.
    pub new_blocks: Vec<DiscoveredBlock>,
    /// The chunk's data was malformed and it was skipped.
    pub skipped: bool,
}

/// Scans block ranges for account activity and persists the outcome chunk by chunk.
///
/// A chunk is the unit of progress: its discovered blocks and its range update
/// are written before the next chunk starts, and nothing is written for a chunk
/// that fails. Cancellation is observed at every RPC and at chunk boundaries.
pub struct RangeScanner {
    chain_id: u64,
    client: Arc<dyn ChainClient>,
    progress: Arc<dyn ProgressStore>,
    history: Arc<dyn HistoryStore>,
    settings: ScanSettings,
}

impl RangeScanner {
    #[must_use]
    pub fn new(
        client: Arc<dyn ChainClient>,
        progress: Arc<dyn ProgressStore>,
        history: Arc<dyn HistoryStore>,
        settings: ScanSettings,
    ) -> Self {
        Self { chain_id: client.chain_id(), client, progress, history, settings }
    }

    #[must_use]
    pub fn settings(&self) -> &ScanSettings {
        &self.settings
    }

    #[must_use]
    pub fn client(&self) -> &Arc<dyn ChainClient> {
        &self.client
    }

    /// Scans `[from, to]` for one account in chunks, in the direction `mode` implies.
    ///
    /// A backfill stops early once the native genesis is found.
    pub async fn scan(
        &self,
        guard: &CallGuard,
        mode: ScanMode,
        account: Address,
        from: u64,
        to: u64,
    ) -> Result<ScanOutcome, IndexerError> {
        let mut outcome =
            ScanOutcome { boundary: if mode.is_backward() { to } else { from }, ..ScanOutcome::default() };
        if from > to {
            return Ok(outcome);
        }

        if mode == ScanMode::TokenTail {
            let chunk = self.scan_chunk(guard, mode, account, from, to).await?;
            outcome.boundary = chunk.boundary;
            outcome.blocks = chunk.new_blocks;
            outcome.chunks = 1;
            return Ok(outcome);
        }

        let chunk_size = self.settings.chunk_size.max(1);
        let (mut lo, mut hi) = if mode.is_backward() {
            (to.saturating_sub(chunk_size).max(from), to)
        } else {
            (from, from.saturating_add(chunk_size).min(to))
        };

        loop {
            guard.checkpoint()?;
            let chunk = self.scan_chunk(guard, mode, account, lo, hi).await?;
            outcome.chunks += 1;
            outcome.boundary = chunk.boundary;
            outcome.blocks.extend(chunk.new_blocks);

            if mode.is_backward() {
                outcome.genesis = outcome.genesis.or(chunk.genesis);
                // a truncated probe may see the genesis below its boundary
                if chunk.genesis.is_some_and(|g| g >= chunk.boundary) || chunk.boundary <= from {
                    break;
                }
                hi = chunk.boundary;
                lo = hi.saturating_sub(chunk_size).max(from);
            } else {
                if chunk.boundary >= to {
                    break;
                }
                lo = chunk.boundary;
                hi = lo.saturating_add(chunk_size).min(to);
            }
        }

        Ok(outcome)
    }

    /// Scans and persists a single chunk for one account.
    pub async fn scan_chunk(
        &self,
        guard: &CallGuard,
        mode: ScanMode,
        account: Address,
        from: u64,
        to: u64,
    ) -> Result<ChunkResult, IndexerError> {
        let started = Instant::now();
        let mut chunk = ChunkResult {
            from,
            to,
            boundary: if mode.is_backward() { from } else { to },
            ..ChunkResult::default()
        };

        let discovered = match self.discover(guard, mode, account, from, to).await {
            Ok(discovered) => discovered,
            Err(e) if e.is_malformed() => {
                warn!(
                    chain_id = self.chain_id,
                    %account,
                    mode = mode.as_str(),
                    from,
                    to,
                    error = %e,
                    "skipping chunk with malformed data"
                );
                metrics::record_task_error("scan", "malformed");
                chunk.skipped = true;
                Discovery::default()
            }
            Err(e) => return Err(e),
        };

        if let Some(boundary) = discovered.native_boundary {
            chunk.boundary = boundary;
        }
        chunk.genesis = discovered.genesis;
        chunk.new_blocks = self.history.save_blocks(&discovered.blocks).await?;

        match mode {
            ScanMode::Backfill => {
                let native_first = match chunk.genesis {
                    Some(genesis) if !discovered.truncated => genesis,
                    _ => chunk.boundary,
                };
                let mut native = BlockRangeUpdate::scanned(native_first, to);
                if let Some(genesis) = chunk.genesis {
                    native = native.with_start(genesis);
                }
                self.progress.upsert_range(self.chain_id, account, RangeKind::Native, native).await?;
                self.progress
                    .upsert_range(self.chain_id, account, RangeKind::Token, BlockRangeUpdate::scanned(from, to))
                    .await?;
            }
            ScanMode::Live => {
                self.progress
                    .upsert_range(
                        self.chain_id,
                        account,
                        RangeKind::Native,
                        BlockRangeUpdate::up_to(chunk.boundary),
                    )
                    .await?;
                self.progress
                    .upsert_range(self.chain_id, account, RangeKind::Token, BlockRangeUpdate::up_to(to))
                    .await?;
            }
            ScanMode::TokenLogs => {
                self.progress
                    .upsert_range(self.chain_id, account, RangeKind::Token, BlockRangeUpdate::up_to(to))
                    .await?;
            }
            ScanMode::TokenTail => {}
        }

        metrics::record_blocks_discovered(self.chain_id, mode.as_str(), chunk.new_blocks.len());
        metrics::record_scan_duration(self.chain_id, mode.as_str(), started.elapsed());
        debug!(
            chain_id = self.chain_id,
            %account,
            mode = mode.as_str(),
            from,
            to,
            boundary = chunk.boundary,
            genesis = ?chunk.genesis,
            new_blocks = chunk.new_blocks.len(),
            "chunk scanned"
        );
        Ok(chunk)
    }

    /// Log-only sweep of `[from, to]` for many accounts; advances each token
    /// `last_known` per chunk.
    pub async fn scan_token_logs(
        &self,
        guard: &CallGuard,
        accounts: &[Address],
        from: u64,
        to: u64,
    ) -> Result<ScanOutcome, IndexerError> {
        let mut outcome = ScanOutcome { boundary: from, ..ScanOutcome::default() };
        if accounts.is_empty() || from > to {
            return Ok(outcome);
        }

        for (lo, hi) in chunk_ranges(from, to, self.settings.chunk_size, false) {
            guard.checkpoint()?;
            let started = Instant::now();
            let scanner = LogScanner::new(self.client.as_ref(), guard, self.settings.log_batch_size);
            let blocks = match scanner.scan(accounts, lo, hi, LogDirection::Both).await {
                Ok(blocks) => blocks,
                Err(e) if e.is_malformed() => {
                    warn!(chain_id = self.chain_id, from = lo, to = hi, error = %e, "skipping malformed log chunk");
                    metrics::record_task_error("scan", "malformed");
                    Vec::new()
                }
                Err(e) => return Err(e),
            };

            let new_blocks = self.history.save_blocks(&blocks).await?;
            for account in accounts {
                self.progress
                    .upsert_range(self.chain_id, *account, RangeKind::Token, BlockRangeUpdate::up_to(hi))
                    .await?;
            }

            metrics::record_blocks_discovered(self.chain_id, ScanMode::TokenLogs.as_str(), new_blocks.len());
            metrics::record_scan_duration(self.chain_id, ScanMode::TokenLogs.as_str(), started.elapsed());
            outcome.blocks.extend(new_blocks);
            outcome.boundary = hi;
            outcome.chunks += 1;
        }

        Ok(outcome)
    }

    async fn discover(
        &self,
        guard: &CallGuard,
        mode: ScanMode,
        account: Address,
        from: u64,
        to: u64,
    ) -> Result<Discovery, IndexerError> {
        let direction =
            if mode == ScanMode::TokenTail { LogDirection::Incoming } else { LogDirection::Both };
        let logs = LogScanner::new(self.client.as_ref(), guard, self.settings.log_batch_size);

        let mut discovery = Discovery::default();
        let mut collector = BlockCollector::new(self.chain_id);

        if mode.probes_native() {
            let probe = NativeProbe::new(
                self.client.as_ref(),
                guard,
                account,
                self.settings.max_ranges_per_level,
                self.settings.native_probe_concurrency,
            );
            let accounts = [account];
            let (native, token_blocks) = tokio::try_join!(
                probe.run(from, to, mode.is_backward()),
                logs.scan(&accounts, from, to, direction),
            )?;

            for header in &native.changed {
                collector.add(account, header.number, header.hash, TransferRef::NativeActivity);
            }
            collector.extend(token_blocks);

            discovery.native_boundary = Some(native.boundary);
            discovery.truncated = native.truncated;
            if mode == ScanMode::Backfill {
                if native.genesis == Some(to) {
                    // untouched at the chunk top: nothing below it either
                    discovery.genesis = Some(0);
                    discovery.native_boundary = Some(0);
                } else {
                    discovery.genesis = native.genesis;
                }
            }
        } else {
            collector.extend(logs.scan(&[account], from, to, direction).await?);
        }

        discovery.blocks = collector.into_blocks();
        Ok(discovery)
    }
}

#[derive(Debug, Default)]
struct Discovery {
    blocks: Vec<DiscoveredBlock>,
    native_boundary: Option<u64>,
    genesis: Option<u64>,
    truncated: bool,
}
