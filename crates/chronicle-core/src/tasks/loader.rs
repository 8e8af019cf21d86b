use chrono::{DateTime, Utc};
use futures_util::{stream, StreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{BlockReceiver, ChainContext, ReadinessTracker};
use crate::{
    errors::IndexerError,
    events::IndexerEvent,
    metrics,
    rpc::CallGuard,
    store::{Asset, DiscoveredBlock, Direction, TransferRecord, TransferRef, TransferStatus},
    types::{Address, Hash32, Word},
};

/// Totals of one or more processed batches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub blocks: usize,
    pub records: usize,
    /// Records inserted or changed.
    pub new_records: usize,
    pub loaded_blocks: usize,
    /// Blocks left unresolved because a receipt is still missing.
    pub pending_blocks: usize,
    pub failed: Vec<Address>,
    /// Accounts a `NewTransfersAvailable` event was emitted for.
    pub notified: Vec<Address>,
}

impl LoadReport {
    fn absorb(&mut self, other: LoadReport) {
        self.blocks += other.blocks;
        self.records += other.records;
        self.new_records += other.new_records;
        self.loaded_blocks += other.loaded_blocks;
        self.pending_blocks += other.pending_blocks;
        self.failed.extend(other.failed);
        self.notified.extend(other.notified);
    }
}

#[derive(Default)]
struct AccountLoad {
    records: usize,
    new_records: usize,
    loaded_blocks: usize,
    pending_blocks: usize,
}

/// Single consumer of a chain's block queue.
///
/// Turns discovered blocks into [`TransferRecord`]s. Account groups of a batch
/// load concurrently up to `loader_fan_out`; blocks of one account load in order.
pub struct TransferDetailLoader {
    ctx: ChainContext,
    readiness: Arc<ReadinessTracker>,
}

impl TransferDetailLoader {
    #[must_use]
    pub fn new(ctx: ChainContext, readiness: Arc<ReadinessTracker>) -> Self {
        Self { ctx, readiness }
    }

    /// Drains `rx` until cancelled or every producer is gone.
    pub async fn run(&self, mut rx: BlockReceiver, cancel: CancellationToken) -> LoadReport {
        let guard = self.ctx.guard(&cancel);
        let mut total = LoadReport::default();

        loop {
            let batch = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                batch = rx.recv() => batch,
            };
            let Some(blocks) = batch else {
                debug!(chain_id = self.ctx.chain_id, "block queue closed");
                break;
            };

            match self.process_batch(&guard, blocks).await {
                Ok(report) => total.absorb(report),
                Err(e) if e.is_cancelled() => break,
                Err(e) => {
                    warn!(chain_id = self.ctx.chain_id, error = %e, "loader batch failed");
                    metrics::record_task_error("loader", e.kind());
                }
            }
        }

        info!(
            chain_id = self.ctx.chain_id,
            blocks = total.blocks,
            records = total.records,
            "transfer loader stopped"
        );
        total
    }

    /// Loads one batch.
    ///
    /// # Errors
    ///
    /// Only cancellation and notification bookkeeping fail the batch; per-account
    /// failures are listed in [`LoadReport::failed`] and their blocks stay unresolved.
    pub async fn process_batch(
        &self,
        guard: &CallGuard,
        blocks: Vec<DiscoveredBlock>,
    ) -> Result<LoadReport, IndexerError> {
        let mut report = LoadReport { blocks: blocks.len(), ..LoadReport::default() };
        let groups = group_by_account(blocks);
        let fan_out = self.ctx.config.loader_fan_out.max(1);

        let results: Vec<(Address, Result<AccountLoad, IndexerError>)> = stream::iter(groups)
            .map(|(account, blocks)| async move {
                let result = self.load_account(guard, account, &blocks).await;
                (account, result)
            })
            .buffer_unordered(fan_out)
            .collect()
            .await;

        let mut touched = Vec::with_capacity(results.len());
        for (account, result) in results {
            match result {
                Ok(load) => {
                    report.records += load.records;
                    report.new_records += load.new_records;
                    report.loaded_blocks += load.loaded_blocks;
                    report.pending_blocks += load.pending_blocks;
                    if load.new_records > 0 {
                        report.notified.push(account);
                    }
                    touched.push(account);
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(chain_id = self.ctx.chain_id, %account, error = %e, "loading transfers failed");
                    metrics::record_task_error("loader", e.kind());
                    report.failed.push(account);
                }
            }
        }

        if !report.notified.is_empty() {
            report.notified.sort();
            self.ctx.events.emit(IndexerEvent::NewTransfersAvailable {
                chain_id: self.ctx.chain_id,
                accounts: report.notified.clone(),
            });
            metrics::record_transfers_saved(self.ctx.chain_id, report.new_records);
        }

        for account in touched {
            if let Err(e) = self.readiness.check(account).await {
                warn!(chain_id = self.ctx.chain_id, %account, error = %e, "readiness check failed");
            }
        }

        debug!(
            chain_id = self.ctx.chain_id,
            blocks = report.blocks,
            new_records = report.new_records,
            pending_blocks = report.pending_blocks,
            "batch loaded"
        );
        Ok(report)
    }

    async fn load_account(
        &self,
        guard: &CallGuard,
        account: Address,
        blocks: &[DiscoveredBlock],
    ) -> Result<AccountLoad, IndexerError> {
        let mut load = AccountLoad::default();

        for block in blocks {
            let records = self.resolve_block(guard, block).await?;
            let mut terminal = true;
            for record in &records {
                terminal &= record.status.is_terminal();
                if self.ctx.history.save_transfer(record).await?.is_new_data() {
                    load.new_records += 1;
                }
            }
            load.records += records.len();

            if terminal {
                self.ctx.history.mark_block_loaded(self.ctx.chain_id, account, block.hash).await?;
                load.loaded_blocks += 1;
            } else {
                load.pending_blocks += 1;
            }
        }

        Ok(load)
    }

    async fn resolve_block(
        &self,
        guard: &CallGuard,
        block: &DiscoveredBlock,
    ) -> Result<Vec<TransferRecord>, IndexerError> {
        let client = self.ctx.client.as_ref();
        let header = guard.call(client.header_by_number(Some(block.number))).await?;
        if header.hash != block.hash {
            warn!(
                chain_id = self.ctx.chain_id,
                number = block.number,
                discovered = %block.hash,
                canonical = %header.hash,
                "block hash changed since discovery"
            );
        }
        let timestamp = i64::try_from(header.timestamp)
            .ok()
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .ok_or_else(|| {
                IndexerError::Malformed(format!("block {} timestamp {}", block.number, header.timestamp))
            })?;

        let base = RecordBase { block, timestamp };
        let mut records = Vec::new();

        for r in &block.refs {
            match r {
                TransferRef::NativeActivity => {
                    let transactions = guard.call(client.block_transactions(block.number)).await?;
                    for tx in transactions {
                        if tx.from != block.account && tx.to != Some(block.account) {
                            continue;
                        }
                        let status = self.status_of(guard, tx.hash).await?;
                        records.push(base.record(
                            tx.hash,
                            None,
                            tx.from,
                            tx.to,
                            Asset::Native,
                            tx.value,
                            status,
                        ));
                    }
                }
                TransferRef::TokenLog { tx_hash, log_index, asset, from, to, amount } => {
                    let status = self.status_of(guard, *tx_hash).await?;
                    records.push(base.record(
                        *tx_hash,
                        Some(*log_index),
                        *from,
                        Some(*to),
                        *asset,
                        *amount,
                        status,
                    ));
                }
            }
        }

        Ok(records)
    }

    async fn status_of(&self, guard: &CallGuard, tx: Hash32) -> Result<TransferStatus, IndexerError> {
        let receipt = guard.call(self.ctx.client.transaction_receipt(tx)).await?;
        Ok(match receipt {
            None => TransferStatus::Pending,
            Some(r) if r.success == Some(false) => TransferStatus::Failed,
            Some(_) => TransferStatus::Success,
        })
    }
}

struct RecordBase<'a> {
    block: &'a DiscoveredBlock,
    timestamp: DateTime<Utc>,
}

impl RecordBase<'_> {
    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        tx_hash: Hash32,
        log_index: Option<u32>,
        from: Address,
        to: Option<Address>,
        asset: Asset,
        amount: Word,
        status: TransferStatus,
    ) -> TransferRecord {
        let account = self.block.account;
        let (direction, counterpart) = if from == account && to == Some(account) {
            (Direction::SelfTransfer, Some(account))
        } else if to == Some(account) {
            (Direction::Incoming, Some(from))
        } else {
            (Direction::Outgoing, to)
        };

        TransferRecord {
            chain_id: self.block.chain_id,
            tx_hash,
            log_index,
            account,
            counterpart,
            direction,
            asset,
            amount,
            status,
            block_number: self.block.number,
            block_hash: self.block.hash,
            timestamp: self.timestamp,
        }
    }
}

/// Splits a batch into per-account groups, keeping first-seen account order
/// and block order within each account.
fn group_by_account(blocks: Vec<DiscoveredBlock>) -> Vec<(Address, Vec<DiscoveredBlock>)> {
    let mut groups: Vec<(Address, Vec<DiscoveredBlock>)> = Vec::new();
    for block in blocks {
        match groups.iter_mut().find(|(account, _)| *account == block.account) {
            Some((_, group)) => group.push(block),
            None => groups.push((block.account, vec![block])),
        }
    }
    groups
}
