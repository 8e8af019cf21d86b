//! Block discovery.
//!
//! A scan narrows a block range down to the blocks where a tracked account had
//! activity. Two independent probes feed it:
//!
//! ```text
//!              ┌──────────────┐  balance/nonce bisection   ┌───────────────┐
//! [from, to] ─►│ NativeProbe  │───────────────────────────►│               │
//!              └──────────────┘                            │ BlockCollector│─► HistoryStore
//!              ┌──────────────┐  Transfer(from,to) logs    │  (dedup by    │   + ProgressStore
//!          ───►│ token_logs   │───────────────────────────►│   block hash) │
//!              └──────────────┘                            └───────────────┘
//! ```
//!
//! Below the native genesis the log side alone cannot be trusted to cover every
//! token, so [`TokenBisector`] localizes token balance changes first and the
//! log scan runs only over the ranges it returns.

pub mod bisector;
pub mod native;
pub mod range_scanner;
pub mod token_logs;

use std::collections::HashMap;

use crate::{
    store::{DiscoveredBlock, TransferRef},
    types::{Address, Hash32},
};

pub use bisector::TokenBisector;
pub use native::{NativeProbe, NativeProbeResult};
pub use range_scanner::{ChunkResult, RangeScanner};
pub use token_logs::{LogDirection, LogScanner, TRANSFER_EVENT_TOPIC};

/// What a scan is for; decides direction, probes and which range fields it writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// Walk backward toward genesis; writes `first_known` and `start`.
    Backfill,
    /// Walk forward from `last_known` to the head; writes `last_known`.
    Live,
    /// Log-only sweep for many accounts; writes the token `last_known`.
    TokenLogs,
    /// Incoming log resolution of ranges found by [`TokenBisector`]; writes nothing.
    TokenTail,
}

impl ScanMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backfill => "backfill",
            Self::Live => "live",
            Self::TokenLogs => "token_logs",
            Self::TokenTail => "token_tail",
        }
    }

    /// Whether the native balance/nonce probe participates.
    #[must_use]
    pub fn probes_native(&self) -> bool {
        matches!(self, Self::Backfill | Self::Live)
    }

    /// Whether chunks are visited newest first.
    #[must_use]
    pub fn is_backward(&self) -> bool {
        matches!(self, Self::Backfill)
    }
}

/// Tuning knobs shared by every scanner on a chain.
#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub chunk_size: u64,
    pub max_ranges_per_level: usize,
    pub native_probe_concurrency: usize,
    pub token_batch_size: u64,
    pub log_batch_size: u64,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            chunk_size: 10_000,
            max_ranges_per_level: 60,
            native_probe_concurrency: 10,
            token_batch_size: 100_000,
            log_batch_size: 100_000,
        }
    }
}

/// Aggregate result of a multi-chunk scan.
#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    /// Backfill: lowest block fully covered. Forward modes: highest block covered.
    pub boundary: u64,
    pub blocks: Vec<DiscoveredBlock>,
    /// Block at or below which the account has no native history.
    pub genesis: Option<u64>,
    pub chunks: usize,
}

/// Merges references for the same block from several probes, keeping first-seen order.
#[derive(Debug, Default)]
pub struct BlockCollector {
    chain_id: u64,
    blocks: Vec<DiscoveredBlock>,
    index: HashMap<(Address, Hash32), usize>,
}

impl BlockCollector {
    #[must_use]
    pub fn new(chain_id: u64) -> Self {
        Self { chain_id, blocks: Vec::new(), index: HashMap::new() }
    }

    pub fn add(&mut self, account: Address, number: u64, hash: Hash32, r: TransferRef) {
        if let Some(&idx) = self.index.get(&(account, hash)) {
            self.blocks[idx].absorb([r]);
            return;
        }
        self.index.insert((account, hash), self.blocks.len());
        self.blocks.push(DiscoveredBlock {
            chain_id: self.chain_id,
            account,
            number,
            hash,
            refs: vec![r],
        });
    }

    pub fn extend(&mut self, blocks: impl IntoIterator<Item = DiscoveredBlock>) {
        for block in blocks {
            for r in block.refs {
                self.add(block.account, block.number, block.hash, r);
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    #[must_use]
    pub fn into_blocks(self) -> Vec<DiscoveredBlock> {
        self.blocks
    }
}

/// Splits `[from, to]` into closed chunks of at most `size + 1` blocks whose edges
/// overlap by one block, ordered newest first when `backward`.
///
/// Adjacent chunks share an edge because a probe compares state at both ends: a
/// change in block `b` shows up between `b - 1` and `b`.
#[must_use]
pub fn chunk_ranges(from: u64, to: u64, size: u64, backward: bool) -> Vec<(u64, u64)> {
    let size = size.max(1);
    let mut chunks = Vec::new();
    if from > to {
        return chunks;
    }
    if backward {
        let mut hi = to;
        loop {
            let lo = hi.saturating_sub(size).max(from);
            chunks.push((lo, hi));
            if lo == from {
                break;
            }
            hi = lo;
        }
    } else {
        let mut lo = from;
        loop {
            let hi = lo.saturating_add(size).min(to);
            chunks.push((lo, hi));
            if hi == to {
                break;
            }
            lo = hi;
        }
    }
    chunks
}
