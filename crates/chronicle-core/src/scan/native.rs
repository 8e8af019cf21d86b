use dashmap::DashMap;
use futures_util::{stream, StreamExt, TryStreamExt};
use tracing::{debug, warn};

use crate::{
    errors::IndexerError,
    rpc::{BlockHeader, CallGuard, ChainClient},
    types::{Address, Word},
};

/// Bisection depth guard; `2^30` blocks is far beyond any chunk size.
const MAX_DEPTH: usize = 30;

/// What the native probe learned about one chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NativeProbeResult {
    /// Headers of the blocks where balance or nonce changed, newest first.
    pub changed: Vec<BlockHeader>,
    /// Backward: lowest block from which everything above is resolved.
    /// Forward: highest block up to which everything is resolved.
    pub boundary: u64,
    /// Highest block at which the account had neither balance nor nonce.
    pub genesis: Option<u64>,
    /// Open sub-ranges were dropped to respect the per-level cap.
    pub truncated: bool,
}

impl NativeProbeResult {
    fn note_pristine(&mut self, block: Option<u64>) {
        if let Some(block) = block {
            self.genesis = Some(self.genesis.map_or(block, |g| g.max(block)));
        }
    }
}

enum Probe {
    Unchanged { pristine_at: Option<u64> },
    Changed { header: BlockHeader, pristine_at: Option<u64> },
    Split((u64, u64), (u64, u64)),
}

/// Finds the blocks in a chunk where an account's native balance or nonce changed.
///
/// Each level compares state at both ends of every open range and splits the
/// ranges that differ, until single-block steps remain. Lookups are memoized
/// per block for the lifetime of the probe.
pub struct NativeProbe<'a> {
    client: &'a dyn ChainClient,
    guard: &'a CallGuard,
    account: Address,
    max_ranges_per_level: usize,
    concurrency: usize,
    balances: DashMap<u64, Word>,
    nonces: DashMap<u64, u64>,
}

impl<'a> NativeProbe<'a> {
    #[must_use]
    pub fn new(
        client: &'a dyn ChainClient,
        guard: &'a CallGuard,
        account: Address,
        max_ranges_per_level: usize,
        concurrency: usize,
    ) -> Self {
        Self {
            client,
            guard,
            account,
            max_ranges_per_level: max_ranges_per_level.max(1),
            concurrency: concurrency.max(1),
            balances: DashMap::new(),
            nonces: DashMap::new(),
        }
    }

    async fn balance(&self, block: u64) -> Result<Word, IndexerError> {
        if let Some(cached) = self.balances.get(&block) {
            return Ok(*cached);
        }
        let balance = self.guard.call(self.client.balance_at(self.account, block)).await?;
        self.balances.insert(block, balance);
        Ok(balance)
    }

    async fn nonce(&self, block: u64) -> Result<u64, IndexerError> {
        if let Some(cached) = self.nonces.get(&block) {
            return Ok(*cached);
        }
        let nonce = self.guard.call(self.client.nonce_at(self.account, block)).await?;
        self.nonces.insert(block, nonce);
        Ok(nonce)
    }

    async fn probe(&self, lo: u64, hi: u64) -> Result<Probe, IndexerError> {
        if lo >= hi {
            return Ok(Probe::Unchanged { pristine_at: None });
        }
        let (balance_lo, balance_hi) = tokio::try_join!(self.balance(lo), self.balance(hi))?;

        if balance_lo == balance_hi {
            let nonce_hi = self.nonce(hi).await?;
            if nonce_hi == 0 {
                // Balance can only drop through an own transaction, so a zero
                // nonce with equal ends means nothing happened in between.
                let pristine_at = balance_hi.is_zero().then_some(hi);
                return Ok(Probe::Unchanged { pristine_at });
            }
            if self.nonce(lo).await? == nonce_hi {
                return Ok(Probe::Unchanged { pristine_at: None });
            }
        }

        if hi - lo == 1 {
            let header = self.guard.call(self.client.header_by_number(Some(hi))).await?;
            // a first-ever activity step pins the genesis exactly
            let pristine_at =
                if balance_lo.is_zero() && self.nonce(lo).await? == 0 { Some(lo) } else { None };
            return Ok(Probe::Changed { header, pristine_at });
        }
        let mid = lo + (hi - lo) / 2;
        Ok(Probe::Split((lo, mid), (mid, hi)))
    }

    /// Probes the closed chunk `[from, to]`.
    ///
    /// When a level holds more than `max_ranges_per_level` open ranges, only the
    /// ranges nearest the scan origin are kept (newest for backward scans, oldest
    /// for forward ones) and `boundary` stops at the last kept edge.
    pub async fn run(
        &self,
        from: u64,
        to: u64,
        backward: bool,
    ) -> Result<NativeProbeResult, IndexerError> {
        let mut result = NativeProbeResult {
            boundary: if backward { from } else { to },
            ..NativeProbeResult::default()
        };

        let mut level = vec![(from, to)];
        let mut depth = 0;
        while !level.is_empty() {
            if depth > MAX_DEPTH {
                warn!(account = %self.account, from, to, open = level.len(), "native probe depth exceeded");
                result.truncated = true;
                result.boundary = if backward {
                    level.iter().map(|(_, hi)| *hi).max().unwrap_or(from)
                } else {
                    level.iter().map(|(lo, _)| *lo).min().unwrap_or(to)
                };
                break;
            }

            let outcomes: Vec<Probe> = stream::iter(level.iter().copied().map(|(lo, hi)| self.probe(lo, hi)))
                .buffer_unordered(self.concurrency)
                .try_collect()
                .await?;

            let mut next = Vec::new();
            for outcome in outcomes {
                match outcome {
                    Probe::Unchanged { pristine_at } => result.note_pristine(pristine_at),
                    Probe::Changed { header, pristine_at } => {
                        result.note_pristine(pristine_at);
                        result.changed.push(header);
                    }
                    Probe::Split(low, high) => {
                        next.push(low);
                        next.push(high);
                    }
                }
            }

            if next.len() > self.max_ranges_per_level {
                if backward {
                    next.sort_unstable_by(|a, b| b.0.cmp(&a.0));
                } else {
                    next.sort_unstable_by_key(|r| r.0);
                }
                let dropped = next.split_off(self.max_ranges_per_level);
                result.truncated = true;
                let edge = if backward {
                    next.iter().map(|(lo, _)| *lo).min().unwrap_or(from)
                } else {
                    next.iter().map(|(_, hi)| *hi).max().unwrap_or(to)
                };
                result.boundary = if backward {
                    result.boundary.max(edge)
                } else {
                    result.boundary.min(edge)
                };
                debug!(
                    account = %self.account,
                    dropped = dropped.len(),
                    boundary = result.boundary,
                    "native probe level capped"
                );
            }

            level = next;
            depth += 1;
        }

        if result.truncated {
            let boundary = result.boundary;
            result.changed.retain(|h| if backward { h.number > boundary } else { h.number <= boundary });
        }
        result.changed.sort_unstable_by(|a, b| b.number.cmp(&a.number));
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SimulatedChain;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn guard() -> CallGuard {
        CallGuard::new(CancellationToken::new(), Duration::from_secs(5))
    }

    fn me() -> Address {
        Address([1; 20])
    }

    fn other() -> Address {
        Address([2; 20])
    }

    fn numbers(result: &NativeProbeResult) -> Vec<u64> {
        result.changed.iter().map(|h| h.number).collect()
    }

    #[tokio::test]
    async fn test_finds_incoming_and_outgoing_blocks() {
        let chain = SimulatedChain::new(1, 10_000);
        chain.send_native(1_500, other(), me(), 100);
        chain.send_native(7_321, me(), other(), 40);

        let guard = guard();
        let probe = NativeProbe::new(&chain, &guard, me(), 60, 4);
        let result = probe.run(0, 10_000, true).await.unwrap();

        assert_eq!(numbers(&result), vec![7_321, 1_500]);
        assert_eq!(result.genesis, Some(1_499));
        assert!(!result.truncated);
        assert_eq!(result.boundary, 0);
    }

    #[tokio::test]
    async fn test_nonce_only_change_is_found() {
        let chain = SimulatedChain::new(1, 1_000);
        chain.send_native(10, other(), me(), 100);
        // zero-value self transaction: balance constant, nonce moves
        chain.send_native(600, me(), me(), 0);

        let guard = guard();
        let result = NativeProbe::new(&chain, &guard, me(), 60, 4).run(100, 1_000, true).await.unwrap();
        assert_eq!(numbers(&result), vec![600]);
        assert_eq!(result.genesis, None);
    }

    #[tokio::test]
    async fn test_changes_without_own_transaction_are_found() {
        let chain = SimulatedChain::new(1, 1_000);
        chain.send_native(10, other(), me(), 100);
        chain.credit_native(300, me(), 50);
        chain.bump_nonce(700, me());

        let guard = guard();
        let result = NativeProbe::new(&chain, &guard, me(), 60, 4).run(100, 1_000, true).await.unwrap();
        assert_eq!(numbers(&result), vec![700, 300]);
    }

    #[tokio::test]
    async fn test_untouched_account_is_pristine() {
        let chain = SimulatedChain::new(1, 1_000);
        let guard = guard();
        let probe = NativeProbe::new(&chain, &guard, me(), 60, 4);

        let result = probe.run(0, 1_000, true).await.unwrap();
        assert!(result.changed.is_empty());
        assert_eq!(result.genesis, Some(1_000));
    }

    #[tokio::test]
    async fn test_level_cap_keeps_newest_ranges() {
        let chain = SimulatedChain::new(1, 1_024);
        for block in (8..=1_024).step_by(8) {
            chain.send_native(block, other(), me(), 1);
        }

        let guard = guard();
        let result = NativeProbe::new(&chain, &guard, me(), 8, 4).run(0, 1_024, true).await.unwrap();

        assert!(result.truncated);
        assert!(result.boundary > 0);
        assert!(!result.changed.is_empty());
        assert!(result.changed.iter().all(|h| h.number > result.boundary));
        assert_eq!(result.changed[0].number, 1_024);
    }

    #[tokio::test]
    async fn test_memoizes_lookups() {
        let chain = SimulatedChain::new(1, 1_000);
        chain.send_native(500, other(), me(), 1);

        let guard = guard();
        let probe = NativeProbe::new(&chain, &guard, me(), 60, 1);
        probe.run(0, 1_000, true).await.unwrap();
        let first = chain.calls().balance_at;
        probe.run(0, 1_000, true).await.unwrap();

        assert_eq!(chain.calls().balance_at, first, "second run served from the memo");
    }
}
