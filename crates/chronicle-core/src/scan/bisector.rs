use std::collections::HashMap;
use tracing::trace;

use crate::{
    errors::IndexerError,
    rpc::{CallGuard, ChainClient},
    types::{Address, Word},
};

/// Localizes token balance changes to ranges small enough for a log query.
///
/// Ranges are closed and halves share their midpoint (`[from, mid]` and
/// `[mid, to]`), so a step between two adjacent blocks is always inside one
/// emitted range. Balances are memoized per block for one invocation.
pub struct TokenBisector<'a> {
    client: &'a dyn ChainClient,
    guard: &'a CallGuard,
    batch_size: u64,
}

impl<'a> TokenBisector<'a> {
    #[must_use]
    pub fn new(client: &'a dyn ChainClient, guard: &'a CallGuard, batch_size: u64) -> Self {
        Self { client, guard, batch_size: batch_size.max(1) }
    }

    /// Ranges within `[from, to]` where `account`'s `token` balance differs at the
    /// two ends, each spanning at most `batch_size` blocks, in ascending order.
    pub async fn find_changed_ranges(
        &self,
        account: Address,
        token: Address,
        from: u64,
        to: u64,
    ) -> Result<Vec<(u64, u64)>, IndexerError> {
        let mut memo: HashMap<u64, Word> = HashMap::new();
        let mut found = Vec::new();
        let mut pending = vec![(from, to)];

        while let Some((lo, hi)) = pending.pop() {
            if lo >= hi {
                continue;
            }
            let balance_lo = self.balance(&mut memo, account, token, lo).await?;
            let balance_hi = self.balance(&mut memo, account, token, hi).await?;
            if balance_lo == balance_hi {
                continue;
            }
            if hi - lo <= self.batch_size {
                found.push((lo, hi));
                continue;
            }
            let mid = lo + (hi - lo) / 2;
            pending.push((mid, hi));
            pending.push((lo, mid));
        }

        trace!(%account, %token, from, to, ranges = found.len(), queries = memo.len(), "token balance bisected");
        found.sort_unstable();
        Ok(found)
    }

    async fn balance(
        &self,
        memo: &mut HashMap<u64, Word>,
        account: Address,
        token: Address,
        block: u64,
    ) -> Result<Word, IndexerError> {
        if let Some(balance) = memo.get(&block) {
            return Ok(*balance);
        }
        let balance =
            self.guard.call(self.client.token_balance_at(account, token, block)).await?;
        memo.insert(block, balance);
        Ok(balance)
    }
}
