use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::StoreError;
use crate::types::{Address, Hash32, Word};

/// Which side of an account's history a [`BlockRange`] tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RangeKind {
    Native,
    Token,
}

impl RangeKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Token => "token",
        }
    }
}

impl fmt::Display for RangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted scan cursor for one (chain, account, kind).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockRange {
    /// Block at or below which the account has no history. Set once.
    pub start: Option<u64>,
    /// Lowest block already backfilled.
    pub first_known: Option<u64>,
    /// Highest block already scanned.
    pub last_known: Option<u64>,
    /// Balance fingerprint observed at `last_known`.
    pub balance_fingerprint: Option<Hash32>,
}

impl BlockRange {
    /// `true` once nothing is left between `first_known` and the start of history.
    #[must_use]
    pub fn is_fully_backfilled(&self) -> bool {
        match self.first_known {
            Some(0) => true,
            Some(first) => self.start.is_some_and(|start| start >= first),
            None => false,
        }
    }

    /// Folds an update into this range without ever regressing a boundary.
    ///
    /// `start` keeps its first value, `first_known` takes the minimum,
    /// `last_known` the maximum, and a provided fingerprint replaces the old one.
    #[must_use]
    pub fn merged(&self, update: &BlockRangeUpdate) -> Self {
        fn pick(a: Option<u64>, b: Option<u64>, f: fn(u64, u64) -> u64) -> Option<u64> {
            match (a, b) {
                (Some(x), Some(y)) => Some(f(x, y)),
                (x, y) => x.or(y),
            }
        }

        Self {
            start: self.start.or(update.start),
            first_known: pick(self.first_known, update.first_known, u64::min),
            last_known: pick(self.last_known, update.last_known, u64::max),
            balance_fingerprint: update.balance_fingerprint.or(self.balance_fingerprint),
        }
    }
}

/// A requested change to a [`BlockRange`], applied with [`BlockRange::merged`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockRangeUpdate {
    pub start: Option<u64>,
    pub first_known: Option<u64>,
    pub last_known: Option<u64>,
    pub balance_fingerprint: Option<Hash32>,
}

impl BlockRangeUpdate {
    /// `[from, to]` has been fully scanned.
    #[must_use]
    pub fn scanned(from: u64, to: u64) -> Self {
        Self { first_known: Some(from), last_known: Some(to), ..Self::default() }
    }

    /// Everything up to `to` has been scanned; the lower bound is untouched.
    #[must_use]
    pub fn up_to(to: u64) -> Self {
        Self { last_known: Some(to), ..Self::default() }
    }

    #[must_use]
    pub fn with_start(mut self, start: u64) -> Self {
        self.start = Some(start);
        self
    }

    #[must_use]
    pub fn with_fingerprint(mut self, fingerprint: Hash32) -> Self {
        self.balance_fingerprint = Some(fingerprint);
        self
    }

    /// Rejects updates that could break `first_known <= last_known` after merging.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidRange`] if `first_known` is set without
    /// `last_known` or exceeds it.
    pub fn validate(&self) -> Result<(), StoreError> {
        match (self.first_known, self.last_known) {
            (Some(first), Some(last)) if first > last => Err(StoreError::InvalidRange(format!(
                "first_known {first} above last_known {last}"
            ))),
            (Some(first), None) => Err(StoreError::InvalidRange(format!(
                "first_known {first} without last_known"
            ))),
            _ => Ok(()),
        }
    }
}

/// Token standard and identity of a transferred asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Asset {
    Native,
    Erc20 { contract: Address },
    Erc721 { contract: Address, token_id: Word },
}

/// A transfer known to touch a block, not yet resolved to a full record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransferRef {
    /// Native balance or nonce changed in this block; the body must be inspected.
    NativeActivity,
    /// A token `Transfer` event addressed to or from the account.
    TokenLog {
        tx_hash: Hash32,
        log_index: u32,
        asset: Asset,
        from: Address,
        to: Address,
        amount: Word,
    },
}

/// A block in which an account had activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredBlock {
    pub chain_id: u64,
    pub account: Address,
    pub number: u64,
    pub hash: Hash32,
    pub refs: Vec<TransferRef>,
}

impl DiscoveredBlock {
    /// Adds references from another discovery of the same block, skipping duplicates.
    /// Returns `true` if anything was added.
    pub fn absorb(&mut self, refs: impl IntoIterator<Item = TransferRef>) -> bool {
        let mut changed = false;
        for r in refs {
            if !self.refs.contains(&r) {
                self.refs.push(r);
                changed = true;
            }
        }
        changed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Success,
    Failed,
}

impl TransferStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
    /// Sender and recipient are the same tracked account.
    SelfTransfer,
}

/// Identity of a stored transfer.
///
/// A transaction is identified by `(chain_id, tx_hash)`; one transaction can yield
/// several records, one per tracked account it touches and per token log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferKey {
    pub chain_id: u64,
    pub tx_hash: Hash32,
    pub account: Address,
    pub log_index: Option<u32>,
}

/// Consumed units of one rate limiter tag, kept across restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaUsage {
    pub tag: String,
    pub used: u64,
    /// Wall-clock start of the current window.
    pub window_start: DateTime<Utc>,
}

/// A fully resolved transfer as shown in an account's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRecord {
    pub chain_id: u64,
    pub tx_hash: Hash32,
    /// `None` for native value transfers.
    pub log_index: Option<u32>,
    pub account: Address,
    pub counterpart: Option<Address>,
    pub direction: Direction,
    pub asset: Asset,
    pub amount: Word,
    pub status: TransferStatus,
    pub block_number: u64,
    pub block_hash: Hash32,
    pub timestamp: DateTime<Utc>,
}

impl TransferRecord {
    #[must_use]
    pub fn key(&self) -> TransferKey {
        TransferKey {
            chain_id: self.chain_id,
            tx_hash: self.tx_hash,
            account: self.account,
            log_index: self.log_index,
        }
    }
}

/// Result of an idempotent transfer upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Inserted,
    Updated,
    /// Identical row already present, or the stored row is terminal.
    Unchanged,
}

impl SaveOutcome {
    #[must_use]
    pub fn is_new_data(&self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_fully_backfilled() {
        assert!(!BlockRange::default().is_fully_backfilled());
        assert!(BlockRange { first_known: Some(0), ..Default::default() }.is_fully_backfilled());
        assert!(BlockRange { start: Some(150), first_known: Some(150), ..Default::default() }
            .is_fully_backfilled());
        assert!(BlockRange { start: Some(200), first_known: Some(150), ..Default::default() }
            .is_fully_backfilled());
        assert!(!BlockRange { start: Some(100), first_known: Some(150), ..Default::default() }
            .is_fully_backfilled());
    }

    #[test]
    fn test_merge_never_regresses() {
        let existing = BlockRange {
            start: Some(10),
            first_known: Some(100),
            last_known: Some(500),
            balance_fingerprint: Some(Hash32([1; 32])),
        };

        let merged = existing.merged(&BlockRangeUpdate::scanned(200, 400).with_start(50));
        assert_eq!(merged.start, Some(10), "start is immutable once set");
        assert_eq!(merged.first_known, Some(100));
        assert_eq!(merged.last_known, Some(500));
        assert_eq!(merged.balance_fingerprint, Some(Hash32([1; 32])));

        let merged = existing.merged(&BlockRangeUpdate::up_to(900).with_fingerprint(Hash32([2; 32])));
        assert_eq!(merged.last_known, Some(900));
        assert_eq!(merged.balance_fingerprint, Some(Hash32([2; 32])));
    }

    #[test]
    fn test_update_validation() {
        assert!(BlockRangeUpdate::scanned(5, 5).validate().is_ok());
        assert!(BlockRangeUpdate::scanned(6, 5).validate().is_err());
        let lone_first = BlockRangeUpdate { first_known: Some(1), ..Default::default() };
        assert!(lone_first.validate().is_err());
        assert!(BlockRangeUpdate::up_to(3).validate().is_ok());
    }

    #[test]
    fn test_absorb_dedups_refs() {
        let mut block = DiscoveredBlock {
            chain_id: 1,
            account: Address([1; 20]),
            number: 7,
            hash: Hash32([7; 32]),
            refs: vec![TransferRef::NativeActivity],
        };
        assert!(!block.absorb([TransferRef::NativeActivity]));
        assert_eq!(block.refs.len(), 1);
    }

    fn update_strategy() -> impl Strategy<Value = BlockRangeUpdate> {
        prop_oneof![
            (0u64..10_000, 0u64..10_000).prop_map(|(a, b)| BlockRangeUpdate::scanned(a.min(b), a.max(b))),
            (0u64..10_000).prop_map(BlockRangeUpdate::up_to),
            (0u64..10_000, 0u64..10_000)
                .prop_map(|(a, b)| BlockRangeUpdate::scanned(a.min(b), a.max(b)).with_start(a.min(b))),
        ]
    }

    proptest! {
        #[test]
        fn merged_bounds_stay_ordered(updates in proptest::collection::vec(update_strategy(), 1..40)) {
            let mut range = BlockRange::default();
            for update in &updates {
                prop_assert!(update.validate().is_ok());
                let next = range.merged(update);
                if let (Some(old), Some(new)) = (range.first_known, next.first_known) {
                    prop_assert!(new <= old, "first_known moved up: {} -> {}", old, new);
                }
                if let (Some(old), Some(new)) = (range.last_known, next.last_known) {
                    prop_assert!(new >= old, "last_known moved down: {} -> {}", old, new);
                }
                range = next;
                if let (Some(first), Some(last)) = (range.first_known, range.last_known) {
                    prop_assert!(first <= last, "first {} > last {}", first, last);
                }
            }
        }
    }
}
