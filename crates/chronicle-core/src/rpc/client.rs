//! The chain access contract the indexer is written against.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::RpcError;
use crate::types::{Address, Hash32, Word};

/// Minimal block header needed to record a discovered block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub number: u64,
    pub hash: Hash32,
    pub parent_hash: Hash32,
    pub timestamp: u64,
}

/// `eth_getLogs` filter.
///
/// `topics[i] == None` is a wildcard; `Some(vec)` matches any of the listed values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    pub from_block: u64,
    pub to_block: u64,
    pub addresses: Vec<Address>,
    pub topics: Vec<Option<Vec<Hash32>>>,
}

impl LogFilter {
    /// Returns `true` if `log` satisfies the address and topic constraints.
    #[must_use]
    pub fn matches(&self, log: &LogEntry) -> bool {
        if log.block_number < self.from_block || log.block_number > self.to_block {
            return false;
        }
        if !self.addresses.is_empty() && !self.addresses.contains(&log.address) {
            return false;
        }
        self.topics.iter().enumerate().all(|(i, wanted)| match wanted {
            None => true,
            Some(options) => log.topics.get(i).is_some_and(|t| options.contains(t)),
        })
    }
}

/// A single event log as returned by the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub address: Address,
    pub topics: Vec<Hash32>,
    pub data: Vec<u8>,
    pub block_number: u64,
    pub block_hash: Hash32,
    pub transaction_hash: Hash32,
    pub log_index: u32,
    pub removed: bool,
}

/// A transaction as included in a block body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionInfo {
    pub hash: Hash32,
    pub from: Address,
    pub to: Option<Address>,
    pub value: Word,
}

/// The subset of a receipt the detail loader needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionReceipt {
    pub transaction_hash: Hash32,
    pub block_number: u64,
    /// `None` for pre-Byzantium receipts that only carry a state root.
    pub success: Option<bool>,
}

/// Per-account balance fingerprints computed at a single block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceFingerprints {
    /// Block the balances were read at; the live watcher uses it as the head.
    pub block_number: u64,
    pub per_account: Vec<(Address, Hash32)>,
}

impl BalanceFingerprints {
    #[must_use]
    pub fn get(&self, account: &Address) -> Option<Hash32> {
        self.per_account.iter().find(|(addr, _)| addr == account).map(|(_, hash)| *hash)
    }

    /// One hash over every account's fingerprint, in request order.
    #[must_use]
    pub fn combined(&self) -> Hash32 {
        let mut hasher = Sha256::new();
        for (account, hash) in &self.per_account {
            hasher.update(account.0);
            hasher.update(hash.0);
        }
        Hash32(hasher.finalize().into())
    }
}

/// Hashes an account's native balance followed by its token balances.
///
/// Token balances must be supplied in the same order on every call for the
/// result to be comparable across ticks.
#[must_use]
pub fn fingerprint_balances(native: &Word, tokens: &[Word]) -> Hash32 {
    let mut hasher = Sha256::new();
    hasher.update(native.0);
    for balance in tokens {
        hasher.update(balance.0);
    }
    Hash32(hasher.finalize().into())
}

/// Per-chain read access to block headers, account state and logs.
///
/// Implementations must be cheap to share (`Arc<dyn ChainClient>`); cancellation
/// and timeouts are applied by the caller through [`CallGuard`](super::CallGuard).
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn chain_id(&self) -> u64;

    /// Header at `number`, or the latest header when `None`.
    async fn header_by_number(&self, number: Option<u64>) -> Result<BlockHeader, RpcError>;

    async fn balance_at(&self, account: Address, block: u64) -> Result<Word, RpcError>;

    async fn nonce_at(&self, account: Address, block: u64) -> Result<u64, RpcError>;

    async fn token_balance_at(
        &self,
        account: Address,
        token: Address,
        block: u64,
    ) -> Result<Word, RpcError>;

    async fn filter_logs(&self, filter: &LogFilter) -> Result<Vec<LogEntry>, RpcError>;

    /// Fingerprints native plus token balances for every account in one round trip.
    async fn balance_fingerprints(
        &self,
        accounts: &[Address],
        tokens: &[Address],
    ) -> Result<BalanceFingerprints, RpcError>;

    /// Full transaction list of a block.
    async fn block_transactions(&self, number: u64) -> Result<Vec<TransactionInfo>, RpcError>;

    /// Receipt for a mined transaction, `None` while pending or unknown.
    async fn transaction_receipt(
        &self,
        hash: Hash32,
    ) -> Result<Option<TransactionReceipt>, RpcError>;
}
