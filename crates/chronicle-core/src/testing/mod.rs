//! In-memory chain for tests.
//!
//! [`SimulatedChain`] implements [`ChainClient`] over a ledger of native and
//! token transfers, answering historical state queries exactly like an archive
//! node would. It counts calls per method and can inject failures, latency and
//! `eth_getLogs` size limits.

use async_trait::async_trait;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::{
    collections::{BTreeMap, HashMap},
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};

use crate::{
    rpc::{
        fingerprint_balances, BalanceFingerprints, BlockHeader, ChainClient, LogEntry, LogFilter,
        RpcError, TransactionInfo, TransactionReceipt,
    },
    scan::TRANSFER_EVENT_TOPIC,
    types::{Address, Hash32, Word},
};

/// Base timestamp of block 0; blocks are 12 seconds apart.
pub const GENESIS_TIMESTAMP: u64 = 1_600_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimMethod {
    HeaderByNumber,
    BalanceAt,
    NonceAt,
    TokenBalanceAt,
    FilterLogs,
    BalanceFingerprints,
    BlockTransactions,
    TransactionReceipt,
}

/// Snapshot of per-method call counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub header_by_number: u64,
    pub balance_at: u64,
    pub nonce_at: u64,
    pub token_balance_at: u64,
    pub filter_logs: u64,
    pub balance_fingerprints: u64,
    pub block_transactions: u64,
    pub transaction_receipt: u64,
}

impl CallCounts {
    #[must_use]
    pub fn total(&self) -> u64 {
        self.header_by_number +
            self.balance_at +
            self.nonce_at +
            self.token_balance_at +
            self.filter_logs +
            self.balance_fingerprints +
            self.block_transactions +
            self.transaction_receipt
    }
}

#[derive(Default)]
struct Counters {
    header_by_number: AtomicU64,
    balance_at: AtomicU64,
    nonce_at: AtomicU64,
    token_balance_at: AtomicU64,
    filter_logs: AtomicU64,
    balance_fingerprints: AtomicU64,
    block_transactions: AtomicU64,
    transaction_receipt: AtomicU64,
}

impl Counters {
    fn get(&self, method: SimMethod) -> &AtomicU64 {
        match method {
            SimMethod::HeaderByNumber => &self.header_by_number,
            SimMethod::BalanceAt => &self.balance_at,
            SimMethod::NonceAt => &self.nonce_at,
            SimMethod::TokenBalanceAt => &self.token_balance_at,
            SimMethod::FilterLogs => &self.filter_logs,
            SimMethod::BalanceFingerprints => &self.balance_fingerprints,
            SimMethod::BlockTransactions => &self.block_transactions,
            SimMethod::TransactionReceipt => &self.transaction_receipt,
        }
    }

    fn snapshot(&self) -> CallCounts {
        let load = |c: &AtomicU64| c.load(Ordering::SeqCst);
        CallCounts {
            header_by_number: load(&self.header_by_number),
            balance_at: load(&self.balance_at),
            nonce_at: load(&self.nonce_at),
            token_balance_at: load(&self.token_balance_at),
            filter_logs: load(&self.filter_logs),
            balance_fingerprints: load(&self.balance_fingerprints),
            block_transactions: load(&self.block_transactions),
            transaction_receipt: load(&self.transaction_receipt),
        }
    }
}

/// Post-block state of one account: `(block, balance, nonce)` checkpoints.
type NativeHistory = Vec<(u64, u128, u64)>;

#[derive(Default)]
struct Ledger {
    native: HashMap<Address, NativeHistory>,
    tokens: HashMap<(Address, Address), Vec<(u64, u128)>>,
    transactions: BTreeMap<u64, Vec<TransactionInfo>>,
    logs: Vec<LogEntry>,
    receipts: HashMap<Hash32, TransactionReceipt>,
    pending_receipts: Vec<Hash32>,
    tx_counter: u64,
}

impl Ledger {
    fn native_at(&self, account: &Address, block: u64) -> (u128, u64) {
        self.native
            .get(account)
            .and_then(|h| h.iter().rev().find(|(b, _, _)| *b <= block))
            .map_or((0, 0), |(_, balance, nonce)| (*balance, *nonce))
    }

    fn token_at(&self, account: &Address, token: &Address, block: u64) -> u128 {
        self.tokens
            .get(&(*account, *token))
            .and_then(|h| h.iter().rev().find(|(b, _)| *b <= block))
            .map_or(0, |(_, balance)| *balance)
    }

    fn set_native(&mut self, account: Address, block: u64, balance: u128, nonce: u64) {
        let history = self.native.entry(account).or_default();
        history.retain(|(b, _, _)| *b != block);
        history.push((block, balance, nonce));
        history.sort_by_key(|(b, _, _)| *b);
    }

    fn set_token(&mut self, account: Address, token: Address, block: u64, balance: u128) {
        let history = self.tokens.entry((account, token)).or_default();
        history.retain(|(b, _)| *b != block);
        history.push((block, balance));
        history.sort_by_key(|(b, _)| *b);
    }

    fn next_tx_hash(&mut self, block: u64) -> Hash32 {
        self.tx_counter += 1;
        let mut hasher = Sha256::new();
        hasher.update(b"tx");
        hasher.update(block.to_be_bytes());
        hasher.update(self.tx_counter.to_be_bytes());
        Hash32(hasher.finalize().into())
    }
}

/// Deterministic archive-node stand-in.
///
/// Ledger mutations are expected in ascending block order per account; each
/// change applies from its block onward.
pub struct SimulatedChain {
    chain_id: u64,
    head: AtomicU64,
    ledger: RwLock<Ledger>,
    counters: Counters,
    failures: RwLock<HashMap<SimMethod, usize>>,
    max_log_range: RwLock<Option<u64>>,
    latency: RwLock<Option<Duration>>,
    in_flight: AtomicUsize,
}

impl SimulatedChain {
    #[must_use]
    pub fn new(chain_id: u64, head: u64) -> Self {
        Self {
            chain_id,
            head: AtomicU64::new(head),
            ledger: RwLock::new(Ledger::default()),
            counters: Counters::default(),
            failures: RwLock::new(HashMap::new()),
            max_log_range: RwLock::new(None),
            latency: RwLock::new(None),
            in_flight: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn head(&self) -> u64 {
        self.head.load(Ordering::SeqCst)
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    #[must_use]
    pub fn calls(&self) -> CallCounts {
        self.counters.snapshot()
    }

    /// Calls currently awaiting their injected latency.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Makes the next `count` calls of `method` fail with a transient error.
    pub fn fail_next(&self, method: SimMethod, count: usize) {
        self.failures.write().insert(method, count);
    }

    /// Rejects `eth_getLogs` spans wider than `max` blocks as too large.
    pub fn set_max_log_range(&self, max: Option<u64>) {
        *self.max_log_range.write() = max;
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write() = latency;
    }

    /// Deterministic hash of block `number`.
    #[must_use]
    pub fn block_hash(&self, number: u64) -> Hash32 {
        let mut hasher = Sha256::new();
        hasher.update(self.chain_id.to_be_bytes());
        hasher.update(number.to_be_bytes());
        Hash32(hasher.finalize().into())
    }

    /// Native value transfer mined in `block`. Returns the transaction hash.
    pub fn send_native(&self, block: u64, from: Address, to: Address, value: u128) -> Hash32 {
        let mut ledger = self.ledger.write();
        let hash = ledger.next_tx_hash(block);

        let (from_balance, from_nonce) = ledger.native_at(&from, block);
        ledger.set_native(from, block, from_balance.saturating_sub(value), from_nonce + 1);
        let (to_balance, to_nonce) = ledger.native_at(&to, block);
        ledger.set_native(to, block, to_balance + value, to_nonce);

        ledger.transactions.entry(block).or_default().push(TransactionInfo {
            hash,
            from,
            to: Some(to),
            value: Word::from_u128(value),
        });
        ledger.receipts.insert(
            hash,
            TransactionReceipt { transaction_hash: hash, block_number: block, success: Some(true) },
        );
        hash
    }

    /// Balance credited without a transaction in the block body (rewards, withdrawals).
    pub fn credit_native(&self, block: u64, to: Address, value: u128) {
        let mut ledger = self.ledger.write();
        let (balance, nonce) = ledger.native_at(&to, block);
        ledger.set_native(to, block, balance + value, nonce);
    }

    /// Bumps the nonce without touching the balance or the block body, e.g. a
    /// transaction whose fee was paid by a sponsor.
    pub fn bump_nonce(&self, block: u64, account: Address) {
        let mut ledger = self.ledger.write();
        let (balance, nonce) = ledger.native_at(&account, block);
        ledger.set_native(account, block, balance, nonce + 1);
    }

    /// ERC-20 `Transfer` of `amount` emitted by `token` in `block`.
    pub fn transfer_token(
        &self,
        block: u64,
        token: Address,
        from: Address,
        to: Address,
        amount: u128,
    ) -> Hash32 {
        let mut ledger = self.ledger.write();
        let from_balance = ledger.token_at(&from, &token, block);
        ledger.set_token(from, token, block, from_balance.saturating_sub(amount));
        let to_balance = ledger.token_at(&to, &token, block);
        ledger.set_token(to, token, block, to_balance + amount);

        let topics = vec![TRANSFER_EVENT_TOPIC, from.to_topic(), to.to_topic()];
        let data = Word::from_u128(amount).0.to_vec();
        self.push_log(&mut ledger, block, token, topics, data)
    }

    /// ERC-721 `Transfer` of `token_id` emitted by `token` in `block`.
    pub fn transfer_nft(
        &self,
        block: u64,
        token: Address,
        from: Address,
        to: Address,
        token_id: u128,
    ) -> Hash32 {
        let mut ledger = self.ledger.write();
        let topics = vec![
            TRANSFER_EVENT_TOPIC,
            from.to_topic(),
            to.to_topic(),
            Hash32(Word::from_u128(token_id).0),
        ];
        self.push_log(&mut ledger, block, token, topics, Vec::new())
    }

    /// Appends a raw log, e.g. a malformed one.
    pub fn push_raw_log(&self, block: u64, address: Address, topics: Vec<Hash32>, data: Vec<u8>) {
        let mut ledger = self.ledger.write();
        self.push_log(&mut ledger, block, address, topics, data);
    }

    /// Makes the receipt of `tx` unavailable, as if it were still pending.
    pub fn hide_receipt(&self, tx: Hash32) {
        self.ledger.write().pending_receipts.push(tx);
    }

    /// Marks a mined transaction as reverted.
    pub fn revert_transaction(&self, tx: Hash32) {
        if let Some(receipt) = self.ledger.write().receipts.get_mut(&tx) {
            receipt.success = Some(false);
        }
    }

    fn push_log(
        &self,
        ledger: &mut Ledger,
        block: u64,
        address: Address,
        topics: Vec<Hash32>,
        data: Vec<u8>,
    ) -> Hash32 {
        let hash = ledger.next_tx_hash(block);
        let log_index = u32::try_from(ledger.logs.iter().filter(|l| l.block_number == block).count())
            .unwrap_or(u32::MAX);
        ledger.logs.push(LogEntry {
            address,
            topics,
            data,
            block_number: block,
            block_hash: self.block_hash(block),
            transaction_hash: hash,
            log_index,
            removed: false,
        });
        ledger.receipts.insert(
            hash,
            TransactionReceipt { transaction_hash: hash, block_number: block, success: Some(true) },
        );
        hash
    }

    async fn enter(&self, method: SimMethod) -> Result<(), RpcError> {
        self.counters.get(method).fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.read();
        if let Some(delay) = latency {
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        let mut failures = self.failures.write();
        if let Some(remaining) = failures.get_mut(&method) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RpcError::ConnectionFailed(format!("injected {method:?} failure")));
            }
        }
        Ok(())
    }

    fn check_block(&self, block: u64) -> Result<(), RpcError> {
        let head = self.head();
        if block > head {
            return Err(RpcError::JsonRpc(-32000, format!("header not found: {block} > {head}")));
        }
        Ok(())
    }

    fn header(&self, number: u64) -> BlockHeader {
        BlockHeader {
            number,
            hash: self.block_hash(number),
            parent_hash: if number == 0 { Hash32::default() } else { self.block_hash(number - 1) },
            timestamp: GENESIS_TIMESTAMP + number * 12,
        }
    }
}

#[async_trait]
impl ChainClient for SimulatedChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn header_by_number(&self, number: Option<u64>) -> Result<BlockHeader, RpcError> {
        self.enter(SimMethod::HeaderByNumber).await?;
        let number = number.unwrap_or_else(|| self.head());
        self.check_block(number)?;
        Ok(self.header(number))
    }

    async fn balance_at(&self, account: Address, block: u64) -> Result<Word, RpcError> {
        self.enter(SimMethod::BalanceAt).await?;
        self.check_block(block)?;
        Ok(Word::from_u128(self.ledger.read().native_at(&account, block).0))
    }

    async fn nonce_at(&self, account: Address, block: u64) -> Result<u64, RpcError> {
        self.enter(SimMethod::NonceAt).await?;
        self.check_block(block)?;
        Ok(self.ledger.read().native_at(&account, block).1)
    }

    async fn token_balance_at(
        &self,
        account: Address,
        token: Address,
        block: u64,
    ) -> Result<Word, RpcError> {
        self.enter(SimMethod::TokenBalanceAt).await?;
        self.check_block(block)?;
        Ok(Word::from_u128(self.ledger.read().token_at(&account, &token, block)))
    }

    async fn filter_logs(&self, filter: &LogFilter) -> Result<Vec<LogEntry>, RpcError> {
        self.enter(SimMethod::FilterLogs).await?;
        let max_range = *self.max_log_range.read();
        if let Some(max) = max_range {
            if filter.to_block.saturating_sub(filter.from_block) + 1 > max {
                return Err(RpcError::JsonRpc(
                    -32005,
                    "query returned more than 10000 results".to_string(),
                ));
            }
        }
        Ok(self.ledger.read().logs.iter().filter(|log| filter.matches(log)).cloned().collect())
    }

    async fn balance_fingerprints(
        &self,
        accounts: &[Address],
        tokens: &[Address],
    ) -> Result<BalanceFingerprints, RpcError> {
        self.enter(SimMethod::BalanceFingerprints).await?;
        let head = self.head();
        let ledger = self.ledger.read();
        let per_account = accounts
            .iter()
            .map(|account| {
                let native = Word::from_u128(ledger.native_at(account, head).0);
                let token_balances: Vec<Word> = tokens
                    .iter()
                    .map(|token| Word::from_u128(ledger.token_at(account, token, head)))
                    .collect();
                (*account, fingerprint_balances(&native, &token_balances))
            })
            .collect();
        Ok(BalanceFingerprints { block_number: head, per_account })
    }

    async fn block_transactions(&self, number: u64) -> Result<Vec<TransactionInfo>, RpcError> {
        self.enter(SimMethod::BlockTransactions).await?;
        self.check_block(number)?;
        Ok(self.ledger.read().transactions.get(&number).cloned().unwrap_or_default())
    }

    async fn transaction_receipt(
        &self,
        hash: Hash32,
    ) -> Result<Option<TransactionReceipt>, RpcError> {
        self.enter(SimMethod::TransactionReceipt).await?;
        let ledger = self.ledger.read();
        if ledger.pending_receipts.contains(&hash) {
            return Ok(None);
        }
        Ok(ledger.receipts.get(&hash).copied())
    }
}
