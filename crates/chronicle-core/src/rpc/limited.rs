use async_trait::async_trait;
use std::sync::Arc;

use super::{
    client::{
        BalanceFingerprints, BlockHeader, ChainClient, LogEntry, LogFilter, TransactionInfo,
        TransactionReceipt,
    },
    RpcError,
};
use crate::{
    rate_limit::RateLimiter,
    types::{Address, Hash32, Word},
};

/// [`ChainClient`] decorator that charges every call against rate limiter tags.
///
/// Historical scans for an account run through a client tagged with both the
/// account tag and the chain group tag, so one runaway backfill cannot exhaust
/// the node budget of the whole wallet. Denials surface as the transient
/// [`RpcError::RateLimited`].
pub struct LimitedChainClient {
    inner: Arc<dyn ChainClient>,
    limiter: RateLimiter,
    tags: Vec<String>,
}

impl LimitedChainClient {
    #[must_use]
    pub fn new(inner: Arc<dyn ChainClient>, limiter: RateLimiter, tags: Vec<String>) -> Self {
        Self { inner, limiter, tags }
    }

    fn charge(&self) -> Result<(), RpcError> {
        for tag in &self.tags {
            if !self.limiter.allow(tag) {
                return Err(RpcError::RateLimited(tag.clone()));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ChainClient for LimitedChainClient {
    fn chain_id(&self) -> u64 {
        self.inner.chain_id()
    }

    async fn header_by_number(&self, number: Option<u64>) -> Result<BlockHeader, RpcError> {
        self.charge()?;
        self.inner.header_by_number(number).await
    }

    async fn balance_at(&self, account: Address, block: u64) -> Result<Word, RpcError> {
        self.charge()?;
        self.inner.balance_at(account, block).await
    }

    async fn nonce_at(&self, account: Address, block: u64) -> Result<u64, RpcError> {
        self.charge()?;
        self.inner.nonce_at(account, block).await
    }

    async fn token_balance_at(
        &self,
        account: Address,
        token: Address,
        block: u64,
    ) -> Result<Word, RpcError> {
        self.charge()?;
        self.inner.token_balance_at(account, token, block).await
    }

    async fn filter_logs(&self, filter: &LogFilter) -> Result<Vec<LogEntry>, RpcError> {
        self.charge()?;
        self.inner.filter_logs(filter).await
    }

    async fn balance_fingerprints(
        &self,
        accounts: &[Address],
        tokens: &[Address],
    ) -> Result<BalanceFingerprints, RpcError> {
        self.charge()?;
        self.inner.balance_fingerprints(accounts, tokens).await
    }

    async fn block_transactions(&self, number: u64) -> Result<Vec<TransactionInfo>, RpcError> {
        self.charge()?;
        self.inner.block_transactions(number).await
    }

    async fn transaction_receipt(
        &self,
        hash: Hash32,
    ) -> Result<Option<TransactionReceipt>, RpcError> {
        self.charge()?;
        self.inner.transaction_receipt(hash).await
    }
}
