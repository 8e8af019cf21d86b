//! Indexer-level error taxonomy.
//!
//! Every long-running task classifies its failures into one of four buckets:
//!
//! | Bucket | Variants | Handling |
//! |--------|----------|----------|
//! | transient | [`Rpc`](IndexerError::Rpc) (transient), [`Store`](IndexerError::Store) | retried with backoff, bounded |
//! | malformed | [`Malformed`](IndexerError::Malformed), malformed [`Rpc`](IndexerError::Rpc) | chunk skipped and logged |
//! | configuration | [`Config`](IndexerError::Config) | fail fast at task start |
//! | cancellation | [`Cancelled`](IndexerError::Cancelled) | not a failure |

use crate::{rpc::RpcError, store::StoreError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("rpc failure: {0}")]
    Rpc(#[from] RpcError),

    #[error("store failure: {0}")]
    Store(#[from] StoreError),

    #[error("malformed chain data: {0}")]
    Malformed(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl IndexerError {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Data-shape failures that will not go away by retrying the same chunk.
    #[must_use]
    pub fn is_malformed(&self) -> bool {
        match self {
            Self::Malformed(_) => true,
            Self::Rpc(e) => e.is_malformed(),
            _ => false,
        }
    }

    #[must_use]
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// A local quota denied the call; the work is paused, not failed.
    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::Rpc(RpcError::RateLimited(_)))
    }

    /// Short label for logs and the `indexer_errors_total` metric.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Config(_) => "config",
            _ if self.is_malformed() => "malformed",
            Self::Rpc(_) | Self::Store(_) | Self::Malformed(_) => "transient",
        }
    }
}
