use std::{future::Future, time::Duration};
use tokio_util::sync::CancellationToken;

use super::RpcError;
use crate::{errors::IndexerError, metrics};

/// Applies cancellation and a per-call timeout to chain RPCs.
///
/// Every RPC issued by the scanners and tasks goes through [`CallGuard::call`], so
/// a cancelled chain group abandons in-flight requests at once and a hung node
/// turns into a transient [`RpcError::Timeout`] instead of a stalled task.
#[derive(Clone, Debug)]
pub struct CallGuard {
    cancel: CancellationToken,
    timeout: Duration,
}

impl CallGuard {
    #[must_use]
    pub fn new(cancel: CancellationToken, timeout: Duration) -> Self {
        Self { cancel, timeout }
    }

    /// Same cancellation token, different timeout (e.g. the short head fetch).
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self { cancel: self.cancel.clone(), timeout }
    }

    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns `Err(Cancelled)` if cancellation was requested.
    pub fn checkpoint(&self) -> Result<(), IndexerError> {
        if self.cancel.is_cancelled() {
            Err(IndexerError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub async fn call<T, F>(&self, fut: F) -> Result<T, IndexerError>
    where
        F: Future<Output = Result<T, RpcError>>,
    {
        self.checkpoint()?;
        let result = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(IndexerError::Cancelled),
            res = tokio::time::timeout(self.timeout, fut) => res,
        };

        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                metrics::record_rpc_error(e.metric_label());
                Err(IndexerError::Rpc(e))
            }
            Err(_) => {
                metrics::record_rpc_error(RpcError::Timeout.metric_label());
                Err(IndexerError::Rpc(RpcError::Timeout))
            }
        }
    }

    /// Sleeps for `delay` unless cancelled first.
    pub async fn sleep(&self, delay: Duration) -> Result<(), IndexerError> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(IndexerError::Cancelled),
            () = tokio::time::sleep(delay) => Ok(()),
        }
    }
}
