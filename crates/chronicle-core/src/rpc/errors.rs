use thiserror::Error;

/// Classification of JSON-RPC errors returned by a chain node.
///
/// The indexer cares about three outcomes: retry later (transient), give up on the
/// data (malformed), or shrink the query (result too large).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcErrorCategory {
    /// Invalid request, method not found, invalid params.
    ClientError,
    /// Internal or server error on the node side.
    ProviderError,
    /// Node-side rate limiting (-32005 without a result-size message).
    RateLimit,
    /// Node could not parse the request or produced garbage.
    ParseError,
    /// Contract call reverted (e.g. `balanceOf` on a non-token address).
    ExecutionError,
    /// `eth_getLogs` range or result set exceeded the node's limits.
    ResultTooLarge,
}

impl RpcErrorCategory {
    /// Classifies a JSON-RPC error code and message.
    ///
    /// Result-size limits are reported by different clients under different codes
    /// (-32005 on Infura, -32602 on Alchemy, -32000 on geth), so the message is
    /// checked before the code.
    #[must_use]
    pub fn from_code_and_message(code: i32, message: &str) -> Self {
        let message_lower = message.to_lowercase();
        if message_lower.contains("query returned more than") ||
            message_lower.contains("block range") ||
            message_lower.contains("response size") ||
            message_lower.contains("too many results") ||
            (message_lower.contains("limit exceeded") && message_lower.contains("log"))
        {
            return Self::ResultTooLarge;
        }

        match code {
            -32700 => Self::ParseError,
            -32602..=-32600 => Self::ClientError,
            -32005 => Self::RateLimit,
            -32099..=-32000 => {
                if message_lower.contains("execution reverted") || message_lower.contains("revert")
                {
                    Self::ExecutionError
                } else {
                    Self::ProviderError
                }
            }
            _ => Self::ProviderError,
        }
    }

    /// Returns `true` if the call may succeed when repeated later.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimit | Self::ProviderError)
    }

    /// Returns a static string representation for metrics labels.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientError => "client_error",
            Self::ProviderError => "provider_error",
            Self::RateLimit => "rate_limit",
            Self::ParseError => "parse_error",
            Self::ExecutionError => "execution_error",
            Self::ResultTooLarge => "result_too_large",
        }
    }
}

/// Errors that can occur when talking to a chain node.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RpcError {
    /// Request exceeded its timeout.
    #[error("Request timeout")]
    Timeout,

    /// Failed to reach the node.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Non-2xx HTTP status.
    #[error("HTTP error {0}: {1}")]
    HttpError(u16, String),

    /// JSON-RPC error object returned by the node.
    #[error("RPC error {0}: {1}")]
    JsonRpc(i32, String),

    /// Network-level error from the underlying HTTP client.
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Response could not be parsed or was inconsistent.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Local rate limiter denied the call for the given tag.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// HTTP concurrency limit could not be acquired.
    #[error("Concurrency limit reached: {0}")]
    ConcurrencyLimit(String),
}

impl RpcError {
    /// Returns the JSON-RPC error category if this is a node-reported error.
    #[must_use]
    pub fn rpc_category(&self) -> Option<RpcErrorCategory> {
        match self {
            Self::JsonRpc(code, message) => {
                Some(RpcErrorCategory::from_code_and_message(*code, message))
            }
            _ => None,
        }
    }

    /// Returns `true` if the call may succeed when repeated later.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout |
            Self::Network(_) |
            Self::ConnectionFailed(_) |
            Self::RateLimited(_) |
            Self::ConcurrencyLimit(_) => true,
            Self::HttpError(status, _) => (500..=599).contains(status) || *status == 429,
            Self::JsonRpc(_, _) => self.rpc_category().is_some_and(|cat| cat.is_transient()),
            Self::InvalidResponse(_) => false,
        }
    }

    /// Returns `true` if the node returned data the indexer cannot interpret.
    #[must_use]
    pub fn is_malformed(&self) -> bool {
        match self {
            Self::InvalidResponse(_) => true,
            Self::JsonRpc(_, _) => self.rpc_category() == Some(RpcErrorCategory::ParseError),
            _ => false,
        }
    }

    /// Returns `true` if a log query should be retried over a smaller range.
    #[must_use]
    pub fn is_result_too_large(&self) -> bool {
        self.rpc_category() == Some(RpcErrorCategory::ResultTooLarge)
    }

    /// Label used for the `rpc_errors_total` metric.
    #[must_use]
    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::ConnectionFailed(_) | Self::Network(_) => "network",
            Self::HttpError(_, _) => "http",
            Self::JsonRpc(_, _) => self.rpc_category().map_or("rpc", |cat| cat.as_str()),
            Self::InvalidResponse(_) => "invalid_response",
            Self::RateLimited(_) => "local_rate_limit",
            Self::ConcurrencyLimit(_) => "concurrency_limit",
        }
    }
}
