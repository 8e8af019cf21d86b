//! Chain access: the [`ChainClient`] contract, its JSON-RPC implementation, and the
//! decorators the indexer wraps around it.
//!
//! # Layers
//!
//! ```text
//! indexer task
//!     │  CallGuard::call (cancellation + timeout)
//!     ▼
//! LimitedChainClient (rate limiter tags, history scans only)
//!     ▼
//! JsonRpcChainClient ── HttpClient (semaphore, 5xx retry) ──► node
//! ```

pub mod client;
pub mod errors;
pub mod guard;
pub mod http_client;
pub mod json_rpc;
pub mod limited;

pub use client::{
    fingerprint_balances, BalanceFingerprints, BlockHeader, ChainClient, LogEntry, LogFilter,
    TransactionInfo, TransactionReceipt,
};
pub use errors::{RpcError, RpcErrorCategory};
pub use guard::CallGuard;
pub use http_client::{HttpClient, HttpClientConfig};
pub use json_rpc::JsonRpcChainClient;
pub use limited::LimitedChainClient;
