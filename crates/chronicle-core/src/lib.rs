//! # Chronicle Core
//!
//! Core library of the chronicle multi-chain transfer-history indexer.
//!
//! Every balance change, native transfer and token transfer of the tracked
//! accounts is discovered straight from each chain's RPC endpoint, persisted
//! locally and kept current as new blocks arrive.
//!
//! - **[`scan`]**: range scanning that combines native balance/nonce probing with
//!   token `Transfer` logs, plus the bisection search for token balance changes.
//!
//! - **[`tasks`]**: the long-running work of a chain: backward backfill, forward
//!   live watching with balance fingerprints, and transfer detail loading.
//!
//! - **[`indexer`]**: per-chain and multi-chain orchestration.
//!
//! - **[`store`]**: resumable scan progress and transfer history, in memory or `SQLite`.
//!
//! - **[`rpc`]**: the [`ChainClient`](rpc::ChainClient) contract and its JSON-RPC implementation.
//!
//! - **[`rate_limit`]**: tag-keyed quotas shared by every chain.
//!
//! - **[`metrics`]**: Prometheus metrics.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                        MultiChainIndexer                          │
//! │  ┌──────────────────────────────┐   ┌──────────────────────────┐  │
//! │  │ ChainIndexer (chain 1)       │   │ ChainIndexer (chain N)   │  │
//! │  │  HistoricalBackfillTask ─┐   │   │          ...             │  │
//! │  │  LiveWatchTask ──────────┤   │   └──────────────────────────┘  │
//! │  │             BlockQueue ◄─┘   │                                 │
//! │  │  TransferDetailLoader        │   shared: RateLimiter,          │
//! │  └──────────────┬───────────────┘   ProgressStore, HistoryStore   │
//! │                 ▼                                                 │
//! │             EventFeed                                             │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Feature Flags
//!
//! - `test-utils`: exposes [`testing::SimulatedChain`], an in-memory chain for tests.

pub mod chain;
pub mod config;
pub mod errors;
pub mod events;
pub mod indexer;
pub mod metrics;
pub mod rate_limit;
pub mod registry;
pub mod rpc;
pub mod runtime;
pub mod scan;
pub mod store;
pub mod tasks;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
