//! Integration and End-to-End Tests for the Chronicle Indexer
//!
//! This crate contains various test modules:
//!
//! - `json_rpc_client_tests`: `JsonRpcChainClient` against a mockito-backed node, batches included
//! - `indexer_e2e_tests`: full runtimes over `SimulatedChain`: backfill, live watching,
//!   restarts, account changes, multiple chains and the `SQLite` store
//! - `runtime_tests`: builder validation and shutdown coordination
//! - `mock_infrastructure`: Reusable mock types for testing (RPC responses, fixtures, polling)
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test --package tests
//! ```
//!
//! No external node is needed; every chain is either simulated in memory or
//! mocked over HTTP.

#[cfg(test)]
mod json_rpc_client_tests;

#[cfg(test)]
mod indexer_e2e_tests;

#[cfg(test)]
mod runtime_tests;

/// Mock infrastructure for testing
pub mod mock_infrastructure;
