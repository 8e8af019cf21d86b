//! Mock Infrastructure for Testing the Chronicle Indexer
//!
//! This module provides reusable mock types for testing chain client interactions
//! without requiring a real node.
//!
//! ## Components
//!
//! - `RpcMockBuilder`: Wraps mockito to provide Ethereum-specific RPC mocking, batches included
//! - `BlockResponseBuilder` / `LogResponseBuilder`: node-shaped response fixtures
//! - Test helpers for addresses, receipts and polling
//!
//! ## Usage
//!
//! ```ignore
//! use tests::mock_infrastructure::{create_json_rpc_client, BlockResponseBuilder, RpcMockBuilder};
//!
//! let mut mock = RpcMockBuilder::new().await;
//! mock.mock_get_block_by_number(100, &BlockResponseBuilder::new(100).build());
//!
//! let client = create_json_rpc_client(mock.url(), 1);
//! ```

pub mod rpc_mock;
pub mod test_helpers;

pub use rpc_mock::{BlockResponseBuilder, LogResponseBuilder, RpcMockBuilder};
pub use test_helpers::*;
