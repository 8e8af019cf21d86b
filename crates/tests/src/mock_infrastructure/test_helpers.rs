//! Test Helper Functions and Utilities
//!
//! Common helpers for creating chain fixtures and polling asynchronous state.

use chronicle_core::rpc::{HttpClient, HttpClientConfig, JsonRpcChainClient};
use serde_json::{json, Value};
use std::{future::Future, sync::Arc, time::Duration};

/// keccak256("Transfer(address,address,uint256)")
pub const TRANSFER_TOPIC: &str = "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

/// Hex address whose 20 bytes are all `byte`.
#[must_use]
pub fn address_hex(byte: u8) -> String {
    format!("0x{}", format!("{byte:02x}").repeat(20))
}

/// Left-pads an address into a 32-byte log topic.
#[must_use]
pub fn address_topic(address: &str) -> String {
    format!("0x{:0>64}", address.trim_start_matches("0x"))
}

/// Creates a full transaction object as returned inside a block body.
#[must_use]
pub fn create_test_transaction(tx_hash: &str, from: &str, to: Option<&str>, value: u128) -> Value {
    json!({
        "hash": tx_hash,
        "nonce": "0x0",
        "transactionIndex": "0x0",
        "from": from,
        "to": to,
        "value": format!("0x{value:x}"),
        "gas": "0x5208",
        "gasPrice": "0x1",
        "input": "0x"
    })
}

/// Creates a test receipt with a post-Byzantium `status` field.
#[must_use]
pub fn create_test_receipt(tx_hash: &str, block_number: u64, success: bool) -> Value {
    json!({
        "transactionHash": tx_hash,
        "transactionIndex": "0x0",
        "blockHash": format!("0x{block_number:064x}"),
        "blockNumber": format!("0x{block_number:x}"),
        "cumulativeGasUsed": "0x5208",
        "gasUsed": "0x5208",
        "contractAddress": null,
        "logs": [],
        "status": if success { "0x1" } else { "0x0" },
        "effectiveGasPrice": "0x1"
    })
}

/// JSON-RPC client for `chain_id` pointed at a mock server, without HTTP retries.
///
/// # Panics
///
/// If the HTTP client cannot be constructed.
#[must_use]
pub fn create_json_rpc_client(url: String, chain_id: u64) -> JsonRpcChainClient {
    let http = HttpClient::with_config(HttpClientConfig { max_retries: 0, ..HttpClientConfig::default() })
        .expect("http client");
    JsonRpcChainClient::new(chain_id, url, Arc::new(http), Duration::from_secs(5))
}

/// Polls `check` every 10ms until it holds.
///
/// # Panics
///
/// If the condition does not hold within `timeout`.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within {timeout:?}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_topic_padding() {
        let topic = address_topic(&address_hex(0xab));
        assert_eq!(topic.len(), 66);
        assert!(topic.starts_with("0x000000000000000000000000abab"));
    }

    #[test]
    fn test_contract_creation_has_null_recipient() {
        let tx = create_test_transaction(&format!("0x{:064x}", 1), &address_hex(1), None, 0);
        assert!(tx["to"].is_null());
    }
}
