//! RPC Mock Builder for Ethereum JSON-RPC Testing
//!
//! Wraps mockito to answer the calls a chain client makes against an archive node.
//! Single-call mocks only match JSON objects, so they never shadow batch requests.

use mockito::{Matcher, Mock, Server, ServerGuard};
use serde_json::{json, Value};

/// Builder for creating mock Ethereum RPC responses.
///
/// Uses mockito internally but provides Ethereum-specific helpers.
pub struct RpcMockBuilder {
    server: ServerGuard,
    mocks: Vec<Mock>,
}

fn single_call(method: &str) -> Matcher {
    Matcher::Regex(format!(r#"^\{{.*"method"\s*:\s*"{method}""#))
}

fn single_call_with_params(method: &str, params_prefix: &str) -> Matcher {
    Matcher::Regex(format!(r#"^\{{.*"method"\s*:\s*"{method}"\s*,\s*"params"\s*:\s*\[{params_prefix}"#))
}

fn result_body(result: &Value) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": 1,
        "result": result
    })
    .to_string()
}

impl RpcMockBuilder {
    /// Creates a new RPC mock builder with a fresh mockito server.
    pub async fn new() -> Self {
        Self { server: Server::new_async().await, mocks: Vec::new() }
    }

    /// Returns the URL of the mock server.
    #[must_use]
    pub fn url(&self) -> String {
        self.server.url()
    }

    fn respond(&mut self, matcher: Matcher, result: &Value) -> &mut Self {
        let mock = self
            .server
            .mock("POST", "/")
            .match_body(matcher)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(result_body(result))
            .create();

        self.mocks.push(mock);
        self
    }

    /// Mocks an `eth_blockNumber` request.
    pub fn mock_block_number(&mut self, block_number: u64) -> &mut Self {
        self.respond(single_call("eth_blockNumber"), &json!(format!("0x{block_number:x}")))
    }

    /// Mocks an `eth_getBlockByNumber` request for a concrete height, with or without bodies.
    pub fn mock_get_block_by_number(&mut self, block_number: u64, response: &Value) -> &mut Self {
        self.respond(
            single_call_with_params("eth_getBlockByNumber", &format!(r#""0x{block_number:x}""#)),
            response,
        )
    }

    /// Mocks an `eth_getBlockByNumber("latest")` request.
    pub fn mock_latest_block(&mut self, response: &Value) -> &mut Self {
        self.respond(single_call_with_params("eth_getBlockByNumber", r#""latest""#), response)
    }

    /// Mocks an `eth_getBalance` request for `account` (any block).
    pub fn mock_get_balance(&mut self, account: &str, balance: &str) -> &mut Self {
        self.respond(
            single_call_with_params("eth_getBalance", &format!(r#""{account}""#)),
            &json!(balance),
        )
    }

    /// Mocks an `eth_getTransactionCount` request for `account` (any block).
    pub fn mock_transaction_count(&mut self, account: &str, nonce: u64) -> &mut Self {
        self.respond(
            single_call_with_params("eth_getTransactionCount", &format!(r#""{account}""#)),
            &json!(format!("0x{nonce:x}")),
        )
    }

    /// Mocks an `eth_call` request, e.g. a `balanceOf` read.
    pub fn mock_eth_call(&mut self, result: &str) -> &mut Self {
        self.respond(single_call("eth_call"), &json!(result))
    }

    /// Mocks an `eth_getLogs` request with specific from/to blocks.
    pub fn mock_get_logs_for_range(
        &mut self,
        from_block: u64,
        to_block: u64,
        logs: &[Value],
    ) -> &mut Self {
        let matcher = Matcher::AllOf(vec![
            single_call("eth_getLogs"),
            Matcher::Regex(format!(r#""fromBlock"\s*:\s*"0x{from_block:x}""#)),
            Matcher::Regex(format!(r#""toBlock"\s*:\s*"0x{to_block:x}""#)),
        ]);
        self.respond(matcher, &Value::Array(logs.to_vec()))
    }

    /// Mocks an `eth_getTransactionReceipt` request. `None` answers `null`, like a
    /// node that has not seen the transaction mined yet.
    pub fn mock_receipt(&mut self, tx_hash: &str, receipt: Option<&Value>) -> &mut Self {
        self.respond(
            single_call_with_params("eth_getTransactionReceipt", &format!(r#""{tx_hash}""#)),
            receipt.unwrap_or(&Value::Null),
        )
    }

    /// Answers every JSON-RPC batch through `responder(method, params)`, echoing request ids.
    pub fn mock_batch<F>(&mut self, responder: F) -> &mut Self
    where
        F: Fn(&str, &Value) -> Value + Send + Sync + 'static,
    {
        let mock = self
            .server
            .mock("POST", "/")
            .match_body(Matcher::Regex(r"^\[".to_string()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body_from_request(move |request| {
                let requests: Vec<Value> = request
                    .body()
                    .ok()
                    .and_then(|body| serde_json::from_slice(body).ok())
                    .unwrap_or_default();
                let responses: Vec<Value> = requests
                    .iter()
                    .map(|req| {
                        let method = req["method"].as_str().unwrap_or_default();
                        json!({
                            "jsonrpc": "2.0",
                            "id": req["id"],
                            "result": responder(method, &req["params"])
                        })
                    })
                    .collect();
                Value::Array(responses).to_string().into_bytes()
            })
            .create();

        self.mocks.push(mock);
        self
    }

    /// Mocks a JSON-RPC error response.
    pub fn mock_rpc_error(&mut self, method: &str, code: i32, message: &str) -> &mut Self {
        let mock = self
            .server
            .mock("POST", "/")
            .match_body(single_call(method))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "error": {
                        "code": code,
                        "message": message
                    }
                })
                .to_string(),
            )
            .create();

        self.mocks.push(mock);
        self
    }

    /// Mocks a non-JSON HTTP failure for `method`.
    pub fn mock_http_status(&mut self, method: &str, status: usize) -> &mut Self {
        let mock = self
            .server
            .mock("POST", "/")
            .match_body(single_call(method))
            .with_status(status)
            .with_body("upstream unavailable")
            .create();

        self.mocks.push(mock);
        self
    }

    /// Verifies all mocks were called.
    #[must_use]
    pub fn verify_all_called(&self) -> bool {
        self.mocks.iter().all(mockito::Mock::matched)
    }
}

/// Builder for constructing block responses.
pub struct BlockResponseBuilder {
    number: u64,
    hash: String,
    parent_hash: String,
    transactions: Vec<Value>,
    timestamp: u64,
}

impl BlockResponseBuilder {
    /// Creates a new block response builder.
    #[must_use]
    pub fn new(number: u64) -> Self {
        Self {
            number,
            hash: format!("0x{number:064x}"),
            parent_hash: format!("0x{:064x}", number.saturating_sub(1)),
            transactions: Vec::new(),
            timestamp: 1_600_000_000 + number * 12,
        }
    }

    /// Sets a custom block hash.
    #[must_use]
    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = hash.into();
        self
    }

    /// Adds full transaction objects to the block.
    #[must_use]
    pub fn with_transactions(mut self, txs: Vec<Value>) -> Self {
        self.transactions = txs;
        self
    }

    /// Sets a custom timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Builds the block response JSON.
    #[must_use]
    pub fn build(self) -> Value {
        json!({
            "number": format!("0x{:x}", self.number),
            "hash": self.hash,
            "parentHash": self.parent_hash,
            "timestamp": format!("0x{:x}", self.timestamp),
            "transactions": self.transactions,
            "gasLimit": "0x1c9c380",
            "gasUsed": "0x5208",
            "baseFeePerGas": "0x7",
            "miner": "0x0000000000000000000000000000000000000000",
            "stateRoot": "0x0000000000000000000000000000000000000000000000000000000000000000"
        })
    }
}

/// Builder for constructing `Transfer` log responses.
pub struct LogResponseBuilder {
    address: String,
    block_number: u64,
    block_hash: String,
    log_index: u64,
    transaction_hash: String,
    topics: Vec<String>,
    data: String,
}

impl LogResponseBuilder {
    /// Creates a new log response builder.
    #[must_use]
    pub fn new(block_number: u64, log_index: u64) -> Self {
        Self {
            address: "0x0000000000000000000000000000000000000001".to_string(),
            block_number,
            block_hash: format!("0x{block_number:064x}"),
            log_index,
            transaction_hash: format!("0x{:064x}", block_number * 100 + log_index),
            topics: vec![format!("0x{:064x}", 0)],
            data: "0x".to_string(),
        }
    }

    /// ERC-20 `Transfer(from, to, amount)` emitted by `token`.
    #[must_use]
    pub fn transfer(
        block_number: u64,
        log_index: u64,
        token: &str,
        from: &str,
        to: &str,
        amount: u128,
    ) -> Self {
        Self::new(block_number, log_index)
            .with_address(token)
            .with_topics(vec![
                super::TRANSFER_TOPIC.to_string(),
                super::address_topic(from),
                super::address_topic(to),
            ])
            .with_data(format!("0x{amount:064x}"))
    }

    /// Sets a custom contract address.
    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Sets topics for the log.
    #[must_use]
    pub fn with_topics(mut self, topics: Vec<String>) -> Self {
        self.topics = topics;
        self
    }

    /// Sets the log data.
    #[must_use]
    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = data.into();
        self
    }

    /// Sets the transaction hash.
    #[must_use]
    pub fn with_transaction_hash(mut self, hash: impl Into<String>) -> Self {
        self.transaction_hash = hash.into();
        self
    }

    /// Builds the log response JSON.
    #[must_use]
    pub fn build(self) -> Value {
        json!({
            "address": self.address,
            "blockNumber": format!("0x{:x}", self.block_number),
            "blockHash": self.block_hash,
            "logIndex": format!("0x{:x}", self.log_index),
            "transactionHash": self.transaction_hash,
            "transactionIndex": "0x0",
            "topics": self.topics,
            "data": self.data,
            "removed": false
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rpc_mock_builder_creation() {
        let mock = RpcMockBuilder::new().await;
        assert!(!mock.url().is_empty());
    }

    #[test]
    fn test_block_response_builder() {
        let block = BlockResponseBuilder::new(100).build();
        assert_eq!(block["number"], "0x64");
        assert_eq!(block["timestamp"], format!("0x{:x}", 1_600_000_000 + 1_200));
    }

    #[test]
    fn test_transfer_log_layout() {
        let log = LogResponseBuilder::transfer(
            100,
            5,
            "0x00000000000000000000000000000000000000cc",
            "0x0000000000000000000000000000000000000001",
            "0x0000000000000000000000000000000000000002",
            7,
        )
        .build();
        assert_eq!(log["logIndex"], "0x5");
        assert_eq!(log["topics"].as_array().map(Vec::len), Some(3));
        assert_eq!(
            log["topics"][2],
            "0x0000000000000000000000000000000000000000000000000000000000000002"
        );
        assert!(log["data"].as_str().is_some_and(|d| d.ends_with("07") && d.len() == 66));
    }

    #[test]
    fn test_single_call_matcher_rejects_batches() {
        let Matcher::Regex(pattern) = single_call("eth_getBalance") else {
            panic!("expected a regex matcher");
        };
        assert!(pattern.starts_with(r"^\{"));
    }
}
