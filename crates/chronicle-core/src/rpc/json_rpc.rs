//! [`ChainClient`] over an Ethereum JSON-RPC HTTP endpoint.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use super::{
    client::{
        fingerprint_balances, BalanceFingerprints, BlockHeader, ChainClient, LogEntry, LogFilter,
        TransactionInfo, TransactionReceipt,
    },
    http_client::HttpClient,
    RpcError,
};
use crate::types::{
    format_quantity, parse_quantity, Address, Hash32, JsonRpcRequest, JsonRpcResponse, Word,
};

/// `balanceOf(address)` function selector.
const BALANCE_OF_SELECTOR: [u8; 4] = [0x70, 0xa0, 0x82, 0x31];

/// JSON-RPC backed chain client for one chain.
pub struct JsonRpcChainClient {
    chain_id: u64,
    url: String,
    http_client: Arc<HttpClient>,
    timeout: Duration,
    next_id: AtomicU64,
}

impl JsonRpcChainClient {
    #[must_use]
    pub fn new(chain_id: u64, url: String, http_client: Arc<HttpClient>, timeout: Duration) -> Self {
        Self { chain_id, url, http_client, timeout, next_id: AtomicU64::new(1) }
    }

    fn request(&self, method: &str, params: Value) -> JsonRpcRequest {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        JsonRpcRequest::new(method, Some(params), json!(id))
    }

    fn into_result(response: JsonRpcResponse) -> Result<Value, RpcError> {
        if let Some(error) = response.error {
            return Err(RpcError::JsonRpc(error.code, error.message));
        }
        response.result.ok_or_else(|| RpcError::InvalidResponse("missing result".to_string()))
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let request = self.request(method, params);
        let body = serde_json::to_vec(&request)
            .map_err(|e| RpcError::InvalidResponse(format!("Failed to serialize request: {e}")))?;

        tracing::trace!(chain_id = self.chain_id, method, "sending rpc request");
        let bytes =
            self.http_client.send_request(&self.url, bytes::Bytes::from(body), self.timeout).await?;

        let response: JsonRpcResponse = serde_json::from_slice(&bytes)
            .map_err(|e| RpcError::InvalidResponse(format!("Invalid JSON: {e}")))?;
        Self::into_result(response)
    }

    /// Sends several requests as one JSON-RPC batch and returns results in request order.
    async fn batch(&self, requests: Vec<JsonRpcRequest>) -> Result<Vec<Value>, RpcError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::to_vec(&requests)
            .map_err(|e| RpcError::InvalidResponse(format!("Failed to serialize batch: {e}")))?;
        let bytes =
            self.http_client.send_request(&self.url, bytes::Bytes::from(body), self.timeout).await?;

        let responses: Vec<JsonRpcResponse> = serde_json::from_slice(&bytes)
            .map_err(|e| RpcError::InvalidResponse(format!("Invalid batch JSON: {e}")))?;

        let mut by_id: HashMap<String, JsonRpcResponse> =
            responses.into_iter().map(|r| (r.id.to_string(), r)).collect();

        requests
            .iter()
            .map(|req| {
                let response = by_id.remove(&req.id.to_string()).ok_or_else(|| {
                    RpcError::InvalidResponse(format!("batch response missing id {}", req.id))
                })?;
                Self::into_result(response)
            })
            .collect()
    }

    fn balance_of_call(account: Address, token: Address) -> Value {
        let mut data = Vec::with_capacity(36);
        data.extend_from_slice(&BALANCE_OF_SELECTOR);
        data.extend_from_slice(&account.to_topic().0);
        json!({ "to": token.to_string(), "data": format!("0x{}", hex::encode(data)) })
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> Result<&'a str, RpcError> {
    value
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| RpcError::InvalidResponse(format!("missing or non-string field '{key}'")))
}

fn quantity_field(value: &Value, key: &str) -> Result<u64, RpcError> {
    parse_quantity(str_field(value, key)?)
        .map_err(|e| RpcError::InvalidResponse(format!("field '{key}': {e}")))
}

fn hash_field(value: &Value, key: &str) -> Result<Hash32, RpcError> {
    Hash32::try_from(str_field(value, key)?)
        .map_err(|e| RpcError::InvalidResponse(format!("field '{key}': {e}")))
}

fn address_field(value: &Value, key: &str) -> Result<Address, RpcError> {
    str_field(value, key)?
        .parse()
        .map_err(|e| RpcError::InvalidResponse(format!("field '{key}': {e}")))
}

fn as_word(value: &Value) -> Result<Word, RpcError> {
    let raw = value
        .as_str()
        .ok_or_else(|| RpcError::InvalidResponse("expected hex string".to_string()))?;
    // Calls to an address without code return "0x".
    if raw == "0x" {
        return Ok(Word::ZERO);
    }
    Word::from_quantity(raw).map_err(|e| RpcError::InvalidResponse(e.to_string()))
}

fn as_quantity(value: &Value) -> Result<u64, RpcError> {
    let raw = value
        .as_str()
        .ok_or_else(|| RpcError::InvalidResponse("expected hex quantity".to_string()))?;
    parse_quantity(raw).map_err(|e| RpcError::InvalidResponse(e.to_string()))
}

fn parse_header(value: &Value) -> Result<BlockHeader, RpcError> {
    if value.is_null() {
        return Err(RpcError::InvalidResponse("block not found".to_string()));
    }
    Ok(BlockHeader {
        number: quantity_field(value, "number")?,
        hash: hash_field(value, "hash")?,
        parent_hash: hash_field(value, "parentHash")?,
        timestamp: quantity_field(value, "timestamp")?,
    })
}

/// Folds batch results laid out as `[balance, token balances...]` per account.
fn fingerprints_from_results(
    accounts: &[Address],
    token_count: usize,
    results: &[Value],
) -> Result<Vec<(Address, Hash32)>, RpcError> {
    let stride = token_count + 1;
    if results.len() != accounts.len() * stride {
        return Err(RpcError::InvalidResponse(format!(
            "fingerprint batch returned {} results, expected {}",
            results.len(),
            accounts.len() * stride
        )));
    }
    accounts
        .iter()
        .zip(results.chunks(stride))
        .map(|(account, chunk)| {
            let (native, token_results) = chunk
                .split_first()
                .ok_or_else(|| RpcError::InvalidResponse("empty fingerprint result".to_string()))?;
            let native = as_word(native)?;
            let token_balances = token_results.iter().map(as_word).collect::<Result<Vec<_>, _>>()?;
            Ok((*account, fingerprint_balances(&native, &token_balances)))
        })
        .collect()
}

fn parse_log(value: &Value) -> Result<LogEntry, RpcError> {
    let topics = value
        .get("topics")
        .and_then(Value::as_array)
        .ok_or_else(|| RpcError::InvalidResponse("log without topics".to_string()))?
        .iter()
        .map(|t| {
            t.as_str()
                .ok_or_else(|| RpcError::InvalidResponse("non-string topic".to_string()))
                .and_then(|s| Hash32::try_from(s).map_err(|e| RpcError::InvalidResponse(e.to_string())))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let data_hex = str_field(value, "data")?;
    let data = hex::decode(data_hex.strip_prefix("0x").unwrap_or(data_hex))
        .map_err(|e| RpcError::InvalidResponse(format!("log data: {e}")))?;
    let log_index = u32::try_from(quantity_field(value, "logIndex")?)
        .map_err(|e| RpcError::InvalidResponse(format!("logIndex: {e}")))?;

    Ok(LogEntry {
        address: address_field(value, "address")?,
        topics,
        data,
        block_number: quantity_field(value, "blockNumber")?,
        block_hash: hash_field(value, "blockHash")?,
        transaction_hash: hash_field(value, "transactionHash")?,
        log_index,
        removed: value.get("removed").and_then(Value::as_bool).unwrap_or(false),
    })
}

fn parse_transaction(value: &Value) -> Result<TransactionInfo, RpcError> {
    let to = match value.get("to") {
        None | Some(Value::Null) => None,
        Some(_) => Some(address_field(value, "to")?),
    };
    Ok(TransactionInfo {
        hash: hash_field(value, "hash")?,
        from: address_field(value, "from")?,
        to,
        value: as_word(value.get("value").unwrap_or(&Value::Null))?,
    })
}

fn parse_receipt(value: &Value) -> Result<TransactionReceipt, RpcError> {
    let success = match value.get("status").and_then(Value::as_str) {
        None => None,
        Some(raw) => Some(
            parse_quantity(raw).map_err(|e| RpcError::InvalidResponse(format!("status: {e}")))? ==
                1,
        ),
    };
    Ok(TransactionReceipt {
        transaction_hash: hash_field(value, "transactionHash")?,
        block_number: quantity_field(value, "blockNumber")?,
        success,
    })
}

fn filter_params(filter: &LogFilter) -> Value {
    let topics: Vec<Value> = filter
        .topics
        .iter()
        .map(|slot| match slot {
            None => Value::Null,
            Some(options) => Value::Array(options.iter().map(|t| json!(t.to_string())).collect()),
        })
        .collect();

    let mut params = json!({
        "fromBlock": format_quantity(filter.from_block),
        "toBlock": format_quantity(filter.to_block),
        "topics": topics,
    });
    if !filter.addresses.is_empty() {
        params["address"] =
            Value::Array(filter.addresses.iter().map(|a| json!(a.to_string())).collect());
    }
    json!([params])
}

#[async_trait]
impl ChainClient for JsonRpcChainClient {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn header_by_number(&self, number: Option<u64>) -> Result<BlockHeader, RpcError> {
        let tag = number.map_or_else(|| "latest".to_string(), format_quantity);
        let result = self.call("eth_getBlockByNumber", json!([tag, false])).await?;
        parse_header(&result)
    }

    async fn balance_at(&self, account: Address, block: u64) -> Result<Word, RpcError> {
        let result = self
            .call("eth_getBalance", json!([account.to_string(), format_quantity(block)]))
            .await?;
        as_word(&result)
    }

    async fn nonce_at(&self, account: Address, block: u64) -> Result<u64, RpcError> {
        let result = self
            .call("eth_getTransactionCount", json!([account.to_string(), format_quantity(block)]))
            .await?;
        as_quantity(&result)
    }

    async fn token_balance_at(
        &self,
        account: Address,
        token: Address,
        block: u64,
    ) -> Result<Word, RpcError> {
        let result = self
            .call("eth_call", json!([Self::balance_of_call(account, token), format_quantity(block)]))
            .await?;
        as_word(&result)
    }

    async fn filter_logs(&self, filter: &LogFilter) -> Result<Vec<LogEntry>, RpcError> {
        let result = self.call("eth_getLogs", filter_params(filter)).await?;
        result
            .as_array()
            .ok_or_else(|| RpcError::InvalidResponse("eth_getLogs result is not an array".into()))?
            .iter()
            .map(parse_log)
            .collect()
    }

    async fn balance_fingerprints(
        &self,
        accounts: &[Address],
        tokens: &[Address],
    ) -> Result<BalanceFingerprints, RpcError> {
        let head = as_quantity(&self.call("eth_blockNumber", json!([])).await?)?;
        let block = format_quantity(head);

        let mut requests = Vec::with_capacity(accounts.len() * (tokens.len() + 1));
        for account in accounts {
            requests.push(self.request("eth_getBalance", json!([account.to_string(), block])));
            for token in tokens {
                requests.push(
                    self.request("eth_call", json!([Self::balance_of_call(*account, *token), block])),
                );
            }
        }

        let results = self.batch(requests).await?;
        let per_account = fingerprints_from_results(accounts, tokens.len(), &results)?;
        Ok(BalanceFingerprints { block_number: head, per_account })
    }

    async fn block_transactions(&self, number: u64) -> Result<Vec<TransactionInfo>, RpcError> {
        let result =
            self.call("eth_getBlockByNumber", json!([format_quantity(number), true])).await?;
        if result.is_null() {
            return Err(RpcError::InvalidResponse(format!("block {number} not found")));
        }
        result
            .get("transactions")
            .and_then(Value::as_array)
            .ok_or_else(|| RpcError::InvalidResponse("block without transactions".to_string()))?
            .iter()
            .map(parse_transaction)
            .collect()
    }

    async fn transaction_receipt(
        &self,
        hash: Hash32,
    ) -> Result<Option<TransactionReceipt>, RpcError> {
        let result = self.call("eth_getTransactionReceipt", json!([hash.to_string()])).await?;
        if result.is_null() {
            return Ok(None);
        }
        parse_receipt(&result).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balance_of_call_encoding() {
        let account: Address = "0x00000000000000000000000000000000000000aa".parse().unwrap();
        let token: Address = "0x00000000000000000000000000000000000000bb".parse().unwrap();
        let call = JsonRpcChainClient::balance_of_call(account, token);

        let data = call["data"].as_str().unwrap();
        assert!(data.starts_with("0x70a08231"));
        assert_eq!(data.len(), 2 + 8 + 64);
        assert!(data.ends_with("aa"));
        assert_eq!(call["to"], "0x00000000000000000000000000000000000000bb");
    }

    #[test]
    fn test_filter_params_shape() {
        let filter = LogFilter {
            from_block: 16,
            to_block: 255,
            addresses: Vec::new(),
            topics: vec![Some(vec![Hash32([1; 32])]), None],
        };
        let params = filter_params(&filter);
        assert_eq!(params[0]["fromBlock"], "0x10");
        assert_eq!(params[0]["toBlock"], "0xff");
        assert!(params[0]["topics"][1].is_null());
        assert!(params[0].get("address").is_none());
    }

    #[test]
    fn test_parse_log_rejects_missing_topics() {
        let raw = json!({
            "address": "0x00000000000000000000000000000000000000bb",
            "data": "0x",
            "blockNumber": "0x1",
            "blockHash": format!("0x{}", "11".repeat(32)),
            "transactionHash": format!("0x{}", "22".repeat(32)),
            "logIndex": "0x0"
        });
        assert!(matches!(parse_log(&raw), Err(RpcError::InvalidResponse(_))));
    }

    #[test]
    fn test_short_fingerprint_batch_is_rejected() {
        let accounts: Vec<Address> = vec![
            "0x00000000000000000000000000000000000000aa".parse().unwrap(),
            "0x00000000000000000000000000000000000000ab".parse().unwrap(),
        ];
        // One token per account; the second account lost its token balance.
        let results = vec![json!("0x1"), json!("0x2"), json!("0x3")];
        let err = fingerprints_from_results(&accounts, 1, &results).unwrap_err();
        assert!(matches!(err, RpcError::InvalidResponse(_)));

        let results = vec![json!("0x1"), json!("0x"), json!("0x3"), json!("0x4")];
        let folded = fingerprints_from_results(&accounts, 1, &results).unwrap();
        assert_eq!(folded.len(), 2);
        assert_eq!(folded[0].0, accounts[0]);
        assert_eq!(folded[0].1, fingerprint_balances(&Word::from_u128(1), &[Word::ZERO]));
    }

    #[test]
    fn test_parse_receipt_status() {
        let raw = json!({
            "transactionHash": format!("0x{}", "22".repeat(32)),
            "blockNumber": "0x64",
            "status": "0x0"
        });
        let receipt = parse_receipt(&raw).unwrap();
        assert_eq!(receipt.block_number, 100);
        assert_eq!(receipt.success, Some(false));
    }

    #[test]
    fn test_empty_call_result_is_zero() {
        assert_eq!(as_word(&json!("0x")).unwrap(), Word::ZERO);
    }
}
