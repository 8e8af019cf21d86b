//! Integration tests for `JsonRpcChainClient` against a mock node.
//!
//! Every `ChainClient` operation is exercised over HTTP: request shape, result
//! parsing, null results and error mapping.

use crate::mock_infrastructure::{
    address_hex, create_json_rpc_client, create_test_receipt, create_test_transaction,
    BlockResponseBuilder, LogResponseBuilder, RpcMockBuilder,
};
use chronicle_core::{
    rpc::{fingerprint_balances, ChainClient, LogFilter, RpcError},
    scan::TRANSFER_EVENT_TOPIC,
    types::{Address, Hash32, Word},
};
use serde_json::{json, Value};

fn address(byte: u8) -> Address {
    address_hex(byte).parse().expect("valid address")
}

fn tx_hash(n: u64) -> String {
    format!("0x{n:064x}")
}

#[tokio::test]
async fn test_latest_header() {
    let mut mock = RpcMockBuilder::new().await;
    mock.mock_latest_block(&BlockResponseBuilder::new(0x1234).build());
    let client = create_json_rpc_client(mock.url(), 1);

    let header = client.header_by_number(None).await.unwrap();
    assert_eq!(header.number, 0x1234);
    assert_eq!(header.timestamp, 1_600_000_000 + 0x1234 * 12);
    assert_eq!(header.hash, Hash32::try_from(format!("0x{:064x}", 0x1234).as_str()).unwrap());
    assert_eq!(header.parent_hash, Hash32::try_from(format!("0x{:064x}", 0x1233).as_str()).unwrap());
    assert!(mock.verify_all_called());
}

#[tokio::test]
async fn test_header_by_number_and_missing_block() {
    let mut mock = RpcMockBuilder::new().await;
    let reorged_hash = format!("0x{}", "ab".repeat(32));
    mock.mock_get_block_by_number(
        100,
        &BlockResponseBuilder::new(100).with_hash(reorged_hash.as_str()).with_timestamp(1_700_000_000).build(),
    );
    mock.mock_get_block_by_number(101, &Value::Null);
    let client = create_json_rpc_client(mock.url(), 1);

    let header = client.header_by_number(Some(100)).await.unwrap();
    assert_eq!(header.number, 100);
    assert_eq!(header.hash, Hash32::try_from(reorged_hash.as_str()).unwrap());
    assert_eq!(header.timestamp, 1_700_000_000);
    let missing = client.header_by_number(Some(101)).await;
    assert!(matches!(missing, Err(RpcError::InvalidResponse(_))));
}

#[tokio::test]
async fn test_balance_and_nonce() {
    let account = address_hex(0xaa);
    let mut mock = RpcMockBuilder::new().await;
    mock.mock_get_balance(&account, "0xde0b6b3a7640000");
    mock.mock_transaction_count(&account, 42);
    let client = create_json_rpc_client(mock.url(), 1);

    let balance = client.balance_at(address(0xaa), 500).await.unwrap();
    assert_eq!(balance, Word::from_u128(1_000_000_000_000_000_000));
    assert_eq!(client.nonce_at(address(0xaa), 500).await.unwrap(), 42);
}

#[tokio::test]
async fn test_token_balance_reads_balance_of() {
    let mut mock = RpcMockBuilder::new().await;
    mock.mock_eth_call(&format!("0x{:064x}", 2_500));
    let client = create_json_rpc_client(mock.url(), 1);

    let balance = client.token_balance_at(address(0xaa), address(0xcc), 10).await.unwrap();
    assert_eq!(balance, Word::from_u128(2_500));
}

#[tokio::test]
async fn test_token_balance_without_code_is_zero() {
    let mut mock = RpcMockBuilder::new().await;
    mock.mock_eth_call("0x");
    let client = create_json_rpc_client(mock.url(), 1);

    let balance = client.token_balance_at(address(0xaa), address(0xcc), 10).await.unwrap();
    assert_eq!(balance, Word::ZERO);
}

#[tokio::test]
async fn test_filter_logs_parses_transfers() {
    let token = address_hex(0xcc);
    let from = address_hex(0x01);
    let to = address_hex(0x02);
    let mut mock = RpcMockBuilder::new().await;
    mock.mock_get_logs_for_range(
        0x10,
        0xff,
        &[LogResponseBuilder::transfer(0x20, 3, &token, &from, &to, 99).with_transaction_hash(tx_hash(77)).build()],
    );
    let client = create_json_rpc_client(mock.url(), 1);

    let filter = LogFilter {
        from_block: 0x10,
        to_block: 0xff,
        addresses: vec![address(0xcc)],
        topics: vec![Some(vec![TRANSFER_EVENT_TOPIC]), None, Some(vec![address(0x02).to_topic()])],
    };
    let logs = client.filter_logs(&filter).await.unwrap();

    assert_eq!(logs.len(), 1);
    let log = &logs[0];
    assert_eq!(log.address, address(0xcc));
    assert_eq!(log.block_number, 0x20);
    assert_eq!(log.log_index, 3);
    assert_eq!(log.transaction_hash, Hash32::try_from(tx_hash(77).as_str()).unwrap());
    assert_eq!(log.topics[0], TRANSFER_EVENT_TOPIC);
    assert_eq!(log.topics[2], address(0x02).to_topic());
    assert_eq!(Word::from_be_slice(&log.data), Some(Word::from_u128(99)));
    assert!(!log.removed);
}

#[tokio::test]
async fn test_log_range_error_is_classified() {
    let mut mock = RpcMockBuilder::new().await;
    mock.mock_rpc_error("eth_getLogs", -32005, "query returned more than 10000 results");
    let client = create_json_rpc_client(mock.url(), 1);

    let filter = LogFilter { from_block: 0, to_block: 1_000_000, addresses: Vec::new(), topics: Vec::new() };
    let err = client.filter_logs(&filter).await.unwrap_err();

    assert!(matches!(err, RpcError::JsonRpc(-32005, _)));
    assert!(err.is_result_too_large());
}

#[tokio::test]
async fn test_block_transactions() {
    let from = address_hex(0x01);
    let to = address_hex(0x02);
    let block = BlockResponseBuilder::new(77)
        .with_transactions(vec![
            create_test_transaction(&tx_hash(1), &from, Some(&to), 5),
            create_test_transaction(&tx_hash(2), &from, None, 0),
        ])
        .build();
    let mut mock = RpcMockBuilder::new().await;
    mock.mock_get_block_by_number(77, &block);
    let client = create_json_rpc_client(mock.url(), 1);

    let txs = client.block_transactions(77).await.unwrap();
    assert_eq!(txs.len(), 2);
    assert_eq!(txs[0].from, address(0x01));
    assert_eq!(txs[0].to, Some(address(0x02)));
    assert_eq!(txs[0].value, Word::from_u128(5));
    assert_eq!(txs[1].to, None);
}

#[tokio::test]
async fn test_transaction_receipts() {
    let mined = tx_hash(1);
    let reverted = tx_hash(2);
    let pending = tx_hash(3);
    let mut mock = RpcMockBuilder::new().await;
    mock.mock_receipt(&mined, Some(&create_test_receipt(&mined, 50, true)));
    mock.mock_receipt(&reverted, Some(&create_test_receipt(&reverted, 51, false)));
    mock.mock_receipt(&pending, None);
    let client = create_json_rpc_client(mock.url(), 1);

    let receipt = client
        .transaction_receipt(Hash32::try_from(mined.as_str()).unwrap())
        .await
        .unwrap()
        .expect("mined receipt");
    assert_eq!(receipt.block_number, 50);
    assert_eq!(receipt.success, Some(true));

    let receipt = client
        .transaction_receipt(Hash32::try_from(reverted.as_str()).unwrap())
        .await
        .unwrap()
        .expect("reverted receipt");
    assert_eq!(receipt.success, Some(false));

    let receipt = client.transaction_receipt(Hash32::try_from(pending.as_str()).unwrap()).await.unwrap();
    assert!(receipt.is_none());
}

#[tokio::test]
async fn test_balance_fingerprints_batch() {
    let mut mock = RpcMockBuilder::new().await;
    mock.mock_block_number(900);
    mock.mock_batch(|method, params| match method {
        "eth_getBalance" if params[0] == address_hex(0x01) => json!("0x64"),
        "eth_getBalance" => json!("0x0"),
        "eth_call" => json!(format!("0x{:064x}", 7)),
        _ => Value::Null,
    });
    let client = create_json_rpc_client(mock.url(), 1);

    let accounts = [address(0x01), address(0x02)];
    let tokens = [address(0xcc), address(0xdd)];
    let fingerprints = client.balance_fingerprints(&accounts, &tokens).await.unwrap();

    assert_eq!(fingerprints.block_number, 900);
    assert_eq!(fingerprints.per_account.len(), 2);
    let seven = Word::from_u128(7);
    assert_eq!(fingerprints.per_account[0].0, address(0x01));
    assert_eq!(
        fingerprints.per_account[0].1,
        fingerprint_balances(&Word::from_u128(100), &[seven, seven])
    );
    assert_eq!(fingerprints.per_account[1].1, fingerprint_balances(&Word::ZERO, &[seven, seven]));
    assert_ne!(fingerprints.per_account[0].1, fingerprints.per_account[1].1);
}

#[tokio::test]
async fn test_rpc_error_is_surfaced() {
    let mut mock = RpcMockBuilder::new().await;
    mock.mock_rpc_error("eth_getBalance", -32000, "header not found");
    let client = create_json_rpc_client(mock.url(), 1);

    let err = client.balance_at(address(0xaa), 1).await.unwrap_err();
    assert!(matches!(err, RpcError::JsonRpc(-32000, ref message) if message == "header not found"));
}

#[tokio::test]
async fn test_http_failure_is_surfaced() {
    let mut mock = RpcMockBuilder::new().await;
    mock.mock_http_status("eth_getTransactionCount", 503);
    let client = create_json_rpc_client(mock.url(), 1);

    let err = client.nonce_at(address(0xaa), 1).await.unwrap_err();
    assert!(matches!(err, RpcError::HttpError(503, _)));
    assert!(err.is_transient());
}
