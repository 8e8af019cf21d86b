//! Integration tests for runtime lifecycle and builder components.
//!
//! These tests verify the behavioral contracts of the indexer runtime:
//! - Shutdown coordination and idempotency
//! - Builder configuration validation and error handling
//! - Chain groups stopping cleanly mid-scan and mid-startup
//!
//! Tests use `tokio::time::timeout` to prevent hanging on failures.

use chronicle_core::{
    config::{AccountConfig, AppConfig, ChainConfig, StorageBackend},
    rate_limit::{account_tag, chain_group_tag},
    runtime::{IndexerRuntime, IndexerRuntimeBuilder, RuntimeError},
    testing::{SimMethod, SimulatedChain},
    types::Address,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tokio::time::{timeout, Duration};

const ALICE: Address = Address([0x0a; 20]);

/// Creates a minimal valid configuration with one chain and one account.
fn create_test_runtime_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.storage.backend = StorageBackend::Memory;
    config.metrics.enabled = false;
    config.indexer.chunk_size = 500;
    config.indexer.start_retry_interval_seconds = 1;
    config.chains = vec![ChainConfig {
        chain_id: 1,
        name: "mainnet".to_string(),
        rpc_url: "https://rpc.example.com".to_string(),
        tokens: Vec::new(),
        token_batch_size: None,
        enabled: true,
    }];
    config.accounts = vec![AccountConfig { address: ALICE, externally_fundable: true }];
    config
}

async fn build_runtime(chain: &Arc<SimulatedChain>) -> IndexerRuntime {
    IndexerRuntimeBuilder::new()
        .with_config(create_test_runtime_config())
        .with_client(Arc::<SimulatedChain>::clone(chain))
        .build()
        .await
        .expect("Failed to build runtime")
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let chain = Arc::new(SimulatedChain::new(1, 1_000));
    let runtime = build_runtime(&chain).await;
    runtime.start().await.unwrap();

    runtime.shutdown().await;
    // second call must neither panic nor deadlock
    timeout(Duration::from_secs(2), runtime.shutdown()).await.expect("second shutdown returns");
    assert!(!runtime.indexer().chain(1).unwrap().is_running());
}

#[tokio::test]
async fn test_shutdown_signal_broadcast_to_all_receivers() {
    let chain = Arc::new(SimulatedChain::new(1, 1_000));
    let runtime = build_runtime(&chain).await;

    let received_count = Arc::new(AtomicUsize::new(0));
    let tasks: Vec<_> = (0..3)
        .map(|_| {
            let mut rx = runtime.shutdown_receiver();
            let count = Arc::clone(&received_count);
            tokio::spawn(async move {
                if rx.recv().await.is_ok() {
                    count.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(50)).await;
    runtime.shutdown().await;

    for task in tasks {
        timeout(Duration::from_secs(2), task)
            .await
            .expect("Task should complete")
            .expect("Task should not panic");
    }
    assert_eq!(received_count.load(Ordering::SeqCst), 3, "All 3 receivers should have been notified");
}

#[tokio::test]
async fn test_shutdown_interrupts_slow_backfill() {
    let chain = Arc::new(SimulatedChain::new(1, 200_000));
    chain.send_native(10, Address([0x99; 20]), ALICE, 1);
    chain.set_latency(Some(Duration::from_millis(50)));

    let runtime = build_runtime(&chain).await;
    runtime.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(runtime.indexer().chain(1).unwrap().is_backfilling());

    timeout(Duration::from_secs(5), runtime.shutdown()).await.expect("shutdown should not wait for the scan");
    assert!(!runtime.indexer().chain(1).unwrap().is_running());
}

#[tokio::test]
async fn test_shutdown_during_startup() {
    let chain = Arc::new(SimulatedChain::new(1, 1_000));
    chain.fail_next(SimMethod::HeaderByNumber, usize::MAX);

    let runtime = Arc::new(build_runtime(&chain).await);
    let starting = {
        let runtime = Arc::clone(&runtime);
        tokio::spawn(async move { runtime.start().await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!starting.is_finished(), "start waits for the chain head");

    runtime.shutdown().await;
    let result = timeout(Duration::from_secs(3), starting).await.expect("start should give up");
    assert!(result.is_ok(), "start task should not panic");
    assert!(!runtime.indexer().chain(1).unwrap().is_running());
}

#[tokio::test]
async fn test_builder_missing_config_returns_error() {
    let result = IndexerRuntimeBuilder::new().build().await;
    assert!(matches!(result, Err(RuntimeError::ConfigValidation(_))));
}

#[tokio::test]
async fn test_builder_no_enabled_chains_returns_error() {
    let mut config = create_test_runtime_config();
    config.chains[0].enabled = false;

    let result = IndexerRuntimeBuilder::new().with_config(config).build().await;
    assert!(matches!(result, Err(RuntimeError::NoChains)));
}

#[tokio::test]
async fn test_builder_rejects_invalid_config() {
    let mut config = create_test_runtime_config();
    config.chains[0].rpc_url = "ws://rpc.example.com".to_string();
    let result = IndexerRuntimeBuilder::new().with_config(config).build().await;
    assert!(matches!(result, Err(RuntimeError::ConfigValidation(ref msg)) if msg.contains("RPC URL")));

    let mut config = create_test_runtime_config();
    config.indexer.chunk_size = 0;
    let result = IndexerRuntimeBuilder::new().with_config(config).build().await;
    assert!(matches!(result, Err(RuntimeError::ConfigValidation(ref msg)) if msg.contains("chunk_size")));
}

#[tokio::test]
async fn test_builder_uses_json_rpc_without_override() {
    let runtime = IndexerRuntimeBuilder::new()
        .with_config(create_test_runtime_config())
        .build()
        .await
        .expect("Failed to build runtime");

    let chain = runtime.indexer().chain(1).expect("chain registered");
    assert_eq!(chain.chain_id(), 1);
    assert!(!chain.is_running());
    assert_eq!(runtime.config().accounts.len(), 1);
}

#[tokio::test]
async fn test_builder_client_override_is_ignored_for_unknown_chain() {
    let stray = Arc::new(SimulatedChain::new(42, 10));
    let runtime = IndexerRuntimeBuilder::new()
        .with_config(create_test_runtime_config())
        .with_client(stray)
        .build()
        .await
        .expect("Failed to build runtime");

    assert_eq!(runtime.indexer().chain_ids(), vec![1]);
}

#[tokio::test]
async fn test_builder_applies_rate_limits() {
    let mut config = create_test_runtime_config();
    config.rate_limits.account_limit = 25;
    config.rate_limits.chain_group_limit = 400;

    let chain = Arc::new(SimulatedChain::new(1, 10));
    let runtime = IndexerRuntimeBuilder::new()
        .with_config(config)
        .with_client(chain)
        .build()
        .await
        .expect("Failed to build runtime");

    let limiter = runtime.components().rate_limiter();
    assert_eq!(limiter.remaining(&account_tag(&ALICE)), Some(25));
    assert_eq!(limiter.remaining(&chain_group_tag(1)), Some(400));
}
