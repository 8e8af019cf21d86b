//! End-to-end indexing scenarios over a simulated archive node.
//!
//! Each test builds a full runtime (stores, registries, chain groups and their
//! tasks) on top of `SimulatedChain` and observes results only through the
//! stores and the event feed, the way an embedding wallet would.

use crate::mock_infrastructure::wait_until;
use chronicle_core::{
    config::{AccountConfig, AppConfig, ChainConfig, StorageBackend},
    events::IndexerEvent,
    registry::TrackedAccount,
    runtime::IndexerRuntime,
    store::{
        Asset, Direction, HistoryStore, MemoryHistoryStore, MemoryProgressStore, ProgressStore,
        RangeKind, SqliteStore, TransferStatus,
    },
    testing::SimulatedChain,
    types::{Address, Word},
};
use std::{collections::HashSet, sync::Arc, time::Duration};
use tokio::sync::broadcast;

const ALICE: Address = Address([0x0a; 20]);
const BOB: Address = Address([0x0b; 20]);
const STRANGER: Address = Address([0x99; 20]);
const TOKEN: Address = Address([0xcc; 20]);

const WAIT: Duration = Duration::from_secs(10);

fn chain_config(chain_id: u64, tokens: Vec<Address>) -> ChainConfig {
    ChainConfig {
        chain_id,
        name: format!("chain-{chain_id}"),
        rpc_url: "https://rpc.example.com".to_string(),
        tokens,
        token_batch_size: None,
        enabled: true,
    }
}

fn create_test_config(accounts: &[Address]) -> AppConfig {
    let mut config = AppConfig::default();
    config.storage.backend = StorageBackend::Memory;
    config.metrics.enabled = false;
    config.indexer.chunk_size = 1_000;
    config.indexer.live_interval_seconds = 1;
    config.indexer.backfill_retry_interval_seconds = 1;
    config.indexer.start_retry_interval_seconds = 1;
    config.chains = vec![chain_config(1, vec![TOKEN])];
    config.accounts = accounts
        .iter()
        .map(|address| AccountConfig { address: *address, externally_fundable: false })
        .collect();
    config
}

async fn build(config: AppConfig, chains: &[&Arc<SimulatedChain>]) -> IndexerRuntime {
    let mut builder = IndexerRuntime::builder().with_config(config);
    for chain in chains {
        builder = builder.with_client(Arc::<SimulatedChain>::clone(*chain));
    }
    builder.build().await.expect("Failed to build runtime")
}

async fn wait_for_transfers(history: &Arc<dyn HistoryStore>, chain_id: u64, account: Address, count: usize) {
    wait_until(WAIT, || {
        let history = Arc::clone(history);
        async move {
            history.transfers_for_account(chain_id, account, 100).await.unwrap_or_default().len() >= count
        }
    })
    .await;
}

async fn wait_for_backfill(progress: &Arc<dyn ProgressStore>, chain_id: u64, account: Address) {
    wait_until(WAIT, || {
        let progress = Arc::clone(progress);
        async move {
            let native = progress.get_range(chain_id, account, RangeKind::Native).await;
            let token = progress.get_range(chain_id, account, RangeKind::Token).await;
            matches!((native, token), (Ok(n), Ok(t)) if n.is_fully_backfilled() && t.is_fully_backfilled())
        }
    })
    .await;
}

async fn wait_for_ready(events: &mut broadcast::Receiver<IndexerEvent>, chain_id: u64, account: Address) {
    let result = tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(IndexerEvent::RecentHistoryReady { chain_id: c, account: a }) if c == chain_id && a == account => {
                    return;
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event feed closed"),
            }
        }
    })
    .await;
    assert!(result.is_ok(), "account {account} never became ready on chain {chain_id}");
}

#[tokio::test]
async fn test_full_history_is_indexed() {
    let chain = Arc::new(SimulatedChain::new(1, 5_000));
    chain.send_native(1_200, STRANGER, ALICE, 10);
    chain.transfer_token(2_500, TOKEN, STRANGER, ALICE, 300);
    chain.transfer_token(3_100, TOKEN, ALICE, STRANGER, 120);
    chain.send_native(4_000, ALICE, BOB, 4);

    let runtime = build(create_test_config(&[ALICE, BOB]), &[&chain]).await;
    let mut events = runtime.subscribe();
    runtime.start().await.unwrap();

    let history = Arc::clone(runtime.components().history_store());
    wait_for_transfers(&history, 1, ALICE, 4).await;
    wait_for_transfers(&history, 1, BOB, 1).await;
    wait_for_ready(&mut events, 1, ALICE).await;

    let transfers = history.transfers_for_account(1, ALICE, 100).await.unwrap();
    assert_eq!(transfers.len(), 4);
    assert!(transfers.windows(2).all(|w| w[0].block_number >= w[1].block_number));
    assert!(transfers.iter().all(|t| t.status == TransferStatus::Success));

    let native_out = transfers.iter().find(|t| t.block_number == 4_000).expect("native outgoing");
    assert_eq!(native_out.asset, Asset::Native);
    assert_eq!(native_out.direction, Direction::Outgoing);
    assert_eq!(native_out.counterpart, Some(BOB));
    assert_eq!(native_out.amount, Word::from_u128(4));

    let token_in = transfers.iter().find(|t| t.block_number == 2_500).expect("token incoming");
    assert_eq!(token_in.asset, Asset::Erc20 { contract: TOKEN });
    assert_eq!(token_in.direction, Direction::Incoming);
    assert_eq!(token_in.amount, Word::from_u128(300));

    let bob = history.transfers_for_account(1, BOB, 100).await.unwrap();
    assert_eq!(bob[0].direction, Direction::Incoming);
    assert_eq!(bob[0].counterpart, Some(ALICE));

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_backfill_marks_history_complete() {
    let chain = Arc::new(SimulatedChain::new(1, 5_000));
    chain.send_native(2_200, STRANGER, ALICE, 10);

    let runtime = build(create_test_config(&[ALICE]), &[&chain]).await;
    let mut events = runtime.subscribe();
    runtime.start().await.unwrap();
    wait_for_ready(&mut events, 1, ALICE).await;

    let progress = Arc::clone(runtime.components().progress_store());
    wait_for_backfill(&progress, 1, ALICE).await;

    let native = progress.get_range(1, ALICE, RangeKind::Native).await.unwrap();
    assert_eq!(native.last_known, Some(5_000));
    assert!(native.start.is_some_and(|start| start <= 2_200));

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_live_watch_picks_up_new_blocks() {
    let chain = Arc::new(SimulatedChain::new(1, 5_000));
    let late = chain.send_native(5_005, STRANGER, ALICE, 7);

    let mut config = create_test_config(&[ALICE]);
    config.indexer.omit_history = true;
    let runtime = build(config, &[&chain]).await;
    let mut events = runtime.subscribe();
    runtime.start().await.unwrap();

    chain.set_head(5_010);
    let history = Arc::clone(runtime.components().history_store());
    wait_for_transfers(&history, 1, ALICE, 1).await;

    let transfers = history.transfers_for_account(1, ALICE, 10).await.unwrap();
    assert_eq!(transfers[0].tx_hash, late);
    assert_eq!(transfers[0].block_number, 5_005);

    let notified = tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(IndexerEvent::NewTransfersAvailable { accounts, .. }) = events.recv().await {
                return accounts;
            }
        }
    })
    .await
    .expect("no new-transfers notification");
    assert_eq!(notified, vec![ALICE]);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_restart_resumes_without_duplicates() {
    let chain = Arc::new(SimulatedChain::new(1, 5_000));
    chain.send_native(1_500, STRANGER, ALICE, 10);
    chain.transfer_token(3_500, TOKEN, STRANGER, ALICE, 50);

    let progress: Arc<dyn ProgressStore> = Arc::new(MemoryProgressStore::new());
    let history: Arc<dyn HistoryStore> = Arc::new(MemoryHistoryStore::new());

    let first = IndexerRuntime::builder()
        .with_config(create_test_config(&[ALICE]))
        .with_stores(Arc::clone(&progress), Arc::clone(&history))
        .with_client(Arc::clone(&chain) as _)
        .build()
        .await
        .unwrap();
    let mut events = first.subscribe();
    first.start().await.unwrap();
    wait_for_ready(&mut events, 1, ALICE).await;
    wait_for_backfill(&progress, 1, ALICE).await;
    first.shutdown().await;

    let before = chain.calls();
    let second = IndexerRuntime::builder()
        .with_config(create_test_config(&[ALICE]))
        .with_stores(Arc::clone(&progress), Arc::clone(&history))
        .with_client(Arc::clone(&chain) as _)
        .build()
        .await
        .unwrap();
    second.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    second.shutdown().await;

    let transfers = history.transfers_for_account(1, ALICE, 100).await.unwrap();
    assert_eq!(transfers.len(), 2);
    let keys: HashSet<_> = transfers.iter().map(|t| t.key()).collect();
    assert_eq!(keys.len(), 2);

    // history is complete, so the second run never probes old balances
    let after = chain.calls();
    assert_eq!(after.balance_at, before.balance_at);
    assert_eq!(after.token_balance_at, before.token_balance_at);
}

#[tokio::test]
async fn test_restart_scans_blocks_mined_while_stopped() {
    let chain = Arc::new(SimulatedChain::new(1, 5_000));
    chain.send_native(1_500, STRANGER, ALICE, 10);

    let progress: Arc<dyn ProgressStore> = Arc::new(MemoryProgressStore::new());
    let history: Arc<dyn HistoryStore> = Arc::new(MemoryHistoryStore::new());
    let runtime = |progress: &Arc<dyn ProgressStore>, history: &Arc<dyn HistoryStore>| {
        IndexerRuntime::builder()
            .with_config(create_test_config(&[ALICE]))
            .with_stores(Arc::clone(progress), Arc::clone(history))
            .with_client(Arc::clone(&chain) as _)
            .build()
    };

    let first = runtime(&progress, &history).await.unwrap();
    first.start().await.unwrap();
    wait_for_backfill(&progress, 1, ALICE).await;
    wait_for_transfers(&history, 1, ALICE, 1).await;
    first.shutdown().await;

    // round trip of equal value: the balance after downtime matches the stored fingerprint
    chain.send_native(5_200, STRANGER, ALICE, 7);
    chain.send_native(5_300, ALICE, STRANGER, 7);
    chain.set_head(6_000);

    let second = runtime(&progress, &history).await.unwrap();
    second.start().await.unwrap();
    wait_for_transfers(&history, 1, ALICE, 3).await;
    second.shutdown().await;

    let transfers = history.transfers_for_account(1, ALICE, 100).await.unwrap();
    let blocks: HashSet<u64> = transfers.iter().map(|t| t.block_number).collect();
    assert_eq!(blocks, HashSet::from([1_500, 5_200, 5_300]));
    let native = progress.get_range(1, ALICE, RangeKind::Native).await.unwrap();
    assert_eq!(native.last_known, Some(6_000));
}

#[tokio::test]
async fn test_account_added_at_runtime_is_backfilled() {
    let chain = Arc::new(SimulatedChain::new(1, 5_000));
    chain.send_native(900, STRANGER, BOB, 3);

    let runtime = build(create_test_config(&[ALICE]), &[&chain]).await;
    let mut events = runtime.subscribe();
    runtime.start().await.unwrap();

    runtime.indexer().add_account(TrackedAccount::new(BOB, false)).await.unwrap();
    assert_eq!(runtime.indexer().accounts().len(), 2);

    let history = Arc::clone(runtime.components().history_store());
    wait_for_transfers(&history, 1, BOB, 1).await;
    wait_for_ready(&mut events, 1, BOB).await;

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_removed_account_loses_its_data() {
    let chain = Arc::new(SimulatedChain::new(1, 5_000));
    chain.send_native(900, STRANGER, ALICE, 3);

    let runtime = build(create_test_config(&[ALICE]), &[&chain]).await;
    runtime.start().await.unwrap();
    let history = Arc::clone(runtime.components().history_store());
    wait_for_transfers(&history, 1, ALICE, 1).await;

    assert!(runtime.indexer().remove_account(ALICE).await.unwrap());
    assert!(runtime.indexer().accounts().is_empty());
    assert!(history.transfers_for_account(1, ALICE, 10).await.unwrap().is_empty());
    let native = runtime.components().progress_store().get_range(1, ALICE, RangeKind::Native).await.unwrap();
    assert_eq!(native.last_known, None);

    assert!(!runtime.indexer().remove_account(ALICE).await.unwrap());
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_chains_are_indexed_independently() {
    let mainnet = Arc::new(SimulatedChain::new(1, 5_000));
    let rollup = Arc::new(SimulatedChain::new(10, 8_000));
    mainnet.send_native(1_000, STRANGER, ALICE, 1);
    rollup.send_native(7_000, STRANGER, ALICE, 2);
    rollup.send_native(7_500, ALICE, STRANGER, 1);

    let mut config = create_test_config(&[ALICE]);
    config.chains.push(chain_config(10, Vec::new()));
    // one failing header fetch delays the rollup without affecting mainnet
    rollup.fail_next(chronicle_core::testing::SimMethod::HeaderByNumber, 1);

    let runtime = build(config, &[&mainnet, &rollup]).await;
    assert_eq!(runtime.indexer().chain_ids(), vec![1, 10]);
    runtime.start().await.unwrap();

    let history = Arc::clone(runtime.components().history_store());
    wait_for_transfers(&history, 1, ALICE, 1).await;
    wait_for_transfers(&history, 10, ALICE, 2).await;

    assert_eq!(history.transfers_for_account(1, ALICE, 10).await.unwrap().len(), 1);
    let rollup_transfers = history.transfers_for_account(10, ALICE, 10).await.unwrap();
    assert!(rollup_transfers.iter().all(|t| t.chain_id == 10));

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_sqlite_backed_indexing() {
    let chain = Arc::new(SimulatedChain::new(1, 3_000));
    let reverted = chain.send_native(2_000, ALICE, STRANGER, 5);
    chain.revert_transaction(reverted);

    let store = Arc::new(SqliteStore::connect("sqlite::memory:", 1).await.unwrap());
    let runtime = IndexerRuntime::builder()
        .with_config(create_test_config(&[ALICE]))
        .with_stores(store.clone(), store.clone())
        .with_client(Arc::clone(&chain) as _)
        .build()
        .await
        .unwrap();
    runtime.start().await.unwrap();

    let history: Arc<dyn HistoryStore> = store;
    wait_for_transfers(&history, 1, ALICE, 1).await;
    let transfers = history.transfers_for_account(1, ALICE, 10).await.unwrap();
    assert_eq!(transfers[0].status, TransferStatus::Failed);
    assert_eq!(transfers[0].direction, Direction::Outgoing);

    runtime.shutdown().await;
}
