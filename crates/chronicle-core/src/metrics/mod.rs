//! # Indexer Metrics
//!
//! Thin wrappers over the `metrics` facade. Every recorder is a lock-free atomic
//! update, so tasks call them inline on their hot paths. Nothing is recorded
//! until a recorder is installed; tests and library users that never install
//! one pay only for the no-op dispatch.
//!
//! | Metric | Kind | Labels |
//! |--------|------|--------|
//! | `indexer_rpc_errors_total` | counter | `kind` |
//! | `indexer_blocks_discovered_total` | counter | `chain_id`, `mode` |
//! | `indexer_scan_duration_seconds` | histogram | `chain_id`, `mode` |
//! | `indexer_transfers_saved_total` | counter | `chain_id` |
//! | `indexer_task_errors_total` | counter | `task`, `kind` |
//! | `indexer_live_ticks_total` | counter | `chain_id` |
//! | `indexer_dirty_accounts` | gauge | `chain_id` |
//! | `indexer_tracked_accounts` | gauge | `chain_id` |
//! | `indexer_chain_head` | gauge | `chain_id` |

use ::metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use std::{net::SocketAddr, time::Duration};

/// Installs the global Prometheus recorder and spawns its HTTP scrape listener.
///
/// Must be called from within a Tokio runtime.
///
/// # Errors
///
/// Returns an error if another global recorder is already installed or the
/// listener cannot bind.
pub fn install_exporter(listen: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(listen).install()
}

pub fn record_rpc_error(kind: &'static str) {
    counter!("indexer_rpc_errors_total", "kind" => kind).increment(1);
}

pub fn record_blocks_discovered(chain_id: u64, mode: &'static str, count: usize) {
    counter!("indexer_blocks_discovered_total", "chain_id" => chain_id.to_string(), "mode" => mode)
        .increment(count as u64);
}

pub fn record_scan_duration(chain_id: u64, mode: &'static str, elapsed: Duration) {
    histogram!("indexer_scan_duration_seconds", "chain_id" => chain_id.to_string(), "mode" => mode)
        .record(elapsed.as_secs_f64());
}

pub fn record_transfers_saved(chain_id: u64, count: usize) {
    counter!("indexer_transfers_saved_total", "chain_id" => chain_id.to_string())
        .increment(count as u64);
}

pub fn record_task_error(task: &'static str, kind: &'static str) {
    counter!("indexer_task_errors_total", "task" => task, "kind" => kind).increment(1);
}

#[allow(clippy::cast_precision_loss)]
pub fn record_live_tick(chain_id: u64, dirty_accounts: usize) {
    let chain = chain_id.to_string();
    counter!("indexer_live_ticks_total", "chain_id" => chain.clone()).increment(1);
    gauge!("indexer_dirty_accounts", "chain_id" => chain).set(dirty_accounts as f64);
}

#[allow(clippy::cast_precision_loss)]
pub fn set_tracked_accounts(chain_id: u64, count: usize) {
    gauge!("indexer_tracked_accounts", "chain_id" => chain_id.to_string()).set(count as f64);
}

#[allow(clippy::cast_precision_loss)]
pub fn set_chain_head(chain_id: u64, head: u64) {
    gauge!("indexer_chain_head", "chain_id" => chain_id.to_string()).set(head as f64);
}
