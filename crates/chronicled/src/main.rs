use anyhow::{Context, Result};
use chronicle_core::{config::AppConfig, events::IndexerEvent, runtime::IndexerRuntime};
use std::time::Duration;
use tokio::{signal, sync::broadcast};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Graceful shutdown timeout in seconds.
/// After this timeout, the process exits without waiting for the chain groups.
const GRACEFUL_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Initializes the logging system based on the configuration.
///
/// `RUST_LOG` wins over `logging.level` when set.
fn init_logging(config: &AppConfig) {
    let default_directives = format!("warn,chronicle_core={0},chronicled={0}", config.logging.level);
    let filter = match std::env::var("RUST_LOG").as_deref() {
        Ok("debug") => EnvFilter::new("warn,chronicle_core=debug,chronicled=debug"),
        Ok("trace") => EnvFilter::new("warn,chronicle_core=trace,chronicled=trace"),
        Ok(_) => EnvFilter::try_from_env("RUST_LOG").unwrap_or_else(|_| EnvFilter::new(&default_directives)),
        Err(_) => EnvFilter::new(&default_directives),
    };

    let registry = tracing_subscriber::registry().with(filter);

    if config.logging.format.as_str() == "json" {
        let fmt_layer = tracing_subscriber::fmt::layer().json();
        registry.with(fmt_layer).init();
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .pretty()
            .with_file(true)
            .with_line_number(true)
            .with_target(false);
        registry.with(fmt_layer).init();
    }
}

/// Logs indexer events until the feed closes.
async fn log_events(mut events: broadcast::Receiver<IndexerEvent>) {
    loop {
        match events.recv().await {
            Ok(IndexerEvent::FetchingRecentHistoryStarted { chain_id, accounts }) => {
                info!(chain_id, accounts = accounts.len(), "Fetching recent history");
            }
            Ok(IndexerEvent::RecentHistoryReady { chain_id, account }) => {
                info!(chain_id, %account, "Recent history ready");
            }
            Ok(IndexerEvent::NewTransfersAvailable { chain_id, accounts }) => {
                debug!(chain_id, accounts = accounts.len(), "New transfers available");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event listener lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load().context("Failed to load configuration")?;
    config.validate().map_err(|e| anyhow::anyhow!("Configuration validation failed: {e}"))?;

    init_logging(&config);
    info!("Starting chronicle indexer");
    debug!(
        chains = config.enabled_chains().count(),
        accounts = config.accounts.len(),
        storage = ?config.storage.backend,
        "Configuration loaded"
    );

    if config.metrics.enabled {
        let addr = config.metrics_addr().map_err(|e| anyhow::anyhow!(e))?;
        chronicle_core::metrics::install_exporter(addr).context("Failed to install Prometheus exporter")?;
        info!(address = %addr, "Prometheus exporter listening");
    }

    let runtime = IndexerRuntime::builder()
        .with_config(config)
        .build()
        .await
        .context("Failed to initialize indexer runtime")?;
    let event_logger = tokio::spawn(log_events(runtime.subscribe()));

    let started = tokio::select! {
        result = runtime.start() => {
            result.context("Failed to start indexer")?;
            true
        }
        () = shutdown_signal() => {
            info!("Shutdown requested during startup");
            false
        }
    };
    if started {
        shutdown_signal().await;
    }

    match tokio::time::timeout(Duration::from_secs(GRACEFUL_SHUTDOWN_TIMEOUT_SECS), runtime.shutdown()).await {
        Ok(()) => info!("Indexer shutdown complete"),
        Err(_) => error!(timeout_secs = GRACEFUL_SHUTDOWN_TIMEOUT_SECS, "Graceful shutdown timed out"),
    }
    event_logger.abort();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(
                error = %e,
                "Failed to install Ctrl+C handler"
            );
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!(
                    error = %e,
                    "Failed to install signal handler"
                );

                () = std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!(
        "Shutdown signal received, starting graceful shutdown (timeout: {}s)",
        GRACEFUL_SHUTDOWN_TIMEOUT_SECS
    );
}
