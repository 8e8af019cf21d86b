//! Application configuration with layered loading.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded in this order (later overrides earlier):
//!
//! 1. **Compiled defaults**: `Default` implementations and `#[serde(default)]`
//! 2. **Config file**: TOML file named by the `CHRONICLE_CONFIG` env var
//! 3. **Environment variables**: `CHRONICLE__*` env vars override single fields
//!
//! # Configuration Sections
//!
//! - [`IndexerConfig`]: scan sizes, intervals, retry bounds and RPC timeouts
//! - [`RateLimitsConfig`]: history quotas per chain group and per account
//! - [`StorageConfig`]: `SQLite` database or in-memory stores
//! - [`ChainConfig`]: one entry per indexed chain with its tracked tokens
//! - [`AccountConfig`]: tracked accounts
//! - [`MetricsConfig`] and [`LoggingConfig`]
//!
//! # Example
//!
//! ```toml
//! [indexer]
//! chunk_size = 10000
//! live_interval_seconds = 120
//!
//! [[chains]]
//! chain_id = 1
//! name = "mainnet"
//! rpc_url = "https://eth-mainnet.example.com"
//! tokens = ["0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48"]
//!
//! [[accounts]]
//! address = "0x00000000219ab540356cbb839cbe05303d7705fa"
//! externally_fundable = true
//! ```

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, path::Path, time::Duration};

use crate::{registry::TrackedAccount, rpc::HttpClientConfig, scan::ScanSettings, types::Address};

/// Scanning, scheduling and retry settings shared by every chain group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Blocks per scan chunk; progress is persisted per chunk. Defaults to `10000`.
    pub chunk_size: u64,
    /// Open sub-ranges kept per native bisection level. Defaults to `60`.
    pub max_ranges_per_level: usize,
    /// Concurrent native probe lookups. Defaults to `10`.
    pub native_probe_concurrency: usize,
    /// Largest range the token bisector emits. Defaults to `100000`.
    pub token_batch_size: u64,
    /// Widest `eth_getLogs` window. Defaults to `100000`.
    pub log_batch_size: u64,
    /// Batches buffered between discovery and the detail loader. Defaults to `100`.
    pub queue_capacity: usize,
    /// Accounts resolved concurrently per loader batch. Defaults to `4`.
    pub loader_fan_out: usize,
    /// Defaults to `120`.
    pub live_interval_seconds: u64,
    /// Live ticks between nonce checks of externally fundable accounts. Defaults to `30`.
    pub nonce_check_every: u64,
    /// Live ticks between token-log safety-net scans. Defaults to `5`.
    pub log_check_every: u64,
    /// Defaults to `5`.
    pub backfill_retry_interval_seconds: u64,
    /// Consecutive failed backfill rounds before giving up. Defaults to `3`.
    pub backfill_max_failures: u32,
    /// Defaults to `20`.
    pub rpc_timeout_seconds: u64,
    /// Timeout of the latest-header fetch. Defaults to `3`.
    pub head_timeout_seconds: u64,
    /// Delay before a chain group whose start failed is tried again. Defaults to `30`.
    pub start_retry_interval_seconds: u64,
    /// Treat every account as fully backfilled and only watch forward.
    pub omit_history: bool,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            chunk_size: 10_000,
            max_ranges_per_level: 60,
            native_probe_concurrency: 10,
            token_batch_size: 100_000,
            log_batch_size: 100_000,
            queue_capacity: 100,
            loader_fan_out: 4,
            live_interval_seconds: 120,
            nonce_check_every: 30,
            log_check_every: 5,
            backfill_retry_interval_seconds: 5,
            backfill_max_failures: 3,
            rpc_timeout_seconds: 20,
            head_timeout_seconds: 3,
            start_retry_interval_seconds: 30,
            omit_history: false,
        }
    }
}

impl IndexerConfig {
    /// Scanner settings, with an optional per-chain token batch override.
    #[must_use]
    pub fn scan_settings(&self, token_batch_size: Option<u64>) -> ScanSettings {
        ScanSettings {
            chunk_size: self.chunk_size,
            max_ranges_per_level: self.max_ranges_per_level,
            native_probe_concurrency: self.native_probe_concurrency,
            token_batch_size: token_batch_size.unwrap_or(self.token_batch_size),
            log_batch_size: self.log_batch_size,
        }
    }

    #[must_use]
    pub fn live_interval(&self) -> Duration {
        Duration::from_secs(self.live_interval_seconds)
    }

    #[must_use]
    pub fn backfill_retry_interval(&self) -> Duration {
        Duration::from_secs(self.backfill_retry_interval_seconds)
    }

    #[must_use]
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_seconds)
    }

    #[must_use]
    pub fn head_timeout(&self) -> Duration {
        Duration::from_secs(self.head_timeout_seconds)
    }

    #[must_use]
    pub fn start_retry_interval(&self) -> Duration {
        Duration::from_secs(self.start_retry_interval_seconds)
    }
}

/// History-scan request quotas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitsConfig {
    pub enabled: bool,
    /// Requests per chain group per period. Defaults to `10000`.
    pub chain_group_limit: u64,
    /// Defaults to one day.
    pub chain_group_period_seconds: Option<u64>,
    /// Requests per account. Defaults to `5000`.
    pub account_limit: u64,
    /// `None` makes the account quota a lifetime budget.
    pub account_period_seconds: Option<u64>,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            chain_group_limit: 10_000,
            chain_group_period_seconds: Some(86_400),
            account_limit: 5_000,
            account_period_seconds: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Defaults to `sqlite://./db/chronicle.db`.
    pub database_url: String,
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            database_url: "sqlite://./db/chronicle.db".to_string(),
            max_connections: 4,
        }
    }
}

/// One indexed chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    /// HTTPS JSON-RPC endpoint of an archive node.
    pub rpc_url: String,
    /// Tracked token contracts. An empty list is valid.
    #[serde(default)]
    pub tokens: Vec<Address>,
    /// Overrides `indexer.token_batch_size` for this chain.
    #[serde(default)]
    pub token_batch_size: Option<u64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountConfig {
    pub address: Address,
    #[serde(default)]
    pub externally_fundable: bool,
}

impl From<&AccountConfig> for TrackedAccount {
    fn from(config: &AccountConfig) -> Self {
        TrackedAccount::new(config.address, config.externally_fundable)
    }
}

/// HTTP client limits toward RPC nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Maximum concurrent requests per node. Defaults to `64`.
    pub max_concurrent_requests: usize,
    /// Defaults to `2000`.
    pub permit_timeout_ms: u64,
    /// Retries of 5xx responses and connection errors. Defaults to `2`.
    pub max_retries: u32,
}

impl Default for RpcConfig {
    fn default() -> Self {
        let http = HttpClientConfig::default();
        Self {
            max_concurrent_requests: http.concurrent_limit,
            permit_timeout_ms: http.permit_timeout_ms,
            max_retries: http.max_retries,
        }
    }
}

impl From<&RpcConfig> for HttpClientConfig {
    fn from(config: &RpcConfig) -> Self {
        HttpClientConfig {
            concurrent_limit: config.max_concurrent_requests,
            permit_timeout_ms: config.permit_timeout_ms,
            max_retries: config.max_retries,
        }
    }
}

/// Prometheus metrics export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Defaults to `true`.
    pub enabled: bool,
    /// Defaults to `127.0.0.1`.
    pub bind_address: String,
    /// Defaults to `9090`.
    pub prometheus_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true, bind_address: "127.0.0.1".to_string(), prometheus_port: 9090 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (e.g., "trace", "debug", "info"). Defaults to `"info"`.
    pub level: String,
    /// `"json"` or `"pretty"`. Defaults to `"pretty"`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: "pretty".to_string() }
    }
}

/// Root application configuration.
///
/// Loaded with the `CHRONICLE` prefix for environment overrides, using `__` as
/// a separator (e.g. `CHRONICLE__INDEXER__CHUNK_SIZE=5000`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub indexer: IndexerConfig,
    #[serde(default)]
    pub rate_limits: RateLimitsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub chains: Vec<ChainConfig>,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Loads configuration from a TOML file with environment variable overrides.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be parsed or deserialized.
    pub fn from_file<P: AsRef<Path>>(config_path: P) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::with_name(&config_path.as_ref().to_string_lossy()).required(false))
            .add_source(Environment::with_prefix("CHRONICLE").separator("__"))
            .build()?
            .try_deserialize()
    }

    /// Loads from `CHRONICLE_CONFIG`, defaulting to `config/config.toml`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration cannot be loaded or parsed.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("CHRONICLE_CONFIG").unwrap_or_else(|_| "config/config.toml".to_string());
        Self::from_file(config_path)
    }

    #[must_use]
    pub fn enabled_chains(&self) -> impl Iterator<Item = &ChainConfig> {
        self.chains.iter().filter(|c| c.enabled)
    }

    #[must_use]
    pub fn tracked_accounts(&self) -> Vec<TrackedAccount> {
        self.accounts.iter().map(TrackedAccount::from).collect()
    }

    /// Address the Prometheus exporter listens on.
    ///
    /// # Errors
    ///
    /// Returns an error string if the address does not parse.
    pub fn metrics_addr(&self) -> Result<SocketAddr, String> {
        format!("{}:{}", self.metrics.bind_address, self.metrics.prometheus_port)
            .parse()
            .map_err(|_| {
                format!(
                    "Invalid metrics address: {}:{}",
                    self.metrics.bind_address, self.metrics.prometheus_port
                )
            })
    }

    /// Validates the configuration for correctness and consistency.
    ///
    /// # Errors
    ///
    /// Returns a descriptive error string for the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        let indexer = &self.indexer;
        let positive = [
            ("indexer.chunk_size", indexer.chunk_size),
            ("indexer.token_batch_size", indexer.token_batch_size),
            ("indexer.log_batch_size", indexer.log_batch_size),
            ("indexer.live_interval_seconds", indexer.live_interval_seconds),
            ("indexer.nonce_check_every", indexer.nonce_check_every),
            ("indexer.log_check_every", indexer.log_check_every),
            ("indexer.rpc_timeout_seconds", indexer.rpc_timeout_seconds),
            ("indexer.head_timeout_seconds", indexer.head_timeout_seconds),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(format!("{name} must be greater than 0"));
        }
        if indexer.max_ranges_per_level == 0 {
            return Err("indexer.max_ranges_per_level must be greater than 0".to_string());
        }
        if indexer.native_probe_concurrency == 0 {
            return Err("indexer.native_probe_concurrency must be greater than 0".to_string());
        }
        if indexer.queue_capacity == 0 {
            return Err("indexer.queue_capacity must be greater than 0".to_string());
        }
        if indexer.loader_fan_out == 0 {
            return Err("indexer.loader_fan_out must be greater than 0".to_string());
        }
        if self.rpc.max_concurrent_requests == 0 {
            return Err("rpc.max_concurrent_requests must be greater than 0".to_string());
        }

        let mut seen = Vec::new();
        for chain in &self.chains {
            if seen.contains(&chain.chain_id) {
                return Err(format!("Duplicate chain id: {}", chain.chain_id));
            }
            seen.push(chain.chain_id);
            if !chain.rpc_url.starts_with("http") {
                return Err(format!("Invalid RPC URL for chain {}: {}", chain.name, chain.rpc_url));
            }
            if chain.token_batch_size == Some(0) {
                return Err(format!("Token batch size for chain {} must be greater than 0", chain.name));
            }
        }

        if self.storage.backend == StorageBackend::Sqlite && !self.storage.database_url.starts_with("sqlite:") {
            return Err(format!("Invalid SQLite URL: {}", self.storage.database_url));
        }

        if !["json", "pretty"].contains(&self.logging.format.as_str()) {
            return Err("Logging format must be 'json' or 'pretty'".to_string());
        }

        Ok(())
    }
}
