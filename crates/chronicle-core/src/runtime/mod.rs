//! Runtime initialization and lifecycle management.
//!
//! Wires configuration into stores, chain clients, registries and the
//! [`MultiChainIndexer`](crate::indexer::MultiChainIndexer), for the daemon as
//! well as embedders.
//!
//! # Examples
//!
//! ```no_run
//! use chronicle_core::{config::AppConfig, runtime::IndexerRuntime};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AppConfig::load()?;
//!     let runtime = IndexerRuntime::builder().with_config(config).build().await?;
//!
//!     let mut events = runtime.subscribe();
//!     runtime.start().await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         println!("{event:?}");
//!     }
//!
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod builder;
pub mod components;
pub mod lifecycle;

pub use builder::{IndexerRuntimeBuilder, RuntimeError};
pub use components::IndexerComponents;
pub use lifecycle::IndexerRuntime;
