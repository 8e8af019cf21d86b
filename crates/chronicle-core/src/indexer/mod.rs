//! Orchestration of per-chain task groups.
//!
//! [`MultiChainIndexer`] owns one [`ChainIndexer`] per chain. Each chain
//! indexer owns its task group and joins it on stop.

mod chain;
mod multi;

pub use chain::ChainIndexer;
pub use multi::{IndexerDeps, MultiChainIndexer};
