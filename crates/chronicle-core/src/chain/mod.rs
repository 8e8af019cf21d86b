//! Per-chain head tracking.
//!
//! One [`ChainHead`] exists per chain group and is shared by the live watcher
//! and the backfill task as the last known state of the chain:
//!
//! ```text
//!                ┌───────────┐
//!                │ ChainHead │  ArcSwap, wait-free reads
//!                └─────┬─────┘
//!          ┌───────────┼────────────┐
//!          ▼           ▼            ▼
//!   LiveWatchTask  Backfill    ChainIndexer
//!   (refreshes)    (start head) (omit_history)
//! ```

pub mod head;

pub use head::ChainHead;
