//! Tickarchive Library
//!
//! Market-data persistence: schema evolution, deduplicated trades, order book
//! snapshots, and time-range access. Used by the `tickarchive` binary and the
//! integration tests.

pub mod config;
pub mod storage;

pub use config::ArchiveConfig;
pub use storage::{MarketDataStore, StoreError};
