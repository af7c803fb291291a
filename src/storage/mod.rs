//! Market Data Storage
//!
//! Durable, append-only storage for venue trades and order book snapshots.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        MarketDataStore                          │
//! │  (opens connection, applies schema changes, builds stores)      │
//! └─────────────────────────────────────────────────────────────────┘
//!                                │
//!        ┌───────────────────────┼───────────────────────┐
//!        ▼                       ▼                       ▼
//! ┌─────────────┐        ┌─────────────┐        ┌─────────────┐
//! │ Schema      │        │ TradeStore  │        │ Snapshot    │
//! │ Migrator    │        │ (dedup)     │        │ Store       │
//! └─────────────┘        └──────┬──────┘        └──────┬──────┘
//!                               │                      │
//!                               └──────────┬───────────┘
//!                                          ▼
//!                                   ┌─────────────┐
//!                                   │ RangeIndex  │
//!                                   │ (time)      │
//!                                   └──────┬──────┘
//!                                          ▼
//!                                   ┌─────────────┐
//!                                   │ Timeline /  │
//!                                   │ ReplayFeed  │
//!                                   └─────────────┘
//! ```
//!
//! # Guarantees
//!
//! - **Trades**: at most one row per `(trade_id, symbol, market_type)`,
//!   enforced by a unique index; the first write wins
//! - **Snapshots**: every valid capture is its own row
//! - **Decimals**: exact text, never floating point
//! - **Rows**: immutable once written
//! - **Schema**: versioned, additive, each change atomic

pub mod aggregate;
pub mod book;
pub mod clock;
pub mod database;
pub mod error;
pub mod ingest;
pub mod migrations;
pub mod model;
pub mod range_index;
pub mod snapshot_store;
pub mod timeline;
pub mod trade_store;

#[cfg(test)]
mod migrations_tests;

pub use aggregate::{roll_up, BarInterval, TradeBar};
pub use book::{BookSide, NewSnapshot, PriceLevel, RawSnapshot, Side, Snapshot};
pub use clock::{Clock, ManualClock, Millis, SystemClock};
pub use database::{
    open_connection, open_existing_connection, open_memory_connection, ConnectionOptions,
    MarketDataStore, SharedConnection,
};
pub use error::{StoreError, ValidationError};
pub use ingest::{import_snapshots, import_trades, ImportSummary};
pub use migrations::{
    applied_versions, AppliedChange, MigrationReport, SchemaChange, SchemaMigrator,
    STANDARD_CHANGES,
};
pub use model::{BatchOutcome, InsertOutcome, MarketType, NewTrade, RawTrade, Trade, TradeKey};
pub use range_index::{IndexUsage, RangeIndex, TimeRange};
pub use snapshot_store::{SnapshotStore, SnapshotStoreStats, UpdateIdRegression};
pub use timeline::{merge, MarketEvent, ReplayFeed, Timestamped};
pub use trade_store::{TradeStore, TradeStoreStats};
