//! Database Handle
//!
//! Opens SQLite connections with the journaling and locking settings every
//! writer needs, then brings the schema up to date before any store is built.

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::clock::{Clock, SystemClock};
use super::error::StoreError;
use super::migrations::{MigrationReport, SchemaMigrator};
use super::model::MarketType;
use super::range_index::{IndexUsage, RangeIndex, TimeRange};
use super::snapshot_store::SnapshotStore;
use super::timeline::{self, MarketEvent};
use super::trade_store::TradeStore;

/// Connection shared by the stores of one process.
pub type SharedConnection = Arc<Mutex<Connection>>;

/// Per-connection settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionOptions {
    /// How long a writer waits on a locked database before failing.
    pub busy_timeout_ms: u64,
    /// Page cache size in KiB.
    pub cache_size_kib: i64,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            cache_size_kib: 32_000,
        }
    }
}

/// Open (or create) a database file with WAL journaling and a busy timeout.
pub fn open_connection(db_path: &str, options: &ConnectionOptions) -> Result<Connection, StoreError> {
    let path = Path::new(db_path);

    // Create parent directory if needed
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;

    let conn = Connection::open_with_flags(db_path, flags)?;
    conn.busy_timeout(Duration::from_millis(options.busy_timeout_ms))?;
    conn.execute_batch(&format!(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA cache_size = -{};
         PRAGMA temp_store = MEMORY;",
        options.cache_size_kib.max(0)
    ))?;

    Ok(conn)
}

/// Open a database file that must already exist. Never creates the file or
/// its directory, so a mistyped path fails instead of yielding an empty archive.
pub fn open_existing_connection(
    db_path: &str,
    options: &ConnectionOptions,
) -> Result<Connection, StoreError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX;

    let conn = Connection::open_with_flags(db_path, flags)?;
    conn.busy_timeout(Duration::from_millis(options.busy_timeout_ms))?;
    Ok(conn)
}

/// In-memory database. Only visible to the returned connection.
pub fn open_memory_connection() -> Result<Connection, StoreError> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("PRAGMA temp_store = MEMORY;")?;
    Ok(conn)
}

// =============================================================================
// Market Data Store
// =============================================================================

/// Both stores over one migrated connection.
pub struct MarketDataStore {
    conn: SharedConnection,
    trades: TradeStore,
    snapshots: SnapshotStore,
    migration: MigrationReport,
}

impl MarketDataStore {
    /// Open a database file, apply pending schema changes, and build the stores.
    ///
    /// Fails with `StoreError::SchemaApply` when the schema cannot be brought
    /// up to date; callers treat that as fatal.
    pub fn open(
        db_path: &str,
        options: &ConnectionOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let conn = open_connection(db_path, options)?;
        let store = Self::from_connection(conn, clock)?;
        info!(
            db_path,
            applied = store.migration.applied.len(),
            "Opened market data store"
        );
        Ok(store)
    }

    /// In-memory store on the system clock.
    pub fn open_memory() -> Result<Self, StoreError> {
        Self::open_memory_with_clock(Arc::new(SystemClock))
    }

    pub fn open_memory_with_clock(clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        Self::from_connection(open_memory_connection()?, clock)
    }

    /// Migrate an already-open connection and build the stores on it.
    pub fn from_connection(mut conn: Connection, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let migration = SchemaMigrator::standard()
            .with_clock(clock.clone())
            .apply(&mut conn)?;

        let conn: SharedConnection = Arc::new(Mutex::new(conn));
        Ok(Self {
            trades: TradeStore::new(conn.clone(), clock.clone()),
            snapshots: SnapshotStore::new(conn.clone(), clock),
            conn,
            migration,
        })
    }

    pub fn trades(&self) -> &TradeStore {
        &self.trades
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    /// What the startup migration did.
    pub fn migration_report(&self) -> &MigrationReport {
        &self.migration
    }

    pub fn connection(&self) -> SharedConnection {
        self.conn.clone()
    }

    /// Query plans of both range statements.
    pub fn index_usage(&self) -> Result<Vec<IndexUsage>, StoreError> {
        RangeIndex::verify(&self.conn.lock())
    }

    /// Trades and snapshots of one instrument, merged into a single time-ordered pass.
    pub fn timeline(
        &self,
        symbol: &str,
        market_type: MarketType,
        range: TimeRange,
    ) -> Result<Vec<MarketEvent>, StoreError> {
        let trades = self.trades.query_range(symbol, market_type, range)?;
        let snapshots = self.snapshots.query_range(symbol, market_type, range)?;
        Ok(timeline::merge(trades, snapshots))
    }
}
