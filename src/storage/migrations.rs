//! Schema Evolution
//!
//! Ordered, additive schema changes tracked in a `schema_migrations` ledger.
//!
//! # Contract
//!
//! - Changes run in strictly increasing version order; a later change may
//!   assume every earlier one succeeded.
//! - Every change is idempotent on its own (`IF NOT EXISTS`, column checks), so
//!   two deployments racing through startup both succeed.
//! - Each change runs in its own `BEGIN IMMEDIATE` transaction together with
//!   its ledger row. A failing change rolls back completely and nothing after
//!   it runs.
//! - Only schema and the ledger are touched, never data rows.
//!
//! Version tags are UTC timestamps (`YYYYMMDDhhmmss`).

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, TransactionBehavior};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::clock::{format_timestamp, parse_timestamp, Clock, SystemClock};
use super::error::StoreError;

/// Ledger of applied changes.
pub const LEDGER_TABLE: &str = "schema_migrations";

/// Non-unique time index on `trades(event_time)`.
pub const TRADES_TIME_INDEX: &str = "idx_trades_event_time";

/// Non-unique time index on `order_books(created_at)`.
pub const ORDER_BOOKS_TIME_INDEX: &str = "idx_order_books_created_at";

/// Unique dedup index on `trades(trade_id, symbol, market_type)`.
pub const TRADES_DEDUP_INDEX: &str = "idx_trades_dedup";

/// Body of a schema change. Runs inside the change's transaction.
pub type ChangeFn = fn(&Connection) -> rusqlite::Result<()>;

/// One versioned schema change.
#[derive(Clone, Copy)]
pub struct SchemaChange {
    pub version: u64,
    pub name: &'static str,
    pub apply: ChangeFn,
}

impl fmt::Debug for SchemaChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaChange")
            .field("version", &self.version)
            .field("name", &self.name)
            .finish()
    }
}

/// Changes shipped with this build, oldest first.
pub const STANDARD_CHANGES: [SchemaChange; 3] = [
    SchemaChange {
        version: 20241118093000,
        name: "create_market_data_tables",
        apply: create_market_data_tables,
    },
    SchemaChange {
        version: 20241203154500,
        name: "add_market_type",
        apply: add_market_type,
    },
    SchemaChange {
        version: 20250107081500,
        name: "add_trade_dedup_index",
        apply: add_trade_dedup_index,
    },
];

// =============================================================================
// Change Bodies
// =============================================================================

const CREATE_MARKET_DATA_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS trades (
    id TEXT PRIMARY KEY,
    event_time INTEGER NOT NULL,
    symbol TEXT NOT NULL CHECK (length(symbol) <= 20),
    trade_id INTEGER NOT NULL,
    -- exact decimal text, never REAL
    price TEXT NOT NULL,
    quantity TEXT NOT NULL,
    buyer_order_id INTEGER NOT NULL,
    seller_order_id INTEGER NOT NULL,
    is_buyer_maker INTEGER NOT NULL,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_trades_event_time
    ON trades(event_time);

CREATE TABLE IF NOT EXISTS order_books (
    id TEXT PRIMARY KEY,
    last_update_id INTEGER NOT NULL,
    symbol TEXT NOT NULL CHECK (length(symbol) <= 20),
    -- [[price, quantity], ...] as decimal strings
    bids TEXT NOT NULL,
    asks TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_order_books_created_at
    ON order_books(created_at);
"#;

fn create_market_data_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(CREATE_MARKET_DATA_TABLES)
}

fn add_market_type(conn: &Connection) -> rusqlite::Result<()> {
    for table in ["trades", "order_books"] {
        if column_exists(conn, table, "market_type")? {
            debug!(table, "market_type already present");
            continue;
        }
        // Existing rows predate the column and are all spot
        conn.execute_batch(&format!(
            "ALTER TABLE {table} ADD COLUMN market_type TEXT NOT NULL DEFAULT 'SPOT' \
             CHECK (length(market_type) <= 10)"
        ))?;
    }
    Ok(())
}

fn add_trade_dedup_index(conn: &Connection) -> rusqlite::Result<()> {
    // Fails while duplicate keys exist; they must be resolved before this runs.
    conn.execute_batch(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_trades_dedup \
         ON trades(trade_id, symbol, market_type)",
    )
}

// =============================================================================
// Schema Introspection
// =============================================================================

/// Whether `table` has a column named `column`.
pub fn column_exists(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
        params![table, column],
        |row| row.get::<_, i64>(0),
    )
    .map(|count| count > 0)
}

/// Whether an index with this name exists.
pub fn index_exists(conn: &Connection, index: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'index' AND name = ?1)",
        params![index],
        |row| row.get(0),
    )
}

/// Whether a table with this name exists.
pub fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        params![table],
        |row| row.get(0),
    )
}

// =============================================================================
// Ledger
// =============================================================================

/// A ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedChange {
    pub version: u64,
    pub name: String,
    pub applied_at: DateTime<Utc>,
}

/// What one `apply` call did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// Changes applied by this call, in order.
    pub applied: Vec<u64>,
    /// Changes already in the ledger.
    pub skipped: Vec<u64>,
    /// Ledger versions this build does not know (database is newer than the binary).
    pub unknown: Vec<u64>,
}

impl MigrationReport {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

fn ensure_ledger(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )",
    )
}

/// Ledger contents in version order. Empty when the ledger does not exist yet.
pub fn applied_versions(conn: &Connection) -> Result<Vec<AppliedChange>, StoreError> {
    if !table_exists(conn, LEDGER_TABLE)? {
        return Ok(Vec::new());
    }

    let mut stmt =
        conn.prepare("SELECT version, name, applied_at FROM schema_migrations ORDER BY version")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(version, name, applied_at)| {
            let applied_at = parse_timestamp(&applied_at).ok_or_else(|| {
                StoreError::corrupt(LEDGER_TABLE, format!("bad applied_at '{applied_at}'"))
            })?;
            Ok(AppliedChange {
                version: version as u64,
                name,
                applied_at,
            })
        })
        .collect()
}

// =============================================================================
// Migrator
// =============================================================================

/// Applies an ordered list of schema changes.
pub struct SchemaMigrator {
    changes: Vec<SchemaChange>,
    clock: Arc<dyn Clock>,
}

impl SchemaMigrator {
    /// Migrator for the changes shipped with this build.
    pub fn standard() -> Self {
        Self {
            changes: STANDARD_CHANGES.to_vec(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Migrator for a custom change list. Versions must be strictly increasing.
    pub fn new(changes: Vec<SchemaChange>) -> Result<Self, StoreError> {
        for pair in changes.windows(2) {
            if pair[1].version <= pair[0].version {
                return Err(StoreError::InvalidMigrationOrder {
                    version: pair[1].version,
                    name: pair[1].name,
                    previous: pair[0].version,
                });
            }
        }
        Ok(Self {
            changes,
            clock: Arc::new(SystemClock),
        })
    }

    /// Stamp ledger rows from `clock`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Highest version this migrator knows.
    pub fn target_version(&self) -> Option<u64> {
        self.changes.last().map(|c| c.version)
    }

    /// Changes not yet recorded in the ledger.
    pub fn pending(&self, conn: &Connection) -> Result<Vec<SchemaChange>, StoreError> {
        let applied: BTreeSet<u64> = applied_versions(conn)?
            .into_iter()
            .map(|a| a.version)
            .collect();
        Ok(self
            .changes
            .iter()
            .filter(|c| !applied.contains(&c.version))
            .copied()
            .collect())
    }

    /// Bring the database up to `target_version`.
    ///
    /// Stops at the first failing change and returns `StoreError::SchemaApply`.
    pub fn apply(&self, conn: &mut Connection) -> Result<MigrationReport, StoreError> {
        ensure_ledger(conn)?;

        let known: BTreeSet<u64> = self.changes.iter().map(|c| c.version).collect();
        let mut report = MigrationReport::default();

        for applied in applied_versions(conn)? {
            if !known.contains(&applied.version) {
                warn!(
                    version = applied.version,
                    name = %applied.name,
                    "Ledger has a schema change this build does not know"
                );
                report.unknown.push(applied.version);
            }
        }

        for change in &self.changes {
            let applied_at = format_timestamp(&self.clock.now());
            let ran = apply_one(conn, change, &applied_at).map_err(|source| {
                StoreError::SchemaApply {
                    version: change.version,
                    name: change.name,
                    source,
                }
            })?;

            if ran {
                info!(version = change.version, name = change.name, "Applied schema change");
                report.applied.push(change.version);
            } else {
                debug!(version = change.version, name = change.name, "Schema change already applied");
                report.skipped.push(change.version);
            }
        }

        Ok(report)
    }
}

/// Run one change and record it, atomically. Returns false if the ledger already had it.
fn apply_one(conn: &mut Connection, change: &SchemaChange, applied_at: &str) -> rusqlite::Result<bool> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    // Checked under the write lock: a concurrent deployment may have just applied it
    let recorded: bool = tx.query_row(
        "SELECT EXISTS(SELECT 1 FROM schema_migrations WHERE version = ?1)",
        params![change.version as i64],
        |row| row.get(0),
    )?;
    if recorded {
        return Ok(false);
    }

    (change.apply)(&tx)?;
    tx.execute(
        "INSERT OR IGNORE INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
        params![change.version as i64, change.name, applied_at],
    )?;
    tx.commit()?;
    Ok(true)
}
