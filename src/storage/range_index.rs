//! Range Query Index
//!
//! Time-ordered access paths over both stores. Trades are ordered by
//! `idx_trades_event_time`, snapshots by `idx_order_books_created_at`. The
//! range statements live here so `RangeIndex::verify` checks the exact SQL the
//! stores execute.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::clock::{format_millis, Millis};
use super::error::StoreError;
use super::migrations::{ORDER_BOOKS_TIME_INDEX, TRADES_TIME_INDEX};

/// Largest instant that renders in the fixed-width `created_at` form
/// (9999-12-31T23:59:59.999Z).
pub const MAX_TEXT_MILLIS: Millis = 253_402_300_799_999;

pub(crate) const TRADE_COLUMNS: &str = "id, event_time, symbol, trade_id, price, quantity, \
     buyer_order_id, seller_order_id, is_buyer_maker, market_type, created_at";

pub(crate) const SNAPSHOT_COLUMNS: &str =
    "id, last_update_id, symbol, bids, asks, market_type, created_at";

pub(crate) const TRADE_RANGE_SQL: &str = "SELECT id, event_time, symbol, trade_id, price, quantity, \
     buyer_order_id, seller_order_id, is_buyer_maker, market_type, created_at \
     FROM trades \
     WHERE symbol = ?1 AND market_type = ?2 AND event_time >= ?3 AND event_time <= ?4 \
     ORDER BY event_time ASC, trade_id ASC";

pub(crate) const SNAPSHOT_RANGE_SQL: &str = "SELECT id, last_update_id, symbol, bids, asks, market_type, created_at \
     FROM order_books \
     WHERE symbol = ?1 AND market_type = ?2 AND created_at >= ?3 AND created_at <= ?4 \
     ORDER BY created_at ASC, last_update_id ASC";

// =============================================================================
// Time Range
// =============================================================================

/// Inclusive epoch-millisecond window `[start_ms, end_ms]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start_ms: Millis,
    pub end_ms: Millis,
}

impl TimeRange {
    pub fn new(start_ms: Millis, end_ms: Millis) -> Self {
        Self { start_ms, end_ms }
    }

    /// Everything from the epoch onward.
    pub fn all() -> Self {
        Self::new(0, Millis::MAX)
    }

    /// Open bounds default to the widest window.
    pub fn from_bounds(start_ms: Option<Millis>, end_ms: Option<Millis>) -> Self {
        Self::new(start_ms.unwrap_or(0), end_ms.unwrap_or(Millis::MAX))
    }

    /// An inverted window matches nothing.
    pub fn is_empty(&self) -> bool {
        self.start_ms > self.end_ms
    }

    pub fn contains(&self, t: Millis) -> bool {
        self.start_ms <= t && t <= self.end_ms
    }

    /// Bounds rendered for comparison against `created_at` text.
    pub(crate) fn text_bounds(&self) -> (String, String) {
        let clamp = |ms: Millis| ms.clamp(0, MAX_TEXT_MILLIS);
        (format_millis(clamp(self.start_ms)), format_millis(clamp(self.end_ms)))
    }
}

// =============================================================================
// Plan Verification
// =============================================================================

/// How SQLite plans one of the range statements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexUsage {
    pub table: &'static str,
    pub index: &'static str,
    /// `EXPLAIN QUERY PLAN` detail lines.
    pub plan: Vec<String>,
    /// Range is served by `index`.
    pub uses_index: bool,
    /// Plan falls back to scanning the whole table.
    pub full_scan: bool,
}

impl IndexUsage {
    pub fn is_healthy(&self) -> bool {
        self.uses_index && !self.full_scan
    }
}

/// Access-path checks for the range statements.
pub struct RangeIndex;

impl RangeIndex {
    /// Plan both range statements and report which index each one uses.
    pub fn verify(conn: &Connection) -> Result<Vec<IndexUsage>, StoreError> {
        let usages = vec![
            explain(conn, "trades", TRADES_TIME_INDEX, TRADE_RANGE_SQL)?,
            explain(conn, "order_books", ORDER_BOOKS_TIME_INDEX, SNAPSHOT_RANGE_SQL)?,
        ];
        for usage in usages.iter().filter(|u| !u.is_healthy()) {
            warn!(
                table = usage.table,
                index = usage.index,
                plan = ?usage.plan,
                "Range query is not served by its time index"
            );
        }
        Ok(usages)
    }
}

fn explain(
    conn: &Connection,
    table: &'static str,
    index: &'static str,
    sql: &str,
) -> Result<IndexUsage, StoreError> {
    let mut stmt = conn.prepare(&format!("EXPLAIN QUERY PLAN {sql}"))?;
    // Placeholder values; only the plan is read
    let plan = stmt
        .query_map(params!["", "", 0i64, 0i64], |row| row.get::<_, String>(3))?
        .collect::<Result<Vec<_>, _>>()?;

    let uses_index = plan.iter().any(|detail| detail.contains(index));
    let full_scan = plan
        .iter()
        .any(|detail| detail.starts_with("SCAN") && !detail.contains("INDEX"));

    Ok(IndexUsage {
        table,
        index,
        plan,
        uses_index,
        full_scan,
    })
}
