//! OrderBook Snapshot Store
//!
//! Every valid snapshot is appended as its own row; there is no dedup.
//! Two captures with the same `last_update_id` are distinct observations.

use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::book::{BookSide, NewSnapshot, Side, Snapshot};
use super::clock::{format_timestamp, millis_to_datetime, parse_timestamp, Clock};
use super::database::SharedConnection;
use super::error::StoreError;
use super::model::MarketType;
use super::range_index::{TimeRange, SNAPSHOT_COLUMNS, SNAPSHOT_RANGE_SQL};

const INSERT_SNAPSHOT_SQL: &str = r#"
INSERT INTO order_books (id, last_update_id, symbol, bids, asks, market_type, created_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
"#;

/// Write counters since the store was opened.
#[derive(Debug, Default)]
pub struct SnapshotStoreStats {
    pub snapshots_stored: AtomicU64,
    pub snapshots_rejected: AtomicU64,
    pub batch_writes: AtomicU64,
}

/// Consecutive snapshots whose `last_update_id` did not increase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateIdRegression {
    pub previous_id: Uuid,
    pub previous_update_id: i64,
    pub next_id: Uuid,
    pub next_update_id: i64,
    pub next_created_at_ms: i64,
}

pub struct SnapshotStore {
    conn: SharedConnection,
    clock: Arc<dyn Clock>,
    stats: SnapshotStoreStats,
}

impl SnapshotStore {
    /// Store over a connection whose schema is already migrated.
    pub fn new(conn: SharedConnection, clock: Arc<dyn Clock>) -> Self {
        Self {
            conn,
            clock,
            stats: SnapshotStoreStats::default(),
        }
    }

    /// Append one snapshot.
    pub fn append(&self, snapshot: &NewSnapshot) -> Result<Snapshot, StoreError> {
        if let Err(e) = snapshot.validate() {
            self.stats.snapshots_rejected.fetch_add(1, Ordering::Relaxed);
            debug!(error = %e, "Rejecting invalid snapshot");
            return Err(e.into());
        }

        let stored = self.stamp(snapshot);
        let conn = self.conn.lock();
        insert_row(&conn, &stored)?;
        self.stats.snapshots_stored.fetch_add(1, Ordering::Relaxed);

        debug!(
            symbol = %stored.symbol,
            market_type = %stored.market_type,
            last_update_id = stored.last_update_id,
            bid_levels = stored.bids.len(),
            ask_levels = stored.asks.len(),
            "Stored book snapshot"
        );
        if snapshot.is_crossed() {
            warn!(
                symbol = %stored.symbol,
                last_update_id = stored.last_update_id,
                "Stored crossed book snapshot"
            );
        }

        Ok(stored)
    }

    /// Append many snapshots in one immediate transaction. An invalid
    /// snapshot aborts the batch before anything is written.
    pub fn append_batch(&self, snapshots: &[NewSnapshot]) -> Result<usize, StoreError> {
        if snapshots.is_empty() {
            return Ok(0);
        }

        for snapshot in snapshots {
            if let Err(e) = snapshot.validate() {
                self.stats.snapshots_rejected.fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        for snapshot in snapshots {
            insert_row(&tx, &self.stamp(snapshot))?;
        }
        tx.commit()?;

        self.stats
            .snapshots_stored
            .fetch_add(snapshots.len() as u64, Ordering::Relaxed);
        self.stats.batch_writes.fetch_add(1, Ordering::Relaxed);
        info!(count = snapshots.len(), "Stored snapshot batch");

        Ok(snapshots.len())
    }

    /// Snapshots of one instrument captured inside `range`, oldest first.
    pub fn query_range(
        &self,
        symbol: &str,
        market_type: MarketType,
        range: TimeRange,
    ) -> Result<Vec<Snapshot>, StoreError> {
        if range.is_empty() {
            return Ok(Vec::new());
        }

        let (start, end) = range.text_bounds();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(SNAPSHOT_RANGE_SQL)?;
        let rows = stmt
            .query_map(
                params![symbol, market_type.as_str(), start, end],
                SnapshotRow::read,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(SnapshotRow::decode).collect()
    }

    /// Most recently captured snapshot of an instrument.
    pub fn latest(
        &self,
        symbol: &str,
        market_type: MarketType,
    ) -> Result<Option<Snapshot>, StoreError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {SNAPSHOT_COLUMNS} FROM order_books \
                     WHERE symbol = ?1 AND market_type = ?2 \
                     ORDER BY created_at DESC, last_update_id DESC \
                     LIMIT 1"
                ),
                params![symbol, market_type.as_str()],
                SnapshotRow::read,
            )
            .optional()?;
        row.map(SnapshotRow::decode).transpose()
    }

    pub fn count(&self, symbol: &str, market_type: MarketType) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM order_books WHERE symbol = ?1 AND market_type = ?2",
            params![symbol, market_type.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Rows across every instrument.
    pub fn count_all(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM order_books", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Walk snapshots in capture order and report every step where
    /// `last_update_id` failed to increase. Stored rows are never rejected
    /// for this; it is a read-side diagnostic.
    pub fn find_update_id_regressions(
        &self,
        symbol: &str,
        market_type: MarketType,
        range: TimeRange,
    ) -> Result<Vec<UpdateIdRegression>, StoreError> {
        if range.is_empty() {
            return Ok(Vec::new());
        }

        let (start, end) = range.text_bounds();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, last_update_id, created_at
            FROM order_books
            WHERE symbol = ?1 AND market_type = ?2 AND created_at >= ?3 AND created_at <= ?4
            ORDER BY created_at ASC, last_update_id ASC
            "#,
        )?;

        let seqs: Vec<(String, i64, String)> = stmt
            .query_map(params![symbol, market_type.as_str(), start, end], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut regressions = Vec::new();
        for window in seqs.windows(2) {
            let (prev_id, prev_update, _) = &window[0];
            let (next_id, next_update, next_created) = &window[1];
            if next_update <= prev_update {
                regressions.push(UpdateIdRegression {
                    previous_id: parse_id(prev_id)?,
                    previous_update_id: *prev_update,
                    next_id: parse_id(next_id)?,
                    next_update_id: *next_update,
                    next_created_at_ms: parse_created_at(next_created)?.timestamp_millis(),
                });
            }
        }

        if !regressions.is_empty() {
            warn!(
                symbol,
                market_type = %market_type,
                count = regressions.len(),
                "last_update_id did not increase between snapshots"
            );
        }

        Ok(regressions)
    }

    pub fn stats(&self) -> &SnapshotStoreStats {
        &self.stats
    }

    fn stamp(&self, snapshot: &NewSnapshot) -> Snapshot {
        let created_at = millis_to_datetime(self.clock.now_millis());
        Snapshot::from_new(snapshot, Uuid::new_v4(), created_at)
    }
}

fn insert_row(conn: &Connection, snapshot: &Snapshot) -> Result<(), StoreError> {
    let bids = snapshot.bids.to_json()?;
    let asks = snapshot.asks.to_json()?;
    conn.prepare_cached(INSERT_SNAPSHOT_SQL)?.execute(params![
        snapshot.id.to_string(),
        snapshot.last_update_id,
        snapshot.symbol,
        bids,
        asks,
        snapshot.market_type.as_str(),
        format_timestamp(&snapshot.created_at),
    ])?;
    Ok(())
}

fn parse_id(raw: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|e| StoreError::corrupt("order_books", format!("id '{raw}': {e}")))
}

fn parse_created_at(raw: &str) -> Result<chrono::DateTime<chrono::Utc>, StoreError> {
    parse_timestamp(raw)
        .ok_or_else(|| StoreError::corrupt("order_books", format!("created_at '{raw}'")))
}

struct SnapshotRow {
    id: String,
    last_update_id: i64,
    symbol: String,
    bids: String,
    asks: String,
    market_type: String,
    created_at: String,
}

impl SnapshotRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            last_update_id: row.get(1)?,
            symbol: row.get(2)?,
            bids: row.get(3)?,
            asks: row.get(4)?,
            market_type: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn decode(self) -> Result<Snapshot, StoreError> {
        let side = |side: Side, raw: &str| {
            BookSide::from_json(side, raw)
                .map_err(|e| StoreError::corrupt("order_books", format!("{}: {e}", self.id)))
        };

        Ok(Snapshot {
            bids: side(Side::Bid, &self.bids)?,
            asks: side(Side::Ask, &self.asks)?,
            market_type: self
                .market_type
                .parse::<MarketType>()
                .map_err(|e| StoreError::corrupt("order_books", e.to_string()))?,
            created_at: parse_created_at(&self.created_at)?,
            id: parse_id(&self.id)?,
            last_update_id: self.last_update_id,
            symbol: self.symbol,
        })
    }
}
