//! Trade Store
//!
//! Append-only trade rows, deduplicated on `(trade_id, symbol, market_type)`.
//!
//! Dedup is enforced by the unique index alone: the insert is attempted and a
//! unique-constraint failure is reported as `InsertOutcome::Duplicate`. There
//! is no read-before-write, so concurrent writers on separate connections
//! cannot both store the same key.

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::aggregate::{roll_up, BarInterval, TradeBar};
use super::clock::{format_timestamp, millis_to_datetime, parse_timestamp, Clock};
use super::database::SharedConnection;
use super::error::{is_unique_violation, StoreError};
use super::model::{BatchOutcome, InsertOutcome, MarketType, NewTrade, Trade, TradeKey};
use super::range_index::{TimeRange, TRADE_COLUMNS, TRADE_RANGE_SQL};

const INSERT_TRADE_SQL: &str = r#"
INSERT INTO trades (
    id, event_time, symbol, trade_id, price, quantity,
    buyer_order_id, seller_order_id, is_buyer_maker, market_type, created_at
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
"#;

// =============================================================================
// Statistics
// =============================================================================

/// Write counters since the store was opened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeStoreStats {
    pub inserted: u64,
    pub duplicates: u64,
    /// Records that failed validation.
    pub rejected: u64,
    pub batch_writes: u64,
}

// =============================================================================
// Trade Store
// =============================================================================

pub struct TradeStore {
    conn: SharedConnection,
    clock: Arc<dyn Clock>,
    stats: Mutex<TradeStoreStats>,
}

impl TradeStore {
    /// Store over a connection whose schema is already migrated.
    pub fn new(conn: SharedConnection, clock: Arc<dyn Clock>) -> Self {
        Self {
            conn,
            clock,
            stats: Mutex::new(TradeStoreStats::default()),
        }
    }

    /// Insert one trade. A key that is already stored yields `Duplicate` and
    /// leaves the stored row untouched.
    pub fn insert(&self, trade: &NewTrade) -> Result<InsertOutcome, StoreError> {
        if let Err(e) = trade.validate() {
            self.stats.lock().rejected += 1;
            debug!(error = %e, trade_id = trade.trade_id, "Rejecting invalid trade");
            return Err(e.into());
        }

        let stored = self.stamp(trade);
        let conn = self.conn.lock();
        match insert_row(&conn, &stored) {
            Ok(_) => {
                self.stats.lock().inserted += 1;
                debug!(key = %stored.key(), event_time = stored.event_time, "Stored trade");
                Ok(InsertOutcome::Inserted(stored))
            }
            Err(e) if is_unique_violation(&e) => {
                self.stats.lock().duplicates += 1;
                debug!(key = %trade.key(), "Duplicate trade skipped");
                Ok(InsertOutcome::Duplicate)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Insert many trades in one immediate transaction.
    ///
    /// Every record is validated first; a single invalid record aborts the
    /// batch before anything is written. Duplicates (against stored rows or
    /// earlier records in the same batch) are counted, not fatal.
    pub fn insert_batch(&self, trades: &[NewTrade]) -> Result<BatchOutcome, StoreError> {
        if trades.is_empty() {
            return Ok(BatchOutcome::default());
        }

        for trade in trades {
            if let Err(e) = trade.validate() {
                self.stats.lock().rejected += 1;
                debug!(error = %e, trade_id = trade.trade_id, "Rejecting batch with invalid trade");
                return Err(e.into());
            }
        }

        let mut outcome = BatchOutcome::default();
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        for trade in trades {
            let stored = self.stamp(trade);
            match insert_row(&tx, &stored) {
                Ok(_) => outcome.inserted += 1,
                // Constraint failures abort the statement only, the transaction stays open
                Err(e) if is_unique_violation(&e) => outcome.duplicates += 1,
                Err(e) => return Err(e.into()),
            }
        }

        tx.commit()?;

        {
            let mut stats = self.stats.lock();
            stats.inserted += outcome.inserted as u64;
            stats.duplicates += outcome.duplicates as u64;
            stats.batch_writes += 1;
        }

        if outcome.duplicates > 0 {
            warn!(
                inserted = outcome.inserted,
                duplicates = outcome.duplicates,
                "Trade batch contained already-stored keys"
            );
        } else {
            info!(inserted = outcome.inserted, "Stored trade batch");
        }

        Ok(outcome)
    }

    /// Trades of one instrument with `event_time` inside `range`, oldest first.
    pub fn query_range(
        &self,
        symbol: &str,
        market_type: MarketType,
        range: TimeRange,
    ) -> Result<Vec<Trade>, StoreError> {
        if range.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(TRADE_RANGE_SQL)?;
        let rows = stmt
            .query_map(
                params![symbol, market_type.as_str(), range.start_ms, range.end_ms],
                TradeRow::read,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(TradeRow::decode).collect()
    }

    /// Look up a stored trade by its dedup key.
    pub fn find(&self, key: &TradeKey) -> Result<Option<Trade>, StoreError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {TRADE_COLUMNS} FROM trades \
                     WHERE trade_id = ?1 AND symbol = ?2 AND market_type = ?3"
                ),
                params![key.trade_id, key.symbol, key.market_type.as_str()],
                TradeRow::read,
            )
            .optional()?;
        row.map(TradeRow::decode).transpose()
    }

    /// First and last `event_time` stored for an instrument.
    pub fn time_coverage(
        &self,
        symbol: &str,
        market_type: MarketType,
    ) -> Result<Option<(i64, i64)>, StoreError> {
        let conn = self.conn.lock();
        let result = conn.query_row(
            r#"
            SELECT MIN(event_time), MAX(event_time)
            FROM trades
            WHERE symbol = ?1 AND market_type = ?2
            "#,
            params![symbol, market_type.as_str()],
            |row| {
                let min: Option<i64> = row.get(0)?;
                let max: Option<i64> = row.get(1)?;
                Ok((min, max))
            },
        )?;

        match result {
            (Some(min), Some(max)) => Ok(Some((min, max))),
            _ => Ok(None),
        }
    }

    pub fn count(&self, symbol: &str, market_type: MarketType) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM trades WHERE symbol = ?1 AND market_type = ?2",
            params![symbol, market_type.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Rows across every instrument.
    pub fn count_all(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM trades", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Close/volume bars over `range`.
    pub fn bars(
        &self,
        symbol: &str,
        market_type: MarketType,
        range: TimeRange,
        interval: BarInterval,
    ) -> Result<Vec<TradeBar>, StoreError> {
        let trades = self.query_range(symbol, market_type, range)?;
        roll_up(&trades, interval)
    }

    pub fn stats(&self) -> TradeStoreStats {
        self.stats.lock().clone()
    }

    /// New identity plus an ingestion time truncated to the stored precision.
    fn stamp(&self, trade: &NewTrade) -> Trade {
        let created_at = millis_to_datetime(self.clock.now_millis());
        Trade::from_new(trade, Uuid::new_v4(), created_at)
    }
}

fn insert_row(conn: &Connection, trade: &Trade) -> rusqlite::Result<usize> {
    conn.prepare_cached(INSERT_TRADE_SQL)?.execute(params![
        trade.id.to_string(),
        trade.event_time,
        trade.symbol,
        trade.trade_id,
        trade.price.to_string(),
        trade.quantity.to_string(),
        trade.buyer_order_id,
        trade.seller_order_id,
        trade.is_buyer_maker,
        trade.market_type.as_str(),
        format_timestamp(&trade.created_at),
    ])
}

// =============================================================================
// Row Decoding
// =============================================================================

/// Columns as SQLite returns them, before parsing.
struct TradeRow {
    id: String,
    event_time: i64,
    symbol: String,
    trade_id: i64,
    price: String,
    quantity: String,
    buyer_order_id: i64,
    seller_order_id: i64,
    is_buyer_maker: bool,
    market_type: String,
    created_at: String,
}

impl TradeRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            event_time: row.get(1)?,
            symbol: row.get(2)?,
            trade_id: row.get(3)?,
            price: row.get(4)?,
            quantity: row.get(5)?,
            buyer_order_id: row.get(6)?,
            seller_order_id: row.get(7)?,
            is_buyer_maker: row.get(8)?,
            market_type: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    fn decode(self) -> Result<Trade, StoreError> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| StoreError::corrupt("trades", format!("id '{}': {e}", self.id)))?;
        let decimal = |field: &str, raw: &str| {
            Decimal::from_str_exact(raw)
                .map_err(|_| StoreError::corrupt("trades", format!("{field} '{raw}' for {id}")))
        };
        let market_type = self
            .market_type
            .parse::<MarketType>()
            .map_err(|e| StoreError::corrupt("trades", e.to_string()))?;
        let created_at = parse_timestamp(&self.created_at).ok_or_else(|| {
            StoreError::corrupt("trades", format!("created_at '{}' for {id}", self.created_at))
        })?;

        Ok(Trade {
            price: decimal("price", &self.price)?,
            quantity: decimal("quantity", &self.quantity)?,
            id,
            event_time: self.event_time,
            symbol: self.symbol,
            trade_id: self.trade_id,
            buyer_order_id: self.buyer_order_id,
            seller_order_id: self.seller_order_id,
            is_buyer_maker: self.is_buyer_maker,
            market_type,
            created_at,
        })
    }
}
