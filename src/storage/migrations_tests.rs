//! Schema Evolution Tests
//!
//! These tests verify that:
//! 1. Re-running the market_type change leaves exactly one column per table
//! 2. The dedup index change fails cleanly over duplicate rows
//! 3. Rows written before market_type existed read back as SPOT
//! 4. A failing change leaves none of its DDL behind
//! 5. Unknown ledger versions do not block startup
//! 6. Any partially migrated database converges to the same schema

use proptest::prelude::*;
use rusqlite::{params, Connection};

use crate::storage::clock::ManualClock;
use crate::storage::database::MarketDataStore;
use crate::storage::error::StoreError;
use crate::storage::migrations::{
    applied_versions, index_exists, table_exists, SchemaChange, SchemaMigrator, STANDARD_CHANGES,
    TRADES_DEDUP_INDEX,
};
use crate::storage::model::MarketType;
use crate::storage::range_index::TimeRange;

const ADD_MARKET_TYPE: u64 = 20241203154500;
const ADD_DEDUP_INDEX: u64 = 20250107081500;

fn migrator_through(count: usize) -> SchemaMigrator {
    SchemaMigrator::new(STANDARD_CHANGES[..count].to_vec()).unwrap()
}

fn market_type_columns(conn: &Connection, table: &str) -> i64 {
    conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = 'market_type'",
        params![table],
        |row| row.get(0),
    )
    .unwrap()
}

fn ledger_versions(conn: &Connection) -> Vec<u64> {
    applied_versions(conn)
        .unwrap()
        .into_iter()
        .map(|a| a.version)
        .collect()
}

fn schema_objects(conn: &Connection) -> Vec<(String, String, Option<String>)> {
    let mut stmt = conn
        .prepare(
            "SELECT type, name, sql FROM sqlite_master \
             WHERE name NOT LIKE 'sqlite_%' ORDER BY type, name",
        )
        .unwrap();
    stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}

fn insert_raw_trade(conn: &Connection, id: &str, trade_id: i64) {
    conn.execute(
        "INSERT INTO trades (id, event_time, symbol, trade_id, price, quantity, \
         buyer_order_id, seller_order_id, is_buyer_maker) \
         VALUES (?1, 1000, 'BTCUSDT', ?2, '100.5', '0.25', 1, 2, 0)",
        params![id, trade_id],
    )
    .unwrap();
}

// =============================================================================
// TEST 1: market_type change is idempotent
// =============================================================================

#[test]
fn test_market_type_change_runs_twice() {
    let mut conn = Connection::open_in_memory().unwrap();
    SchemaMigrator::standard().apply(&mut conn).unwrap();

    // Forget it was applied so the migrator runs it again against the live schema
    conn.execute(
        "DELETE FROM schema_migrations WHERE version = ?1",
        params![ADD_MARKET_TYPE as i64],
    )
    .unwrap();

    let report = SchemaMigrator::standard().apply(&mut conn).unwrap();
    assert_eq!(report.applied, vec![ADD_MARKET_TYPE]);
    assert_eq!(market_type_columns(&conn, "trades"), 1);
    assert_eq!(market_type_columns(&conn, "order_books"), 1);
}

// =============================================================================
// TEST 2: dedup index over pre-existing duplicates
// =============================================================================

fn create_followup_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("CREATE TABLE followup (id INTEGER PRIMARY KEY)")
}

#[test]
fn test_dedup_index_fails_over_duplicates() {
    let mut conn = Connection::open_in_memory().unwrap();
    migrator_through(2).apply(&mut conn).unwrap();

    // Same key twice, written before the unique index existed
    insert_raw_trade(&conn, "a", 100);
    insert_raw_trade(&conn, "b", 100);

    let mut changes = STANDARD_CHANGES.to_vec();
    changes.push(SchemaChange {
        version: 20250301000000,
        name: "create_followup_table",
        apply: create_followup_table,
    });
    let migrator = SchemaMigrator::new(changes).unwrap();

    let err = migrator.apply(&mut conn).unwrap_err();
    assert!(matches!(
        err,
        StoreError::SchemaApply {
            version: ADD_DEDUP_INDEX,
            name: "add_trade_dedup_index",
            ..
        }
    ));
    assert!(err.is_schema_failure());

    // Nothing from the failed change, nothing after it
    assert!(!index_exists(&conn, TRADES_DEDUP_INDEX).unwrap());
    assert!(!table_exists(&conn, "followup").unwrap());
    assert_eq!(ledger_versions(&conn), vec![20241118093000, ADD_MARKET_TYPE]);

    // Data rows were not touched
    let rows: i64 = conn
        .query_row("SELECT COUNT(*) FROM trades", [], |row| row.get(0))
        .unwrap();
    assert_eq!(rows, 2);

    // Once the duplicate is resolved the same migrator finishes
    conn.execute("DELETE FROM trades WHERE id = 'b'", []).unwrap();
    let report = migrator.apply(&mut conn).unwrap();
    assert_eq!(report.applied, vec![ADD_DEDUP_INDEX, 20250301000000]);
    assert!(index_exists(&conn, TRADES_DEDUP_INDEX).unwrap());
}

#[test]
fn test_store_refuses_to_open_over_duplicates() {
    let mut conn = Connection::open_in_memory().unwrap();
    migrator_through(2).apply(&mut conn).unwrap();
    insert_raw_trade(&conn, "a", 7);
    insert_raw_trade(&conn, "b", 7);

    let result = MarketDataStore::from_connection(conn, ManualClock::shared(0));
    assert!(matches!(result, Err(StoreError::SchemaApply { .. })));
}

// =============================================================================
// TEST 3: rows that predate market_type
// =============================================================================

#[test]
fn test_existing_rows_default_to_spot() {
    let mut conn = Connection::open_in_memory().unwrap();
    migrator_through(1).apply(&mut conn).unwrap();
    insert_raw_trade(&conn, "00000000-0000-4000-8000-000000000001", 1);
    conn.execute(
        "INSERT INTO order_books (id, last_update_id, symbol, bids, asks) \
         VALUES ('00000000-0000-4000-8000-000000000002', 5, 'BTCUSDT', '[[\"100\",\"1\"]]', '[]')",
        [],
    )
    .unwrap();

    let store = MarketDataStore::from_connection(conn, ManualClock::shared(0)).unwrap();
    assert_eq!(store.migration_report().applied, vec![ADD_MARKET_TYPE, ADD_DEDUP_INDEX]);

    let trades = store
        .trades()
        .query_range("BTCUSDT", MarketType::Spot, TimeRange::all())
        .unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].market_type, MarketType::Spot);
    assert_eq!(trades[0].price.to_string(), "100.5");

    let snapshot = store
        .snapshots()
        .latest("BTCUSDT", MarketType::Spot)
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.last_update_id, 5);
    assert!(snapshot.asks.is_empty());
}

// =============================================================================
// TEST 4: failing change is atomic
// =============================================================================

fn half_applied_change(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("CREATE TABLE partial (id INTEGER PRIMARY KEY)")?;
    conn.execute_batch("ALTER TABLE missing_table ADD COLUMN x INTEGER")
}

#[test]
fn test_failing_change_rolls_back_its_ddl() {
    let mut conn = Connection::open_in_memory().unwrap();
    let mut changes = STANDARD_CHANGES.to_vec();
    changes.push(SchemaChange {
        version: 20250301000000,
        name: "half_applied_change",
        apply: half_applied_change,
    });

    let err = SchemaMigrator::new(changes).unwrap().apply(&mut conn).unwrap_err();
    assert!(matches!(err, StoreError::SchemaApply { version: 20250301000000, .. }));
    assert!(!table_exists(&conn, "partial").unwrap());

    // Earlier changes committed independently
    assert_eq!(ledger_versions(&conn).len(), 3);
}

// =============================================================================
// TEST 5: ledger written by a newer build
// =============================================================================

#[test]
fn test_unknown_ledger_version_is_tolerated() {
    let mut conn = Connection::open_in_memory().unwrap();
    SchemaMigrator::standard().apply(&mut conn).unwrap();
    conn.execute(
        "INSERT INTO schema_migrations (version, name, applied_at) \
         VALUES (29990101000000, 'from_the_future', '2999-01-01T00:00:00.000Z')",
        [],
    )
    .unwrap();

    let report = SchemaMigrator::standard().apply(&mut conn).unwrap();
    assert!(report.is_noop());
    assert_eq!(report.unknown, vec![29990101000000]);
}

#[test]
fn test_ledger_stamped_from_clock() {
    let mut conn = Connection::open_in_memory().unwrap();
    SchemaMigrator::standard()
        .with_clock(ManualClock::shared(1_700_000_000_123))
        .apply(&mut conn)
        .unwrap();

    for applied in applied_versions(&conn).unwrap() {
        assert_eq!(applied.applied_at.timestamp_millis(), 1_700_000_000_123);
    }
}

// =============================================================================
// TEST 6: convergence from any starting point
// =============================================================================

proptest! {
    #[test]
    fn prop_partial_databases_converge(prefix in 0usize..=3, reruns in 1usize..=3) {
        let mut reference = Connection::open_in_memory().unwrap();
        SchemaMigrator::standard().apply(&mut reference).unwrap();

        let mut conn = Connection::open_in_memory().unwrap();
        migrator_through(prefix).apply(&mut conn).unwrap();
        for _ in 0..reruns {
            SchemaMigrator::standard().apply(&mut conn).unwrap();
        }

        prop_assert_eq!(schema_objects(&conn), schema_objects(&reference));
        prop_assert_eq!(ledger_versions(&conn), ledger_versions(&reference));
    }
}
