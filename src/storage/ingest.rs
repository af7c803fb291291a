//! JSON-lines Ingest
//!
//! Streams recorded feed captures into the stores, one record per line.
//! Records are written in transactions of at most `batch_size`, so memory
//! stays bounded by one batch regardless of file size. Lines that fail to
//! decode or validate are logged and counted, never written.

use serde::Serialize;
use std::io::BufRead;
use thiserror::Error;
use tracing::{info, warn};

use super::book::{NewSnapshot, RawSnapshot};
use super::error::{StoreError, ValidationError};
use super::model::{MarketType, NewTrade, RawTrade};
use super::snapshot_store::SnapshotStore;
use super::trade_store::TradeStore;

/// Counts from one import run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub written: usize,
    /// Trade keys already stored; always zero for snapshots.
    pub duplicates: usize,
    pub rejected: usize,
    pub batches: usize,
}

#[derive(Debug, Error)]
enum RecordError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

/// Import trades, falling back to `market` for records without a market type.
pub fn import_trades<R: BufRead>(
    trades: &TradeStore,
    reader: R,
    market: MarketType,
    batch_size: usize,
) -> Result<ImportSummary, StoreError> {
    let summary = ingest_lines(
        reader,
        batch_size,
        "trade",
        |line| Ok(serde_json::from_str::<RawTrade>(line)?.into_trade(market)?),
        |batch: &[NewTrade]| {
            let outcome = trades.insert_batch(batch)?;
            Ok((outcome.inserted, outcome.duplicates))
        },
    )?;

    info!(
        inserted = summary.written,
        duplicates = summary.duplicates,
        rejected = summary.rejected,
        batches = summary.batches,
        "Trade import complete"
    );
    Ok(summary)
}

/// Import order book snapshots, falling back to `market` for records without a market type.
pub fn import_snapshots<R: BufRead>(
    snapshots: &SnapshotStore,
    reader: R,
    market: MarketType,
    batch_size: usize,
) -> Result<ImportSummary, StoreError> {
    let summary = ingest_lines(
        reader,
        batch_size,
        "snapshot",
        |line| Ok(serde_json::from_str::<RawSnapshot>(line)?.into_snapshot(market)?),
        |batch: &[NewSnapshot]| Ok((snapshots.append_batch(batch)?, 0)),
    )?;

    info!(
        stored = summary.written,
        rejected = summary.rejected,
        batches = summary.batches,
        "Snapshot import complete"
    );
    Ok(summary)
}

fn ingest_lines<R, T, P, F>(
    reader: R,
    batch_size: usize,
    kind: &'static str,
    parse: P,
    mut flush: F,
) -> Result<ImportSummary, StoreError>
where
    R: BufRead,
    P: Fn(&str) -> Result<T, RecordError>,
    F: FnMut(&[T]) -> Result<(usize, usize), StoreError>,
{
    let batch_size = batch_size.max(1);
    let mut batch: Vec<T> = Vec::with_capacity(batch_size);
    let mut summary = ImportSummary::default();

    let mut write = |batch: &mut Vec<T>, summary: &mut ImportSummary| -> Result<(), StoreError> {
        let (written, duplicates) = flush(batch.as_slice())?;
        summary.written += written;
        summary.duplicates += duplicates;
        summary.batches += 1;
        batch.clear();
        Ok(())
    };

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        match parse(&line) {
            Ok(record) => batch.push(record),
            Err(e) => {
                summary.rejected += 1;
                warn!(line = line_no + 1, kind, error = %e, "Skipping record");
                continue;
            }
        }

        if batch.len() >= batch_size {
            write(&mut batch, &mut summary)?;
        }
    }

    if !batch.is_empty() {
        write(&mut batch, &mut summary)?;
    }

    Ok(summary)
}
