//! Tickarchive CLI
//!
//! Applies schema changes, ingests recorded feed files, and reads stored
//! market data back out as JSON lines.
//!
//! Usage:
//!   # Bring the schema up to date
//!   cargo run --release --bin tickarchive -- migrate
//!
//!   # Ingest a JSON-lines trade capture
//!   cargo run --release --bin tickarchive -- import-trades --file trades.jsonl
//!
//!   # Read a window back
//!   cargo run --release --bin tickarchive -- trades --symbol BTCUSDT \
//!       --start 1700000000000 --end 1700000600000

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::{BufReader, Write};
use std::sync::Arc;

use tickarchive::config::{self, ArchiveConfig};
use tickarchive::storage::{
    applied_versions, ingest, open_existing_connection, BarInterval, MarketDataStore, MarketType,
    SchemaMigrator, SystemClock, TimeRange,
};

#[derive(Parser, Debug)]
#[command(name = "tickarchive")]
#[command(about = "Durable storage for exchange trades and order book snapshots")]
struct Args {
    /// Path to SQLite database (overrides config)
    #[arg(long, env = "TICKARCHIVE_DB_PATH")]
    db: Option<String>,

    /// Busy timeout in milliseconds (overrides config)
    #[arg(long, env = "TICKARCHIVE_BUSY_TIMEOUT_MS")]
    busy_timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply pending schema changes
    Migrate,

    /// Show ledger, pending changes, row counts, and index usage
    Status,

    /// Ingest trades from a JSON-lines file
    ImportTrades {
        #[arg(long)]
        file: String,

        /// Market for records without one (defaults to config)
        #[arg(long)]
        market: Option<MarketType>,

        #[arg(long, default_value = "1000")]
        batch_size: usize,
    },

    /// Ingest order book snapshots from a JSON-lines file
    ImportSnapshots {
        #[arg(long)]
        file: String,

        #[arg(long)]
        market: Option<MarketType>,

        #[arg(long, default_value = "1000")]
        batch_size: usize,
    },

    /// Print trades in a time window
    Trades {
        #[command(flatten)]
        window: Window,
    },

    /// Print snapshots captured in a time window
    Snapshots {
        #[command(flatten)]
        window: Window,
    },

    /// Print close/volume bars for a time window
    Bars {
        #[command(flatten)]
        window: Window,

        #[arg(long, default_value = "minute")]
        interval: BarInterval,
    },
}

#[derive(clap::Args, Debug)]
struct Window {
    #[arg(long)]
    symbol: String,

    #[arg(long)]
    market: Option<MarketType>,

    /// Inclusive start (epoch ms)
    #[arg(long)]
    start: Option<i64>,

    /// Inclusive end (epoch ms)
    #[arg(long)]
    end: Option<i64>,
}

impl Window {
    fn range(&self) -> TimeRange {
        TimeRange::from_bounds(self.start, self.end)
    }
}

fn main() -> Result<()> {
    config::load_env();

    // Logs go to stderr; stdout carries query output
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tickarchive=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = ArchiveConfig::from_env();
    if let Some(db) = args.db {
        config.db_path = db;
    }
    if let Some(ms) = args.busy_timeout_ms {
        config.busy_timeout_ms = ms;
    }

    match args.command {
        Commands::Migrate => migrate(&config)?,
        Commands::Status => status(&config)?,
        Commands::ImportTrades {
            file,
            market,
            batch_size,
        } => import_trades(&config, &file, market.unwrap_or(config.default_market), batch_size)?,
        Commands::ImportSnapshots {
            file,
            market,
            batch_size,
        } => import_snapshots(&config, &file, market.unwrap_or(config.default_market), batch_size)?,
        Commands::Trades { window } => {
            let store = open_store(&config)?;
            let market = window.market.unwrap_or(config.default_market);
            let trades = store.trades().query_range(&window.symbol, market, window.range())?;
            print_json_lines(&trades)?;
        }
        Commands::Snapshots { window } => {
            let store = open_store(&config)?;
            let market = window.market.unwrap_or(config.default_market);
            let snapshots = store
                .snapshots()
                .query_range(&window.symbol, market, window.range())?;
            print_json_lines(&snapshots)?;
        }
        Commands::Bars { window, interval } => {
            let store = open_store(&config)?;
            let market = window.market.unwrap_or(config.default_market);
            let bars = store
                .trades()
                .bars(&window.symbol, market, window.range(), interval)?;
            print_json_lines(&bars)?;
        }
    }

    Ok(())
}

fn open_store(config: &ArchiveConfig) -> Result<MarketDataStore> {
    MarketDataStore::open(
        &config.db_path,
        &config.connection_options(),
        Arc::new(SystemClock),
    )
    .with_context(|| format!("Failed to open market data store: {}", config.db_path))
}

fn migrate(config: &ArchiveConfig) -> Result<()> {
    let store = open_store(config)?;
    let report = store.migration_report();

    if report.is_noop() {
        match SchemaMigrator::standard().target_version() {
            Some(version) => println!("Schema up to date at version {version}"),
            None => println!("Schema up to date"),
        }
    } else {
        for version in &report.applied {
            println!("Applied {version}");
        }
    }
    for version in &report.unknown {
        println!("Unknown change in ledger: {version}");
    }
    Ok(())
}

fn status(config: &ArchiveConfig) -> Result<()> {
    println!("Database: {}", config.db_path);
    println!();

    let conn = open_existing_connection(&config.db_path, &config.connection_options())
        .with_context(|| format!("Database not found or unreadable: {}", config.db_path))?;

    println!("Applied schema changes:");
    for applied in applied_versions(&conn)? {
        println!("  {} {:<28} {}", applied.version, applied.name, applied.applied_at);
    }

    let pending = SchemaMigrator::standard().pending(&conn)?;
    if !pending.is_empty() {
        println!();
        println!("Pending schema changes:");
        for change in &pending {
            println!("  {} {}", change.version, change.name);
        }
        println!();
        println!("Run `tickarchive migrate` before reading counts.");
        return Ok(());
    }
    drop(conn);

    let store = open_store(config)?;
    println!();
    println!("Rows:");
    println!("  trades      : {}", store.trades().count_all()?);
    println!("  order_books : {}", store.snapshots().count_all()?);

    println!();
    println!("Range index usage:");
    for usage in store.index_usage()? {
        let state = if usage.is_healthy() { "ok" } else { "NOT USED" };
        println!("  {:<12} {:<28} {}", usage.table, usage.index, state);
        for detail in &usage.plan {
            println!("      {detail}");
        }
    }
    Ok(())
}

fn import_trades(
    config: &ArchiveConfig,
    file: &str,
    market: MarketType,
    batch_size: usize,
) -> Result<()> {
    let store = open_store(config)?;
    let reader = BufReader::new(File::open(file).with_context(|| format!("Failed to open {file}"))?);

    let summary = ingest::import_trades(store.trades(), reader, market, batch_size)
        .with_context(|| format!("Trade import failed: {file}"))?;
    println!(
        "inserted={} duplicates={} rejected={}",
        summary.written, summary.duplicates, summary.rejected
    );
    Ok(())
}

fn import_snapshots(
    config: &ArchiveConfig,
    file: &str,
    market: MarketType,
    batch_size: usize,
) -> Result<()> {
    let store = open_store(config)?;
    let reader = BufReader::new(File::open(file).with_context(|| format!("Failed to open {file}"))?);

    let summary = ingest::import_snapshots(store.snapshots(), reader, market, batch_size)
        .with_context(|| format!("Snapshot import failed: {file}"))?;
    println!("stored={} rejected={}", summary.written, summary.rejected);
    Ok(())
}

fn print_json_lines<T: serde::Serialize>(items: &[T]) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for item in items {
        serde_json::to_writer(&mut out, item)?;
        writeln!(out)?;
    }
    Ok(())
}
