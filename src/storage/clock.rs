//! Write Clock
//!
//! Every `created_at` column is stamped from a `Clock` handed to the store,
//! never from the database's `now`. Production uses `SystemClock`; tests pin
//! time with `ManualClock`.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Milliseconds since Unix epoch.
pub type Millis = i64;

/// Source of ingestion timestamps.
pub trait Clock: Send + Sync {
    /// Current time in UTC.
    fn now(&self) -> DateTime<Utc>;

    /// Current time as epoch milliseconds.
    fn now_millis(&self) -> Millis {
        self.now().timestamp_millis()
    }
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    current_ms: AtomicI64,
}

impl ManualClock {
    /// Create a clock pinned at `start_ms`.
    pub fn new(start_ms: Millis) -> Self {
        Self {
            current_ms: AtomicI64::new(start_ms),
        }
    }

    /// Shared handle, ready to hand to a store.
    pub fn shared(start_ms: Millis) -> Arc<Self> {
        Arc::new(Self::new(start_ms))
    }

    /// Jump to an absolute time.
    pub fn set(&self, ms: Millis) {
        self.current_ms.store(ms, Ordering::SeqCst);
    }

    /// Move forward by `delta_ms`.
    pub fn advance(&self, delta_ms: Millis) {
        self.current_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        millis_to_datetime(self.current_ms.load(Ordering::SeqCst))
    }

    fn now_millis(&self) -> Millis {
        self.current_ms.load(Ordering::SeqCst)
    }
}

/// Convert epoch millis to a UTC timestamp, saturating at the representable range.
pub fn millis_to_datetime(ms: Millis) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(if ms < 0 {
            DateTime::<Utc>::MIN_UTC
        } else {
            DateTime::<Utc>::MAX_UTC
        })
}

/// Render a timestamp in the fixed-width form stored in `created_at`.
///
/// `YYYY-MM-DDThh:mm:ss.mmmZ` sorts lexicographically in time order, which is
/// what lets the `created_at` index serve range scans.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Render epoch millis in the stored `created_at` form.
pub fn format_millis(ms: Millis) -> String {
    format_timestamp(&millis_to_datetime(ms))
}

/// Parse a stored `created_at` value.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
