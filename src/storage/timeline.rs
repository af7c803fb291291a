//! Replay Timeline
//!
//! Merges range-query results from both stores into one time-ordered pass
//! for backtests. Trades are placed by `event_time`, snapshots by capture
//! time; on equal timestamps trades come first.

use serde::Serialize;

use super::book::Snapshot;
use super::clock::Millis;
use super::model::Trade;

/// Anything a replay cursor can order.
pub trait Timestamped {
    fn timestamp_ms(&self) -> Millis;
}

impl Timestamped for Trade {
    fn timestamp_ms(&self) -> Millis {
        self.event_time
    }
}

impl Timestamped for Snapshot {
    fn timestamp_ms(&self) -> Millis {
        self.created_at_millis()
    }
}

/// One replay step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MarketEvent {
    Trade(Trade),
    Snapshot(Snapshot),
}

impl Timestamped for MarketEvent {
    fn timestamp_ms(&self) -> Millis {
        match self {
            MarketEvent::Trade(t) => t.timestamp_ms(),
            MarketEvent::Snapshot(s) => s.timestamp_ms(),
        }
    }
}

/// Merge two already-ordered sequences.
pub fn merge(trades: Vec<Trade>, snapshots: Vec<Snapshot>) -> Vec<MarketEvent> {
    let mut events = Vec::with_capacity(trades.len() + snapshots.len());
    let mut trades = trades.into_iter().peekable();
    let mut snapshots = snapshots.into_iter().peekable();

    loop {
        let take_trade = match (trades.peek(), snapshots.peek()) {
            (Some(t), Some(s)) => t.timestamp_ms() <= s.timestamp_ms(),
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => break,
        };
        let event = if take_trade {
            trades.next().map(MarketEvent::Trade)
        } else {
            snapshots.next().map(MarketEvent::Snapshot)
        };
        events.extend(event);
    }

    events
}

// =============================================================================
// Replay Cursor
// =============================================================================

/// Forward cursor over time-ordered records, resettable for repeated runs.
#[derive(Debug, Clone)]
pub struct ReplayFeed<T> {
    items: Vec<T>,
    current_index: usize,
}

impl<T: Timestamped> ReplayFeed<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items,
            current_index: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items not yet consumed.
    pub fn remaining(&self) -> usize {
        self.items.len() - self.current_index
    }

    /// First and last timestamps covered.
    pub fn time_range(&self) -> Option<(Millis, Millis)> {
        match (self.items.first(), self.items.last()) {
            (Some(first), Some(last)) => Some((first.timestamp_ms(), last.timestamp_ms())),
            _ => None,
        }
    }

    /// Rewind for another replay.
    pub fn reset(&mut self) {
        self.current_index = 0;
    }

    pub fn next(&mut self) -> Option<&T> {
        let item = self.items.get(self.current_index)?;
        self.current_index += 1;
        Some(item)
    }

    pub fn peek(&self) -> Option<&T> {
        self.items.get(self.current_index)
    }

    /// Consume every item at or before `ts`.
    pub fn advance_to(&mut self, ts: Millis) -> &[T] {
        let start = self.current_index;
        while self
            .items
            .get(self.current_index)
            .is_some_and(|item| item.timestamp_ms() <= ts)
        {
            self.current_index += 1;
        }
        &self.items[start..self.current_index]
    }
}
