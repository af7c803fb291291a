//! Trade bars: close and exact volume per fixed time bucket.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::clock::Millis;
use super::error::StoreError;
use super::model::Trade;

/// Bucket width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BarInterval {
    Minute,
    Hour,
}

impl BarInterval {
    pub fn millis(&self) -> Millis {
        match self {
            BarInterval::Minute => 60_000,
            BarInterval::Hour => 3_600_000,
        }
    }

    /// Start of the bucket containing `ts`.
    pub fn bucket_start(&self, ts: Millis) -> Millis {
        ts - ts.rem_euclid(self.millis())
    }
}

impl fmt::Display for BarInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BarInterval::Minute => f.write_str("minute"),
            BarInterval::Hour => f.write_str("hour"),
        }
    }
}

impl FromStr for BarInterval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "minute" | "1m" => Ok(BarInterval::Minute),
            "hour" | "1h" => Ok(BarInterval::Hour),
            other => Err(format!("unknown bar interval '{other}'")),
        }
    }
}

/// One bucket of trades.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeBar {
    pub bucket_start_ms: Millis,
    /// Price of the last trade in the bucket.
    #[serde(with = "rust_decimal::serde::str")]
    pub close: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub volume: Decimal,
    pub trade_count: u64,
}

/// Roll trades up into bars. Expects trades in range-query order
/// (`event_time`, then `trade_id`); empty buckets are not emitted.
///
/// Fails with `StoreError::Overflow` when a bucket's volume exceeds `Decimal::MAX`.
pub fn roll_up(trades: &[Trade], interval: BarInterval) -> Result<Vec<TradeBar>, StoreError> {
    let mut bars: Vec<TradeBar> = Vec::new();

    for trade in trades {
        let bucket = interval.bucket_start(trade.event_time);
        match bars.last_mut() {
            Some(bar) if bar.bucket_start_ms == bucket => {
                bar.volume = bar
                    .volume
                    .checked_add(trade.quantity)
                    .ok_or(StoreError::Overflow {
                        field: "volume",
                        bucket_start_ms: bucket,
                    })?;
                bar.close = trade.price;
                bar.trade_count += 1;
            }
            _ => bars.push(TradeBar {
                bucket_start_ms: bucket,
                close: trade.price,
                volume: trade.quantity,
                trade_count: 1,
            }),
        }
    }

    Ok(bars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::model::{MarketType, NewTrade};
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn trade(trade_id: i64, event_time: i64, price: Decimal, quantity: Decimal) -> Trade {
        let new = NewTrade {
            event_time,
            symbol: "BTCUSDT".to_string(),
            trade_id,
            price,
            quantity,
            buyer_order_id: 1,
            seller_order_id: 2,
            is_buyer_maker: true,
            market_type: MarketType::Spot,
        };
        Trade::from_new(&new, Uuid::new_v4(), Utc::now())
    }

    #[test]
    fn test_bucket_start() {
        assert_eq!(BarInterval::Minute.bucket_start(59_999), 0);
        assert_eq!(BarInterval::Minute.bucket_start(60_000), 60_000);
        assert_eq!(BarInterval::Hour.bucket_start(7_199_999), 3_600_000);
    }

    #[test]
    fn test_roll_up_close_and_volume() {
        let trades = vec![
            trade(1, 1_000, dec!(100.1), dec!(0.1)),
            trade(2, 30_000, dec!(100.3), dec!(0.2)),
            trade(3, 59_999, dec!(100.2), dec!(0.3)),
            trade(4, 3_600_000, dec!(99), dec!(1)),
        ];

        let bars = roll_up(&trades, BarInterval::Minute).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].bucket_start_ms, 0);
        assert_eq!(bars[0].close, dec!(100.2));
        assert_eq!(bars[0].volume, dec!(0.6));
        assert_eq!(bars[0].trade_count, 3);
        assert_eq!(bars[1].bucket_start_ms, 3_600_000);

        let hourly = roll_up(&trades, BarInterval::Hour).unwrap();
        assert_eq!(hourly.len(), 2);
        assert_eq!(hourly[0].trade_count, 3);
        assert_eq!(hourly[1].close, dec!(99));

        assert!(roll_up(&[], BarInterval::Hour).unwrap().is_empty());
    }

    #[test]
    fn test_volume_overflow_is_an_error() {
        let trades = vec![
            trade(1, 1_000, dec!(1), Decimal::MAX),
            trade(2, 2_000, dec!(1), Decimal::MAX),
        ];

        assert!(matches!(
            roll_up(&trades, BarInterval::Minute),
            Err(StoreError::Overflow {
                field: "volume",
                bucket_start_ms: 0
            })
        ));

        // Separate buckets never add the two together
        let apart = vec![
            trade(1, 1_000, dec!(1), Decimal::MAX),
            trade(2, 61_000, dec!(1), Decimal::MAX),
        ];
        assert_eq!(roll_up(&apart, BarInterval::Minute).unwrap().len(), 2);
    }

    #[test]
    fn test_interval_parsing() {
        assert_eq!("minute".parse::<BarInterval>().unwrap(), BarInterval::Minute);
        assert_eq!("1H".parse::<BarInterval>().unwrap(), BarInterval::Hour);
        assert!("day".parse::<BarInterval>().is_err());
        assert_eq!(BarInterval::Hour.to_string(), "hour");
    }
}
