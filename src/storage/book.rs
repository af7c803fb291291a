//! Order Book Snapshots
//!
//! Bid and ask sides are explicit ordered sequences of exact price levels.
//! On disk each side is a JSON array of `[price, quantity]` string pairs:
//!
//! ```text
//! [["43250.10","0.5"],["43250.00","1.25"]]
//! ```
//!
//! Strings keep the decimals exact; the array keeps the level order exactly
//! as captured.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::ValidationError;
use super::model::{parse_decimal, validate_symbol, MarketType};

// =============================================================================
// Price Levels
// =============================================================================

/// One price level: price and resting quantity.
///
/// Decodes only from a pair of decimal strings; JSON numbers are refused
/// since they would pass through `f64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "(String, String)", into = "(Decimal, Decimal)")]
pub struct PriceLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, quantity: Decimal) -> Self {
        Self { price, quantity }
    }

    /// Parse exact decimal text. More than 28 significant digits is an error, not a rounding.
    pub fn parse(price: &str, quantity: &str) -> Result<Self, ValidationError> {
        Ok(Self {
            price: parse_decimal("price", price)?,
            quantity: parse_decimal("quantity", quantity)?,
        })
    }
}

impl TryFrom<(String, String)> for PriceLevel {
    type Error = ValidationError;

    fn try_from((price, quantity): (String, String)) -> Result<Self, Self::Error> {
        Self::parse(&price, &quantity)
    }
}

impl From<PriceLevel> for (Decimal, Decimal) {
    fn from(level: PriceLevel) -> Self {
        (level.price, level.quantity)
    }
}

/// Which side of the book a sequence of levels belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Bid,
    Ask,
}

impl Side {
    pub fn label(&self) -> &'static str {
        match self {
            Side::Bid => "bids",
            Side::Ask => "asks",
        }
    }

    fn expected_order(&self) -> &'static str {
        match self {
            Side::Bid => "descending",
            Side::Ask => "ascending",
        }
    }

    /// Whether `next` may follow `prev` on this side.
    fn in_order(&self, prev: Decimal, next: Decimal) -> bool {
        match self {
            Side::Bid => next < prev,
            Side::Ask => next > prev,
        }
    }
}

/// Validated, ordered levels for one side of the book.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct BookSide {
    levels: Vec<PriceLevel>,
}

impl BookSide {
    /// Validate `levels` for `side`: positive prices, non-negative quantities,
    /// strictly monotone prices (bids descending, asks ascending).
    ///
    /// An empty side is valid; a venue can legitimately show no resting orders.
    pub fn new(side: Side, levels: Vec<PriceLevel>) -> Result<Self, ValidationError> {
        for (index, level) in levels.iter().enumerate() {
            if level.price <= Decimal::ZERO {
                return Err(ValidationError::MalformedBook {
                    side: side.label(),
                    reason: format!("level {index} has non-positive price {}", level.price),
                });
            }
            if level.quantity.is_sign_negative() && !level.quantity.is_zero() {
                return Err(ValidationError::MalformedBook {
                    side: side.label(),
                    reason: format!("level {index} has negative quantity {}", level.quantity),
                });
            }
            if index > 0 && !side.in_order(levels[index - 1].price, level.price) {
                return Err(ValidationError::UnorderedBook {
                    side: side.label(),
                    index,
                    price: level.price.to_string(),
                    expected: side.expected_order(),
                });
            }
        }
        Ok(Self { levels })
    }

    /// Decode and validate a stored or feed-supplied document.
    pub fn from_json(side: Side, raw: &str) -> Result<Self, ValidationError> {
        let levels: Vec<PriceLevel> =
            serde_json::from_str(raw).map_err(|e| ValidationError::MalformedBook {
                side: side.label(),
                reason: e.to_string(),
            })?;
        Self::new(side, levels)
    }

    /// Encode as the stored array-of-arrays document.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.levels)
    }

    pub fn levels(&self) -> &[PriceLevel] {
        &self.levels
    }

    /// Best level (first in order).
    pub fn best(&self) -> Option<&PriceLevel> {
        self.levels.first()
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

// =============================================================================
// Snapshots
// =============================================================================

/// Book state captured by the feed connector, ready for append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewSnapshot {
    pub last_update_id: i64,
    pub symbol: String,
    pub market_type: MarketType,
    pub bids: BookSide,
    pub asks: BookSide,
}

impl NewSnapshot {
    /// Build from raw level lists, validating both sides.
    pub fn new(
        symbol: impl Into<String>,
        market_type: MarketType,
        last_update_id: i64,
        bids: Vec<PriceLevel>,
        asks: Vec<PriceLevel>,
    ) -> Result<Self, ValidationError> {
        let snapshot = Self {
            last_update_id,
            symbol: symbol.into(),
            market_type,
            bids: BookSide::new(Side::Bid, bids)?,
            asks: BookSide::new(Side::Ask, asks)?,
        };
        snapshot.validate()?;
        Ok(snapshot)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_symbol(&self.symbol)
    }

    /// Best bid at or above best ask.
    pub fn is_crossed(&self) -> bool {
        match (self.bids.best(), self.asks.best()) {
            (Some(bid), Some(ask)) => bid.price >= ask.price,
            _ => false,
        }
    }
}

/// Snapshot as the feed connector delivers it: levels as `[price, qty]` text pairs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSnapshot {
    #[serde(alias = "lastUpdateId")]
    pub last_update_id: i64,
    pub symbol: String,
    #[serde(default)]
    pub market_type: Option<String>,
    pub bids: Vec<(String, String)>,
    pub asks: Vec<(String, String)>,
}

impl RawSnapshot {
    /// Parse and validate, using `fallback` when the record carries no market type.
    pub fn into_snapshot(self, fallback: MarketType) -> Result<NewSnapshot, ValidationError> {
        let market_type = match self.market_type.as_deref() {
            Some(raw) => raw.parse()?,
            None => fallback,
        };
        let bids = parse_levels(Side::Bid, &self.bids)?;
        let asks = parse_levels(Side::Ask, &self.asks)?;
        NewSnapshot::new(self.symbol, market_type, self.last_update_id, bids, asks)
    }
}

fn parse_levels(side: Side, raw: &[(String, String)]) -> Result<Vec<PriceLevel>, ValidationError> {
    raw.iter()
        .enumerate()
        .map(|(index, (price, qty))| {
            PriceLevel::parse(price, qty).map_err(|e| ValidationError::MalformedBook {
                side: side.label(),
                reason: format!("level {index}: {e}"),
            })
        })
        .collect()
}

/// A stored snapshot row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub id: Uuid,
    pub last_update_id: i64,
    pub symbol: String,
    pub market_type: MarketType,
    pub bids: BookSide,
    pub asks: BookSide,
    pub created_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn from_new(snapshot: &NewSnapshot, id: Uuid, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            last_update_id: snapshot.last_update_id,
            symbol: snapshot.symbol.clone(),
            market_type: snapshot.market_type,
            bids: snapshot.bids.clone(),
            asks: snapshot.asks.clone(),
            created_at,
        }
    }

    /// Capture time as epoch millis.
    pub fn created_at_millis(&self) -> i64 {
        self.created_at.timestamp_millis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn bids() -> Vec<PriceLevel> {
        vec![
            PriceLevel::new(dec!(100.5), dec!(2)),
            PriceLevel::new(dec!(100.4), dec!(1.25)),
        ]
    }

    fn asks() -> Vec<PriceLevel> {
        vec![
            PriceLevel::new(dec!(100.6), dec!(3)),
            PriceLevel::new(dec!(100.7), dec!(0.5)),
        ]
    }

    #[test]
    fn test_side_serializes_as_array_of_string_pairs() {
        let side = BookSide::new(Side::Bid, bids()).unwrap();
        let json = side.to_json().unwrap();
        assert_eq!(json, r#"[["100.5","2"],["100.4","1.25"]]"#);

        let decoded = BookSide::from_json(Side::Bid, &json).unwrap();
        assert_eq!(decoded, side);
        assert_eq!(decoded.best().unwrap().price, dec!(100.5));
    }

    #[test]
    fn test_from_json_accepts_zero_quantity() {
        let side = BookSide::from_json(Side::Ask, r#"[["1.10", "5"], ["1.20", "0"]]"#).unwrap();
        assert_eq!(side.len(), 2);
        assert_eq!(side.levels()[1].quantity, Decimal::ZERO);
    }

    #[test]
    fn test_unordered_sides_rejected() {
        let mut reversed = bids();
        reversed.reverse();
        assert!(matches!(
            BookSide::new(Side::Bid, reversed),
            Err(ValidationError::UnorderedBook {
                side: "bids",
                index: 1,
                ..
            })
        ));

        let mut reversed = asks();
        reversed.reverse();
        assert!(matches!(
            BookSide::new(Side::Ask, reversed),
            Err(ValidationError::UnorderedBook { side: "asks", .. })
        ));

        // Repeated price is not a valid book level sequence either
        let repeated = vec![
            PriceLevel::new(dec!(1), dec!(1)),
            PriceLevel::new(dec!(1), dec!(2)),
        ];
        assert!(BookSide::new(Side::Ask, repeated).is_err());
    }

    #[test]
    fn test_malformed_documents_rejected() {
        for doc in [
            r#"{"price":"1"}"#,
            r#"[["1"]]"#,
            r#"[["abc","1"]]"#,
            r#"[["1","2","3"]]"#,
            "not json",
        ] {
            assert!(
                matches!(
                    BookSide::from_json(Side::Bid, doc),
                    Err(ValidationError::MalformedBook { side: "bids", .. })
                ),
                "accepted {doc}"
            );
        }

        let negative = vec![PriceLevel::new(dec!(1), dec!(-1))];
        assert!(BookSide::new(Side::Bid, negative).is_err());
        let zero_price = vec![PriceLevel::new(dec!(0), dec!(1))];
        assert!(BookSide::new(Side::Bid, zero_price).is_err());
    }

    #[test]
    fn test_empty_side_is_valid() {
        let snapshot = NewSnapshot::new("BTCUSDT", MarketType::Spot, 1, vec![], asks()).unwrap();
        assert!(snapshot.bids.is_empty());
        assert!(!snapshot.is_crossed());
    }

    #[test]
    fn test_raw_snapshot_parsing() {
        let line = r#"{"lastUpdateId":1027024,"symbol":"BTCUSDT",
            "bids":[["4.00000000","431.00000000"]],
            "asks":[["4.00000200","12.00000000"]]}"#;
        let raw: RawSnapshot = serde_json::from_str(line).unwrap();
        let snapshot = raw.into_snapshot(MarketType::Futures).unwrap();
        assert_eq!(snapshot.last_update_id, 1_027_024);
        assert_eq!(snapshot.market_type, MarketType::Futures);
        assert_eq!(snapshot.bids.best().unwrap().quantity, dec!(431));
        assert_eq!(snapshot.asks.to_json().unwrap(), r#"[["4.00000200","12.00000000"]]"#);
    }

    #[test]
    fn test_raw_snapshot_bad_level() {
        let raw = RawSnapshot {
            last_update_id: 1,
            symbol: "BTCUSDT".to_string(),
            market_type: None,
            bids: vec![("x".to_string(), "1".to_string())],
            asks: vec![],
        };
        assert!(matches!(
            raw.into_snapshot(MarketType::Spot),
            Err(ValidationError::MalformedBook { side: "bids", .. })
        ));
    }

    #[test]
    fn test_crossed_book_detected() {
        let new = NewSnapshot::new("BTCUSDT", MarketType::Spot, 7, bids(), asks()).unwrap();
        assert!(!new.is_crossed());
        let stored = Snapshot::from_new(&new, Uuid::new_v4(), Utc::now());
        assert_eq!(stored.bids, new.bids);

        let crossed = NewSnapshot::new(
            "BTCUSDT",
            MarketType::Spot,
            8,
            vec![PriceLevel::new(dec!(101), dec!(1))],
            asks(),
        )
        .unwrap();
        assert!(crossed.is_crossed());
    }

    #[test]
    fn test_numeric_levels_rejected() {
        for doc in [
            "[[100.1, 1]]",
            r#"[["100.1", 1]]"#,
            "[[100.123456789012345678, 1]]",
        ] {
            assert!(
                matches!(
                    BookSide::from_json(Side::Bid, doc),
                    Err(ValidationError::MalformedBook { side: "bids", .. })
                ),
                "accepted {doc}"
            );
        }

        // The same values as strings are kept digit for digit
        let side = BookSide::from_json(Side::Bid, r#"[["100.123456789012345678","1"]]"#).unwrap();
        assert_eq!(side.levels()[0].price.to_string(), "100.123456789012345678");
    }

    #[test]
    fn test_levels_beyond_decimal_precision_rejected() {
        let too_precise = "1.00000000000000000000000000009";
        assert!(BookSide::from_json(Side::Ask, &format!(r#"[["{too_precise}","1"]]"#)).is_err());

        let raw = RawSnapshot {
            last_update_id: 1,
            symbol: "BTCUSDT".to_string(),
            market_type: None,
            bids: vec![(too_precise.to_string(), "1".to_string())],
            asks: vec![],
        };
        assert!(matches!(
            raw.into_snapshot(MarketType::Spot),
            Err(ValidationError::MalformedBook { side: "bids", .. })
        ));
    }
}
