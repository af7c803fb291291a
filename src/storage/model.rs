//! Trade Records
//!
//! `RawTrade` is what the feed connector hands over (decimals still as text),
//! `NewTrade` is a validated record ready for insert, and `Trade` is a stored
//! row with its generated identity and ingestion time.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::error::ValidationError;

/// Column width of `symbol`.
pub const MAX_SYMBOL_LEN: usize = 20;

// =============================================================================
// Market Type
// =============================================================================

/// Venue market segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarketType {
    /// Spot. Rows written before the column existed are spot.
    #[default]
    Spot,
    /// Perpetual and dated futures.
    Futures,
}

impl MarketType {
    pub const ALL: [MarketType; 2] = [MarketType::Spot, MarketType::Futures];

    /// Stored column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketType::Spot => "SPOT",
            MarketType::Futures => "FUTURES",
        }
    }
}

impl fmt::Display for MarketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MarketType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SPOT" => Ok(MarketType::Spot),
            "FUTURES" => Ok(MarketType::Futures),
            _ => Err(ValidationError::UnknownMarketType(s.to_string())),
        }
    }
}

// =============================================================================
// Shared Field Checks
// =============================================================================

pub(crate) fn validate_symbol(symbol: &str) -> Result<(), ValidationError> {
    if symbol.trim().is_empty() {
        return Err(ValidationError::MissingField("symbol"));
    }
    let len = symbol.chars().count();
    if len > MAX_SYMBOL_LEN {
        return Err(ValidationError::SymbolTooLong {
            symbol: symbol.to_string(),
            len,
            max: MAX_SYMBOL_LEN,
        });
    }
    Ok(())
}

pub(crate) fn validate_non_negative(
    field: &'static str,
    value: Decimal,
) -> Result<(), ValidationError> {
    if value.is_sign_negative() && !value.is_zero() {
        return Err(ValidationError::Negative {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

pub(crate) fn parse_decimal(field: &'static str, raw: &str) -> Result<Decimal, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::MissingField(field));
    }
    Decimal::from_str_exact(trimmed).map_err(|_| ValidationError::MalformedDecimal {
        field,
        value: raw.to_string(),
    })
}

// =============================================================================
// Trades
// =============================================================================

/// Trade as decoded from the venue feed, decimals still as text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTrade {
    pub event_time: i64,
    pub symbol: String,
    pub trade_id: i64,
    pub price: String,
    #[serde(alias = "qty")]
    pub quantity: String,
    pub buyer_order_id: i64,
    pub seller_order_id: i64,
    pub is_buyer_maker: bool,
    #[serde(default)]
    pub market_type: Option<String>,
}

impl RawTrade {
    /// Parse into a validated trade, using `fallback` when the record carries no market type.
    pub fn into_trade(self, fallback: MarketType) -> Result<NewTrade, ValidationError> {
        let market_type = match self.market_type.as_deref() {
            Some(raw) => raw.parse()?,
            None => fallback,
        };
        let trade = NewTrade {
            event_time: self.event_time,
            price: parse_decimal("price", &self.price)?,
            quantity: parse_decimal("quantity", &self.quantity)?,
            symbol: self.symbol,
            trade_id: self.trade_id,
            buyer_order_id: self.buyer_order_id,
            seller_order_id: self.seller_order_id,
            is_buyer_maker: self.is_buyer_maker,
            market_type,
        };
        trade.validate()?;
        Ok(trade)
    }
}

impl TryFrom<RawTrade> for NewTrade {
    type Error = ValidationError;

    fn try_from(raw: RawTrade) -> Result<Self, Self::Error> {
        raw.into_trade(MarketType::default())
    }
}

/// Trade ready for insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTrade {
    /// Venue event time (epoch ms).
    pub event_time: i64,
    pub symbol: String,
    /// Venue sequence number, unique within (symbol, market_type).
    pub trade_id: i64,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub quantity: Decimal,
    pub buyer_order_id: i64,
    pub seller_order_id: i64,
    pub is_buyer_maker: bool,
    #[serde(default)]
    pub market_type: MarketType,
}

impl NewTrade {
    /// Dedup key: (trade_id, symbol, market_type).
    pub fn key(&self) -> TradeKey {
        TradeKey {
            trade_id: self.trade_id,
            symbol: self.symbol.clone(),
            market_type: self.market_type,
        }
    }

    /// Check every field against its column contract.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_symbol(&self.symbol)?;
        if self.event_time < 0 {
            return Err(ValidationError::NegativeEventTime(self.event_time));
        }
        validate_non_negative("price", self.price)?;
        validate_non_negative("quantity", self.quantity)?;
        Ok(())
    }
}

/// The triple that identifies a trade across replays.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TradeKey {
    pub trade_id: i64,
    pub symbol: String,
    pub market_type: MarketType,
}

impl fmt::Display for TradeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.market_type, self.symbol, self.trade_id)
    }
}

/// A stored trade row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub event_time: i64,
    pub symbol: String,
    pub trade_id: i64,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub quantity: Decimal,
    pub buyer_order_id: i64,
    pub seller_order_id: i64,
    pub is_buyer_maker: bool,
    pub market_type: MarketType,
    pub created_at: DateTime<Utc>,
}

impl Trade {
    /// Attach a generated identity and ingestion time.
    pub fn from_new(trade: &NewTrade, id: Uuid, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            event_time: trade.event_time,
            symbol: trade.symbol.clone(),
            trade_id: trade.trade_id,
            price: trade.price,
            quantity: trade.quantity,
            buyer_order_id: trade.buyer_order_id,
            seller_order_id: trade.seller_order_id,
            is_buyer_maker: trade.is_buyer_maker,
            market_type: trade.market_type,
            created_at,
        }
    }

    pub fn key(&self) -> TradeKey {
        TradeKey {
            trade_id: self.trade_id,
            symbol: self.symbol.clone(),
            market_type: self.market_type,
        }
    }
}

/// Result of a single trade insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// First time this key was seen.
    Inserted(Trade),
    /// Key already stored; nothing was written.
    Duplicate,
}

impl InsertOutcome {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, InsertOutcome::Duplicate)
    }

    pub fn inserted(&self) -> Option<&Trade> {
        match self {
            InsertOutcome::Inserted(trade) => Some(trade),
            InsertOutcome::Duplicate => None,
        }
    }
}

/// Result of a batch insert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub inserted: usize,
    pub duplicates: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn raw(price: &str, qty: &str) -> RawTrade {
        RawTrade {
            event_time: 1_000,
            symbol: "BTCUSDT".to_string(),
            trade_id: 100,
            price: price.to_string(),
            quantity: qty.to_string(),
            buyer_order_id: 1,
            seller_order_id: 2,
            is_buyer_maker: true,
            market_type: None,
        }
    }

    #[test]
    fn test_market_type_parsing() {
        assert_eq!("SPOT".parse::<MarketType>().unwrap(), MarketType::Spot);
        assert_eq!("futures".parse::<MarketType>().unwrap(), MarketType::Futures);
        assert_eq!(MarketType::default(), MarketType::Spot);
        assert!(matches!(
            "OPTIONS".parse::<MarketType>(),
            Err(ValidationError::UnknownMarketType(_))
        ));
    }

    #[test]
    fn test_raw_trade_keeps_exact_decimals() {
        let trade = NewTrade::try_from(raw("43250.12345678", "0.00100000")).unwrap();
        assert_eq!(trade.price, dec!(43250.12345678));
        assert_eq!(trade.quantity.to_string(), "0.00100000");
        assert_eq!(trade.market_type, MarketType::Spot);
    }

    #[test]
    fn test_raw_trade_rejects_bad_decimals() {
        assert!(matches!(
            NewTrade::try_from(raw("1e3", "1")),
            Err(ValidationError::MalformedDecimal { field: "price", .. })
        ));
        assert!(matches!(
            NewTrade::try_from(raw("100", "abc")),
            Err(ValidationError::MalformedDecimal {
                field: "quantity",
                ..
            })
        ));
        assert!(matches!(
            NewTrade::try_from(raw("", "1")),
            Err(ValidationError::MissingField("price"))
        ));
        assert!(matches!(
            NewTrade::try_from(raw("-1", "1")),
            Err(ValidationError::Negative { field: "price", .. })
        ));
    }

    #[test]
    fn test_raw_trade_market_type_override() {
        let mut r = raw("1", "1");
        r.market_type = Some("FUTURES".to_string());
        let trade = r.into_trade(MarketType::Spot).unwrap();
        assert_eq!(trade.market_type, MarketType::Futures);

        let trade = raw("1", "1").into_trade(MarketType::Futures).unwrap();
        assert_eq!(trade.market_type, MarketType::Futures);
    }

    #[test]
    fn test_symbol_validation() {
        let mut trade = NewTrade::try_from(raw("1", "1")).unwrap();
        trade.symbol = String::new();
        assert_eq!(trade.validate(), Err(ValidationError::MissingField("symbol")));

        trade.symbol = "X".repeat(MAX_SYMBOL_LEN);
        assert!(trade.validate().is_ok());

        trade.symbol = "X".repeat(MAX_SYMBOL_LEN + 1);
        assert!(matches!(
            trade.validate(),
            Err(ValidationError::SymbolTooLong { len: 21, .. })
        ));
    }

    #[test]
    fn test_zero_price_is_valid() {
        let trade = NewTrade::try_from(raw("0", "-0")).unwrap();
        assert!(trade.validate().is_ok());
        assert!(trade.price.is_zero());
    }

    #[test]
    fn test_raw_trade_from_feed_json() {
        let line = r#"{"event_time":1700000000000,"symbol":"ETHUSDT","trade_id":7,
            "price":"2000.50","qty":"1.5","buyer_order_id":11,"seller_order_id":12,
            "is_buyer_maker":false}"#;
        let raw: RawTrade = serde_json::from_str(line).unwrap();
        let trade = NewTrade::try_from(raw).unwrap();
        assert_eq!(trade.price, dec!(2000.50));
        assert_eq!(trade.quantity, dec!(1.5));
        assert_eq!(trade.key().to_string(), "SPOT/ETHUSDT#7");
    }
}
