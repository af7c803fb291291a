//! Storage Errors
//!
//! `ValidationError` rejects a single record before anything touches the
//! database. `StoreError` covers everything that reaches SQLite.
//!
//! A duplicate trade key is neither: it is reported as
//! `InsertOutcome::Duplicate`.

use thiserror::Error;

/// A record failed validation and was never written.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Required text field was empty.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// Symbol exceeds the column width.
    #[error("symbol '{symbol}' is {len} chars, max is {max}")]
    SymbolTooLong {
        symbol: String,
        len: usize,
        max: usize,
    },

    /// Decimal text could not be parsed exactly.
    #[error("malformed decimal in {field}: '{value}'")]
    MalformedDecimal { field: &'static str, value: String },

    /// Price or quantity below zero.
    #[error("{field} must be non-negative, got {value}")]
    Negative { field: &'static str, value: String },

    /// Event time before the Unix epoch.
    #[error("event_time must be non-negative, got {0}")]
    NegativeEventTime(i64),

    /// Market segment not recognised.
    #[error("unknown market type '{0}'")]
    UnknownMarketType(String),

    /// Bid/ask document did not decode into price levels.
    #[error("malformed {side} document: {reason}")]
    MalformedBook { side: &'static str, reason: String },

    /// Price levels out of order for their side.
    #[error("{side} level {index} at price {price} breaks {expected} price order")]
    UnorderedBook {
        side: &'static str,
        index: usize,
        price: String,
        expected: &'static str,
    },
}

/// Errors returned by the stores and the schema migrator.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Record rejected before write.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A schema change failed; nothing from it was kept and later changes did not run.
    #[error("schema change {version} ({name}) failed: {source}")]
    SchemaApply {
        version: u64,
        name: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    /// Migrator built with versions that are not strictly increasing.
    #[error("schema change {version} ({name}) is not after {previous}")]
    InvalidMigrationOrder {
        version: u64,
        name: &'static str,
        previous: u64,
    },

    /// Any other SQLite failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Bid/ask document could not be encoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Database directory could not be created.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Decimal arithmetic left the representable range.
    #[error("decimal overflow in {field} for bucket {bucket_start_ms}")]
    Overflow {
        field: &'static str,
        bucket_start_ms: i64,
    },

    /// A stored row no longer decodes into its model.
    #[error("corrupt row in {table}: {reason}")]
    Corrupt { table: &'static str, reason: String },
}

impl StoreError {
    pub(crate) fn corrupt(table: &'static str, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            table,
            reason: reason.into(),
        }
    }

    /// True when startup must abort because the schema could not be brought up to date.
    pub fn is_schema_failure(&self) -> bool {
        matches!(
            self,
            Self::SchemaApply { .. } | Self::InvalidMigrationOrder { .. }
        )
    }
}

/// Whether a SQLite error is the unique-index violation raised by a duplicate key.
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            e.code == rusqlite::ErrorCode::ConstraintViolation
                && e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_converts_into_store_error() {
        let err: StoreError = ValidationError::MissingField("symbol").into();
        assert!(matches!(err, StoreError::Validation(_)));
        assert_eq!(err.to_string(), "missing required field: symbol");
        assert!(!err.is_schema_failure());
    }

    #[test]
    fn test_unique_violation_detection() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE t (id TEXT PRIMARY KEY, k INTEGER NOT NULL);
             CREATE UNIQUE INDEX idx_t_k ON t(k);
             INSERT INTO t (id, k) VALUES ('a', 1);",
        )
        .unwrap();

        let dup_key = conn
            .execute("INSERT INTO t (id, k) VALUES ('b', 1)", [])
            .unwrap_err();
        assert!(is_unique_violation(&dup_key));

        // Primary key collisions carry a different extended code
        let dup_pk = conn
            .execute("INSERT INTO t (id, k) VALUES ('a', 2)", [])
            .unwrap_err();
        assert!(!is_unique_violation(&dup_pk));

        let not_null = conn
            .execute("INSERT INTO t (id, k) VALUES ('c', NULL)", [])
            .unwrap_err();
        assert!(!is_unique_violation(&not_null));
    }
}
