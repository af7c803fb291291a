//! Archive configuration
//!
//! Loaded from TOML (`TICKARCHIVE_CONFIG`, else `tickarchive.toml`), then
//! overridden field by field from the environment.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

use crate::storage::{ConnectionOptions, MarketType};

pub const CONFIG_PATH_ENV: &str = "TICKARCHIVE_CONFIG";
pub const DB_PATH_ENV: &str = "TICKARCHIVE_DB_PATH";
pub const BUSY_TIMEOUT_ENV: &str = "TICKARCHIVE_BUSY_TIMEOUT_MS";
pub const DEFAULT_MARKET_ENV: &str = "TICKARCHIVE_DEFAULT_MARKET";

const DEFAULT_CONFIG_PATH: &str = "tickarchive.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// SQLite database file
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Writer wait on a locked database (ms)
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Market segment for records that do not carry one
    #[serde(default)]
    pub default_market: MarketType,

    /// SQLite page cache (KiB)
    #[serde(default = "default_cache_size_kib")]
    pub cache_size_kib: i64,
}

fn default_db_path() -> String {
    "data/tickarchive.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_cache_size_kib() -> i64 {
    32_000
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            default_market: MarketType::default(),
            cache_size_kib: default_cache_size_kib(),
        }
    }
}

impl ArchiveConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load from the configured path (or defaults), then apply environment overrides
    pub fn from_env() -> Self {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        let mut config = Self::load(&path).unwrap_or_else(|e| {
            tracing::debug!("Using default archive config ({}): {}", path, e);
            Self::default()
        });
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Override fields from `lookup`. Unparseable values are logged and ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let value = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(path) = value(DB_PATH_ENV) {
            self.db_path = path;
        }
        if let Some(raw) = value(BUSY_TIMEOUT_ENV) {
            match raw.trim().parse() {
                Ok(ms) => self.busy_timeout_ms = ms,
                Err(_) => warn!(key = BUSY_TIMEOUT_ENV, value = %raw, "Ignoring invalid override"),
            }
        }
        if let Some(raw) = value(DEFAULT_MARKET_ENV) {
            match raw.parse() {
                Ok(market) => self.default_market = market,
                Err(_) => warn!(key = DEFAULT_MARKET_ENV, value = %raw, "Ignoring invalid override"),
            }
        }
    }

    /// Save to TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            busy_timeout_ms: self.busy_timeout_ms,
            cache_size_kib: self.cache_size_kib,
        }
    }
}

/// Load `.env` from the working directory (and parents), then next to the manifest.
pub fn load_env() {
    let _ = dotenv::dotenv();

    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}
