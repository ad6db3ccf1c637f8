use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use statecraft::StrategySpec;

/// Demo configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub persistence: StrategySpec,
    pub cache_ttl: Duration,
    pub saga_debounce: Duration,
    pub data_dir: PathBuf,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        Ok(Self {
            persistence: var("STATECRAFT_PERSISTENCE")
                .unwrap_or_else(|| "debounced:250".to_string())
                .parse()
                .context("STATECRAFT_PERSISTENCE must be every_change, debounced:<ms> or throttled:<ms>")?,
            cache_ttl: Duration::from_secs(
                var("STATECRAFT_CACHE_TTL_SECS")
                    .unwrap_or_else(|| "86400".to_string())
                    .parse()
                    .context("STATECRAFT_CACHE_TTL_SECS must be a valid number")?,
            ),
            saga_debounce: Duration::from_millis(
                var("STATECRAFT_SAGA_DEBOUNCE_MS")
                    .unwrap_or_else(|| "100".to_string())
                    .parse()
                    .context("STATECRAFT_SAGA_DEBOUNCE_MS must be a valid number")?,
            ),
            data_dir: var("STATECRAFT_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".statecraft")),
        })
    }
}
