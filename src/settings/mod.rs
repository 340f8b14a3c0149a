// Runtime configuration and the persisted settings blob
pub mod store;

pub use store::{ApiEnv, CoreSettings, SettingsBlob, SettingsStore};

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::execution::FeedSettings;

/// Process configuration: defaults, then `tradedesk.toml` (or `--config`),
/// then `TRADEDESK_*` environment variables
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DeskConfig {
    pub api_base: String,
    pub request_timeout_secs: u64,
    pub requests_per_second: u32,
    pub order_book_depth: usize,
    pub trades_limit: usize,
    pub balance_history: usize,
    pub settings_path: PathBuf,
    pub log_filter: String,
    pub watchlist: Vec<String>,
}

impl Default for DeskConfig {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:5000/api".to_string(),
            request_timeout_secs: 10,
            requests_per_second: 10,
            order_book_depth: 10,
            trades_limit: 20,
            balance_history: 120,
            settings_path: PathBuf::from("trading_bot_settings.json"),
            log_filter: "tradedesk=info".to_string(),
            watchlist: ["BTCUSDT", "ETHUSDT", "BNBUSDT", "ADAUSDT", "XRPUSDT", "SOLUSDT"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl DeskConfig {
    /// Load configuration from file and environment
    ///
    /// # Arguments
    /// * `path` - Explicit config file; must exist when given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name("tradedesk").required(false),
        };

        let config: DeskConfig = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix("TRADEDESK")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("watchlist"),
            )
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.api_base.trim().is_empty() {
            anyhow::bail!("api_base must not be empty");
        }
        if self.request_timeout_secs == 0 {
            anyhow::bail!("request_timeout_secs must be at least 1");
        }
        if self.requests_per_second == 0 {
            anyhow::bail!("requests_per_second must be at least 1");
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn feed_settings(&self) -> FeedSettings {
        FeedSettings {
            order_book_depth: self.order_book_depth,
            trades_limit: self.trades_limit,
            balance_history: self.balance_history,
        }
    }

    pub fn settings_store(&self) -> SettingsStore {
        SettingsStore::new(&self.settings_path)
    }
}
