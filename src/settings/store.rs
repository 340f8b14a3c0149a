use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_REFRESH_SECS: u64 = 5;
const MIN_REFRESH_SECS: u64 = 1;
const MAX_REFRESH_SECS: u64 = 300;
const DEFAULT_PAGE_SIZE: usize = 10;

/// Exchange environment the credentials belong to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ApiEnv {
    #[default]
    Testnet,
    Mainnet,
}

impl ApiEnv {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "testnet" | "test" | "demo" => Some(ApiEnv::Testnet),
            "mainnet" | "live" | "production" | "prod" => Some(ApiEnv::Mainnet),
            _ => None,
        }
    }
}

impl fmt::Display for ApiEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiEnv::Testnet => f.write_str("testnet"),
            ApiEnv::Mainnet => f.write_str("mainnet"),
        }
    }
}

// ============================================================================
// Persisted blob
// ============================================================================
//
// Two shapes have been written by the settings form: a rich one with
// risk/notifications/logs sections and a minimal one with only api, a
// trimmed trading section and appearance.theme. Every section and field is
// optional so both parse. Form inputs are stored as strings, so numeric
// fields accept either numbers or numeric strings.

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SettingsBlob {
    pub api: ApiSection,
    pub trading: TradingSection,
    pub orders: OrdersSection,
    pub risk: RiskSection,
    pub appearance: AppearanceSection,
}

#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct ApiSection {
    pub key: Option<String>,
    pub secret: Option<String>,
    pub env: Option<String>,
}

impl fmt::Debug for ApiSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiSection")
            .field("key", &self.key.as_ref().map(|_| "<set>"))
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("env", &self.env)
            .finish()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TradingSection {
    pub default_symbol: Option<String>,
    #[serde(deserialize_with = "lenient_decimal")]
    pub default_quantity: Option<Decimal>,
    pub confirm_orders: Option<bool>,
    pub auto_refresh: Option<bool>,
    #[serde(deserialize_with = "lenient_u64")]
    pub refresh_interval: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OrdersSection {
    #[serde(deserialize_with = "lenient_u64")]
    pub page_size: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RiskSection {
    #[serde(deserialize_with = "lenient_decimal")]
    pub max_position_size: Option<Decimal>,
    #[serde(deserialize_with = "lenient_decimal")]
    pub stop_loss: Option<Decimal>,
    #[serde(deserialize_with = "lenient_decimal")]
    pub take_profit: Option<Decimal>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppearanceSection {
    pub theme: Option<String>,
    pub chart_type: Option<String>,
}

fn lenient_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f.round() as u64)),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

fn lenient_decimal<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Decimal>, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => Decimal::from_str(&n.to_string()).ok(),
        Some(Value::String(s)) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    })
}

// ============================================================================
// Validated view
// ============================================================================

/// The values the core actually uses, validated
#[derive(Debug, Clone, PartialEq)]
pub struct CoreSettings {
    pub env: ApiEnv,
    pub refresh_interval: Duration,
    pub page_size: usize,
    pub default_symbol: Option<String>,
    pub default_quantity: Option<Decimal>,
    pub confirm_orders: bool,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            env: ApiEnv::default(),
            refresh_interval: Duration::from_secs(DEFAULT_REFRESH_SECS),
            page_size: DEFAULT_PAGE_SIZE,
            default_symbol: None,
            default_quantity: None,
            confirm_orders: true,
        }
    }
}

impl From<&SettingsBlob> for CoreSettings {
    fn from(blob: &SettingsBlob) -> Self {
        let env = match blob.api.env.as_deref() {
            None => ApiEnv::default(),
            Some(raw) => ApiEnv::parse(raw).unwrap_or_else(|| {
                tracing::warn!("Unknown api.env {:?}, using testnet", raw);
                ApiEnv::Testnet
            }),
        };

        let refresh_secs = blob
            .trading
            .refresh_interval
            .unwrap_or(DEFAULT_REFRESH_SECS)
            .clamp(MIN_REFRESH_SECS, MAX_REFRESH_SECS);

        let page_size = match blob.orders.page_size {
            Some(0) => {
                tracing::warn!("orders.pageSize must be at least 1, using {}", DEFAULT_PAGE_SIZE);
                DEFAULT_PAGE_SIZE
            }
            Some(n) => n as usize,
            None => DEFAULT_PAGE_SIZE,
        };

        CoreSettings {
            env,
            refresh_interval: Duration::from_secs(refresh_secs),
            page_size,
            default_symbol: blob
                .trading
                .default_symbol
                .as_ref()
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty()),
            default_quantity: blob.trading.default_quantity.filter(|q| *q > Decimal::ZERO),
            confirm_orders: blob.trading.confirm_orders.unwrap_or(true),
        }
    }
}

/// Read-only access to the persisted settings file
///
/// The core never writes the blob; the settings form owns it.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn parse(json: &str) -> Result<SettingsBlob> {
        serde_json::from_str(json).context("Failed to parse settings blob")
    }

    /// Load and validate. A missing file yields the defaults.
    pub fn load(&self) -> Result<CoreSettings> {
        if !self.path.exists() {
            tracing::info!(path = %self.path.display(), "No settings file, using defaults");
            return Ok(CoreSettings::default());
        }

        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let blob = Self::parse(&raw)?;

        let settings = CoreSettings::from(&blob);
        tracing::info!(
            env = %settings.env,
            refresh_secs = settings.refresh_interval.as_secs(),
            page_size = settings.page_size,
            "Settings loaded"
        );
        Ok(settings)
    }
}
