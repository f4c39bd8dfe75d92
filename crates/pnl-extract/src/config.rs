//! Configuration for pnl-extract.
//!
//! Supports loading from TOML file with CLI argument overrides.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use alloy_primitives::Address;
use pnl_common::{normalize_address, TimeWindow, WindowError};
use pnl_core::UnredeemedPolicy;
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;

use crate::http::HttpConfig;

/// Default tracked trader.
const DEFAULT_USER: &str = "0x63ce342161250d705dc0b16df89036c8e5f9ba9a";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse TOML config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid user address '{0}': expected a 20-byte hex address")]
    InvalidAddress(String),

    #[error(transparent)]
    Window(#[from] WindowError),

    #[error("Invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Top-level configuration for pnl-extract.
#[derive(Debug, Clone)]
pub struct ExtractConfig {
    /// Tracked address, lowercase.
    pub user: String,
    /// Profile handle for the scraped source; the address when unset.
    pub profile: Option<String>,
    /// First day of the window (YYYY-MM-DD).
    pub start: String,
    /// Last day of the window, inclusive (YYYY-MM-DD).
    pub end: String,
    pub data_dir: PathBuf,
    pub log_level: String,
    pub sources: SourcesConfig,
    pub reconcile: ReconcileConfig,
    pub policy: UnredeemedPolicy,
}

/// Endpoints and paging behaviour shared by all sources.
#[derive(Debug, Clone)]
pub struct SourcesConfig {
    pub gamma_url: String,
    /// Markets ending this long before or after the window are fetched too.
    pub market_horizon: chrono::Duration,
    /// Base of the profile pages (`{data_url}/profile/{handle}`).
    pub data_url: String,
    /// Base of the REST activity feed.
    pub data_api_url: String,
    /// JSON-RPC endpoint for trade block numbers; lookups are skipped when unset.
    pub polygon_rpc_url: Option<String>,
    /// Cap on activity rows read per run, 0 for no cap.
    pub activity_max_items: usize,
    pub orderbook_subgraph_url: String,
    pub activity_subgraph_url: String,
    pub pnl_subgraph_url: String,
    pub page_size: usize,
    /// Pause between consecutive page requests.
    pub page_delay: Duration,
    pub http: HttpConfig,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        SourcesToml::default().into()
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Absolute USD difference tolerated between sources.
    pub tolerance: Decimal,
    /// Snapshot series used for the scraped figure.
    pub timeframe: String,
    /// Block used for lookups before `fallback_split_timestamp` when the lookup fails.
    pub fallback_start_block: u64,
    /// Block used for lookups at or after `fallback_split_timestamp` when the lookup fails.
    pub fallback_end_block: u64,
    pub fallback_split_timestamp: i64,
    /// Decimals of the `realizedPnl` field on the PnL subgraph.
    pub pnl_subgraph_decimals: u32,
}

impl ReconcileConfig {
    /// Static block estimate for a timestamp.
    pub fn fallback_block(&self, timestamp: i64) -> u64 {
        if timestamp < self.fallback_split_timestamp {
            self.fallback_start_block
        } else {
            self.fallback_end_block
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        ReconcileToml::default().into()
    }
}

impl Default for ExtractConfig {
    fn default() -> Self {
        TomlConfig::default().into()
    }
}

/// Values given on the command line; `None` keeps the file/default value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub user: Option<String>,
    pub profile: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub log_level: Option<String>,
    pub policy: Option<UnredeemedPolicy>,
    pub tolerance: Option<Decimal>,
}

impl ExtractConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Read {
                path: path.as_ref().to_path_buf(),
                source,
            })?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file: TomlConfig = toml::from_str(content)?;
        Ok(Self::from(file))
    }

    /// Load `path` if it exists, defaults otherwise.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply CLI overrides to the configuration.
    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(user) = overrides.user {
            self.user = normalize_address(&user);
        }
        if let Some(profile) = overrides.profile {
            self.profile = Some(profile);
        }
        if let Some(start) = overrides.start {
            self.start = start;
        }
        if let Some(end) = overrides.end {
            self.end = end;
        }
        if let Some(dir) = overrides.data_dir {
            self.data_dir = dir;
        }
        if let Some(level) = overrides.log_level {
            self.log_level = level;
        }
        if let Some(policy) = overrides.policy {
            self.policy = policy;
        }
        if let Some(tolerance) = overrides.tolerance {
            self.reconcile.tolerance = tolerance;
        }
    }

    /// Check every input that would otherwise fail mid-run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Address::from_str(&self.user).map_err(|_| ConfigError::InvalidAddress(self.user.clone()))?;
        self.window()?;
        if self.sources.page_size == 0 {
            return Err(ConfigError::Invalid {
                field: "sources.page_size",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.sources.market_horizon < chrono::Duration::zero() {
            return Err(ConfigError::Invalid {
                field: "sources.market_horizon_days",
                reason: "must not be negative".to_string(),
            });
        }
        if self.reconcile.tolerance.is_sign_negative() {
            return Err(ConfigError::Invalid {
                field: "reconcile.tolerance",
                reason: "must not be negative".to_string(),
            });
        }
        Ok(())
    }

    /// The half-open reconciliation window.
    pub fn window(&self) -> Result<TimeWindow, WindowError> {
        TimeWindow::parse(&self.start, &self.end)
    }

    /// Handle used to build the profile URL.
    pub fn profile_handle(&self) -> &str {
        self.profile.as_deref().unwrap_or(&self.user)
    }
}

/// TOML file structure for deserialization.
#[derive(Debug, Default, Deserialize)]
struct TomlConfig {
    #[serde(default)]
    general: GeneralToml,
    #[serde(default)]
    sources: SourcesToml,
    #[serde(default)]
    reconcile: ReconcileToml,
    #[serde(default)]
    policy: PolicyToml,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct GeneralToml {
    user: String,
    profile: Option<String>,
    start: String,
    end: String,
    data_dir: PathBuf,
    log_level: String,
}

impl Default for GeneralToml {
    fn default() -> Self {
        Self {
            user: DEFAULT_USER.to_string(),
            profile: None,
            start: "2026-01-05".to_string(),
            end: "2026-01-06".to_string(),
            data_dir: PathBuf::from("data"),
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct SourcesToml {
    gamma_url: String,
    market_horizon_days: i64,
    data_url: String,
    data_api_url: String,
    polygon_rpc_url: String,
    activity_max_items: usize,
    orderbook_subgraph_url: String,
    activity_subgraph_url: String,
    pnl_subgraph_url: String,
    page_size: usize,
    page_delay_ms: u64,
    request_timeout_secs: u64,
    max_retries: u32,
    initial_backoff_ms: u64,
}

impl Default for SourcesToml {
    fn default() -> Self {
        let goldsky = "https://api.goldsky.com/api/public/project_cl6mb8i9h0003e201j6li0diw/subgraphs";
        Self {
            gamma_url: "https://gamma-api.polymarket.com".to_string(),
            market_horizon_days: 1,
            data_url: "https://polymarket.com".to_string(),
            data_api_url: "https://data-api.polymarket.com".to_string(),
            polygon_rpc_url: String::new(),
            activity_max_items: 0,
            orderbook_subgraph_url: format!("{goldsky}/orderbook-subgraph/0.0.1/gn"),
            activity_subgraph_url: format!("{goldsky}/activity-subgraph/0.0.4/gn"),
            pnl_subgraph_url: format!("{goldsky}/pnl-subgraph/0.0.14/gn"),
            page_size: 1000,
            page_delay_ms: 100,
            request_timeout_secs: 30,
            max_retries: 3,
            initial_backoff_ms: 1000,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ReconcileToml {
    tolerance: Decimal,
    timeframe: String,
    fallback_start_block: u64,
    fallback_end_block: u64,
    fallback_split_timestamp: i64,
    pnl_subgraph_decimals: u32,
}

impl Default for ReconcileToml {
    fn default() -> Self {
        Self {
            tolerance: Decimal::from(5),
            timeframe: "ALL".to_string(),
            fallback_start_block: 81_139_400,
            fallback_end_block: 81_213_222,
            fallback_split_timestamp: 1_767_700_000,
            pnl_subgraph_decimals: 6,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PolicyToml {
    closed_unredeemed: UnredeemedPolicy,
}

impl From<SourcesToml> for SourcesConfig {
    fn from(toml: SourcesToml) -> Self {
        Self {
            gamma_url: toml.gamma_url.trim_end_matches('/').to_string(),
            market_horizon: chrono::Duration::days(toml.market_horizon_days),
            data_url: toml.data_url.trim_end_matches('/').to_string(),
            data_api_url: toml.data_api_url.trim_end_matches('/').to_string(),
            polygon_rpc_url: Some(toml.polygon_rpc_url.trim().to_string())
                .filter(|u| !u.is_empty()),
            activity_max_items: toml.activity_max_items,
            orderbook_subgraph_url: toml.orderbook_subgraph_url,
            activity_subgraph_url: toml.activity_subgraph_url,
            pnl_subgraph_url: toml.pnl_subgraph_url,
            page_size: toml.page_size,
            page_delay: Duration::from_millis(toml.page_delay_ms),
            http: HttpConfig {
                timeout: Duration::from_secs(toml.request_timeout_secs),
                max_retries: toml.max_retries,
                initial_backoff: Duration::from_millis(toml.initial_backoff_ms),
            },
        }
    }
}

impl From<ReconcileToml> for ReconcileConfig {
    fn from(toml: ReconcileToml) -> Self {
        Self {
            tolerance: toml.tolerance,
            timeframe: toml.timeframe,
            fallback_start_block: toml.fallback_start_block,
            fallback_end_block: toml.fallback_end_block,
            fallback_split_timestamp: toml.fallback_split_timestamp,
            pnl_subgraph_decimals: toml.pnl_subgraph_decimals,
        }
    }
}

impl From<TomlConfig> for ExtractConfig {
    fn from(toml: TomlConfig) -> Self {
        Self {
            user: normalize_address(&toml.general.user),
            profile: toml.general.profile.filter(|p| !p.trim().is_empty()),
            start: toml.general.start,
            end: toml.general.end,
            data_dir: toml.general.data_dir,
            log_level: toml.general.log_level,
            sources: toml.sources.into(),
            reconcile: toml.reconcile.into(),
            policy: toml.policy.closed_unredeemed,
        }
    }
}
