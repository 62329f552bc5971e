// =============================================================================
// Service Configuration — JSON file + environment overrides
// =============================================================================
//
// Every tunable of the fetch/serve process lives here.  All fields carry a
// serde default so that a partial (or missing) config file still yields a
// working service; environment variables are applied on top of the file.
//
//   MINUTE_BARS_DATA_DIR   record directory
//   MINUTE_BARS_BIND_ADDR  HTTP listen address
//   MINUTE_BARS_TICKERS    comma-separated default ticker set
//
// =============================================================================

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::indicators::MIN_LOOKBACK_SESSIONS;
use crate::provider::yahoo::DEFAULT_BASE_URL;
use crate::updater::{RetryPolicy, UpdaterSettings};

pub const DEFAULT_CONFIG_PATH: &str = "minute_bars.json";

pub const ENV_DATA_DIR: &str = "MINUTE_BARS_DATA_DIR";
pub const ENV_BIND_ADDR: &str = "MINUTE_BARS_BIND_ADDR";
pub const ENV_TICKERS: &str = "MINUTE_BARS_TICKERS";

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_tickers() -> Vec<String> {
    vec!["SNDK".to_string(), "QQQ".to_string(), "NVDA".to_string()]
}

fn default_market_timezone() -> String {
    "America/New_York".to_string()
}

fn default_max_history_days() -> u32 {
    30
}

fn default_max_requests_per_window() -> usize {
    5
}

fn default_rate_window_secs() -> u64 {
    60
}

fn default_max_fetch_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    2_000
}

fn default_lookback_sessions() -> usize {
    MIN_LOOKBACK_SESSIONS
}

fn default_provider_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

// =============================================================================
// ServiceConfig
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    // --- Storage & serving ---------------------------------------------------

    /// Directory holding one `<TICKER>.records` file per ticker.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Tickers updated when a request names none.
    #[serde(default = "default_tickers")]
    pub default_tickers: Vec<String>,

    /// IANA zone that defines "today" and the trading date of a bar.
    #[serde(default = "default_market_timezone")]
    pub market_timezone: String,

    // --- Update algorithm ----------------------------------------------------

    /// How far back a fresh store is seeded; also the provider's 1-minute
    /// history horizon.
    #[serde(default = "default_max_history_days")]
    pub max_history_days: u32,

    /// Persisted sessions handed to the indicators as warm-up (at least 14).
    #[serde(default = "default_lookback_sessions")]
    pub lookback_sessions: usize,

    // --- Provider ------------------------------------------------------------

    #[serde(default = "default_max_requests_per_window")]
    pub max_requests_per_window: usize,

    #[serde(default = "default_rate_window_secs")]
    pub rate_window_secs: u64,

    /// Attempts per request, including the first.
    #[serde(default = "default_max_fetch_attempts")]
    pub max_fetch_attempts: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_provider_base_url")]
    pub provider_base_url: String,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            bind_addr: default_bind_addr(),
            default_tickers: default_tickers(),
            market_timezone: default_market_timezone(),
            max_history_days: default_max_history_days(),
            lookback_sessions: default_lookback_sessions(),
            max_requests_per_window: default_max_requests_per_window(),
            rate_window_secs: default_rate_window_secs(),
            max_fetch_attempts: default_max_fetch_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            provider_base_url: default_provider_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read service config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse service config from {}", path.display()))?;

        info!(
            path = %path.display(),
            data_dir = %config.data_dir.display(),
            tickers = ?config.default_tickers,
            "service config loaded"
        );

        Ok(config)
    }

    /// Load `path` (defaults when it does not exist), apply environment
    /// overrides and validate the result.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            Self::load(path)?
        } else {
            warn!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };
        config.apply_env_overrides();
        config.finalize()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from `lookup` (an environment-like key → value map).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup(ENV_DATA_DIR).filter(|v| !v.trim().is_empty()) {
            info!(data_dir = %dir, "data_dir overridden from environment");
            self.data_dir = PathBuf::from(dir.trim());
        }
        if let Some(addr) = lookup(ENV_BIND_ADDR).filter(|v| !v.trim().is_empty()) {
            info!(bind_addr = %addr, "bind_addr overridden from environment");
            self.bind_addr = addr.trim().to_string();
        }
        if let Some(list) = lookup(ENV_TICKERS) {
            let tickers: Vec<String> = list
                .split(',')
                .map(|t| t.trim().to_uppercase())
                .filter(|t| !t.is_empty())
                .collect();
            if !tickers.is_empty() {
                info!(?tickers, "default tickers overridden from environment");
                self.default_tickers = tickers;
            }
        }
    }

    /// Clamp out-of-range values and reject settings the service cannot run
    /// with.
    pub fn finalize(&mut self) -> Result<()> {
        if self.lookback_sessions < MIN_LOOKBACK_SESSIONS {
            warn!(
                configured = self.lookback_sessions,
                minimum = MIN_LOOKBACK_SESSIONS,
                "lookback_sessions too small, clamping"
            );
            self.lookback_sessions = MIN_LOOKBACK_SESSIONS;
        }
        if self.max_fetch_attempts == 0 {
            self.max_fetch_attempts = 1;
        }
        if self.default_tickers.is_empty() {
            self.default_tickers = default_tickers();
        }
        self.market_tz()?;
        Ok(())
    }

    pub fn market_tz(&self) -> Result<Tz> {
        Tz::from_str(&self.market_timezone)
            .map_err(|e| anyhow!("invalid market_timezone {:?}: {e}", self.market_timezone))
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn updater_settings(&self) -> UpdaterSettings {
        UpdaterSettings {
            max_history_days: self.max_history_days,
            lookback_sessions: self.lookback_sessions,
            retry: RetryPolicy {
                max_attempts: self.max_fetch_attempts,
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
            },
        }
    }
}

/// Current calendar date in `tz`.
pub fn today_in(tz: Tz) -> NaiveDate {
    Utc::now().with_timezone(&tz).date_naive()
}
