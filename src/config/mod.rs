use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::oco::{Backoff, ManagerConfig, RetryPolicy};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub bybit: BybitConfig,
    #[serde(default)]
    pub oco: OcoConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BybitConfig {
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    #[serde(default)]
    pub testnet: bool,
    #[serde(default = "default_rest_url")]
    pub rest_url: String,
    #[serde(default = "default_ws_private_url")]
    pub ws_private_url: String,
    #[serde(default = "default_recv_window_ms")]
    pub recv_window_ms: u64,
    #[serde(default = "default_category")]
    pub category: String,               // "linear" or "inverse"
    #[serde(default = "default_hedge_mode")]
    pub hedge_mode: bool,               // positionIdx 1/2 instead of 0
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

impl Default for BybitConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_secret: None,
            testnet: false,
            rest_url: default_rest_url(),
            ws_private_url: default_ws_private_url(),
            recv_window_ms: default_recv_window_ms(),
            category: default_category(),
            hedge_mode: default_hedge_mode(),
            http_timeout_secs: default_http_timeout_secs(),
        }
    }
}

impl BybitConfig {
    pub fn has_credentials(&self) -> bool {
        matches!((&self.api_key, &self.api_secret), (Some(k), Some(s)) if !k.is_empty() && !s.is_empty())
    }
}

fn default_rest_url() -> String { "https://api.bybit.com".to_string() }
fn default_ws_private_url() -> String { "wss://stream.bybit.com/v5/private".to_string() }
fn default_recv_window_ms() -> u64 { 5000 }
fn default_category() -> String { "linear".to_string() }
fn default_hedge_mode() -> bool { true }
fn default_http_timeout_secs() -> u64 { 10 }

const TESTNET_REST_URL: &str = "https://api-testnet.bybit.com";
const TESTNET_WS_PRIVATE_URL: &str = "wss://stream-testnet.bybit.com/v5/private";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OcoConfig {
    #[serde(default = "default_confirm_timeout_secs")]
    pub confirm_timeout_secs: u64,
    #[serde(default = "default_confirm_backoff_step_secs")]
    pub confirm_backoff_step_secs: u64,
    #[serde(default = "default_confirm_backoff_cap_secs")]
    pub confirm_backoff_cap_secs: u64,
    #[serde(default = "default_leg_max_attempts")]
    pub leg_max_attempts: u32,
    #[serde(default = "default_leg_backoff_step_secs")]
    pub leg_backoff_step_secs: u64,
}

impl Default for OcoConfig {
    fn default() -> Self {
        Self {
            confirm_timeout_secs: default_confirm_timeout_secs(),
            confirm_backoff_step_secs: default_confirm_backoff_step_secs(),
            confirm_backoff_cap_secs: default_confirm_backoff_cap_secs(),
            leg_max_attempts: default_leg_max_attempts(),
            leg_backoff_step_secs: default_leg_backoff_step_secs(),
        }
    }
}

fn default_confirm_timeout_secs() -> u64 { 20 }
fn default_confirm_backoff_step_secs() -> u64 { 1 }
fn default_confirm_backoff_cap_secs() -> u64 { 3 }
fn default_leg_max_attempts() -> u32 { 3 }
fn default_leg_backoff_step_secs() -> u64 { 2 }

impl From<&OcoConfig> for ManagerConfig {
    fn from(cfg: &OcoConfig) -> Self {
        Self {
            confirm_timeout: Duration::from_secs(cfg.confirm_timeout_secs),
            confirm_backoff: Backoff::capped(
                Duration::from_secs(cfg.confirm_backoff_step_secs),
                Duration::from_secs(cfg.confirm_backoff_cap_secs),
            ),
            leg_policy: RetryPolicy::new(
                cfg.leg_max_attempts,
                Backoff::linear(Duration::from_secs(cfg.leg_backoff_step_secs)),
            ),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReconciliationConfig {
    #[serde(default = "default_reconciliation_enabled")]
    pub enabled: bool,
    #[serde(default = "default_reconciliation_interval_secs")]
    pub interval_secs: u64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            enabled: default_reconciliation_enabled(),
            interval_secs: default_reconciliation_interval_secs(),
        }
    }
}

fn default_reconciliation_enabled() -> bool { true }
fn default_reconciliation_interval_secs() -> u64 { 30 }

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String { "info".to_string() }

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
}

impl Config {
    /// `config/default.*` (optional), then `BOT__SECTION__KEY` env vars,
    /// then `BYBIT_API_KEY` / `BYBIT_API_SECRET`.
    pub fn load() -> Result<Arc<Self>> {
        dotenv::dotenv().ok();

        let mut builder = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::Environment::with_prefix("BOT").separator("__"));

        if let Ok(api_key) = std::env::var("BYBIT_API_KEY") {
            builder = builder.set_override("bybit.api_key", api_key)?;
        }

        if let Ok(api_secret) = std::env::var("BYBIT_API_SECRET") {
            builder = builder.set_override("bybit.api_secret", api_secret)?;
        }

        let config: Self = builder
            .build()?
            .try_deserialize()
            .context("invalid configuration")?;
        Ok(Arc::new(config.resolved()))
    }

    /// Parse a TOML document on its own, without file or env layering.
    pub fn from_toml(source: &str) -> Result<Self> {
        let config: Self = config::Config::builder()
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()?
            .try_deserialize()
            .context("invalid configuration")?;
        Ok(config.resolved())
    }

    /// Swap in testnet endpoints when `testnet` is set and the urls were
    /// left at their mainnet defaults.
    fn resolved(mut self) -> Self {
        if self.bybit.testnet {
            if self.bybit.rest_url == default_rest_url() {
                self.bybit.rest_url = TESTNET_REST_URL.to_string();
            }
            if self.bybit.ws_private_url == default_ws_private_url() {
                self.bybit.ws_private_url = TESTNET_WS_PRIVATE_URL.to_string();
            }
        }
        self
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig::from(&self.oco)
    }
}
