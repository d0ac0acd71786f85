//! Application configuration.

use crate::error::{AppError, AppResult};
use rfq_core::AssetPair;
use rfq_ws::ConnectionConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Maker base URL (http(s) or ws(s)).
    #[serde(default = "default_maker_url")]
    pub maker_url: String,
    /// Identifier appended to the socket path.
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Pairs to subscribe to for price updates ("FROM/TO").
    #[serde(default)]
    pub pairs: Vec<String>,
    #[serde(default)]
    pub quotes: QuoteConfig,
    #[serde(default)]
    pub websocket: WsConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

fn default_maker_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_client_id() -> String {
    "rfq-client".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            maker_url: default_maker_url(),
            client_id: default_client_id(),
            pairs: Vec::new(),
            quotes: QuoteConfig::default(),
            websocket: WsConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

/// Periodic quote requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteConfig {
    /// Interval between request rounds (ms). Default: 5,000.
    #[serde(default = "default_quote_interval_ms")]
    pub interval_ms: u64,
    #[serde(default)]
    pub requests: Vec<QuoteTarget>,
}

fn default_quote_interval_ms() -> u64 {
    5_000
}

impl Default for QuoteConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_quote_interval_ms(),
            requests: Vec::new(),
        }
    }
}

/// One quote request sent every round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteTarget {
    pub from_asset: String,
    pub to_asset: String,
    /// Amount in the smallest unit of `from_asset`.
    pub amount: u64,
}

/// Connection tunables. Field meanings match `rfq_ws::ConnectionConfig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsConfig {
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,
    #[serde(default = "default_circuit_open_duration_ms")]
    pub circuit_open_duration_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_max_reconnect_attempts() -> u32 {
    8
}

fn default_reconnect_base_delay_ms() -> u64 {
    5_000
}

fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}

fn default_heartbeat_interval_ms() -> u64 {
    10_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    20_000
}

fn default_circuit_failure_threshold() -> u32 {
    5
}

fn default_circuit_open_duration_ms() -> u64 {
    30_000
}

fn default_queue_capacity() -> usize {
    200
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            circuit_failure_threshold: default_circuit_failure_threshold(),
            circuit_open_duration_ms: default_circuit_open_duration_ms(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl From<WsConfig> for ConnectionConfig {
    fn from(cfg: WsConfig) -> Self {
        Self {
            max_reconnect_attempts: cfg.max_reconnect_attempts,
            reconnect_base_delay_ms: cfg.reconnect_base_delay_ms,
            reconnect_max_delay_ms: cfg.reconnect_max_delay_ms,
            heartbeat_interval_ms: cfg.heartbeat_interval_ms,
            heartbeat_timeout_ms: cfg.heartbeat_timeout_ms,
            circuit_failure_threshold: cfg.circuit_failure_threshold,
            circuit_open_duration_ms: cfg.circuit_open_duration_ms,
            queue_capacity: cfg.queue_capacity,
            ..ConnectionConfig::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log the Prometheus text dump on shutdown.
    #[serde(default)]
    pub dump_metrics_on_exit: bool,
}

impl AppConfig {
    /// Load from a specific file.
    pub fn from_file(path: &str) -> AppResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("Failed to read config: {e}")))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> AppResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configs the manager or the request loop cannot run with.
    pub fn validate(&self) -> AppResult<()> {
        if self.maker_url.trim().is_empty() {
            return Err(AppError::Config("maker_url must be set".to_string()));
        }
        if self.client_id.trim().is_empty() {
            return Err(AppError::Config("client_id must be set".to_string()));
        }
        if self.quotes.interval_ms == 0 {
            return Err(AppError::Config(
                "quotes.interval_ms must be > 0".to_string(),
            ));
        }
        self.subscription_pairs()?;
        self.connection_config().validate()?;
        Ok(())
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        self.websocket.clone().into()
    }

    /// Parsed subscription pairs.
    pub fn subscription_pairs(&self) -> AppResult<Vec<AssetPair>> {
        self.pairs
            .iter()
            .map(|pair| pair.parse::<AssetPair>().map_err(AppError::from))
            .collect()
    }

    pub fn quote_interval(&self) -> Duration {
        Duration::from_millis(self.quotes.interval_ms)
    }
}
