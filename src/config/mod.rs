use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub markets: MarketsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    /// CLOB market-channel WebSocket URL
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// How often a PING frame is sent.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Silence longer than this forces a reconnect.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    /// Consecutive failed connects before giving up. Unset = retry forever.
    #[serde(default)]
    pub max_reconnect_attempts: Option<u32>,
    /// Log a preview of every inbound frame.
    #[serde(default)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketsConfig {
    /// Gamma API URL (market resolution)
    #[serde(default = "default_gamma_url")]
    pub gamma_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_ws_url() -> String {
    "wss://ws-subscriptions-clob.polymarket.com/ws/market".to_string()
}
fn default_gamma_url() -> String {
    "https://gamma-api.polymarket.com".to_string()
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_heartbeat_interval_ms() -> u64 {
    10_000
}
fn default_heartbeat_timeout_ms() -> u64 {
    30_000
}
fn default_reconnect_base_ms() -> u64 {
    1_000
}
fn default_reconnect_max_ms() -> u64 {
    60_000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            connect_timeout_ms: default_connect_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            max_reconnect_attempts: None,
            verbose: false,
        }
    }
}

impl Default for MarketsConfig {
    fn default() -> Self {
        Self {
            gamma_url: default_gamma_url(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl FeedConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        url::Url::parse(&self.ws_url)
            .map_err(|e| ConfigError::Invalid(format!("feed.ws_url: {e}")))?;
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "feed.heartbeat_interval_ms must be non-zero".into(),
            ));
        }
        if self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            return Err(ConfigError::Invalid(
                "feed.heartbeat_timeout_ms must exceed heartbeat_interval_ms".into(),
            ));
        }
        if self.reconnect_base_ms == 0 || self.reconnect_base_ms > self.reconnect_max_ms {
            return Err(ConfigError::Invalid(
                "feed.reconnect_base_ms must be in 1..=reconnect_max_ms".into(),
            ));
        }
        if self.max_reconnect_attempts == Some(0) {
            return Err(ConfigError::Invalid(
                "feed.max_reconnect_attempts must be at least 1 when set".into(),
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Load config from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&contents)?;
        config.apply_env();
        config.feed.validate()?;
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Defaults plus environment overrides (no file needed).
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("PAIRFEED_WS_URL") {
            self.feed.ws_url = url;
        }
        if let Ok(url) = std::env::var("PAIRFEED_GAMMA_URL") {
            self.markets.gamma_url = url;
        }
        if let Ok(v) = std::env::var("PAIRFEED_VERBOSE") {
            self.feed.verbose = matches!(v.as_str(), "1" | "true" | "yes");
        }
    }
}
