//! Configuration module for feedrelay.

use serde::Deserialize;
use std::path::Path;

use crate::state::{validate_interval, MAX_INTERVAL_MINUTES, MIN_INTERVAL_MINUTES};
use crate::{RelayError, Result};

/// Environment variable holding the Telegram bot token.
pub const BOT_TOKEN_ENV: &str = "TELEGRAM_BOT_TOKEN";

/// Relay behavior configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Poll interval for subscribers without their own setting.
    #[serde(default = "default_interval_minutes")]
    pub default_interval_minutes: u64,
    /// Mirror every delivered entry to the bound channel.
    #[serde(default = "default_mirror_to_channel")]
    pub mirror_to_channel: bool,
    /// Run one cycle over all subscribers right after startup.
    #[serde(default)]
    pub poll_on_startup: bool,
    /// Accept sources on loopback/private hosts.
    #[serde(default)]
    pub allow_private_hosts: bool,
}

fn default_interval_minutes() -> u64 {
    30
}

fn default_mirror_to_channel() -> bool {
    true
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            default_interval_minutes: default_interval_minutes(),
            mirror_to_channel: default_mirror_to_channel(),
            poll_on_startup: false,
            allow_private_hosts: false,
        }
    }
}

/// Feed fetching configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    /// Total request timeout in seconds.
    #[serde(default = "default_fetch_timeout")]
    pub timeout_secs: u64,
    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Maximum feed size in bytes.
    #[serde(default = "default_max_feed_size")]
    pub max_feed_size_bytes: u64,
    /// Maximum number of redirects.
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
    /// User agent sent with every request.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_fetch_timeout() -> u64 {
    10
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_max_feed_size() -> u64 {
    5 * 1024 * 1024 // 5MB
}

fn default_max_redirects() -> usize {
    5
}

fn default_user_agent() -> String {
    "feedrelay/0.1 (+feed notifications)".to_string()
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_fetch_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            max_feed_size_bytes: default_max_feed_size(),
            max_redirects: default_max_redirects(),
            user_agent: default_user_agent(),
        }
    }
}

/// Persisted state configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the JSON state documents.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

fn default_data_dir() -> String {
    "data".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Telegram transport configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    /// Bot API base URL.
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Bot token (prefer the TELEGRAM_BOT_TOKEN environment variable).
    #[serde(default)]
    pub bot_token: String,
    /// Message parse mode.
    #[serde(default = "default_parse_mode")]
    pub parse_mode: String,
    /// Request timeout in seconds.
    #[serde(default = "default_telegram_timeout")]
    pub timeout_secs: u64,
}

fn default_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_parse_mode() -> String {
    "Markdown".to_string()
}

fn default_telegram_timeout() -> u64 {
    10
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            bot_token: String::new(),
            parse_mode: default_parse_mode(),
            timeout_secs: default_telegram_timeout(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Path to the log file.
    #[serde(default = "default_log_file")]
    pub file: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "logs/feedrelay.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Relay behavior.
    #[serde(default)]
    pub relay: RelayConfig,
    /// Feed fetching.
    #[serde(default)]
    pub fetch: FetchConfig,
    /// Persisted state.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Telegram transport.
    #[serde(default)]
    pub telegram: TelegramConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(RelayError::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML file and apply environment variable overrides.
    pub fn load_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| RelayError::Config(format!("config parse error: {e}")))
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported environment variables:
    /// - `TELEGRAM_BOT_TOKEN`: Override the bot token
    pub fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var(BOT_TOKEN_ENV) {
            if !token.is_empty() {
                self.telegram.bot_token = token;
            }
        }
    }

    /// Validate the configuration.
    ///
    /// Returns an error if:
    /// - the bot token is not set
    /// - the default interval is outside 1 minute to 1 week
    /// - a timeout is zero
    pub fn validate(&self) -> Result<()> {
        if self.telegram.bot_token.is_empty() {
            return Err(RelayError::Config(format!(
                "bot_token is not set. Set it in config.toml or via {BOT_TOKEN_ENV} environment variable."
            )));
        }
        if validate_interval(self.relay.default_interval_minutes).is_err() {
            return Err(RelayError::Config(format!(
                "default_interval_minutes must be between {MIN_INTERVAL_MINUTES} and {MAX_INTERVAL_MINUTES}"
            )));
        }
        if self.fetch.timeout_secs == 0 || self.telegram.timeout_secs == 0 {
            return Err(RelayError::Config(
                "timeouts must be at least 1 second".to_string(),
            ));
        }
        Ok(())
    }
}
