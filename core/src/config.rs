use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{GateError, Result};
use crate::ids::alias_prefix_collides;

/// lngate configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateConfig {
    /// Interception hub settings
    #[serde(default)]
    pub intercept: InterceptConfig,

    /// Channel identity settings
    #[serde(default)]
    pub channels: ChannelsConfig,

    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,
}

impl GateConfig {
    /// Load from a YAML or JSON file, chosen by extension
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;

        let config: GateConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&contents)?,
            other => {
                return Err(GateError::ConfigError(format!(
                    "unsupported config format: {:?} (expected .yaml, .yml or .json)",
                    other
                )))
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.intercept.middleware_name.trim().is_empty() {
            return Err(GateError::ConfigError(
                "intercept.middleware_name must not be empty".to_string(),
            ));
        }
        if self.intercept.grace_window_ms == 0 {
            return Err(GateError::ConfigError(
                "intercept.grace_window_ms must be greater than zero".to_string(),
            ));
        }
        if self.channels.alias_prefix.is_empty() {
            return Err(GateError::ConfigError(
                "channels.alias_prefix must not be empty".to_string(),
            ));
        }
        if alias_prefix_collides(&self.channels.alias_prefix, self.channels.alias_counter_width) {
            return Err(GateError::ConfigError(format!(
                "channels.alias_prefix '{}' produces chain-anchored ids",
                self.channels.alias_prefix
            )));
        }
        Ok(())
    }
}

/// Interception hub configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptConfig {
    /// Name the hub registers its interception stream under
    pub middleware_name: String,

    /// Warn when a privileged request is still undecided after this long (ms)
    pub grace_window_ms: u64,

    /// The daemon's own decision deadline (ms); after it the daemon applies
    /// its default policy and the decision is marked expired
    pub daemon_timeout_ms: u64,
}

impl Default for InterceptConfig {
    fn default() -> Self {
        Self {
            middleware_name: "lngate".to_string(),
            grace_window_ms: 30_000,
            daemon_timeout_ms: 60_000,
        }
    }
}

impl InterceptConfig {
    pub fn grace_window(&self) -> Duration {
        Duration::from_millis(self.grace_window_ms)
    }

    pub fn daemon_timeout(&self) -> Duration {
        Duration::from_millis(self.daemon_timeout_ms)
    }
}

/// Channel identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    /// Synthetic prefix of allocated alias ids
    pub alias_prefix: String,

    /// Zero-padding width of the alias counter
    pub alias_counter_width: usize,

    /// Closed identities kept resolvable (0 = unlimited)
    pub archive_limit: usize,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            alias_prefix: "16000000x0x".to_string(),
            alias_counter_width: 1,
            archive_limit: 0,
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}
