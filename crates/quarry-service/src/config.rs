//! Configuration management for the Quarry engine.
//!
//! Supports multiple configuration sources with precedence:
//! 1. Environment variables (highest priority)
//! 2. TOML configuration file
//! 3. Default values (lowest priority)

use std::path::PathBuf;
use std::time::Duration;

use quarry_core::limits::{duration_serde, parse_byte_size, parse_duration};
use quarry_core::{IsolationLevel, ResourceLimits};
use quarry_query::BatchFailurePolicy;
use serde::{Deserialize, Serialize};

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "quarry.toml";

/// Main engine configuration.
///
/// Can be loaded from TOML file or constructed with defaults.
/// Environment variables override TOML settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Database connection
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Process-wide resource ceilings
    #[serde(default)]
    pub limits: ResourceLimits,

    /// Transaction defaults
    #[serde(default)]
    pub transactions: TransactionsConfig,

    /// Independent batch behaviour
    #[serde(default)]
    pub batch: BatchConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database URL (default: "sqlite://quarry.db")
    #[serde(default = "default_db_url")]
    pub url: String,

    /// Max connections in pool (default: 8)
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long a statement waits for a free pooled connection (default: 30s)
    #[serde(default = "default_acquire_timeout", with = "duration_serde")]
    pub acquire_timeout: Duration,
}

/// Transaction defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionsConfig {
    /// Isolation level used when a request names none (default: the
    /// database's own default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation_level: Option<IsolationLevel>,
}

/// Independent batch behaviour
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchConfig {
    /// `continue` or `abort` (default: "continue")
    #[serde(default)]
    pub failure_policy: BatchFailurePolicy,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error (default: "info")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty (default: "pretty")
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_db_url() -> String {
    "sqlite://quarry.db".to_string()
}

fn default_max_connections() -> u32 {
    8
}

fn default_acquire_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_db_url(),
            max_connections: default_max_connections(),
            acquire_timeout: default_acquire_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file doesn't exist or has invalid TOML syntax.
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let contents = std::fs::read_to_string(&path).map_err(|e| ConfigError::IoError {
            path: path.clone(),
            source: e,
        })?;

        toml::from_str(&contents).map_err(|e| ConfigError::TomlError { path, source: e })
    }

    /// Load, override and validate the configuration.
    ///
    /// Reads the file named by `QUARRY_CONFIG`, else `quarry.toml` when it
    /// exists, else starts from defaults. Environment variables override
    /// file values; see [`Config::apply_env_overrides`].
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("QUARRY_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) if std::path::Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(DEFAULT_CONFIG_PATH)?
            }
            Err(_) => Self::default(),
        };

        config.apply_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported environment variables:
    /// - `QUARRY_DATABASE_URL` - Database URL
    /// - `QUARRY_MAX_CONNECTIONS` - Pool size
    /// - `QUARRY_MAX_RESPONSE_SIZE` - e.g. `64 MiB`
    /// - `QUARRY_QUERY_TIMEOUT` - e.g. `30s`, `PT30S`
    /// - `QUARRY_MAX_TRANSACTION_TIMEOUT`
    /// - `QUARRY_MAX_TRANSACTION_WAIT_TIME`
    /// - `QUARRY_ISOLATION_LEVEL` - e.g. `Serializable`, `READ COMMITTED`
    /// - `QUARRY_BATCH_FAILURE_POLICY` - `continue` or `abort`
    /// - `QUARRY_LOG_LEVEL` - Log level
    /// - `QUARRY_LOG_FORMAT` - `json` or `pretty`
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(url) = std::env::var("QUARRY_DATABASE_URL") {
            self.database.url = url;
        }

        if let Some(max) = env_parsed("QUARRY_MAX_CONNECTIONS", |v| v.parse().ok())? {
            self.database.max_connections = max;
        }

        if let Some(size) = env_parsed("QUARRY_MAX_RESPONSE_SIZE", parse_byte_size)? {
            self.limits.max_response_size = size;
        }

        if let Some(timeout) = env_parsed("QUARRY_QUERY_TIMEOUT", parse_duration)? {
            self.limits.query_timeout = timeout;
        }

        if let Some(timeout) = env_parsed("QUARRY_MAX_TRANSACTION_TIMEOUT", parse_duration)? {
            self.limits.max_transaction_timeout = timeout;
        }

        if let Some(wait) = env_parsed("QUARRY_MAX_TRANSACTION_WAIT_TIME", parse_duration)? {
            self.limits.max_transaction_wait_time = wait;
        }

        if let Some(level) = env_parsed("QUARRY_ISOLATION_LEVEL", |v| v.parse().ok())? {
            self.transactions.isolation_level = Some(level);
        }

        if let Some(policy) = env_parsed("QUARRY_BATCH_FAILURE_POLICY", |v| {
            match v.trim().to_ascii_lowercase().as_str() {
                "continue" => Some(BatchFailurePolicy::Continue),
                "abort" => Some(BatchFailurePolicy::Abort),
                _ => None,
            }
        })? {
            self.batch.failure_policy = policy;
        }

        if let Ok(level) = std::env::var("QUARRY_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Ok(format) = std::env::var("QUARRY_LOG_FORMAT") {
            self.logging.format = format;
        }

        Ok(())
    }

    /// Validate the configuration.
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.url.is_empty() {
            return Err(ConfigError::ValidationError(
                "database.url cannot be empty".to_string(),
            ));
        }

        if !self.database.url.starts_with("sqlite:") {
            return Err(ConfigError::ValidationError(format!(
                "database.url must be a sqlite: URL, got `{}`",
                quarry_driver::redact_connection_strings(&self.database.url)
            )));
        }

        if self.database.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "database.max_connections must be > 0".to_string(),
            ));
        }

        if self.database.max_connections > 1000 {
            return Err(ConfigError::ValidationError(
                "database.max_connections must be <= 1000 (recommended: 5-50)".to_string(),
            ));
        }

        if self.limits.max_response_size == 0 {
            return Err(ConfigError::ValidationError(
                "limits.max_response_size must be > 0".to_string(),
            ));
        }

        let durations = [
            ("limits.query_timeout", self.limits.query_timeout),
            (
                "limits.max_transaction_timeout",
                self.limits.max_transaction_timeout,
            ),
            (
                "limits.max_transaction_wait_time",
                self.limits.max_transaction_wait_time,
            ),
            ("database.acquire_timeout", self.database.acquire_timeout),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, value)| value.is_zero()) {
            return Err(ConfigError::ValidationError(format!("{name} must be > 0")));
        }

        // SQLite only runs serializable transactions.
        if let Some(level) = self.transactions.isolation_level {
            if level != IsolationLevel::Serializable {
                return Err(ConfigError::ValidationError(format!(
                    "transactions.isolation_level `{level}` is not supported by sqlite"
                )));
            }
        }

        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "logging.level must be one of: {}",
                valid_levels.join(", ")
            )));
        }

        // Validate log format
        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "logging.format must be one of: {}",
                valid_formats.join(", ")
            )));
        }

        Ok(())
    }
}

fn env_parsed<T>(name: &'static str, parse: impl Fn(&str) -> Option<T>) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => parse(&value)
            .map(Some)
            .ok_or(ConfigError::EnvError { name, value }),
        Err(_) => Ok(None),
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading configuration file
    #[error("Failed to read config file {path:?}: {source}")]
    IoError {
        path: PathBuf,
        source: std::io::Error,
    },

    /// TOML parsing error
    #[error("Failed to parse TOML in {path:?}: {source}")]
    TomlError {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// Environment override that does not parse
    #[error("Invalid value for {name}: `{value}`")]
    EnvError { name: &'static str, value: String },

    /// Validation error
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
