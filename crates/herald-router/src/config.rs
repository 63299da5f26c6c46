//! Router configuration loading from file and environment variables.

use std::collections::BTreeMap;
use std::time::Duration;

use herald_db::DbRuntimeSettings;
use herald_types::Identity;
use serde::Deserialize;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub router: RouterConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Per-provider switches, keyed by provider id.
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
}

/// Settings that change routing decisions.
#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    /// Master switch. When off, routing is a no-op.
    #[serde(default)]
    pub enabled: bool,

    /// Username whose permissions gate every notification. Unset means the
    /// system user.
    #[serde(default)]
    pub acting_username: Option<String>,

    /// When off, rule tag restrictions are ignored and `tag_added` rules
    /// never fire.
    #[serde(default = "default_tagging_enabled")]
    pub tagging_enabled: bool,

    /// Upper bound on a single provider delivery, in milliseconds.
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "herald_router=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human readable output.
    #[serde(default)]
    pub json: bool,
}

/// Settings for one delivery provider.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_enabled")]
    pub enabled: bool,
}

fn default_tagging_enabled() -> bool {
    true
}

fn default_delivery_timeout_ms() -> u64 {
    30_000
}

fn default_db_path() -> String {
    "herald.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    DbRuntimeSettings::default().busy_timeout_ms
}

fn default_pool_max_size() -> u32 {
    DbRuntimeSettings::default().pool_max_size
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_provider_enabled() -> bool {
    true
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            acting_username: None,
            tagging_enabled: default_tagging_enabled(),
            delivery_timeout_ms: default_delivery_timeout_ms(),
        }
    }
}

impl RouterConfig {
    /// The identity whose visibility gates routing.
    pub fn acting_identity(&self) -> Identity {
        Identity::from_setting(self.acting_username.as_deref())
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl DatabaseConfig {
    pub fn runtime_settings(&self) -> DbRuntimeSettings {
        DbRuntimeSettings {
            busy_timeout_ms: self.busy_timeout_ms,
            pool_max_size: self.pool_max_size,
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

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            enabled: default_provider_enabled(),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to install tracing subscriber: {0}")]
    Tracing(String),
}

/// Loads configuration from a TOML file, falling back to defaults, then
/// applies environment overrides.
///
/// Environment variable overrides:
/// - `HERALD_ENABLED` overrides `router.enabled`
/// - `HERALD_ACTING_USERNAME` overrides `router.acting_username`
/// - `HERALD_TAGGING_ENABLED` overrides `router.tagging_enabled`
/// - `HERALD_DELIVERY_TIMEOUT_MS` overrides `router.delivery_timeout_ms`
/// - `HERALD_DB_PATH` overrides `database.path`
/// - `HERALD_LOG_LEVEL` overrides `logging.level`
/// - `HERALD_LOG_JSON` overrides `logging.json`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Applies `HERALD_*` overrides read through `lookup`. Unparseable values are
/// ignored.
pub fn apply_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(enabled) = lookup("HERALD_ENABLED") {
        config.router.enabled = parse_flag(&enabled);
    }
    if let Some(username) = lookup("HERALD_ACTING_USERNAME") {
        config.router.acting_username = Some(username);
    }
    if let Some(tagging) = lookup("HERALD_TAGGING_ENABLED") {
        config.router.tagging_enabled = parse_flag(&tagging);
    }
    if let Some(timeout) = lookup("HERALD_DELIVERY_TIMEOUT_MS") {
        if let Ok(parsed) = timeout.parse() {
            config.router.delivery_timeout_ms = parsed;
        }
    }
    if let Some(db_path) = lookup("HERALD_DB_PATH") {
        config.database.path = db_path;
    }
    if let Some(level) = lookup("HERALD_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = lookup("HERALD_LOG_JSON") {
        config.logging.json = parse_flag(&json);
    }
}

fn parse_flag(value: &str) -> bool {
    value == "true" || value == "1"
}

/// Installs the global `tracing` subscriber described by `logging`.
///
/// An invalid filter falls back to `info`.
///
/// # Errors
///
/// Returns `ConfigError::Tracing` if a global subscriber is already set.
pub fn init_tracing(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let filter = EnvFilter::try_new(&logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    let result = if logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };
    result.map_err(|e| ConfigError::Tracing(e.to_string()))
}
