use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

use crate::services::backorder_allocation::AllocationStrategy;

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const CONFIG_DIR: &str = "config";
const DEFAULT_LOCK_BACKEND: &str = "in-memory";
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 100;
const DEFAULT_MAX_BACKOFF_MS: u64 = 2_000;
const DEFAULT_LOCK_TTL_SECS: u64 = 30;
const DEFAULT_LOCK_WAIT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_ANOMALY_THRESHOLD: i32 = 100;
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Retry and lock-wait policy shared by optimistic retries, distributed locks
/// and database row locks.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ConcurrencyConfig {
    /// Attempts before a conflict is surfaced (first try included)
    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1, max = 10))]
    pub max_attempts: u32,

    /// Delay before the second attempt; doubles on each further attempt
    #[serde(default = "default_initial_backoff_ms")]
    #[validate(range(min = 1))]
    pub initial_backoff_ms: u64,

    /// Upper bound for a single backoff delay
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Auto-expiry of a distributed lock held by a crashed process
    #[serde(default = "default_lock_ttl_secs")]
    #[validate(range(min = 1))]
    pub lock_ttl_secs: u64,

    /// Maximum wait for a distributed lock, also applied as the row-lock wait
    /// timeout on Postgres
    #[serde(default = "default_lock_wait_timeout_ms")]
    #[validate(range(min = 1))]
    pub lock_wait_timeout_ms: u64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            lock_ttl_secs: DEFAULT_LOCK_TTL_SECS,
            lock_wait_timeout_ms: DEFAULT_LOCK_WAIT_TIMEOUT_MS,
        }
    }
}

impl ConcurrencyConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_wait_timeout_ms)
    }
}

/// Stock mutation settings
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct InventoryConfig {
    /// Store used when a caller omits one; must reference an existing store
    #[serde(default)]
    pub default_store_id: Option<i64>,

    /// Single-movement size that raises an anomaly notification
    #[serde(default = "default_anomaly_threshold")]
    #[validate(range(min = 1))]
    pub anomaly_quantity_threshold: i32,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            default_store_id: None,
            anomaly_quantity_threshold: DEFAULT_ANOMALY_THRESHOLD,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AllocationConfig {
    #[serde(default)]
    pub default_strategy: AllocationStrategy,
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Redis connection URL, used by the redis lock backend
    pub redis_url: String,

    /// Distributed lock backend: "redis" or "in-memory"
    #[serde(default = "default_lock_backend")]
    #[validate(custom = "validate_lock_backend")]
    pub lock_backend: String,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    #[validate(range(min = 1))]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Buffer size of the domain notification channel
    #[serde(default = "default_event_channel_capacity")]
    #[validate(range(min = 1))]
    pub event_channel_capacity: usize,

    #[serde(default)]
    #[validate]
    pub concurrency: ConcurrencyConfig,

    #[serde(default)]
    #[validate]
    pub inventory: InventoryConfig,

    #[serde(default)]
    #[validate]
    pub allocation: AllocationConfig,
}

impl AppConfig {
    /// Creates a new configuration with defaults for everything but the
    /// connection endpoints and environment.
    pub fn new(database_url: String, redis_url: String, environment: String) -> Self {
        Self {
            database_url,
            redis_url,
            lock_backend: default_lock_backend(),
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            event_channel_capacity: default_event_channel_capacity(),
            concurrency: ConcurrencyConfig::default(),
            inventory: InventoryConfig::default(),
            allocation: AllocationConfig::default(),
        }
    }

    /// Gets database URL reference
    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    pub fn redis_url(&self) -> &str {
        &self.redis_url
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    pub fn is_development(&self) -> bool {
        self.environment == "development"
    }

    pub fn uses_redis_locks(&self) -> bool {
        self.lock_backend.eq_ignore_ascii_case("redis")
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if self.concurrency.max_backoff_ms < self.concurrency.initial_backoff_ms {
            let mut err = ValidationError::new("max_backoff_ms");
            err.message = Some("max_backoff_ms must not be lower than initial_backoff_ms".into());
            errors.add("concurrency", err);
        }

        // Single-process locks do not serialize work across replicas.
        if self.is_production() && !self.uses_redis_locks() {
            let mut err = ValidationError::new("lock_backend_in_memory");
            err.message = Some(
                "Set APP__LOCK_BACKEND=redis outside development; the in-memory backend only guards a single process"
                    .into(),
            );
            errors.add("lock_backend", err);
        }

        if self.db_min_connections > self.db_max_connections {
            let mut err = ValidationError::new("db_min_connections");
            err.message = Some("db_min_connections must not exceed db_max_connections".into());
            errors.add("db_min_connections", err);
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Gets log level reference
    pub fn log_level(&self) -> &str {
        &self.log_level
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Default value functions
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_lock_backend() -> String {
    DEFAULT_LOCK_BACKEND.to_string()
}

fn default_db_max_connections() -> u32 {
    10
}
fn default_db_min_connections() -> u32 {
    1
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    30
}

fn default_event_channel_capacity() -> usize {
    DEFAULT_EVENT_CHANNEL_CAPACITY
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}
fn default_initial_backoff_ms() -> u64 {
    DEFAULT_INITIAL_BACKOFF_MS
}
fn default_max_backoff_ms() -> u64 {
    DEFAULT_MAX_BACKOFF_MS
}
fn default_lock_ttl_secs() -> u64 {
    DEFAULT_LOCK_TTL_SECS
}
fn default_lock_wait_timeout_ms() -> u64 {
    DEFAULT_LOCK_WAIT_TIMEOUT_MS
}
fn default_anomaly_threshold() -> i32 {
    DEFAULT_ANOMALY_THRESHOLD
}

fn validate_lock_backend(value: &str) -> Result<(), ValidationError> {
    match value.to_ascii_lowercase().as_str() {
        "in-memory" | "redis" => Ok(()),
        _ => {
            let mut err = ValidationError::new("lock_backend");
            err.message = Some("Must be one of: in-memory, redis".into());
            Err(err)
        }
    }
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("multistore_inventory={},sea_orm=warn", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    let filter = EnvFilter::new(filter_directive);
    if json {
        let _ = fmt().with_env_filter(filter).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter).try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    let config = Config::builder()
        .set_default("database_url", "sqlite://inventory.db?mode=rwc")?
        .set_default("redis_url", "redis://localhost:6379")?
        .set_default("environment", run_env.as_str())?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!(
        lock_backend = %app_config.lock_backend,
        strategy = %app_config.allocation.default_strategy,
        "Configuration loaded successfully"
    );
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig::new(
            "sqlite::memory:".into(),
            "redis://127.0.0.1:6379".into(),
            "development".into(),
        )
    }

    #[test]
    fn defaults_follow_the_shared_backoff_policy() {
        let cfg = base_config();
        assert_eq!(cfg.concurrency.max_attempts, 3);
        assert_eq!(cfg.concurrency.initial_backoff(), Duration::from_millis(100));
        assert_eq!(cfg.concurrency.lock_wait_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.inventory.anomaly_quantity_threshold, 100);
        assert_eq!(
            cfg.allocation.default_strategy,
            AllocationStrategy::SmartPriority
        );
        assert!(cfg.validate().is_ok());
        assert!(cfg.validate_additional_constraints().is_ok());
    }

    #[test]
    fn production_requires_redis_locks() {
        let mut cfg = base_config();
        cfg.environment = "production".into();
        assert!(cfg.validate_additional_constraints().is_err());

        cfg.lock_backend = "redis".into();
        assert!(cfg.validate_additional_constraints().is_ok());
    }

    #[test]
    fn rejects_inverted_backoff_bounds() {
        let mut cfg = base_config();
        cfg.concurrency.initial_backoff_ms = 500;
        cfg.concurrency.max_backoff_ms = 100;
        assert!(cfg.validate_additional_constraints().is_err());
    }

    #[test]
    fn rejects_unknown_lock_backend_and_zero_attempts() {
        let mut cfg = base_config();
        cfg.lock_backend = "zookeeper".into();
        cfg.concurrency.max_attempts = 0;
        let errors = cfg.validate().unwrap_err();
        assert!(errors.errors().contains_key("lock_backend"));
        assert!(errors.errors().contains_key("concurrency"));
    }
}
