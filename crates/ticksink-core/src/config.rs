//! Configuration structures for ticksink.
//!
//! Configuration is loaded from TOML files and can be overridden via CLI flags.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Batching, retry and drain configuration
    #[serde(default)]
    pub engine: EngineConfig,

    /// Connection pool configuration
    #[serde(default)]
    pub pool: PoolConfig,

    /// Relational store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Circuit breaker configuration
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Monitoring configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Batching and retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Queue size that triggers an immediate flush. 1 flushes every record.
    #[serde(default = "default_batch_size_threshold")]
    pub batch_size_threshold: usize,

    /// Fixed delay between timer-triggered flushes
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Requeue capacity as a multiple of `batch_size_threshold`
    #[serde(default = "default_max_requeue_multiplier")]
    pub max_requeue_multiplier: usize,

    /// Failed flush attempts after which a record is evicted
    #[serde(default = "default_max_record_attempts")]
    pub max_record_attempts: u32,

    /// Hard cap on queued records; further submits are refused
    #[serde(default = "default_max_queue_capacity")]
    pub max_queue_capacity: usize,

    /// Upper bound on how long finalize and shutdown wait for the drain
    #[serde(default = "default_finalize_timeout_ms")]
    pub finalize_timeout_ms: u64,

    /// Where flushes execute
    #[serde(default)]
    pub flush_mode: FlushMode,
}

impl EngineConfig {
    /// Maximum number of records the queue may hold after a requeue.
    pub fn requeue_capacity(&self) -> usize {
        self.batch_size_threshold
            .saturating_mul(self.max_requeue_multiplier)
    }

    /// Timer period.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Finalize bound.
    pub fn finalize_timeout(&self) -> Duration {
        Duration::from_millis(self.finalize_timeout_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size_threshold: default_batch_size_threshold(),
            flush_interval_ms: default_flush_interval_ms(),
            max_requeue_multiplier: default_max_requeue_multiplier(),
            max_record_attempts: default_max_record_attempts(),
            max_queue_capacity: default_max_queue_capacity(),
            finalize_timeout_ms: default_finalize_timeout_ms(),
            flush_mode: FlushMode::default(),
        }
    }
}

/// Flush execution mode.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FlushMode {
    /// Dedicated tokio worker runs both the size and timer triggers
    #[default]
    Background,
    /// Size trigger flushes synchronously inside `submit`; no timer
    Inline,
}

/// Connection pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Maximum open connections
    #[serde(default = "default_max_pool_connections")]
    pub max_pool_connections: usize,

    /// Connections opened eagerly and kept warm
    #[serde(default = "default_min_idle")]
    pub min_idle: usize,

    /// How long `acquire` waits for a free connection
    #[serde(default = "default_connection_acquire_timeout_ms")]
    pub connection_acquire_timeout_ms: u64,

    /// Idle connections older than this are closed
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Connections older than this are closed on release
    #[serde(default = "default_max_lifetime_ms")]
    pub max_lifetime_ms: u64,

    /// Probe idle connections before handing them out
    #[serde(default = "default_enabled")]
    pub test_on_acquire: bool,
}

impl PoolConfig {
    /// Acquire timeout as a duration.
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_acquire_timeout_ms)
    }

    /// Idle timeout as a duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Max lifetime as a duration.
    pub fn max_lifetime(&self) -> Duration {
        Duration::from_millis(self.max_lifetime_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pool_connections: default_max_pool_connections(),
            min_idle: default_min_idle(),
            connection_acquire_timeout_ms: default_connection_acquire_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            max_lifetime_ms: default_max_lifetime_ms(),
            test_on_acquire: default_enabled(),
        }
    }
}

/// Relational store configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    /// Backend type
    #[serde(default)]
    pub backend: StoreBackend,

    /// Database file (sqlite backend)
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// How long sqlite waits on a locked database
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Create missing tables at startup instead of failing
    #[serde(default)]
    pub provision_schema: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            provision_schema: false,
        }
    }
}

/// Store backend.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// SQLite database file
    #[default]
    Sqlite,
    /// In-process store, lost on exit
    Memory,
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BreakerConfig {
    /// Consecutive failed flush cycles before the breaker opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time the breaker stays open before a probe cycle
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,

    /// Successful probe cycles needed to close again
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            success_threshold: default_success_threshold(),
        }
    }
}

/// Monitoring configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Metrics HTTP port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Health check HTTP port
    #[serde(default = "default_health_port")]
    pub health_port: u16,

    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log format
    #[serde(default)]
    pub log_format: LogFormat,

    /// Period of the logged performance summary
    #[serde(default = "default_summary_interval_secs")]
    pub summary_interval_secs: u64,

    /// A store error within this window marks the engine unhealthy
    #[serde(default = "default_unhealthy_error_window_secs")]
    pub unhealthy_error_window_secs: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            metrics_port: default_metrics_port(),
            health_port: default_health_port(),
            log_level: LogLevel::default(),
            log_format: LogFormat::default(),
            summary_interval_secs: default_summary_interval_secs(),
            unhealthy_error_window_secs: default_unhealthy_error_window_secs(),
        }
    }
}

/// Log level.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level (default)
    #[default]
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl LogLevel {
    /// Directive string for an `EnvFilter`.
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Log format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format (default)
    #[default]
    Json,
    /// Plain text format
    Text,
}

// Default value functions
fn default_batch_size_threshold() -> usize {
    100
}
fn default_flush_interval_ms() -> u64 {
    5000
}
fn default_max_requeue_multiplier() -> usize {
    2
}
fn default_max_record_attempts() -> u32 {
    3
}
fn default_max_queue_capacity() -> usize {
    10_000
}
fn default_finalize_timeout_ms() -> u64 {
    30_000
}

// Pool defaults
fn default_max_pool_connections() -> usize {
    10
}
fn default_min_idle() -> usize {
    2
}
fn default_connection_acquire_timeout_ms() -> u64 {
    30_000
}
fn default_idle_timeout_ms() -> u64 {
    600_000 // 10 minutes
}
fn default_max_lifetime_ms() -> u64 {
    1_800_000 // 30 minutes
}
fn default_enabled() -> bool {
    true
}

// Store defaults
fn default_store_path() -> PathBuf {
    PathBuf::from("ticksink.db")
}
fn default_busy_timeout_ms() -> u64 {
    5000
}

// Breaker defaults
fn default_failure_threshold() -> u32 {
    5
}
fn default_reset_timeout_ms() -> u64 {
    30_000
}
fn default_success_threshold() -> u32 {
    1
}

// Monitoring defaults
fn default_metrics_port() -> u16 {
    9090
}
fn default_health_port() -> u16 {
    8080
}
fn default_summary_interval_secs() -> u64 {
    30
}
fn default_unhealthy_error_window_secs() -> u64 {
    60
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> crate::Result<()> {
        let engine = &self.engine;
        if engine.batch_size_threshold < 1 {
            return Err(crate::Error::Config(
                "batch_size_threshold must be at least 1".into(),
            ));
        }

        if engine.flush_interval_ms == 0 {
            return Err(crate::Error::Config(
                "flush_interval_ms must be greater than 0".into(),
            ));
        }

        if engine.max_requeue_multiplier < 1 {
            return Err(crate::Error::Config(
                "max_requeue_multiplier must be at least 1".into(),
            ));
        }

        if engine.max_record_attempts < 1 {
            return Err(crate::Error::Config(
                "max_record_attempts must be at least 1".into(),
            ));
        }

        if engine.max_queue_capacity < engine.requeue_capacity() {
            return Err(crate::Error::Config(format!(
                "max_queue_capacity ({}) must be at least batch_size_threshold * max_requeue_multiplier ({})",
                engine.max_queue_capacity,
                engine.requeue_capacity()
            )));
        }

        if engine.finalize_timeout_ms == 0 {
            return Err(crate::Error::Config(
                "finalize_timeout_ms must be greater than 0".into(),
            ));
        }

        let pool = &self.pool;
        if pool.max_pool_connections < 1 {
            return Err(crate::Error::Config(
                "max_pool_connections must be at least 1".into(),
            ));
        }

        if pool.connection_acquire_timeout_ms == 0 {
            return Err(crate::Error::Config(
                "connection_acquire_timeout_ms must be greater than 0".into(),
            ));
        }

        if pool.min_idle > pool.max_pool_connections {
            return Err(crate::Error::Config(format!(
                "min_idle ({}) cannot exceed max_pool_connections ({})",
                pool.min_idle, pool.max_pool_connections
            )));
        }

        if self.store.backend == StoreBackend::Sqlite && self.store.path.as_os_str().is_empty() {
            return Err(crate::Error::Config(
                "Store path is required for the sqlite backend".into(),
            ));
        }

        if self.breaker.failure_threshold < 1 || self.breaker.success_threshold < 1 {
            return Err(crate::Error::Config(
                "Breaker thresholds must be at least 1".into(),
            ));
        }

        if self.store.backend == StoreBackend::Sqlite && pool.max_pool_connections > 1 {
            tracing::debug!(
                max = pool.max_pool_connections,
                "SQLite serializes writers; extra pooled connections only serve reads"
            );
        }

        Ok(())
    }
}
