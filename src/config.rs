//! Configuration types for foreman
//!
//! Each component keeps its own config struct next to its code; this
//! module provides the serde-facing aggregate that loads all of them
//! from one TOML file. Durations are written as `*_ms` integers in the
//! file format and converted at the boundary.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::batcher::BatcherConfig;
use crate::breaker::BreakerConfig;
use crate::cache::CacheConfig;
use crate::error::{ForemanError, Result};
use crate::pool::{PoolConfig, ReuseStrategy};
use crate::process::ProcessPoolConfig;
use crate::scheduler::SchedulerConfig;

/// Log verbosity for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl LogLevel {
    pub fn to_tracing_level(self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub max_size: usize,
    pub ttl_ms: u64,
    pub track_metrics: bool,
}

impl Default for CacheSection {
    fn default() -> Self {
        let defaults = CacheConfig::default();
        Self {
            max_size: defaults.max_size,
            ttl_ms: defaults.ttl.as_millis() as u64,
            track_metrics: defaults.track_metrics,
        }
    }
}

impl CacheSection {
    pub fn to_config(&self) -> CacheConfig {
        CacheConfig {
            max_size: self.max_size,
            ttl: Duration::from_millis(self.ttl_ms),
            track_metrics: self.track_metrics,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerSection {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub cooldown_ms: u64,
    pub timeout_ms: u64,
    pub probe_window_ms: u64,
    pub max_retries: u32,
}

impl Default for BreakerSection {
    fn default() -> Self {
        let defaults = BreakerConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold,
            success_threshold: defaults.success_threshold,
            cooldown_ms: defaults.cooldown.as_millis() as u64,
            timeout_ms: defaults.timeout.as_millis() as u64,
            probe_window_ms: defaults.probe_window.as_millis() as u64,
            max_retries: defaults.max_retries,
        }
    }
}

impl BreakerSection {
    pub fn to_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            cooldown: Duration::from_millis(self.cooldown_ms),
            timeout: Duration::from_millis(self.timeout_ms),
            probe_window: Duration::from_millis(self.probe_window_ms),
            max_retries: self.max_retries,
            ..BreakerConfig::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    pub min_connections: usize,
    pub max_connections: usize,
    /// One of `affinity`, `round-robin`, `least-used`.
    pub reuse_strategy: String,
    pub health_check_interval_ms: u64,
    pub connection_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub max_lifetime_ms: u64,
    pub max_waiters: usize,
}

impl Default for PoolSection {
    fn default() -> Self {
        let defaults = PoolConfig::default();
        Self {
            min_connections: defaults.min_connections,
            max_connections: defaults.max_connections,
            reuse_strategy: "affinity".into(),
            health_check_interval_ms: defaults.health_check_interval.as_millis() as u64,
            connection_timeout_ms: defaults.connection_timeout.as_millis() as u64,
            idle_timeout_ms: defaults.idle_timeout.as_millis() as u64,
            max_lifetime_ms: defaults.max_lifetime.as_millis() as u64,
            max_waiters: defaults.max_waiters,
        }
    }
}

impl PoolSection {
    pub fn to_config(&self) -> Result<PoolConfig> {
        let reuse_strategy = match self.reuse_strategy.as_str() {
            "affinity" => ReuseStrategy::Affinity,
            "round-robin" => ReuseStrategy::RoundRobin,
            "least-used" => ReuseStrategy::LeastUsed,
            other => {
                return Err(ForemanError::Config(format!(
                    "invalid reuse_strategy '{}': expected affinity, round-robin or least-used",
                    other
                )))
            }
        };
        let config = PoolConfig {
            min_connections: self.min_connections,
            max_connections: self.max_connections,
            reuse_strategy,
            health_check_interval: Duration::from_millis(self.health_check_interval_ms),
            connection_timeout: Duration::from_millis(self.connection_timeout_ms),
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            max_lifetime: Duration::from_millis(self.max_lifetime_ms),
            max_waiters: self.max_waiters,
            ..PoolConfig::default()
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessSection {
    pub pool_size: usize,
    pub health_check_interval_ms: u64,
    pub max_restarts: u32,
    pub restart_delay_ms: u64,
    pub startup_timeout_ms: u64,
    pub max_queued: usize,
    pub worker_command: String,
    pub worker_args: Vec<String>,
}

impl Default for ProcessSection {
    fn default() -> Self {
        let defaults = ProcessPoolConfig::default();
        Self {
            pool_size: defaults.pool_size,
            health_check_interval_ms: defaults.health_check_interval.as_millis() as u64,
            max_restarts: defaults.max_restarts,
            restart_delay_ms: defaults.restart_delay.as_millis() as u64,
            startup_timeout_ms: defaults.startup_timeout.as_millis() as u64,
            max_queued: defaults.max_queued,
            worker_command: defaults.worker_command,
            worker_args: defaults.worker_args,
        }
    }
}

impl ProcessSection {
    pub fn to_config(&self) -> ProcessPoolConfig {
        ProcessPoolConfig {
            pool_size: self.pool_size,
            health_check_interval: Duration::from_millis(self.health_check_interval_ms),
            max_restarts: self.max_restarts,
            restart_delay: Duration::from_millis(self.restart_delay_ms),
            startup_timeout: Duration::from_millis(self.startup_timeout_ms),
            max_queued: self.max_queued,
            worker_command: self.worker_command.clone(),
            worker_args: self.worker_args.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub max_workers: usize,
    pub max_concurrent: usize,
    pub queue_size: usize,
    pub task_timeout_ms: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub load_balancing: bool,
    pub priority_scheduling: bool,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        let defaults = SchedulerConfig::default();
        Self {
            max_workers: defaults.max_workers,
            max_concurrent: defaults.max_concurrent,
            queue_size: defaults.queue_size,
            task_timeout_ms: defaults.task_timeout.as_millis() as u64,
            retry_attempts: defaults.retry_attempts,
            retry_delay_ms: defaults.retry_delay.as_millis() as u64,
            load_balancing: defaults.load_balancing,
            priority_scheduling: defaults.priority_scheduling,
        }
    }
}

impl SchedulerSection {
    pub fn to_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_workers: self.max_workers,
            max_concurrent: self.max_concurrent,
            queue_size: self.queue_size,
            task_timeout: Duration::from_millis(self.task_timeout_ms),
            retry_attempts: self.retry_attempts,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            load_balancing: self.load_balancing,
            priority_scheduling: self.priority_scheduling,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatcherSection {
    pub max_batch_size: usize,
    pub max_wait_ms: u64,
    pub compression: bool,
    pub compression_threshold: usize,
}

impl Default for BatcherSection {
    fn default() -> Self {
        let defaults = BatcherConfig::default();
        Self {
            max_batch_size: defaults.max_batch_size,
            max_wait_ms: defaults.max_wait.as_millis() as u64,
            compression: defaults.compression,
            compression_threshold: defaults.compression_threshold,
        }
    }
}

impl BatcherSection {
    pub fn to_config(&self) -> BatcherConfig {
        BatcherConfig {
            max_batch_size: self.max_batch_size,
            max_wait: Duration::from_millis(self.max_wait_ms),
            compression: self.compression,
            compression_threshold: self.compression_threshold,
        }
    }
}

/// Aggregate configuration for the whole substrate.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ForemanConfig {
    pub cache: CacheSection,
    pub breaker: BreakerSection,
    pub pool: PoolSection,
    pub process: ProcessSection,
    pub scheduler: SchedulerSection,
    pub batcher: BatcherSection,
    pub log_level: LogLevel,
    /// Log file path (None = stdout).
    pub log_file: Option<PathBuf>,
}

impl ForemanConfig {
    /// Load and validate a TOML configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ForemanError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: ForemanConfig = toml::from_str(&contents).map_err(|e| {
            ForemanError::Config(format!("failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.pool.to_config()?;
        if self.process.pool_size == 0 {
            return Err(ForemanError::Config("process.pool_size must be positive".into()));
        }
        if self.scheduler.max_concurrent == 0 {
            return Err(ForemanError::Config(
                "scheduler.max_concurrent must be positive".into(),
            ));
        }
        if self.batcher.max_batch_size == 0 {
            return Err(ForemanError::Config(
                "batcher.max_batch_size must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = ForemanConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache.max_size, 100);
        assert_eq!(config.scheduler.max_workers, 3);
        assert_eq!(config.batcher.max_batch_size, 10);
        assert_eq!(config.log_level, LogLevel::Info);
    }

    #[test]
    fn test_section_conversion() {
        let config = ForemanConfig::default();
        let breaker = config.breaker.to_config();
        assert_eq!(breaker.cooldown, Duration::from_secs(30));
        let scheduler = config.scheduler.to_config();
        assert_eq!(scheduler.task_timeout, Duration::from_secs(30));
        let pool = config.pool.to_config().unwrap();
        assert_eq!(pool.reuse_strategy, ReuseStrategy::Affinity);
    }

    #[test]
    fn test_from_file_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
log_level = "debug"

[cache]
max_size = 7
ttl_ms = 1000

[pool]
reuse_strategy = "least-used"
max_connections = 20

[process]
pool_size = 5
worker_command = "my-worker"

[batcher]
max_wait_ms = 25
"#
        )
        .unwrap();

        let config = ForemanConfig::from_file(file.path()).unwrap();
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.cache.max_size, 7);
        assert_eq!(config.cache.to_config().ttl, Duration::from_secs(1));
        assert_eq!(
            config.pool.to_config().unwrap().reuse_strategy,
            ReuseStrategy::LeastUsed
        );
        assert_eq!(config.process.pool_size, 5);
        assert_eq!(config.process.to_config().worker_command, "my-worker");
        assert_eq!(
            config.batcher.to_config().max_wait,
            Duration::from_millis(25)
        );
        // Untouched sections keep their defaults.
        assert_eq!(config.scheduler.max_workers, 3);
    }

    #[test]
    fn test_invalid_strategy_rejected() {
        let section = PoolSection {
            reuse_strategy: "random".into(),
            ..PoolSection::default()
        };
        assert!(matches!(
            section.to_config(),
            Err(ForemanError::Config(_))
        ));
    }

    #[test]
    fn test_invalid_pool_bounds_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[pool]
min_connections = 9
max_connections = 2
"#
        )
        .unwrap();
        assert!(matches!(
            ForemanConfig::from_file(file.path()),
            Err(ForemanError::Config(_))
        ));
    }
}
