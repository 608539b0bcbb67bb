//! Orchestrator configuration.
//!
//! Configuration is layered: built-in defaults, then an optional YAML file,
//! then `DIALER_*` environment variables. The same loader runs again when the
//! master receives a `reload_config` command; only the runtime tunables are
//! applied at that point (see [`OrchestratorConfig::apply_runtime_tunables`]).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The YAML configuration file could not be parsed.
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Configuration for the master orchestrator, its worker pool and the workers.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    // Connections
    /// Redis connection URL.
    pub redis_url: String,
    /// Prefix for every Redis key owned by this deployment.
    pub key_prefix: String,
    /// Optional PostgreSQL URL; enables the SQL campaign source and stats sink.
    pub database_url: Option<String>,

    // Master lock
    /// Resource key for master election.
    pub master_lock_key: String,
    /// How often the master renews its lock.
    pub renew_interval: Duration,
    /// Lock TTL. `None` derives it as ten times `renew_interval`.
    pub lock_ttl: Option<Duration>,

    // Control loop
    /// Interval between worker health checks (followed by lock renewal).
    pub health_check_interval: Duration,
    /// Interval between statistics snapshots.
    pub stats_update_interval: Duration,
    /// Sleep between control-loop ticks.
    pub tick_interval: Duration,
    /// Extra pause after a tick that raised an error.
    pub error_cooldown: Duration,

    // Workers
    /// A worker whose heartbeat is older than this is restarted.
    pub worker_timeout: Duration,
    /// Time a freshly spawned worker has to produce its first heartbeat.
    pub worker_bootstrap_grace: Duration,
    /// How often a worker writes its heartbeat.
    pub worker_heartbeat_interval: Duration,
    /// Time between a cooperative stop request and a forced kill.
    pub terminate_grace: Duration,
    /// Upper bound on concurrently running campaign workers.
    pub max_campaign_workers: usize,
    /// Program used to start worker processes. `None` means the current executable.
    pub worker_program: Option<PathBuf>,
    /// Arguments placed before `--id`/`--type` when starting a worker.
    pub worker_args: Vec<String>,

    // Queue
    /// How long a claim stays invisible to other consumers.
    pub visibility_timeout: Duration,
    /// Extra time past the visibility deadline before a claim counts as orphaned.
    pub orphan_grace: Duration,
    /// Base delay of the exponential retry backoff.
    pub retry_base: Duration,
    /// Upper bound of the retry backoff.
    pub retry_max: Duration,
    /// Default attempt budget for new tasks.
    pub max_attempts: u32,

    // Store
    /// Deadline applied to every backing-store round-trip.
    pub store_timeout: Duration,
    /// Number of log lines kept in the mirrored log list.
    pub log_history: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "dialer".to_string(),
            database_url: None,

            master_lock_key: "master".to_string(),
            renew_interval: Duration::from_secs(30),
            lock_ttl: None,

            health_check_interval: Duration::from_secs(30),
            stats_update_interval: Duration::from_secs(60),
            tick_interval: Duration::from_secs(1),
            error_cooldown: Duration::from_secs(5),

            worker_timeout: Duration::from_secs(300),
            worker_bootstrap_grace: Duration::from_secs(60),
            worker_heartbeat_interval: Duration::from_secs(10),
            terminate_grace: Duration::from_secs(10),
            max_campaign_workers: 10,
            worker_program: None,
            worker_args: vec!["worker".to_string()],

            visibility_timeout: Duration::from_secs(300),
            orphan_grace: Duration::ZERO,
            retry_base: Duration::from_secs(5),
            retry_max: Duration::from_secs(300),
            max_attempts: 3,

            store_timeout: Duration::from_secs(2),
            log_history: 1000,
        }
    }
}

/// YAML file overlay. Every field is optional; durations are in seconds.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
struct FileOverlay {
    redis_url: Option<String>,
    key_prefix: Option<String>,
    database_url: Option<String>,
    master_lock_key: Option<String>,
    renew_interval_secs: Option<f64>,
    lock_ttl_secs: Option<f64>,
    health_check_interval_secs: Option<f64>,
    stats_update_interval_secs: Option<f64>,
    tick_interval_secs: Option<f64>,
    error_cooldown_secs: Option<f64>,
    worker_timeout_secs: Option<f64>,
    worker_bootstrap_grace_secs: Option<f64>,
    worker_heartbeat_interval_secs: Option<f64>,
    terminate_grace_secs: Option<f64>,
    max_campaign_workers: Option<usize>,
    worker_program: Option<PathBuf>,
    worker_args: Option<Vec<String>>,
    visibility_timeout_secs: Option<f64>,
    orphan_grace_secs: Option<f64>,
    retry_base_secs: Option<f64>,
    retry_max_secs: Option<f64>,
    max_attempts: Option<u32>,
    store_timeout_secs: Option<f64>,
    log_history: Option<usize>,
}

impl OrchestratorConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration: defaults, then the optional YAML file, then env vars.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read or parsed, a variable
    /// has an invalid value, or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(path) = path {
            config.merge_file(path)?;
        }
        config.merge_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Creates configuration from environment variables only.
    ///
    /// # Environment Variables
    ///
    /// - `REDIS_URL`: Redis connection URL (default: redis://localhost:6379)
    /// - `DATABASE_URL`: PostgreSQL URL (optional)
    /// - `DIALER_KEY_PREFIX`: Redis key prefix (default: dialer)
    /// - `DIALER_MASTER_LOCK_KEY`: master lock resource (default: master)
    /// - `DIALER_RENEW_INTERVAL_SECS`: lock renewal interval (default: 30)
    /// - `DIALER_LOCK_TTL_SECS`: lock TTL (default: 10x renewal interval)
    /// - `DIALER_HEALTH_CHECK_INTERVAL_SECS` (default: 30)
    /// - `DIALER_STATS_UPDATE_INTERVAL_SECS` (default: 60)
    /// - `DIALER_TICK_INTERVAL_SECS` (default: 1)
    /// - `DIALER_ERROR_COOLDOWN_SECS` (default: 5)
    /// - `DIALER_WORKER_TIMEOUT_SECS` (default: 300)
    /// - `DIALER_WORKER_BOOTSTRAP_GRACE_SECS` (default: 60)
    /// - `DIALER_WORKER_HEARTBEAT_INTERVAL_SECS` (default: 10)
    /// - `DIALER_TERMINATE_GRACE_SECS` (default: 10)
    /// - `DIALER_MAX_CAMPAIGN_WORKERS` (default: 10)
    /// - `DIALER_WORKER_PROGRAM`: worker executable (default: current executable)
    /// - `DIALER_VISIBILITY_TIMEOUT_SECS` (default: 300)
    /// - `DIALER_ORPHAN_GRACE_SECS` (default: 0)
    /// - `DIALER_RETRY_BASE_SECS` (default: 5)
    /// - `DIALER_RETRY_MAX_SECS` (default: 300)
    /// - `DIALER_MAX_ATTEMPTS` (default: 3)
    /// - `DIALER_STORE_TIMEOUT_SECS` (default: 2)
    /// - `DIALER_LOG_HISTORY` (default: 1000)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    fn merge_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let overlay: FileOverlay = serde_yaml::from_str(&raw)?;

        if let Some(v) = overlay.redis_url {
            self.redis_url = v;
        }
        if let Some(v) = overlay.key_prefix {
            self.key_prefix = v;
        }
        if overlay.database_url.is_some() {
            self.database_url = overlay.database_url;
        }
        if let Some(v) = overlay.master_lock_key {
            self.master_lock_key = v;
        }
        set_secs(&mut self.renew_interval, overlay.renew_interval_secs, "renew_interval_secs")?;
        if let Some(v) = overlay.lock_ttl_secs {
            self.lock_ttl = Some(secs_to_duration(v, "lock_ttl_secs")?);
        }
        set_secs(
            &mut self.health_check_interval,
            overlay.health_check_interval_secs,
            "health_check_interval_secs",
        )?;
        set_secs(
            &mut self.stats_update_interval,
            overlay.stats_update_interval_secs,
            "stats_update_interval_secs",
        )?;
        set_secs(&mut self.tick_interval, overlay.tick_interval_secs, "tick_interval_secs")?;
        set_secs(&mut self.error_cooldown, overlay.error_cooldown_secs, "error_cooldown_secs")?;
        set_secs(&mut self.worker_timeout, overlay.worker_timeout_secs, "worker_timeout_secs")?;
        set_secs(
            &mut self.worker_bootstrap_grace,
            overlay.worker_bootstrap_grace_secs,
            "worker_bootstrap_grace_secs",
        )?;
        set_secs(
            &mut self.worker_heartbeat_interval,
            overlay.worker_heartbeat_interval_secs,
            "worker_heartbeat_interval_secs",
        )?;
        set_secs(&mut self.terminate_grace, overlay.terminate_grace_secs, "terminate_grace_secs")?;
        if let Some(v) = overlay.max_campaign_workers {
            self.max_campaign_workers = v;
        }
        if overlay.worker_program.is_some() {
            self.worker_program = overlay.worker_program;
        }
        if let Some(v) = overlay.worker_args {
            self.worker_args = v;
        }
        set_secs(
            &mut self.visibility_timeout,
            overlay.visibility_timeout_secs,
            "visibility_timeout_secs",
        )?;
        set_secs(&mut self.orphan_grace, overlay.orphan_grace_secs, "orphan_grace_secs")?;
        set_secs(&mut self.retry_base, overlay.retry_base_secs, "retry_base_secs")?;
        set_secs(&mut self.retry_max, overlay.retry_max_secs, "retry_max_secs")?;
        if let Some(v) = overlay.max_attempts {
            self.max_attempts = v;
        }
        set_secs(&mut self.store_timeout, overlay.store_timeout_secs, "store_timeout_secs")?;
        if let Some(v) = overlay.log_history {
            self.log_history = v;
        }

        Ok(())
    }

    fn merge_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("REDIS_URL") {
            self.redis_url = val;
        }

        if let Ok(val) = std::env::var("DATABASE_URL") {
            self.database_url = if val.trim().is_empty() { None } else { Some(val) };
        }

        if let Ok(val) = std::env::var("DIALER_KEY_PREFIX") {
            self.key_prefix = val;
        }

        if let Ok(val) = std::env::var("DIALER_MASTER_LOCK_KEY") {
            self.master_lock_key = val;
        }

        env_secs(&mut self.renew_interval, "DIALER_RENEW_INTERVAL_SECS")?;

        if let Ok(val) = std::env::var("DIALER_LOCK_TTL_SECS") {
            let secs: f64 = parse_env_value(&val, "DIALER_LOCK_TTL_SECS")?;
            self.lock_ttl = Some(secs_to_duration(secs, "DIALER_LOCK_TTL_SECS")?);
        }

        env_secs(&mut self.health_check_interval, "DIALER_HEALTH_CHECK_INTERVAL_SECS")?;
        env_secs(&mut self.stats_update_interval, "DIALER_STATS_UPDATE_INTERVAL_SECS")?;
        env_secs(&mut self.tick_interval, "DIALER_TICK_INTERVAL_SECS")?;
        env_secs(&mut self.error_cooldown, "DIALER_ERROR_COOLDOWN_SECS")?;
        env_secs(&mut self.worker_timeout, "DIALER_WORKER_TIMEOUT_SECS")?;
        env_secs(&mut self.worker_bootstrap_grace, "DIALER_WORKER_BOOTSTRAP_GRACE_SECS")?;
        env_secs(&mut self.worker_heartbeat_interval, "DIALER_WORKER_HEARTBEAT_INTERVAL_SECS")?;
        env_secs(&mut self.terminate_grace, "DIALER_TERMINATE_GRACE_SECS")?;

        if let Ok(val) = std::env::var("DIALER_MAX_CAMPAIGN_WORKERS") {
            self.max_campaign_workers = parse_env_value(&val, "DIALER_MAX_CAMPAIGN_WORKERS")?;
        }

        if let Ok(val) = std::env::var("DIALER_WORKER_PROGRAM") {
            self.worker_program = Some(PathBuf::from(val));
        }

        env_secs(&mut self.visibility_timeout, "DIALER_VISIBILITY_TIMEOUT_SECS")?;
        env_secs(&mut self.orphan_grace, "DIALER_ORPHAN_GRACE_SECS")?;
        env_secs(&mut self.retry_base, "DIALER_RETRY_BASE_SECS")?;
        env_secs(&mut self.retry_max, "DIALER_RETRY_MAX_SECS")?;

        if let Ok(val) = std::env::var("DIALER_MAX_ATTEMPTS") {
            self.max_attempts = parse_env_value(&val, "DIALER_MAX_ATTEMPTS")?;
        }

        env_secs(&mut self.store_timeout, "DIALER_STORE_TIMEOUT_SECS")?;

        if let Ok(val) = std::env::var("DIALER_LOG_HISTORY") {
            self.log_history = parse_env_value(&val, "DIALER_LOG_HISTORY")?;
        }

        Ok(())
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_url cannot be empty".to_string(),
            ));
        }

        if self.key_prefix.is_empty() || self.key_prefix.contains(char::is_whitespace) {
            return Err(ConfigError::ValidationFailed(
                "key_prefix must be non-empty and contain no whitespace".to_string(),
            ));
        }

        if self.master_lock_key.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "master_lock_key cannot be empty".to_string(),
            ));
        }

        if self.renew_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "renew_interval must be greater than 0".to_string(),
            ));
        }

        if self.lock_ttl() <= self.renew_interval {
            return Err(ConfigError::ValidationFailed(
                "lock_ttl must exceed renew_interval".to_string(),
            ));
        }

        if self.lock_ttl() <= self.health_check_interval {
            return Err(ConfigError::ValidationFailed(
                "lock_ttl must exceed health_check_interval (renewal follows each health check)"
                    .to_string(),
            ));
        }

        if self.worker_timeout <= self.worker_heartbeat_interval {
            return Err(ConfigError::ValidationFailed(
                "worker_timeout must exceed worker_heartbeat_interval".to_string(),
            ));
        }

        if self.visibility_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "visibility_timeout must be greater than 0".to_string(),
            ));
        }

        if self.retry_base > self.retry_max {
            return Err(ConfigError::ValidationFailed(
                "retry_base cannot exceed retry_max".to_string(),
            ));
        }

        if self.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        if self.store_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "store_timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Effective master lock TTL.
    pub fn lock_ttl(&self) -> Duration {
        self.lock_ttl.unwrap_or(self.renew_interval * 10)
    }

    /// Copies the tunables that may change without a restart.
    ///
    /// Returns the names of settings that differ in `fresh` but need a
    /// restart (connections and the worker command line), which were
    /// therefore left untouched.
    pub fn apply_runtime_tunables(&mut self, fresh: &OrchestratorConfig) -> Vec<&'static str> {
        let mut ignored = Vec::new();
        if fresh.redis_url != self.redis_url {
            ignored.push("redis_url");
        }
        if fresh.key_prefix != self.key_prefix {
            ignored.push("key_prefix");
        }
        if fresh.database_url != self.database_url {
            ignored.push("database_url");
        }
        if fresh.master_lock_key != self.master_lock_key {
            ignored.push("master_lock_key");
        }
        if fresh.store_timeout != self.store_timeout {
            ignored.push("store_timeout");
        }
        if fresh.worker_program != self.worker_program {
            ignored.push("worker_program");
        }
        if fresh.worker_args != self.worker_args {
            ignored.push("worker_args");
        }

        self.renew_interval = fresh.renew_interval;
        self.lock_ttl = fresh.lock_ttl;
        self.health_check_interval = fresh.health_check_interval;
        self.stats_update_interval = fresh.stats_update_interval;
        self.tick_interval = fresh.tick_interval;
        self.error_cooldown = fresh.error_cooldown;
        self.worker_timeout = fresh.worker_timeout;
        self.worker_bootstrap_grace = fresh.worker_bootstrap_grace;
        self.worker_heartbeat_interval = fresh.worker_heartbeat_interval;
        self.terminate_grace = fresh.terminate_grace;
        self.max_campaign_workers = fresh.max_campaign_workers;
        self.visibility_timeout = fresh.visibility_timeout;
        self.orphan_grace = fresh.orphan_grace;
        self.retry_base = fresh.retry_base;
        self.retry_max = fresh.retry_max;
        self.max_attempts = fresh.max_attempts;
        self.log_history = fresh.log_history;

        ignored
    }

    /// Sets the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Sets the key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Sets the lock renewal interval and TTL.
    pub fn with_lock_timing(mut self, renew_interval: Duration, ttl: Duration) -> Self {
        self.renew_interval = renew_interval;
        self.lock_ttl = Some(ttl);
        self
    }

    /// Sets the health-check, stats and tick intervals.
    pub fn with_intervals(mut self, health_check: Duration, stats: Duration, tick: Duration) -> Self {
        self.health_check_interval = health_check;
        self.stats_update_interval = stats;
        self.tick_interval = tick;
        self
    }

    /// Sets the worker heartbeat timeout and bootstrap grace.
    pub fn with_worker_timeouts(mut self, timeout: Duration, bootstrap_grace: Duration) -> Self {
        self.worker_timeout = timeout;
        self.worker_bootstrap_grace = bootstrap_grace;
        self
    }

    /// Sets the maximum number of campaign workers.
    pub fn with_max_campaign_workers(mut self, max: usize) -> Self {
        self.max_campaign_workers = max;
        self
    }

    /// Sets the retry backoff bounds.
    pub fn with_retry_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base = base;
        self.retry_max = max;
        self
    }

    /// Sets the graceful termination period.
    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    /// Sets the error cooldown.
    pub fn with_error_cooldown(mut self, cooldown: Duration) -> Self {
        self.error_cooldown = cooldown;
        self
    }
}

fn set_secs(target: &mut Duration, value: Option<f64>, key: &str) -> Result<(), ConfigError> {
    if let Some(secs) = value {
        *target = secs_to_duration(secs, key)?;
    }
    Ok(())
}

fn env_secs(target: &mut Duration, key: &str) -> Result<(), ConfigError> {
    if let Ok(val) = std::env::var(key) {
        let secs: f64 = parse_env_value(&val, key)?;
        *target = secs_to_duration(secs, key)?;
    }
    Ok(())
}

fn secs_to_duration(secs: f64, key: &str) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs).map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("expected a non-negative number of seconds, got {}", secs),
    })
}

/// Parse an environment variable value into the target type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}
