//! Configuration for the coordination primitives.
//!
//! Every struct has a `Default` built from [`crate::constants`], a
//! `from_env()` that overrides individual fields from `JURIS_*` variables
//! (unparseable values fall back to the default), and a `validate()` that
//! rejects combinations the primitives cannot honour.

use crate::constants::*;
use crate::error::{ConfigError, JurisError, JurisResult};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Read and parse an environment variable, falling back to `default`.
fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> JurisError {
    JurisError::Config(ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    })
}

// ============================================================================
// CONNECTION
// ============================================================================

/// Options handed to the store driver on every connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectOptions {
    /// Upper bound on establishing the connection.
    pub connect_timeout: Duration,
    /// Inactivity timeout for the underlying socket.
    pub socket_timeout: Duration,
    /// Name reported to the server, if the driver supports it.
    pub application_name: Option<String>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            socket_timeout: Duration::from_millis(DEFAULT_SOCKET_TIMEOUT_MS),
            application_name: Some("juris".to_string()),
        }
    }
}

/// Configuration for the connection lifecycle manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Store URI. `None` until provided by the host.
    pub uri: Option<String>,
    pub options: ConnectOptions,
    pub health_check_interval: Duration,
    pub ping_timeout: Duration,
    /// Consecutive ping failures tolerated; one more forces a reconnect.
    pub max_ping_failures: u32,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            uri: None,
            options: ConnectOptions::default(),
            health_check_interval: Duration::from_millis(DEFAULT_HEALTH_CHECK_INTERVAL_MS),
            ping_timeout: Duration::from_millis(DEFAULT_PING_TIMEOUT_MS),
            max_ping_failures: DEFAULT_MAX_PING_FAILURES,
            reconnect_base_delay: Duration::from_millis(DEFAULT_RECONNECT_BASE_DELAY_MS),
            reconnect_max_delay: Duration::from_millis(DEFAULT_RECONNECT_MAX_DELAY_MS),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

impl ConnectionConfig {
    /// Create ConnectionConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `JURIS_DB_URI`: Store connection string (no default)
    /// - `JURIS_DB_CONNECT_TIMEOUT_MS`: Connect timeout (default: 5000)
    /// - `JURIS_DB_SOCKET_TIMEOUT_MS`: Socket timeout (default: 45000)
    /// - `JURIS_DB_HEALTH_CHECK_INTERVAL_MS`: Ping interval (default: 30000)
    /// - `JURIS_DB_PING_TIMEOUT_MS`: Ping timeout (default: 5000)
    /// - `JURIS_DB_MAX_PING_FAILURES`: Ping failures forcing a reconnect (default: 2)
    /// - `JURIS_DB_RECONNECT_BASE_DELAY_MS`: First reconnect delay (default: 3000)
    /// - `JURIS_DB_RECONNECT_MAX_DELAY_MS`: Reconnect delay cap (default: 60000)
    /// - `JURIS_DB_MAX_RECONNECT_ATTEMPTS`: Attempts before giving up (default: 50)
    pub fn from_env() -> Self {
        let options = ConnectOptions {
            connect_timeout: Duration::from_millis(env_or(
                "JURIS_DB_CONNECT_TIMEOUT_MS",
                DEFAULT_CONNECT_TIMEOUT_MS,
            )),
            socket_timeout: Duration::from_millis(env_or(
                "JURIS_DB_SOCKET_TIMEOUT_MS",
                DEFAULT_SOCKET_TIMEOUT_MS,
            )),
            application_name: std::env::var("JURIS_DB_APPLICATION_NAME")
                .ok()
                .or_else(|| Some("juris".to_string())),
        };

        Self {
            uri: std::env::var("JURIS_DB_URI").ok().filter(|s| !s.is_empty()),
            options,
            health_check_interval: Duration::from_millis(env_or(
                "JURIS_DB_HEALTH_CHECK_INTERVAL_MS",
                DEFAULT_HEALTH_CHECK_INTERVAL_MS,
            )),
            ping_timeout: Duration::from_millis(env_or(
                "JURIS_DB_PING_TIMEOUT_MS",
                DEFAULT_PING_TIMEOUT_MS,
            )),
            max_ping_failures: env_or("JURIS_DB_MAX_PING_FAILURES", DEFAULT_MAX_PING_FAILURES),
            reconnect_base_delay: Duration::from_millis(env_or(
                "JURIS_DB_RECONNECT_BASE_DELAY_MS",
                DEFAULT_RECONNECT_BASE_DELAY_MS,
            )),
            reconnect_max_delay: Duration::from_millis(env_or(
                "JURIS_DB_RECONNECT_MAX_DELAY_MS",
                DEFAULT_RECONNECT_MAX_DELAY_MS,
            )),
            max_reconnect_attempts: env_or(
                "JURIS_DB_MAX_RECONNECT_ATTEMPTS",
                DEFAULT_MAX_RECONNECT_ATTEMPTS,
            ),
        }
    }

    /// Short intervals for local development and tests.
    pub fn development() -> Self {
        Self {
            health_check_interval: Duration::from_secs(5),
            reconnect_base_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(5),
            max_reconnect_attempts: 10,
            ..Self::default()
        }
    }

    /// Delay before scheduled reconnect attempt `attempt` (1-based):
    /// `min(base * 2^(attempt - 1), max)`.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.reconnect_base_delay
            .checked_mul(factor)
            .map_or(self.reconnect_max_delay, |d| d.min(self.reconnect_max_delay))
    }

    pub fn validate(&self) -> JurisResult<()> {
        if self.options.connect_timeout.is_zero() {
            return Err(invalid(
                "connect_timeout",
                format!("{:?}", self.options.connect_timeout),
                "connect_timeout must be positive",
            ));
        }
        if self.health_check_interval.is_zero() {
            return Err(invalid(
                "health_check_interval",
                format!("{:?}", self.health_check_interval),
                "health_check_interval must be positive",
            ));
        }
        if self.ping_timeout.is_zero() {
            return Err(invalid(
                "ping_timeout",
                format!("{:?}", self.ping_timeout),
                "ping_timeout must be positive",
            ));
        }
        if self.max_ping_failures == 0 {
            return Err(invalid(
                "max_ping_failures",
                0,
                "max_ping_failures must be at least 1",
            ));
        }
        if self.reconnect_max_delay < self.reconnect_base_delay {
            return Err(JurisError::Config(ConfigError::IncompatibleOptions {
                option_a: "reconnect_base_delay".to_string(),
                option_b: "reconnect_max_delay".to_string(),
            }));
        }
        Ok(())
    }
}

// ============================================================================
// LOCKS
// ============================================================================

/// Configuration for the keyed lock manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConfig {
    /// Wait bound used by `with_lock`.
    pub default_timeout: Duration,
    /// Holds older than this are reclaimed by the sweeper.
    pub max_hold: Duration,
    pub sweep_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
            max_hold: Duration::from_secs(DEFAULT_LOCK_MAX_HOLD_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_LOCK_SWEEP_INTERVAL_SECS),
        }
    }
}

impl LockConfig {
    /// Create LockConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `JURIS_LOCK_TIMEOUT_MS`: Default acquire timeout (default: 3000)
    /// - `JURIS_LOCK_MAX_HOLD_SECS`: Stale threshold (default: 60)
    /// - `JURIS_LOCK_SWEEP_INTERVAL_SECS`: Sweeper interval (default: 60)
    pub fn from_env() -> Self {
        Self {
            default_timeout: Duration::from_millis(env_or(
                "JURIS_LOCK_TIMEOUT_MS",
                DEFAULT_LOCK_TIMEOUT_MS,
            )),
            max_hold: Duration::from_secs(env_or(
                "JURIS_LOCK_MAX_HOLD_SECS",
                DEFAULT_LOCK_MAX_HOLD_SECS,
            )),
            sweep_interval: Duration::from_secs(env_or(
                "JURIS_LOCK_SWEEP_INTERVAL_SECS",
                DEFAULT_LOCK_SWEEP_INTERVAL_SECS,
            )),
        }
    }

    pub fn validate(&self) -> JurisResult<()> {
        if self.default_timeout.is_zero() {
            return Err(invalid(
                "default_timeout",
                format!("{:?}", self.default_timeout),
                "default_timeout must be positive",
            ));
        }
        if self.max_hold <= self.default_timeout {
            return Err(JurisError::Config(ConfigError::IncompatibleOptions {
                option_a: "max_hold".to_string(),
                option_b: "default_timeout".to_string(),
            }));
        }
        if self.sweep_interval.is_zero() {
            return Err(invalid(
                "sweep_interval",
                format!("{:?}", self.sweep_interval),
                "sweep_interval must be positive",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// CACHE
// ============================================================================

/// Bounds for the TTL cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Maximum number of entries.
    pub max_entries: usize,
    /// TTL applied when `set` is called without an explicit one.
    pub default_ttl: Duration,
    /// Budget for the summed size estimates of all entries.
    pub max_memory_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_CACHE_MAX_ENTRIES,
            default_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            max_memory_bytes: DEFAULT_CACHE_MAX_MEMORY_MB * 1024 * 1024,
        }
    }
}

impl CacheConfig {
    /// Create CacheConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `JURIS_CACHE_MAX_ENTRIES`: Entry capacity (default: 1000)
    /// - `JURIS_CACHE_TTL_SECS`: Default TTL (default: 900)
    /// - `JURIS_CACHE_MAX_MEMORY_MB`: Memory budget (default: 100)
    pub fn from_env() -> Self {
        Self {
            max_entries: env_or("JURIS_CACHE_MAX_ENTRIES", DEFAULT_CACHE_MAX_ENTRIES),
            default_ttl: Duration::from_secs(env_or(
                "JURIS_CACHE_TTL_SECS",
                DEFAULT_CACHE_TTL_SECS,
            )),
            max_memory_bytes: env_or("JURIS_CACHE_MAX_MEMORY_MB", DEFAULT_CACHE_MAX_MEMORY_MB)
                * 1024
                * 1024,
        }
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_max_memory_bytes(mut self, bytes: usize) -> Self {
        self.max_memory_bytes = bytes;
        self
    }

    pub fn validate(&self) -> JurisResult<()> {
        if self.max_entries == 0 {
            return Err(invalid("max_entries", 0, "max_entries must be positive"));
        }
        if self.max_memory_bytes == 0 {
            return Err(invalid(
                "max_memory_bytes",
                0,
                "max_memory_bytes must be positive",
            ));
        }
        if self.default_ttl.is_zero() {
            return Err(invalid(
                "default_ttl",
                format!("{:?}", self.default_ttl),
                "default_ttl must be positive",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// RETRYING LIMITER
// ============================================================================

/// Configuration for the retrying concurrency limiter.
#[derive(Debug, Clone, PartialEq)]
pub struct LimiterConfig {
    /// Concurrent external calls allowed when the service is healthy.
    pub max_concurrency: usize,
    /// Floor the throttle controller never shrinks below.
    pub min_concurrency: usize,
    /// Timeout of the first attempt before throttle widening.
    pub call_timeout: Duration,
    /// Total attempts per call, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Backoff is multiplied by a factor in `[1 - ratio, 1 + ratio]`.
    pub jitter_ratio: f64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENT_CALLS,
            min_concurrency: DEFAULT_MIN_CONCURRENT_CALLS,
            call_timeout: Duration::from_millis(DEFAULT_CALL_TIMEOUT_MS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_RETRY_MAX_DELAY_MS),
            jitter_ratio: DEFAULT_RETRY_JITTER_RATIO,
        }
    }
}

impl LimiterConfig {
    /// Create LimiterConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `JURIS_AI_MAX_CONCURRENCY`: Concurrent calls (default: 5)
    /// - `JURIS_AI_MIN_CONCURRENCY`: Throttle floor (default: 1)
    /// - `JURIS_AI_TIMEOUT_MS`: First-attempt timeout (default: 30000)
    /// - `JURIS_AI_MAX_RETRIES`: Total attempts per call (default: 3)
    /// - `JURIS_AI_RETRY_DELAY_MS`: Base backoff (default: 1000)
    /// - `JURIS_AI_RETRY_MAX_DELAY_MS`: Backoff cap (default: 30000)
    /// - `JURIS_AI_RETRY_JITTER`: Jitter ratio (default: 0.2)
    pub fn from_env() -> Self {
        Self {
            max_concurrency: env_or("JURIS_AI_MAX_CONCURRENCY", DEFAULT_MAX_CONCURRENT_CALLS),
            min_concurrency: env_or("JURIS_AI_MIN_CONCURRENCY", DEFAULT_MIN_CONCURRENT_CALLS),
            call_timeout: Duration::from_millis(env_or(
                "JURIS_AI_TIMEOUT_MS",
                DEFAULT_CALL_TIMEOUT_MS,
            )),
            max_attempts: env_or("JURIS_AI_MAX_RETRIES", DEFAULT_MAX_ATTEMPTS),
            base_delay: Duration::from_millis(env_or(
                "JURIS_AI_RETRY_DELAY_MS",
                DEFAULT_RETRY_BASE_DELAY_MS,
            )),
            max_delay: Duration::from_millis(env_or(
                "JURIS_AI_RETRY_MAX_DELAY_MS",
                DEFAULT_RETRY_MAX_DELAY_MS,
            )),
            jitter_ratio: env_or("JURIS_AI_RETRY_JITTER", DEFAULT_RETRY_JITTER_RATIO),
        }
    }

    pub fn validate(&self) -> JurisResult<()> {
        if self.max_concurrency == 0 {
            return Err(invalid(
                "max_concurrency",
                0,
                "max_concurrency must be positive",
            ));
        }
        if self.min_concurrency == 0 || self.min_concurrency > self.max_concurrency {
            return Err(invalid(
                "min_concurrency",
                self.min_concurrency,
                "min_concurrency must be between 1 and max_concurrency",
            ));
        }
        if self.max_attempts == 0 {
            return Err(invalid("max_attempts", 0, "max_attempts must be at least 1"));
        }
        if self.call_timeout.is_zero() {
            return Err(invalid(
                "call_timeout",
                format!("{:?}", self.call_timeout),
                "call_timeout must be positive",
            ));
        }
        if !(0.0..1.0).contains(&self.jitter_ratio) {
            return Err(invalid(
                "jitter_ratio",
                self.jitter_ratio,
                "jitter_ratio must be in [0.0, 1.0)",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// SERVICE HEALTH
// ============================================================================

/// Thresholds for the completion-service health tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthConfig {
    /// Consecutive failures that mark the service degraded.
    pub degraded_threshold: u32,
    /// Consecutive failures that mark the service unavailable. Inclusive:
    /// the failure that reaches this count trips the tracker, so
    /// `failure_threshold - 1` failures are tolerated.
    pub failure_threshold: u32,
    /// Consecutive successes that clear a degraded state.
    pub recovery_successes: u32,
    /// Minimum spacing between probes while unavailable.
    pub probe_cooldown: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            degraded_threshold: DEFAULT_HEALTH_DEGRADED_THRESHOLD,
            failure_threshold: DEFAULT_HEALTH_FAILURE_THRESHOLD,
            recovery_successes: DEFAULT_HEALTH_RECOVERY_SUCCESSES,
            probe_cooldown: Duration::from_secs(DEFAULT_HEALTH_PROBE_COOLDOWN_SECS),
        }
    }
}

impl HealthConfig {
    /// Create HealthConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `JURIS_AI_DEGRADED_THRESHOLD`: Failures before degraded (default: 2)
    /// - `JURIS_AI_FAILURE_THRESHOLD`: Failures before unavailable (default: 5)
    /// - `JURIS_AI_RECOVERY_SUCCESSES`: Successes that clear degraded (default: 2)
    /// - `JURIS_AI_PROBE_COOLDOWN_SECS`: Probe spacing (default: 30)
    pub fn from_env() -> Self {
        Self {
            degraded_threshold: env_or(
                "JURIS_AI_DEGRADED_THRESHOLD",
                DEFAULT_HEALTH_DEGRADED_THRESHOLD,
            ),
            failure_threshold: env_or(
                "JURIS_AI_FAILURE_THRESHOLD",
                DEFAULT_HEALTH_FAILURE_THRESHOLD,
            ),
            recovery_successes: env_or(
                "JURIS_AI_RECOVERY_SUCCESSES",
                DEFAULT_HEALTH_RECOVERY_SUCCESSES,
            ),
            probe_cooldown: Duration::from_secs(env_or(
                "JURIS_AI_PROBE_COOLDOWN_SECS",
                DEFAULT_HEALTH_PROBE_COOLDOWN_SECS,
            )),
        }
    }

    pub fn validate(&self) -> JurisResult<()> {
        if self.degraded_threshold == 0 {
            return Err(invalid(
                "degraded_threshold",
                0,
                "degraded_threshold must be positive",
            ));
        }
        if self.failure_threshold < self.degraded_threshold {
            return Err(JurisError::Config(ConfigError::IncompatibleOptions {
                option_a: "failure_threshold".to_string(),
                option_b: "degraded_threshold".to_string(),
            }));
        }
        if self.recovery_successes == 0 {
            return Err(invalid(
                "recovery_successes",
                0,
                "recovery_successes must be positive",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// THROTTLE FEEDBACK
// ============================================================================

/// Tuning for the slow feedback loop that adapts timeouts and concurrency.
#[derive(Debug, Clone, PartialEq)]
pub struct ThrottleConfig {
    pub enabled: bool,
    /// Minimum spacing between two adjustments.
    pub adjust_interval: Duration,
    /// Smoothed latency above this counts as stress.
    pub latency_target: Duration,
    /// Smoothed error rate above this counts as stress.
    pub error_rate_high: f64,
    /// Smoothed error rate below this (with latency under target) counts as healthy.
    pub error_rate_low: f64,
    /// EWMA weight of the newest observation.
    pub smoothing: f64,
    /// Multiplier applied to the timeout factor per stressed adjustment.
    pub widen_step: f64,
    pub max_timeout_factor: f64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            adjust_interval: Duration::from_secs(DEFAULT_THROTTLE_ADJUST_INTERVAL_SECS),
            latency_target: Duration::from_millis(DEFAULT_THROTTLE_LATENCY_TARGET_MS),
            error_rate_high: DEFAULT_THROTTLE_ERROR_RATE_HIGH,
            error_rate_low: DEFAULT_THROTTLE_ERROR_RATE_LOW,
            smoothing: DEFAULT_THROTTLE_SMOOTHING,
            widen_step: DEFAULT_THROTTLE_WIDEN_STEP,
            max_timeout_factor: DEFAULT_THROTTLE_MAX_TIMEOUT_FACTOR,
        }
    }
}

impl ThrottleConfig {
    /// Create ThrottleConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `JURIS_THROTTLE_ENABLED`: Enable feedback (default: true)
    /// - `JURIS_THROTTLE_ADJUST_INTERVAL_SECS`: Adjustment spacing (default: 10)
    /// - `JURIS_THROTTLE_LATENCY_TARGET_MS`: Latency stress threshold (default: 10000)
    /// - `JURIS_THROTTLE_MAX_TIMEOUT_FACTOR`: Timeout widening cap (default: 3.0)
    pub fn from_env() -> Self {
        let enabled = std::env::var("JURIS_THROTTLE_ENABLED")
            .ok()
            .map(|s| s.to_lowercase() != "false")
            .unwrap_or(true);

        Self {
            enabled,
            adjust_interval: Duration::from_secs(env_or(
                "JURIS_THROTTLE_ADJUST_INTERVAL_SECS",
                DEFAULT_THROTTLE_ADJUST_INTERVAL_SECS,
            )),
            latency_target: Duration::from_millis(env_or(
                "JURIS_THROTTLE_LATENCY_TARGET_MS",
                DEFAULT_THROTTLE_LATENCY_TARGET_MS,
            )),
            max_timeout_factor: env_or(
                "JURIS_THROTTLE_MAX_TIMEOUT_FACTOR",
                DEFAULT_THROTTLE_MAX_TIMEOUT_FACTOR,
            ),
            ..Self::default()
        }
    }

    /// Feedback disabled: timeouts and concurrency stay at their configured values.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> JurisResult<()> {
        if !(0.0..=1.0).contains(&self.smoothing) || self.smoothing == 0.0 {
            return Err(invalid(
                "smoothing",
                self.smoothing,
                "smoothing must be in (0.0, 1.0]",
            ));
        }
        if self.error_rate_low > self.error_rate_high {
            return Err(JurisError::Config(ConfigError::IncompatibleOptions {
                option_a: "error_rate_low".to_string(),
                option_b: "error_rate_high".to_string(),
            }));
        }
        if self.widen_step <= 1.0 {
            return Err(invalid("widen_step", self.widen_step, "widen_step must be > 1.0"));
        }
        if self.max_timeout_factor < 1.0 {
            return Err(invalid(
                "max_timeout_factor",
                self.max_timeout_factor,
                "max_timeout_factor must be >= 1.0",
            ));
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
