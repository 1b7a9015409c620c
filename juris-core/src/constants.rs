//! Default values shared across the JURIS crates.
//!
//! Every configurable knob has a `DEFAULT_*` constant here so that
//! `Default` impls and `from_env()` fallbacks agree.

// ============================================================================
// CONNECTION LIFECYCLE
// ============================================================================

/// Interval between health-check pings on an open connection.
pub const DEFAULT_HEALTH_CHECK_INTERVAL_MS: u64 = 30_000;

/// Upper bound on a single health-check ping.
pub const DEFAULT_PING_TIMEOUT_MS: u64 = 5_000;

/// Consecutive ping failures that force the connection to be treated as lost.
pub const DEFAULT_MAX_PING_FAILURES: u32 = 2;

/// First reconnect delay; doubles per attempt.
pub const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 3_000;

/// Cap on the reconnect delay.
pub const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 60_000;

/// Scheduled reconnect attempts before giving up.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 50;

/// Upper bound on a single driver connect (server selection).
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

/// Socket inactivity timeout handed to the driver.
pub const DEFAULT_SOCKET_TIMEOUT_MS: u64 = 45_000;

// ============================================================================
// KEYED LOCKS
// ============================================================================

/// Default wait bound for `acquire_lock` / `with_lock`.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 3_000;

/// A lock held longer than this is considered stale and reclaimed.
pub const DEFAULT_LOCK_MAX_HOLD_SECS: u64 = 60;

/// Interval of the stale-lock sweeper.
pub const DEFAULT_LOCK_SWEEP_INTERVAL_SECS: u64 = 60;

// ============================================================================
// CACHE
// ============================================================================

pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 1_000;
pub const DEFAULT_CACHE_TTL_SECS: u64 = 900;
pub const DEFAULT_CACHE_MAX_MEMORY_MB: usize = 100;

/// Size charged for a value whose serialized form cannot be measured.
pub const CACHE_SIZE_FALLBACK_BYTES: usize = 1_024;

// ============================================================================
// RETRYING LIMITER
// ============================================================================

pub const DEFAULT_MAX_CONCURRENT_CALLS: usize = 5;
pub const DEFAULT_MIN_CONCURRENT_CALLS: usize = 1;
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;
pub const DEFAULT_RETRY_JITTER_RATIO: f64 = 0.2;

/// Per-attempt timeout grows by this fraction of the base for each retry.
pub const ATTEMPT_TIMEOUT_GROWTH: f64 = 0.5;

// ============================================================================
// SERVICE HEALTH
// ============================================================================

pub const DEFAULT_HEALTH_DEGRADED_THRESHOLD: u32 = 2;
pub const DEFAULT_HEALTH_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_HEALTH_RECOVERY_SUCCESSES: u32 = 2;
pub const DEFAULT_HEALTH_PROBE_COOLDOWN_SECS: u64 = 30;

// ============================================================================
// THROTTLE FEEDBACK
// ============================================================================

pub const DEFAULT_THROTTLE_ADJUST_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_THROTTLE_LATENCY_TARGET_MS: u64 = 10_000;
pub const DEFAULT_THROTTLE_ERROR_RATE_HIGH: f64 = 0.25;
pub const DEFAULT_THROTTLE_ERROR_RATE_LOW: f64 = 0.05;
pub const DEFAULT_THROTTLE_SMOOTHING: f64 = 0.2;
pub const DEFAULT_THROTTLE_WIDEN_STEP: f64 = 1.25;
pub const DEFAULT_THROTTLE_MAX_TIMEOUT_FACTOR: f64 = 3.0;

// ============================================================================
// MAINTENANCE
// ============================================================================

pub const DEFAULT_MAINTENANCE_INTERVAL_SECS: u64 = 60;
