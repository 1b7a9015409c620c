use juris_core::HealthState;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Limiter counters since startup.
#[derive(Debug, Default)]
pub struct CallMetrics {
    /// Individual operation invocations, including retries
    pub attempts: AtomicU64,
    /// Calls that returned a value
    pub successes: AtomicU64,
    /// Calls that ran out of attempts
    pub failures: AtomicU64,
    /// Attempts cut off by their timeout
    pub timeouts: AtomicU64,
    pub retries: AtomicU64,
    /// Calls rejected without running because the service is unavailable
    pub fast_failures: AtomicU64,
    pub probes: AtomicU64,
    /// Calls currently holding a slot
    pub in_flight: AtomicUsize,
}

impl CallMetrics {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot of limiter state at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallMetricsSnapshot {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub retries: u64,
    pub fast_failures: u64,
    pub probes: u64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub in_flight: usize,
    pub effective_concurrency: usize,
    pub timeout_factor: f64,
    pub health: HealthState,
}

impl CallMetricsSnapshot {
    /// Share of finished calls that succeeded; 1.0 before any call.
    pub fn success_rate(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            1.0
        } else {
            self.successes as f64 / total as f64
        }
    }
}
