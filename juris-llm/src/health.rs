use juris_core::{HealthConfig, HealthState};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Whether a call may proceed under the current health state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Proceed normally.
    Normal,
    /// Unavailable, but this caller carries the one probe for this cooldown.
    Probe,
    /// Unavailable; fail fast.
    Reject { retry_after: Duration },
}

/// Derives [`HealthState`] from consecutive call outcomes.
///
/// ```text
///   Available --(degraded_threshold failures)--> Degraded
///   Degraded  --(failure_threshold failures)---> Unavailable
///   Degraded  --(recovery_successes)-----------> Available
///   Unavailable --(successful probe)-----------> Available
/// ```
pub struct HealthTracker {
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    probe_in_flight: AtomicBool,
    /// Start of the current probe cooldown.
    last_probe: RwLock<Option<Instant>>,
    config: HealthConfig,
}

impl HealthTracker {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            state: AtomicU8::new(HealthState::Available as u8),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            probe_in_flight: AtomicBool::new(false),
            last_probe: RwLock::new(None),
            config,
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    pub fn state(&self) -> HealthState {
        HealthState::from(self.state.load(Ordering::SeqCst))
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes.load(Ordering::SeqCst)
    }

    /// Decide whether a call may run. At most one probe is admitted per cooldown.
    pub fn admit(&self) -> Admission {
        if self.state() != HealthState::Unavailable {
            return Admission::Normal;
        }

        let since = self
            .last_probe
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .map(|at| at.elapsed());
        let cooldown = self.config.probe_cooldown;

        match since {
            Some(elapsed) if elapsed < cooldown => Admission::Reject {
                retry_after: cooldown - elapsed,
            },
            _ => {
                if self
                    .probe_in_flight
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    return Admission::Reject {
                        retry_after: cooldown,
                    };
                }
                self.restart_cooldown();
                Admission::Probe
            }
        }
    }

    /// Time until the next probe may run, zero unless unavailable.
    pub fn retry_after(&self) -> Duration {
        if self.state() != HealthState::Unavailable {
            return Duration::ZERO;
        }
        self.last_probe
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .map(|at| self.config.probe_cooldown.saturating_sub(at.elapsed()))
            .unwrap_or(Duration::ZERO)
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        let successes = self.consecutive_successes.fetch_add(1, Ordering::SeqCst) + 1;

        match self.state() {
            HealthState::Available => {}
            HealthState::Degraded => {
                if successes >= self.config.recovery_successes {
                    self.set_state(HealthState::Available);
                }
            }
            HealthState::Unavailable => self.set_state(HealthState::Available),
        }
    }

    pub fn record_failure(&self) {
        self.consecutive_successes.store(0, Ordering::SeqCst);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;

        if failures >= self.config.failure_threshold {
            if self.state() != HealthState::Unavailable {
                self.restart_cooldown();
                self.set_state(HealthState::Unavailable);
            }
        } else if failures >= self.config.degraded_threshold
            && self.state() == HealthState::Available
        {
            self.set_state(HealthState::Degraded);
        }
    }

    /// Settle an admitted probe.
    pub fn finish_probe(&self, success: bool) {
        if success {
            self.record_success();
        } else {
            self.consecutive_successes.store(0, Ordering::SeqCst);
            self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
            self.restart_cooldown();
            warn!(
                retry_after_ms = self.config.probe_cooldown.as_millis() as u64,
                "Health probe failed; service still unavailable"
            );
        }
        self.probe_in_flight.store(false, Ordering::SeqCst);
    }

    /// Give the probe slot back without an outcome (the prober was cancelled).
    pub fn abandon_probe(&self) {
        self.probe_in_flight.store(false, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.state
            .store(HealthState::Available as u8, Ordering::SeqCst);
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.consecutive_successes.store(0, Ordering::SeqCst);
        self.probe_in_flight.store(false, Ordering::SeqCst);
        *self
            .last_probe
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn restart_cooldown(&self) {
        *self
            .last_probe
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }

    fn set_state(&self, next: HealthState) {
        let prev = HealthState::from(self.state.swap(next as u8, Ordering::SeqCst));
        if prev == next {
            return;
        }
        match next {
            HealthState::Available => info!(from = %prev, "Service available again"),
            HealthState::Degraded => warn!(
                consecutive_failures = self.consecutive_failures(),
                "Service degraded"
            ),
            HealthState::Unavailable => warn!(
                consecutive_failures = self.consecutive_failures(),
                probe_cooldown_ms = self.config.probe_cooldown.as_millis() as u64,
                "Service unavailable; failing fast until a probe succeeds"
            ),
        }
        if next == HealthState::Available {
            self.consecutive_successes.store(0, Ordering::SeqCst);
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}

impl std::fmt::Debug for HealthTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthTracker")
            .field("state", &self.state())
            .field("consecutive_failures", &self.consecutive_failures())
            .field("consecutive_successes", &self.consecutive_successes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> HealthTracker {
        HealthTracker::new(HealthConfig {
            degraded_threshold: 2,
            failure_threshold: 4,
            recovery_successes: 2,
            probe_cooldown: Duration::from_secs(30),
        })
    }

    #[test]
    fn test_failures_degrade_then_disable() {
        let health = tracker();
        health.record_failure();
        assert_eq!(health.state(), HealthState::Available);
        health.record_failure();
        assert_eq!(health.state(), HealthState::Degraded);
        health.record_failure();
        health.record_failure();
        assert_eq!(health.state(), HealthState::Unavailable);
    }

    #[test]
    fn test_failure_threshold_is_inclusive() {
        let health = tracker();
        for _ in 0..3 {
            health.record_failure();
        }
        assert_eq!(health.state(), HealthState::Degraded);
        assert_eq!(health.admit(), Admission::Normal);

        health.record_failure();
        assert_eq!(health.consecutive_failures(), 4);
        assert_eq!(health.state(), HealthState::Unavailable);
    }

    #[test]
    fn test_degraded_recovers_after_consecutive_successes() {
        let health = tracker();
        health.record_failure();
        health.record_failure();
        health.record_success();
        assert_eq!(health.state(), HealthState::Degraded);
        health.record_success();
        assert_eq!(health.state(), HealthState::Available);
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let health = tracker();
        health.record_failure();
        health.record_success();
        health.record_failure();
        assert_eq!(health.state(), HealthState::Available);
        assert_eq!(health.consecutive_failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_probe_per_cooldown() {
        let health = tracker();
        for _ in 0..4 {
            health.record_failure();
        }
        assert!(matches!(health.admit(), Admission::Reject { .. }));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(health.admit(), Admission::Probe);
        assert!(matches!(health.admit(), Admission::Reject { .. }));

        health.finish_probe(false);
        assert_eq!(health.state(), HealthState::Unavailable);
        assert!(matches!(health.admit(), Admission::Reject { .. }));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(health.admit(), Admission::Probe);
        health.finish_probe(true);
        assert_eq!(health.state(), HealthState::Available);
        assert_eq!(health.admit(), Admission::Normal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_counts_down() {
        let health = tracker();
        assert_eq!(health.retry_after(), Duration::ZERO);
        for _ in 0..4 {
            health.record_failure();
        }
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(health.retry_after(), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_probe_frees_slot() {
        let health = tracker();
        for _ in 0..4 {
            health.record_failure();
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(health.admit(), Admission::Probe);
        health.abandon_probe();

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(health.admit(), Admission::Probe);
    }

    #[test]
    fn test_reset() {
        let health = tracker();
        for _ in 0..4 {
            health.record_failure();
        }
        health.reset();
        assert_eq!(health.state(), HealthState::Available);
        assert_eq!(health.consecutive_failures(), 0);
    }
}
