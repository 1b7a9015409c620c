use crate::health::{Admission, HealthTracker};
use crate::metrics::{CallMetrics, CallMetricsSnapshot};
use crate::provider::HealthProbe;
use crate::throttle::{ThrottleController, ThrottleSnapshot};
use juris_core::constants::ATTEMPT_TIMEOUT_GROWTH;
use juris_core::{
    HealthConfig, HealthState, JurisError, JurisResult, LimiterConfig, LlmError, ThrottleConfig,
};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Text shown to a user when a call degrades instead of failing.
pub const FALLBACK_MESSAGE: &str = "I'm sorry, I encountered an error processing your request.";

const SERVICE_NAME: &str = "completion service";

// ============================================================================
// OPTIONS AND OUTCOMES
// ============================================================================

/// What to do once every attempt has failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnExhausted {
    /// Return the error to the caller.
    #[default]
    Propagate,
    /// Return a [`DegradedResponse`] instead of an error.
    Fallback,
}

/// Per-call retry settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOptions {
    /// Total invocations of the operation, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub on_exhausted: OnExhausted,
}

impl RetryOptions {
    pub fn from_config(config: &LimiterConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay,
            on_exhausted: OnExhausted::Propagate,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn fallback(mut self) -> Self {
        self.on_exhausted = OnExhausted::Fallback;
        self
    }
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self::from_config(&LimiterConfig::default())
    }
}

/// Typed stand-in for a result the service could not produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DegradedResponse {
    pub message: String,
    pub reason: String,
    /// Attempts made before degrading; 0 when the call was never run.
    pub attempts: u32,
}

impl DegradedResponse {
    fn from_error(error: &JurisError, attempts: u32) -> Self {
        Self {
            message: FALLBACK_MESSAGE.to_string(),
            reason: error.to_string(),
            attempts,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome<T> {
    Completed(T),
    Degraded(DegradedResponse),
}

impl<T> CallOutcome<T> {
    pub fn is_degraded(&self) -> bool {
        matches!(self, CallOutcome::Degraded(_))
    }

    pub fn completed(self) -> Option<T> {
        match self {
            CallOutcome::Completed(value) => Some(value),
            CallOutcome::Degraded(_) => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CallOutcome<U> {
        match self {
            CallOutcome::Completed(value) => CallOutcome::Completed(f(value)),
            CallOutcome::Degraded(degraded) => CallOutcome::Degraded(degraded),
        }
    }
}

impl<T: Into<String>> CallOutcome<T> {
    /// The completed text, or the fallback message.
    pub fn into_text(self) -> String {
        match self {
            CallOutcome::Completed(value) => value.into(),
            CallOutcome::Degraded(degraded) => degraded.message,
        }
    }
}

// ============================================================================
// BACKOFF
// ============================================================================

/// Delay before retrying after failed attempt `attempt` (1-based), without jitter:
/// `min(base * 2^(attempt - 1), max)`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent)
        .map(|delay| delay.min(max))
        .unwrap_or(max)
}

/// Scale `delay` by a factor drawn uniformly from `[1 - ratio, 1 + ratio]`.
pub fn apply_jitter(delay: Duration, ratio: f64) -> Duration {
    let ratio = ratio.clamp(0.0, 1.0);
    if ratio == 0.0 {
        return delay;
    }
    let factor = 1.0 - ratio + 2.0 * ratio * rand::random::<f64>();
    delay.mul_f64(factor)
}

// ============================================================================
// RETRYING LIMITER
// ============================================================================

/// Bounds concurrent calls to an external service and retries failures.
///
/// A call holds one slot of a fair semaphore from admission to return,
/// including backoff sleeps. Attempt `n` runs under
/// `call_timeout * (1 + 0.5 * (n - 1)) * timeout_factor`, where the factor
/// comes from the [`ThrottleController`].
pub struct RetryingLimiter {
    config: LimiterConfig,
    semaphore: Semaphore,
    effective: AtomicUsize,
    /// Permits to retire as they are returned.
    pending_shrink: AtomicUsize,
    health: HealthTracker,
    throttle: ThrottleController,
    probe: Option<Arc<dyn HealthProbe>>,
    metrics: CallMetrics,
}

impl RetryingLimiter {
    pub fn new(config: LimiterConfig, health: HealthConfig, throttle: ThrottleConfig) -> Self {
        let max = config.max_concurrency.max(1);
        Self {
            semaphore: Semaphore::new(max),
            effective: AtomicUsize::new(max),
            pending_shrink: AtomicUsize::new(0),
            health: HealthTracker::new(health),
            throttle: ThrottleController::new(throttle, config.min_concurrency, max),
            probe: None,
            metrics: CallMetrics::default(),
            config,
        }
    }

    /// Probe the service with `probe` instead of a real call while unavailable.
    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// Run `operation` with retries.
    ///
    /// The operation is invoked at most `options.max_attempts` times. While
    /// the service is unavailable the call fails fast, except for the single
    /// probe admitted per cooldown.
    ///
    /// # Errors
    /// With [`OnExhausted::Propagate`]: `LlmError::RetryExhausted` wrapping
    /// the last attempt's error, or `LlmError::ServiceUnavailable` on a fast
    /// failure. With [`OnExhausted::Fallback`] both become
    /// `CallOutcome::Degraded`.
    pub async fn with_retry<T, F, Fut>(
        &self,
        mut operation: F,
        options: RetryOptions,
    ) -> JurisResult<CallOutcome<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = JurisResult<T>>,
    {
        let mut max_attempts = options.max_attempts.max(1);
        let mut probe_slot = None;

        match self.health.admit() {
            Admission::Normal => {}
            Admission::Reject { retry_after } => {
                CallMetrics::incr(&self.metrics.fast_failures);
                debug!(
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Service unavailable; failing fast"
                );
                return self.exhausted(options.on_exhausted, unavailable(retry_after), 0);
            }
            Admission::Probe => {
                CallMetrics::incr(&self.metrics.probes);
                let slot = ProbeSlot::new(&self.health);
                match &self.probe {
                    Some(probe) => {
                        let passed = matches!(
                            tokio::time::timeout(self.config.call_timeout, probe.check()).await,
                            Ok(Ok(()))
                        );
                        slot.settle(passed);
                        if !passed {
                            CallMetrics::incr(&self.metrics.fast_failures);
                            let retry_after = self.health.retry_after();
                            return self.exhausted(
                                options.on_exhausted,
                                unavailable(retry_after),
                                0,
                            );
                        }
                        info!("Health probe passed; resuming calls");
                    }
                    None => {
                        // The real call is the probe; one attempt only.
                        max_attempts = 1;
                        probe_slot = Some(slot);
                    }
                }
            }
        }

        let _slot = self.acquire_slot().await?;

        let mut attempt = 1;
        let last_error = loop {
            match self.run_attempt(operation(), attempt).await {
                Ok(value) => {
                    CallMetrics::incr(&self.metrics.successes);
                    match probe_slot.take() {
                        Some(slot) => slot.settle(true),
                        None => self.health.record_success(),
                    }
                    self.adjust_throttle();
                    return Ok(CallOutcome::Completed(value));
                }
                Err(error) => {
                    if attempt >= max_attempts {
                        break error;
                    }
                    let delay = self.retry_delay(attempt, options.base_delay, &error);
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Attempt failed; retrying"
                    );
                    CallMetrics::incr(&self.metrics.retries);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        };

        CallMetrics::incr(&self.metrics.failures);
        match probe_slot.take() {
            Some(slot) => slot.settle(false),
            None => self.health.record_failure(),
        }
        self.adjust_throttle();

        warn!(attempts = attempt, error = %last_error, "All attempts failed");
        let error = JurisError::Llm(LlmError::RetryExhausted {
            attempts: attempt,
            last_error: Box::new(last_error),
        });
        self.exhausted(options.on_exhausted, error, attempt)
    }

    /// `with_retry` with the configured defaults, propagating failures.
    pub async fn call<T, F, Fut>(&self, operation: F) -> JurisResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = JurisResult<T>>,
    {
        let options = RetryOptions::from_config(&self.config);
        match self.with_retry(operation, options).await? {
            CallOutcome::Completed(value) => Ok(value),
            // Propagate never degrades.
            CallOutcome::Degraded(_) => Err(unavailable(self.health.retry_after())),
        }
    }

    /// `with_retry` with the configured defaults, degrading instead of failing.
    pub async fn call_or_degrade<T, F, Fut>(&self, operation: F) -> CallOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = JurisResult<T>>,
    {
        let options = RetryOptions::from_config(&self.config).fallback();
        match self.with_retry(operation, options).await {
            Ok(outcome) => outcome,
            Err(error) => CallOutcome::Degraded(DegradedResponse::from_error(&error, 0)),
        }
    }

    pub fn health(&self) -> HealthState {
        self.health.state()
    }

    pub fn health_tracker(&self) -> &HealthTracker {
        &self.health
    }

    pub fn effective_concurrency(&self) -> usize {
        self.effective.load(Ordering::SeqCst)
    }

    pub fn timeout_factor(&self) -> f64 {
        self.throttle.timeout_factor()
    }

    pub fn throttle(&self) -> ThrottleSnapshot {
        self.throttle.snapshot()
    }

    /// Timeout for attempt `attempt` (1-based) under the current throttle.
    pub fn attempt_timeout(&self, attempt: u32) -> Duration {
        let growth = 1.0 + ATTEMPT_TIMEOUT_GROWTH * attempt.saturating_sub(1) as f64;
        self.config
            .call_timeout
            .mul_f64(growth * self.throttle.timeout_factor())
    }

    pub fn metrics(&self) -> CallMetricsSnapshot {
        CallMetricsSnapshot {
            attempts: self.metrics.attempts.load(Ordering::Relaxed),
            successes: self.metrics.successes.load(Ordering::Relaxed),
            failures: self.metrics.failures.load(Ordering::Relaxed),
            timeouts: self.metrics.timeouts.load(Ordering::Relaxed),
            retries: self.metrics.retries.load(Ordering::Relaxed),
            fast_failures: self.metrics.fast_failures.load(Ordering::Relaxed),
            probes: self.metrics.probes.load(Ordering::Relaxed),
            consecutive_failures: self.health.consecutive_failures(),
            consecutive_successes: self.health.consecutive_successes(),
            in_flight: self.metrics.in_flight.load(Ordering::Relaxed),
            effective_concurrency: self.effective_concurrency(),
            timeout_factor: self.throttle.timeout_factor(),
            health: self.health.state(),
        }
    }

    async fn run_attempt<T, Fut>(&self, attempt_future: Fut, attempt: u32) -> JurisResult<T>
    where
        Fut: Future<Output = JurisResult<T>>,
    {
        CallMetrics::incr(&self.metrics.attempts);
        let timeout = self.attempt_timeout(attempt);
        let started = Instant::now();

        let result = match tokio::time::timeout(timeout, attempt_future).await {
            Ok(result) => result,
            Err(_) => {
                CallMetrics::incr(&self.metrics.timeouts);
                Err(JurisError::Llm(LlmError::AttemptTimeout {
                    attempt,
                    timeout_ms: timeout.as_millis() as u64,
                }))
            }
        };

        self.throttle.record(started.elapsed(), result.is_ok());
        result
    }

    /// Backoff after `attempt`, stretched to honour a provider's retry-after.
    fn retry_delay(&self, attempt: u32, base: Duration, error: &JurisError) -> Duration {
        let delay = apply_jitter(
            backoff_delay(attempt, base, self.config.max_delay),
            self.config.jitter_ratio,
        );
        match error {
            JurisError::Llm(LlmError::RateLimited { retry_after_ms, .. }) if *retry_after_ms > 0 => {
                let hinted = Duration::from_millis(*retry_after_ms as u64).min(self.config.max_delay);
                delay.max(hinted)
            }
            _ => delay,
        }
    }

    fn exhausted<T>(
        &self,
        on_exhausted: OnExhausted,
        error: JurisError,
        attempts: u32,
    ) -> JurisResult<CallOutcome<T>> {
        match on_exhausted {
            OnExhausted::Propagate => Err(error),
            OnExhausted::Fallback => {
                warn!(attempts, reason = %error, "Degrading to fallback response");
                Ok(CallOutcome::Degraded(DegradedResponse::from_error(
                    &error, attempts,
                )))
            }
        }
    }

    // ------------------------------------------------------------------------
    // Slots
    // ------------------------------------------------------------------------

    async fn acquire_slot(&self) -> JurisResult<Slot<'_>> {
        let permit = self.semaphore.acquire().await.map_err(|_| {
            JurisError::Llm(LlmError::ServiceUnavailable {
                service: SERVICE_NAME.to_string(),
                retry_after_ms: 0,
            })
        })?;
        self.metrics.in_flight.fetch_add(1, Ordering::Relaxed);
        Ok(Slot {
            permit: Some(permit),
            limiter: self,
        })
    }

    fn adjust_throttle(&self) {
        if let Some(adjustment) = self.throttle.evaluate() {
            self.resize(adjustment.concurrency);
        }
    }

    fn resize(&self, target: usize) {
        let current = self.effective.swap(target, Ordering::SeqCst);
        if target < current {
            for _ in target..current {
                match self.semaphore.try_acquire() {
                    Ok(permit) => permit.forget(),
                    Err(_) => {
                        self.pending_shrink.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
        } else {
            for _ in current..target {
                if !self.take_pending_shrink() {
                    self.semaphore.add_permits(1);
                }
            }
        }
        debug!(from = current, to = target, "Concurrency resized");
    }

    fn take_pending_shrink(&self) -> bool {
        self.pending_shrink
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for RetryingLimiter {
    fn default() -> Self {
        Self::new(
            LimiterConfig::default(),
            HealthConfig::default(),
            ThrottleConfig::default(),
        )
    }
}

impl std::fmt::Debug for RetryingLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryingLimiter")
            .field("effective_concurrency", &self.effective_concurrency())
            .field("available", &self.semaphore.available_permits())
            .field("health", &self.health.state())
            .field("has_probe", &self.probe.is_some())
            .finish()
    }
}

fn unavailable(retry_after: Duration) -> JurisError {
    JurisError::Llm(LlmError::ServiceUnavailable {
        service: SERVICE_NAME.to_string(),
        retry_after_ms: retry_after.as_millis() as u64,
    })
}

/// A held concurrency slot. Retires its permit if the limiter shrank meanwhile.
struct Slot<'a> {
    permit: Option<SemaphorePermit<'a>>,
    limiter: &'a RetryingLimiter,
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        self.limiter.metrics.in_flight.fetch_sub(1, Ordering::Relaxed);
        if let Some(permit) = self.permit.take() {
            if self.limiter.take_pending_shrink() {
                permit.forget();
            }
        }
    }
}

/// The probe admitted by the health tracker. Frees it unsettled on drop.
struct ProbeSlot<'a> {
    health: &'a HealthTracker,
    settled: bool,
}

impl<'a> ProbeSlot<'a> {
    fn new(health: &'a HealthTracker) -> Self {
        Self {
            health,
            settled: false,
        }
    }

    fn settle(mut self, success: bool) {
        self.settled = true;
        self.health.finish_probe(success);
    }
}

impl Drop for ProbeSlot<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.health.abandon_probe();
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
