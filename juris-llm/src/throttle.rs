use juris_core::ThrottleConfig;
use serde::Serialize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThrottleDirection {
    /// Wider timeouts, fewer concurrent calls.
    Tighten,
    /// Back toward the configured baseline.
    Relax,
}

/// A change the limiter should apply.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Adjustment {
    pub direction: ThrottleDirection,
    pub concurrency: usize,
    pub timeout_factor: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThrottleSnapshot {
    pub enabled: bool,
    /// Smoothed attempt latency, absent before the first sample.
    pub latency_ms: Option<f64>,
    pub error_rate: f64,
    pub timeout_factor: f64,
    pub concurrency: usize,
}

#[derive(Debug)]
struct ThrottleState {
    latency_ms: Option<f64>,
    error_rate: f64,
    samples: u64,
    timeout_factor: f64,
    concurrency: usize,
    last_adjust: Instant,
}

/// Slow feedback loop over attempt latency and error rate.
///
/// Observations feed two EWMAs. At most once per `adjust_interval` the
/// controller compares them against the configured thresholds and proposes
/// one step: under stress it widens the timeout factor and gives up one
/// concurrency slot, when healthy it moves one step back toward baseline.
#[derive(Debug)]
pub struct ThrottleController {
    config: ThrottleConfig,
    min_concurrency: usize,
    max_concurrency: usize,
    state: Mutex<ThrottleState>,
}

impl ThrottleController {
    pub fn new(config: ThrottleConfig, min_concurrency: usize, max_concurrency: usize) -> Self {
        let min_concurrency = min_concurrency.clamp(1, max_concurrency.max(1));
        Self {
            config,
            min_concurrency,
            max_concurrency,
            state: Mutex::new(ThrottleState {
                latency_ms: None,
                error_rate: 0.0,
                samples: 0,
                timeout_factor: 1.0,
                concurrency: max_concurrency,
                last_adjust: Instant::now(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ThrottleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    /// Feed one attempt outcome into the averages.
    pub fn record(&self, latency: Duration, success: bool) {
        if !self.config.enabled {
            return;
        }
        let alpha = self.config.smoothing;
        let sample_ms = latency.as_secs_f64() * 1000.0;
        let error = if success { 0.0 } else { 1.0 };

        let mut state = self.state();
        state.latency_ms = Some(match state.latency_ms {
            Some(prev) => alpha * sample_ms + (1.0 - alpha) * prev,
            None => sample_ms,
        });
        state.error_rate = if state.samples == 0 {
            error
        } else {
            alpha * error + (1.0 - alpha) * state.error_rate
        };
        state.samples += 1;
    }

    /// Propose an adjustment if the interval has elapsed and one is warranted.
    pub fn evaluate(&self) -> Option<Adjustment> {
        if !self.config.enabled {
            return None;
        }
        let mut state = self.state();
        if state.samples == 0 || state.last_adjust.elapsed() < self.config.adjust_interval {
            return None;
        }
        state.last_adjust = Instant::now();

        let latency_ms = state.latency_ms.unwrap_or(0.0);
        let target_ms = self.config.latency_target.as_secs_f64() * 1000.0;
        let stressed = state.error_rate >= self.config.error_rate_high || latency_ms >= target_ms;
        let healthy = state.error_rate <= self.config.error_rate_low && latency_ms < target_ms;

        let (direction, factor, concurrency) = if stressed {
            (
                ThrottleDirection::Tighten,
                (state.timeout_factor * self.config.widen_step).min(self.config.max_timeout_factor),
                state.concurrency.saturating_sub(1).max(self.min_concurrency),
            )
        } else if healthy {
            (
                ThrottleDirection::Relax,
                (state.timeout_factor / self.config.widen_step).max(1.0),
                (state.concurrency + 1).min(self.max_concurrency),
            )
        } else {
            return None;
        };

        if factor == state.timeout_factor && concurrency == state.concurrency {
            debug!(?direction, "Throttle already at its limit");
            return None;
        }

        state.timeout_factor = factor;
        state.concurrency = concurrency;
        info!(
            ?direction,
            latency_ms,
            error_rate = state.error_rate,
            timeout_factor = factor,
            concurrency,
            "Throttle adjusted"
        );
        Some(Adjustment {
            direction,
            concurrency,
            timeout_factor: factor,
        })
    }

    /// Multiplier applied to every attempt timeout. 1.0 when disabled.
    pub fn timeout_factor(&self) -> f64 {
        self.state().timeout_factor
    }

    /// Concurrency the controller currently wants.
    pub fn concurrency(&self) -> usize {
        self.state().concurrency
    }

    pub fn snapshot(&self) -> ThrottleSnapshot {
        let state = self.state();
        ThrottleSnapshot {
            enabled: self.config.enabled,
            latency_ms: state.latency_ms,
            error_rate: state.error_rate,
            timeout_factor: state.timeout_factor,
            concurrency: state.concurrency,
        }
    }
}
