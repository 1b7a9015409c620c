//! JURIS LLM - guarded calls to the completion service
//!
//! The completion service is slow, rate limited and sometimes down. Every
//! call goes through a [`RetryingLimiter`], which combines:
//!
//! - a fair semaphore bounding concurrent calls
//! - per-attempt timeouts that grow with the attempt number
//! - exponential backoff with jitter between attempts
//! - a [`HealthTracker`] that fails fast while the service is unavailable
//! - a [`ThrottleController`] that adapts timeouts and concurrency
//!
//! Provider implementations live outside this crate behind the
//! [`CompletionProvider`] trait.

mod health;
mod limiter;
mod metrics;
mod provider;
mod throttle;

pub use health::{Admission, HealthTracker};
pub use limiter::{
    apply_jitter, backoff_delay, CallOutcome, DegradedResponse, OnExhausted, RetryOptions,
    RetryingLimiter, FALLBACK_MESSAGE,
};
pub use metrics::{CallMetrics, CallMetricsSnapshot};
pub use provider::{CompletionProvider, HealthProbe, ProviderProbe};
pub use throttle::{Adjustment, ThrottleController, ThrottleDirection, ThrottleSnapshot};
