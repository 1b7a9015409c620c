//! Timer scheduling with explicit cancellation.
//!
//! Delayed work and periodic tickers are spawned tokio tasks wrapped in a
//! [`TaskHandle`]. Dropping a handle detaches the task; only
//! [`TaskHandle::cancel`] stops it. Owners that replace a handle must cancel
//! the old one first.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Handle to a scheduled task.
pub struct TaskHandle {
    name: &'static str,
    inner: JoinHandle<()>,
}

impl TaskHandle {
    /// Spawn `fut` on the current runtime.
    pub fn spawn<F>(name: &'static str, fut: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            name,
            inner: tokio::spawn(fut),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Stop the task at its next suspension point. Idempotent.
    pub fn cancel(&self) {
        if !self.inner.is_finished() {
            tracing::debug!(task = self.name, "Cancelling scheduled task");
        }
        self.inner.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }

    /// Wait for the task to end, either normally or by cancellation.
    pub async fn join(self) {
        if let Err(e) = self.inner.await {
            if e.is_panic() {
                tracing::error!(task = self.name, "Scheduled task panicked");
            }
        }
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("name", &self.name)
            .field("finished", &self.inner.is_finished())
            .finish()
    }
}

/// Run `fut` once after `delay`.
pub fn schedule_after<F>(name: &'static str, delay: Duration, fut: F) -> TaskHandle
where
    F: Future<Output = ()> + Send + 'static,
{
    TaskHandle::spawn(name, async move {
        tokio::time::sleep(delay).await;
        fut.await;
    })
}

/// Run `tick` every `period`, first after one full period. A tick that
/// overruns the period delays the next one instead of bunching them up.
pub fn every<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> TaskHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    TaskHandle::spawn(name, async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            tick().await;
        }
    })
}
