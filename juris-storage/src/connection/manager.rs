//! Connection lifecycle manager.

use super::driver::{redact_uri, DriverEvent, StoreDriver};
use super::status::{ConnectionMetrics, ConnectionStatus, LifecycleEvent, ReconnectAttempt};
use chrono::Utc;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use juris_core::{
    every, schedule_after, transition, ConnectOptions, ConnectionConfig, ConnectionError,
    ConnectionEvent, ConnectionState, TaskHandle, Timestamp,
};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

type ConnectFuture<H> = Shared<BoxFuture<'static, Result<H, ConnectionError>>>;

const EVENT_CHANNEL_CAPACITY: usize = 64;

// ============================================================================
// SHARED STATE
// ============================================================================

/// Everything mutated together with the state machine. Guarded by one
/// mutex that is never held across an `.await`.
struct Control<H> {
    handle: Option<H>,
    /// Handle abandoned by a forced drop, closed before the next reconnect.
    stale: Option<H>,
    target: Option<(String, ConnectOptions)>,
    pending: Option<ConnectFuture<H>>,
    attempt: ReconnectAttempt,
    /// Set by an unexpected drop; failed attempts only reschedule while set.
    auto_reconnect: bool,
    shutting_down: bool,
    gave_up: bool,
    health_task: Option<TaskHandle>,
    reconnect_task: Option<TaskHandle>,
    watcher_task: Option<TaskHandle>,
    last_connected_at: Option<Timestamp>,
    last_disconnected_at: Option<Timestamp>,
}

fn is_running(task: &Option<TaskHandle>) -> bool {
    task.as_ref().is_some_and(|t| !t.is_finished())
}

struct Inner<D: StoreDriver> {
    driver: Arc<D>,
    config: ConnectionConfig,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<LifecycleEvent>,
    control: Mutex<Control<D::Handle>>,
    metrics: ConnectionMetrics,
}

impl<D: StoreDriver> Inner<D> {
    fn control(&self) -> MutexGuard<'_, Control<D::Handle>> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Feed `event` through the state machine. The `Control` borrow proves
    /// the caller holds the lock.
    fn apply(&self, _ctl: &mut Control<D::Handle>, event: ConnectionEvent) -> bool {
        let current = self.state();
        match transition(current, event) {
            Ok(next) => {
                self.state_tx.send_replace(next);
                tracing::debug!(from = %current, to = %next, ?event, "Connection state changed");
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "Rejected connection state transition");
                false
            }
        }
    }

    fn emit(&self, event: LifecycleEvent) {
        // No subscribers is fine.
        let _ = self.events_tx.send(event);
    }

    /// Join the in-flight attempt, or start one against the last target.
    fn begin_connect(
        self: &Arc<Self>,
        ctl: &mut Control<D::Handle>,
    ) -> Result<ConnectFuture<D::Handle>, ConnectionError> {
        if let Some(pending) = &ctl.pending {
            return Ok(pending.clone());
        }

        let (uri, options) = ctl.target.clone().ok_or(ConnectionError::MissingUri)?;
        if !self.apply(ctl, ConnectionEvent::ConnectRequested) {
            return Err(ConnectionError::ConnectFailed {
                reason: format!("cannot connect while {}", self.state()),
                uri: redact_uri(&uri),
            });
        }
        self.ensure_watcher(ctl);

        let redacted = redact_uri(&uri);
        let inner = Arc::clone(self);
        // Spawned so the attempt settles even if every caller is cancelled.
        let task = tokio::spawn(async move { inner.run_attempt(uri, options).await });
        let future = async move {
            task.await.unwrap_or_else(|e| {
                Err(ConnectionError::ConnectFailed {
                    uri: redacted,
                    reason: format!("connect task failed: {e}"),
                })
            })
        }
        .boxed()
        .shared();

        ctl.pending = Some(future.clone());
        Ok(future)
    }

    async fn run_attempt(
        self: Arc<Self>,
        uri: String,
        options: ConnectOptions,
    ) -> Result<D::Handle, ConnectionError> {
        let started = Instant::now();
        let result =
            match tokio::time::timeout(options.connect_timeout, self.driver.connect(&uri, &options))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(ConnectionError::Timeout {
                    timeout_ms: options.connect_timeout.as_millis() as u64,
                }),
            };

        let mut ctl = self.control();
        ctl.pending = None;

        match result {
            Ok(handle) => {
                self.apply(&mut ctl, ConnectionEvent::ConnectSucceeded);
                ctl.handle = Some(handle.clone());
                ctl.attempt = ReconnectAttempt::default();
                ctl.auto_reconnect = false;
                ctl.gave_up = false;
                ctl.last_connected_at = Some(Utc::now());
                if let Some(task) = ctl.reconnect_task.take() {
                    task.cancel();
                }
                ConnectionMetrics::record(&self.metrics.connections_opened);
                self.metrics
                    .consecutive_ping_failures
                    .store(0, Ordering::Relaxed);
                if !ctl.shutting_down {
                    self.start_health_check(&mut ctl);
                }
                drop(ctl);

                tracing::info!(
                    driver = self.driver.name(),
                    uri = %redact_uri(&uri),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Store connection established"
                );
                self.emit(LifecycleEvent::Connected);
                Ok(handle)
            }
            Err(e) => {
                self.apply(&mut ctl, ConnectionEvent::ConnectFailed);
                ConnectionMetrics::record(&self.metrics.connection_errors);
                let will_retry = ctl.auto_reconnect && !ctl.shutting_down;
                if will_retry {
                    self.schedule_reconnect(&mut ctl);
                }
                drop(ctl);

                tracing::warn!(
                    driver = self.driver.name(),
                    uri = %redact_uri(&uri),
                    error = %e,
                    will_retry,
                    "Store connection attempt failed"
                );
                self.emit(LifecycleEvent::ConnectFailed {
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn start_health_check(self: &Arc<Self>, ctl: &mut Control<D::Handle>) {
        if let Some(task) = ctl.health_task.take() {
            task.cancel();
        }
        let weak = Arc::downgrade(self);
        ctl.health_task = Some(every(
            "store-health-check",
            self.config.health_check_interval,
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.health_tick().await;
                    }
                }
            },
        ));
    }

    async fn health_tick(self: &Arc<Self>) {
        let handle = {
            let ctl = self.control();
            if ctl.shutting_down || !self.state().is_connected() {
                return;
            }
            match ctl.handle.clone() {
                Some(handle) => handle,
                None => return,
            }
        };

        let started = Instant::now();
        let result = match tokio::time::timeout(self.config.ping_timeout, self.driver.ping(&handle))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::PingFailed {
                reason: format!(
                    "ping timed out after {}ms",
                    self.config.ping_timeout.as_millis()
                ),
            }),
        };

        match result {
            Ok(()) => {
                self.metrics
                    .consecutive_ping_failures
                    .store(0, Ordering::Relaxed);
                tracing::trace!(
                    latency_ms = started.elapsed().as_millis() as u64,
                    "Store ping ok"
                );
            }
            Err(e) => {
                let failures = self
                    .metrics
                    .consecutive_ping_failures
                    .fetch_add(1, Ordering::Relaxed)
                    + 1;
                tracing::warn!(
                    error = %e,
                    failures,
                    max_failures = self.config.max_ping_failures,
                    "Store health check failed"
                );
                self.emit(LifecycleEvent::HealthCheckFailed {
                    consecutive: failures,
                });
                if failures > self.config.max_ping_failures {
                    self.connection_lost(&format!("{failures} consecutive health checks failed"));
                }
            }
        }
    }

    /// Connected → Disconnected without being asked, then start reconnecting.
    fn connection_lost(self: &Arc<Self>, reason: &str) {
        let mut ctl = self.control();
        if ctl.shutting_down || !self.state().is_connected() {
            return;
        }
        if !self.apply(&mut ctl, ConnectionEvent::ConnectionLost) {
            return;
        }

        ctl.stale = ctl.handle.take();
        ctl.auto_reconnect = true;
        ctl.last_disconnected_at = Some(Utc::now());
        if let Some(task) = ctl.health_task.take() {
            task.cancel();
        }
        ConnectionMetrics::record(&self.metrics.connections_closed);
        self.metrics
            .consecutive_ping_failures
            .store(0, Ordering::Relaxed);

        tracing::warn!(driver = self.driver.name(), reason, "Store connection lost unexpectedly");
        self.emit(LifecycleEvent::ConnectionLost {
            reason: reason.to_string(),
        });
        self.schedule_reconnect(&mut ctl);
    }

    fn schedule_reconnect(self: &Arc<Self>, ctl: &mut Control<D::Handle>) {
        if ctl.shutting_down || is_running(&ctl.reconnect_task) {
            return;
        }

        let attempt = ctl.attempt.count + 1;
        if attempt > self.config.max_reconnect_attempts {
            if !ctl.gave_up {
                ctl.gave_up = true;
                tracing::error!(
                    attempts = ctl.attempt.count,
                    "Giving up on store reconnection"
                );
                self.emit(LifecycleEvent::ReconnectExhausted {
                    attempts: ctl.attempt.count,
                });
            }
            return;
        }

        let delay = self.config.reconnect_delay(attempt);
        ctl.attempt.count = attempt;
        ctl.attempt.next_delay = Some(delay);
        ConnectionMetrics::record(&self.metrics.reconnects_scheduled);

        tracing::info!(
            attempt,
            max_attempts = self.config.max_reconnect_attempts,
            delay_ms = delay.as_millis() as u64,
            "Scheduling store reconnection"
        );
        self.emit(LifecycleEvent::ReconnectScheduled {
            attempt,
            delay_ms: delay.as_millis() as u64,
        });

        let weak = Arc::downgrade(self);
        ctl.reconnect_task = Some(schedule_after("store-reconnect", delay, async move {
            if let Some(inner) = weak.upgrade() {
                inner.reconnect_now().await;
            }
        }));
    }

    async fn reconnect_now(self: Arc<Self>) {
        let stale = {
            let mut ctl = self.control();
            // This task's own handle; dropping it does not cancel.
            ctl.reconnect_task = None;
            if ctl.shutting_down || self.state() != ConnectionState::Disconnected {
                return;
            }
            ctl.attempt.last_attempt_at = Some(Utc::now());
            ctl.stale.take()
        };

        if let Some(stale) = stale {
            if let Err(e) = self.driver.disconnect(stale).await {
                tracing::debug!(error = %e, "Closing abandoned store connection failed");
            }
        }

        let attempt = {
            let mut ctl = self.control();
            if ctl.shutting_down || self.state() != ConnectionState::Disconnected {
                return;
            }
            tracing::info!(attempt = ctl.attempt.count, "Attempting store reconnection");
            self.begin_connect(&mut ctl)
        };

        match attempt {
            // Failures reschedule from inside the attempt.
            Ok(future) => {
                let _ = future.await;
            }
            Err(e) => tracing::warn!(error = %e, "Could not start store reconnection"),
        }
    }

    fn ensure_watcher(self: &Arc<Self>, ctl: &mut Control<D::Handle>) {
        if is_running(&ctl.watcher_task) {
            return;
        }
        let mut rx = self.driver.subscribe();
        let weak = Arc::downgrade(self);
        ctl.watcher_task = Some(TaskHandle::spawn("store-driver-events", async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        inner.on_driver_event(event);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Store driver event watcher lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }));
    }

    fn on_driver_event(self: &Arc<Self>, event: DriverEvent) {
        match event {
            DriverEvent::Disconnected { reason } => self.connection_lost(&reason),
            DriverEvent::Error { reason } => {
                tracing::warn!(error = %reason, "Store driver reported an error");
                self.connection_lost(&reason);
            }
        }
    }
}

impl<D: StoreDriver> Drop for Inner<D> {
    fn drop(&mut self) {
        let ctl = self
            .control
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for task in [
            ctl.health_task.take(),
            ctl.reconnect_task.take(),
            ctl.watcher_task.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.cancel();
        }
    }
}

// ============================================================================
// CONNECTION MANAGER
// ============================================================================

/// Keeps one shared data-store connection alive.
///
/// Cloning is cheap; every clone drives the same connection. Timers and the
/// driver-event watcher hold only weak references, so dropping the last
/// clone stops them.
///
/// - `connect` / `ensure_connection` deduplicate concurrent attempts.
/// - A periodic ping detects silent failures; enough consecutive failures
///   force the connection down even if the driver never signals a drop.
/// - After an unexpected drop, reconnects follow capped exponential backoff
///   until `max_reconnect_attempts`, then [`LifecycleEvent::ReconnectExhausted`]
///   is published and automatic reconnection stops.
/// - A failed *initial* connect is returned to the caller and never retried.
pub struct ConnectionManager<D: StoreDriver> {
    inner: Arc<Inner<D>>,
}

impl<D: StoreDriver> Clone for ConnectionManager<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: StoreDriver> ConnectionManager<D> {
    /// Create a manager. Nothing is spawned until the first connect.
    pub fn new(driver: Arc<D>, config: ConnectionConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let target = config
            .uri
            .clone()
            .map(|uri| (uri, config.options.clone()));

        Self {
            inner: Arc::new(Inner {
                driver,
                config,
                state_tx,
                events_tx,
                control: Mutex::new(Control {
                    handle: None,
                    stale: None,
                    target,
                    pending: None,
                    attempt: ReconnectAttempt::default(),
                    auto_reconnect: false,
                    shutting_down: false,
                    gave_up: false,
                    health_task: None,
                    reconnect_task: None,
                    watcher_task: None,
                    last_connected_at: None,
                    last_disconnected_at: None,
                }),
                metrics: ConnectionMetrics::default(),
            }),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.inner.driver
    }

    /// Connect to `uri`. Idempotent: when already connected the current
    /// handle is returned, and concurrent callers share one attempt.
    pub async fn connect(
        &self,
        uri: impl Into<String>,
        options: ConnectOptions,
    ) -> Result<D::Handle, ConnectionError> {
        let uri = uri.into();
        let attempt = {
            let mut ctl = self.inner.control();
            ctl.shutting_down = false;
            ctl.target = Some((uri, options));

            if self.inner.state().is_connected() {
                if let Some(handle) = ctl.handle.clone() {
                    if !is_running(&ctl.health_task) {
                        self.inner.start_health_check(&mut ctl);
                    }
                    return Ok(handle);
                }
            }
            self.inner.begin_connect(&mut ctl)?
        };
        attempt.await
    }

    /// A usable handle: the current one, the in-flight attempt's, or a new
    /// attempt against the last known URI.
    pub async fn ensure_connection(&self) -> Result<D::Handle, ConnectionError> {
        let attempt = {
            let mut ctl = self.inner.control();
            if ctl.shutting_down {
                return Err(ConnectionError::ShutDown);
            }
            if self.inner.state().is_connected() {
                if let Some(handle) = ctl.handle.clone() {
                    return Ok(handle);
                }
            }
            self.inner.begin_connect(&mut ctl)?
        };
        attempt.await
    }

    /// Graceful shutdown. Cancels timers, waits for an in-flight attempt,
    /// then closes the connection. Idempotent.
    pub async fn disconnect(&self) -> Result<(), ConnectionError> {
        let pending = {
            let mut ctl = self.inner.control();
            ctl.shutting_down = true;
            ctl.auto_reconnect = false;
            for task in [
                ctl.health_task.take(),
                ctl.reconnect_task.take(),
                ctl.watcher_task.take(),
            ]
            .into_iter()
            .flatten()
            {
                task.cancel();
            }
            ctl.pending.clone()
        };

        if let Some(pending) = pending {
            let _ = pending.await;
        }

        let (handle, stale) = {
            let mut ctl = self.inner.control();
            let stale = ctl.stale.take();
            let handle = if self.inner.state().is_connected() {
                self.inner
                    .apply(&mut ctl, ConnectionEvent::DisconnectRequested);
                ctl.handle.take()
            } else {
                None
            };
            (handle, stale)
        };

        if let Some(stale) = stale {
            let _ = self.inner.driver.disconnect(stale).await;
        }

        let Some(handle) = handle else {
            tracing::debug!("Store already disconnected");
            return Ok(());
        };

        let result = self.inner.driver.disconnect(handle).await;
        {
            let mut ctl = self.inner.control();
            self.inner
                .apply(&mut ctl, ConnectionEvent::DisconnectCompleted);
            ctl.last_disconnected_at = Some(Utc::now());
        }
        ConnectionMetrics::record(&self.inner.metrics.connections_closed);

        match &result {
            Ok(()) => tracing::info!(driver = self.inner.driver.name(), "Store disconnected gracefully"),
            Err(e) => tracing::warn!(error = %e, "Store disconnect reported an error"),
        }
        self.inner.emit(LifecycleEvent::Disconnected);
        result
    }

    /// Whether a connected handle is available right now.
    pub fn is_ready(&self) -> bool {
        self.inner.state().is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.events_tx.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        let state = self.inner.state();
        let metrics = &self.inner.metrics;
        let ctl = self.inner.control();

        ConnectionStatus {
            driver: self.inner.driver.name().to_string(),
            state,
            ready_state: state.ready_state(),
            state_description: state.as_str(),
            is_connected: state.is_connected(),
            reconnect: ctl.attempt.clone(),
            reconnect_scheduled: is_running(&ctl.reconnect_task),
            health_check_active: is_running(&ctl.health_task),
            gave_up: ctl.gave_up,
            shutting_down: ctl.shutting_down,
            consecutive_ping_failures: metrics.consecutive_ping_failures.load(Ordering::Relaxed),
            connections_opened: metrics.connections_opened.load(Ordering::Relaxed),
            connections_closed: metrics.connections_closed.load(Ordering::Relaxed),
            connection_errors: metrics.connection_errors.load(Ordering::Relaxed),
            reconnects_scheduled: metrics.reconnects_scheduled.load(Ordering::Relaxed),
            last_connected_at: ctl.last_connected_at,
            last_disconnected_at: ctl.last_disconnected_at,
        }
    }
}

impl<D: StoreDriver> std::fmt::Debug for ConnectionManager<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("driver", &self.inner.driver.name())
            .field("state", &self.inner.state())
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32};
    use std::time::Duration;

    struct TestDriver {
        connects: AtomicU32,
        disconnects: AtomicU32,
        fail_connects: AtomicU32,
        fail_pings: AtomicBool,
        connect_delay: Duration,
        events: broadcast::Sender<DriverEvent>,
    }

    impl TestDriver {
        fn new(connect_delay: Duration) -> Arc<Self> {
            let (events, _) = broadcast::channel(16);
            Arc::new(Self {
                connects: AtomicU32::new(0),
                disconnects: AtomicU32::new(0),
                fail_connects: AtomicU32::new(0),
                fail_pings: AtomicBool::new(false),
                connect_delay,
                events,
            })
        }

        fn drop_connection(&self) {
            let _ = self.events.send(DriverEvent::Disconnected {
                reason: "socket closed".to_string(),
            });
        }
    }

    #[async_trait]
    impl StoreDriver for TestDriver {
        type Handle = u32;

        fn name(&self) -> &str {
            "test"
        }

        async fn connect(&self, uri: &str, _: &ConnectOptions) -> Result<u32, ConnectionError> {
            tokio::time::sleep(self.connect_delay).await;
            let n = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
            let failing = self
                .fail_connects
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if failing {
                return Err(ConnectionError::ConnectFailed {
                    uri: uri.to_string(),
                    reason: "refused".to_string(),
                });
            }
            Ok(n)
        }

        async fn ping(&self, _: &u32) -> Result<(), ConnectionError> {
            if self.fail_pings.load(Ordering::SeqCst) {
                Err(ConnectionError::PingFailed {
                    reason: "no reply".to_string(),
                })
            } else {
                Ok(())
            }
        }

        async fn disconnect(&self, _: u32) -> Result<(), ConnectionError> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn subscribe(&self) -> broadcast::Receiver<DriverEvent> {
            self.events.subscribe()
        }
    }

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            health_check_interval: Duration::from_secs(1),
            ping_timeout: Duration::from_millis(200),
            max_ping_failures: 2,
            reconnect_base_delay: Duration::from_millis(100),
            reconnect_max_delay: Duration::from_secs(1),
            max_reconnect_attempts: 3,
            ..ConnectionConfig::default()
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_connects_share_one_attempt() {
        let driver = TestDriver::new(Duration::from_millis(50));
        let manager = ConnectionManager::new(Arc::clone(&driver), config());
        let (a, b, c) = (manager.clone(), manager.clone(), manager.clone());

        let (ra, rb, rc) = tokio::join!(
            a.connect("mem://one", ConnectOptions::default()),
            b.connect("mem://one", ConnectOptions::default()),
            c.connect("mem://one", ConnectOptions::default()),
        );

        assert_eq!(ra, Ok(1));
        assert_eq!(rb, Ok(1));
        assert_eq!(rc, Ok(1));
        assert_eq!(driver.connects.load(Ordering::SeqCst), 1);
        assert!(manager.is_ready());
        assert!(manager.status().health_check_active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_failure_is_not_retried() {
        let driver = TestDriver::new(Duration::ZERO);
        driver.fail_connects.store(1, Ordering::SeqCst);
        let manager = ConnectionManager::new(Arc::clone(&driver), config());

        let err = manager
            .connect("mem://one", ConnectOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::ConnectFailed { .. }));

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(driver.connects.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!manager.status().reconnect_scheduled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let driver = TestDriver::new(Duration::from_secs(30));
        let manager = ConnectionManager::new(driver, config());
        let options = ConnectOptions {
            connect_timeout: Duration::from_secs(1),
            ..ConnectOptions::default()
        };

        let err = manager.connect("mem://slow", options).await.unwrap_err();
        assert_eq!(err, ConnectionError::Timeout { timeout_ms: 1000 });
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_drop_triggers_reconnect() {
        let driver = TestDriver::new(Duration::ZERO);
        let manager = ConnectionManager::new(Arc::clone(&driver), config());
        let mut events = manager.subscribe();
        manager
            .connect("mem://one", ConnectOptions::default())
            .await
            .unwrap();

        driver.drop_connection();
        settle().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.status().reconnect_scheduled);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(manager.is_ready());
        assert_eq!(driver.connects.load(Ordering::SeqCst), 2);
        assert_eq!(manager.status().reconnect.count, 0);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&LifecycleEvent::ReconnectScheduled {
            attempt: 1,
            delay_ms: 100
        }));
        assert_eq!(seen.last(), Some(&LifecycleEvent::Connected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_pings_force_reconnect() {
        let driver = TestDriver::new(Duration::ZERO);
        let manager = ConnectionManager::new(Arc::clone(&driver), config());
        manager
            .connect("mem://one", ConnectOptions::default())
            .await
            .unwrap();

        driver.fail_pings.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(2100)).await;
        // Up to max_ping_failures consecutive failures are tolerated.
        assert!(manager.is_ready());
        assert_eq!(manager.status().consecutive_ping_failures, 2);

        tokio::time::sleep(Duration::from_millis(950)).await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        driver.fail_pings.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(manager.is_ready());
        // The abandoned connection was closed before reconnecting.
        assert_eq!(driver.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(driver.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_gives_up_after_max_attempts() {
        let driver = TestDriver::new(Duration::ZERO);
        let manager = ConnectionManager::new(Arc::clone(&driver), config());
        let mut events = manager.subscribe();
        manager
            .connect("mem://one", ConnectOptions::default())
            .await
            .unwrap();

        driver.fail_connects.store(u32::MAX, Ordering::SeqCst);
        driver.drop_connection();
        tokio::time::sleep(Duration::from_secs(60)).await;

        // Initial connect plus three scheduled attempts.
        assert_eq!(driver.connects.load(Ordering::SeqCst), 4);
        let status = manager.status();
        assert!(status.gave_up);
        assert!(!status.reconnect_scheduled);

        let mut exhausted = None;
        while let Ok(event) = events.try_recv() {
            if let LifecycleEvent::ReconnectExhausted { attempts } = event {
                exhausted = Some(attempts);
            }
        }
        assert_eq!(exhausted, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_suppresses_reconnect() {
        let driver = TestDriver::new(Duration::ZERO);
        let manager = ConnectionManager::new(Arc::clone(&driver), config());
        manager
            .connect("mem://one", ConnectOptions::default())
            .await
            .unwrap();

        manager.disconnect().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(driver.disconnects.load(Ordering::SeqCst), 1);

        driver.drop_connection();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(driver.connects.load(Ordering::SeqCst), 1);
        assert_eq!(
            manager.ensure_connection().await,
            Err(ConnectionError::ShutDown)
        );

        // Disconnecting twice is a no-op.
        manager.disconnect().await.unwrap();
        assert_eq!(driver.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_connection_without_uri() {
        let manager = ConnectionManager::new(TestDriver::new(Duration::ZERO), config());
        assert_eq!(
            manager.ensure_connection().await,
            Err(ConnectionError::MissingUri)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_connection_uses_configured_uri() {
        let driver = TestDriver::new(Duration::ZERO);
        let config = ConnectionConfig {
            uri: Some("mem://configured".to_string()),
            ..config()
        };
        let manager = ConnectionManager::new(Arc::clone(&driver), config);

        assert_eq!(manager.ensure_connection().await, Ok(1));
        assert_eq!(manager.ensure_connection().await, Ok(1));
        assert_eq!(driver.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_state_observes_transitions() {
        let driver = TestDriver::new(Duration::from_millis(10));
        let manager = ConnectionManager::new(driver, config());
        let mut rx = manager.watch_state();

        let connecting = manager.clone();
        let task = tokio::spawn(async move {
            connecting
                .connect("mem://one", ConnectOptions::default())
                .await
        });

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), ConnectionState::Connecting);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), ConnectionState::Connected);
        assert!(task.await.unwrap().is_ok());
    }
}
