//! Application state: the one place the primitives are constructed.

use juris_agents::KeyedLockManager;
use juris_core::{ConnectionError, TaskHandle};
use juris_llm::{CompletionProvider, ProviderProbe, RetryingLimiter};
use juris_storage::{BoundedTtlCache, ChatMessage, ChatStore, ConnectionManager, StoreDriver};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};

use crate::config::AppConfig;
use crate::status::{CompletionStatus, SystemStatus};

/// Values held by the shared cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CacheValue {
    Completion(String),
    History(Vec<ChatMessage>),
}

/// Shared state, built once at startup and handed around as `Arc<AppState<D>>`.
pub struct AppState<D: StoreDriver> {
    pub config: AppConfig,
    pub connection: ConnectionManager<D>,
    pub locks: Arc<KeyedLockManager>,
    pub cache: Arc<BoundedTtlCache<CacheValue>>,
    pub limiter: Arc<RetryingLimiter>,
    pub provider: Arc<dyn CompletionProvider>,
    pub store: Arc<dyn ChatStore<D::Handle>>,
    background: Mutex<Vec<TaskHandle>>,
}

impl<D: StoreDriver> AppState<D> {
    /// Build every primitive from `config`. Nothing is spawned and no
    /// connection is opened until [`AppState::start`] and the first
    /// `ensure_connection`.
    pub fn new(
        config: AppConfig,
        driver: Arc<D>,
        store: Arc<dyn ChatStore<D::Handle>>,
        provider: Arc<dyn CompletionProvider>,
    ) -> Self {
        let connection = ConnectionManager::new(driver, config.connection.clone());
        let locks = Arc::new(KeyedLockManager::new(config.lock.clone()));
        let cache = Arc::new(BoundedTtlCache::new(config.cache.clone()));
        let limiter = Arc::new(
            RetryingLimiter::new(
                config.limiter.clone(),
                config.health.clone(),
                config.throttle.clone(),
            )
            .with_probe(Arc::new(ProviderProbe::new(Arc::clone(&provider)))),
        );

        Self {
            config,
            connection,
            locks,
            cache,
            limiter,
            provider,
            store,
            background: Mutex::new(Vec::new()),
        }
    }

    /// Start background work owned by the state (the stale-lock sweeper).
    /// Calling it again replaces the running tasks.
    pub fn start(&self) {
        let mut background = self.background();
        for task in background.drain(..) {
            task.cancel();
        }
        background.push(self.locks.spawn_sweeper());
        tracing::debug!(tasks = background.len(), "Background tasks started");
    }

    /// Stop background work and close the store connection. Idempotent.
    pub async fn shutdown(&self) -> Result<(), ConnectionError> {
        let tasks: Vec<TaskHandle> = self.background().drain(..).collect();
        for task in &tasks {
            task.cancel();
        }
        self.connection.disconnect().await
    }

    pub fn system_status(&self) -> SystemStatus {
        SystemStatus::collect(
            self.connection.status(),
            self.locks.metrics(),
            self.cache.stats(),
            CompletionStatus {
                provider: self.provider.provider_id().to_string(),
                health: self.limiter.health(),
                calls: self.limiter.metrics(),
                throttle: self.limiter.throttle(),
            },
        )
    }

    fn background(&self) -> std::sync::MutexGuard<'_, Vec<TaskHandle>> {
        self.background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<D: StoreDriver> std::fmt::Debug for AppState<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("connection", &self.connection.state())
            .field("locks", &self.locks)
            .field("cache_entries", &self.cache.len())
            .field("provider", &self.provider.provider_id())
            .field("completion_health", &self.limiter.health())
            .finish()
    }
}
