//! Periodic maintenance of the in-process primitives.
//!
//! The cache drops expired entries lazily on access; keys that are never
//! read again would otherwise sit in memory until LRU pressure reaches them.
//! This task purges them on a fixed interval, removes stored conversations
//! that hold no messages, and logs one status line per cycle so operators
//! can follow connection, lock and completion health without a metrics
//! backend.
//!
//! Stale locks are reclaimed by the lock manager's own sweeper
//! (`KeyedLockManager::spawn_sweeper`), not here.

use juris_core::constants::DEFAULT_MAINTENANCE_INTERVAL_SECS;
use juris_core::{ConfigError, JurisError, JurisResult};
use juris_storage::StoreDriver;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::error::ApiError;
use crate::state::AppState;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the maintenance background task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaintenanceConfig {
    /// How often to run a cycle (default: 60 seconds)
    pub interval: Duration,

    /// Whether each cycle logs the system status (default: true)
    pub log_status: bool,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_MAINTENANCE_INTERVAL_SECS),
            log_status: true,
        }
    }
}

impl MaintenanceConfig {
    /// Create MaintenanceConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `JURIS_MAINTENANCE_INTERVAL_SECS`: Cycle interval (default: 60)
    /// - `JURIS_MAINTENANCE_LOG_STATUS`: Log status each cycle (default: true)
    pub fn from_env() -> Self {
        let interval = Duration::from_secs(
            std::env::var("JURIS_MAINTENANCE_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_MAINTENANCE_INTERVAL_SECS),
        );

        let log_status = std::env::var("JURIS_MAINTENANCE_LOG_STATUS")
            .ok()
            .map(|s| s.to_lowercase() != "false")
            .unwrap_or(true);

        Self {
            interval,
            log_status,
        }
    }

    /// Create a configuration for development/testing with a short interval.
    pub fn development() -> Self {
        Self {
            interval: Duration::from_secs(10),
            log_status: true,
        }
    }

    /// Create a configuration for production. Status lines are left to the
    /// status endpoint.
    pub fn production() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_MAINTENANCE_INTERVAL_SECS),
            log_status: false,
        }
    }

    pub fn validate(&self) -> JurisResult<()> {
        if self.interval.is_zero() {
            return Err(JurisError::Config(ConfigError::InvalidValue {
                field: "maintenance.interval".to_string(),
                value: format!("{:?}", self.interval),
                reason: "interval must be positive".to_string(),
            }));
        }
        Ok(())
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Metrics for maintenance cycles.
#[derive(Debug, Default)]
pub struct MaintenanceMetrics {
    /// Total cycles completed
    pub cycles: AtomicU64,

    /// Total expired cache entries purged since startup
    pub cache_entries_purged: AtomicU64,

    /// Cycles that observed the store connection down
    pub disconnected_cycles: AtomicU64,

    /// Total empty chat documents removed since startup
    pub empty_chats_removed: AtomicU64,

    /// Cycles whose empty-chat cleanup failed
    pub cleanup_errors: AtomicU64,
}

impl MaintenanceMetrics {
    /// Create new metrics instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current snapshot of all metrics.
    pub fn snapshot(&self) -> MaintenanceSnapshot {
        MaintenanceSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            cache_entries_purged: self.cache_entries_purged.load(Ordering::Relaxed),
            disconnected_cycles: self.disconnected_cycles.load(Ordering::Relaxed),
            empty_chats_removed: self.empty_chats_removed.load(Ordering::Relaxed),
            cleanup_errors: self.cleanup_errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of maintenance metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaintenanceSnapshot {
    pub cycles: u64,
    pub cache_entries_purged: u64,
    pub disconnected_cycles: u64,
    pub empty_chats_removed: u64,
    pub cleanup_errors: u64,
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Background task that periodically maintains the shared primitives.
///
/// This task runs until the shutdown signal is received. Each cycle it:
///
/// 1. Purges expired cache entries
/// 2. Removes empty chat documents when the store connection is up, and
///    counts the cycle as disconnected when it is not
/// 3. Optionally logs a one-line system status
///
/// The cycle never initiates a connection; reconnecting is the connection
/// manager's job.
///
/// The first cycle runs one full interval after start.
///
/// # Arguments
///
/// * `state` - Shared application state
/// * `config` - Maintenance configuration
/// * `shutdown_rx` - Watch receiver for shutdown signal
///
/// # Returns
///
/// Metrics collected during the task's lifetime
pub async fn maintenance_task<D: StoreDriver>(
    state: Arc<AppState<D>>,
    config: MaintenanceConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<MaintenanceMetrics> {
    let metrics = Arc::new(MaintenanceMetrics::new());

    let mut ticker = interval_at(Instant::now() + config.interval, config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        interval_secs = config.interval.as_secs(),
        log_status = config.log_status,
        "Maintenance task started"
    );

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                // A dropped sender means nobody can ask us to stop; stop now.
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("Maintenance task shutting down");
                    break;
                }
            }

            _ = ticker.tick() => {
                run_cycle(&state, &config, &metrics).await;
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        cycles = snapshot.cycles,
        cache_entries_purged = snapshot.cache_entries_purged,
        disconnected_cycles = snapshot.disconnected_cycles,
        empty_chats_removed = snapshot.empty_chats_removed,
        "Maintenance task completed"
    );

    metrics
}

/// Perform one maintenance cycle.
async fn run_cycle<D: StoreDriver>(
    state: &AppState<D>,
    config: &MaintenanceConfig,
    metrics: &MaintenanceMetrics,
) {
    metrics.cycles.fetch_add(1, Ordering::Relaxed);

    let purged = state.cache.purge_expired();
    if purged > 0 {
        metrics
            .cache_entries_purged
            .fetch_add(purged as u64, Ordering::Relaxed);
        tracing::debug!(purged, "Purged expired cache entries");
    }

    if state.connection.is_ready() {
        remove_empty_chats(state, metrics).await;
    } else {
        metrics.disconnected_cycles.fetch_add(1, Ordering::Relaxed);
    }

    if !config.log_status {
        tracing::trace!("Maintenance cycle completed");
        return;
    }

    let status = state.system_status();
    tracing::info!(
        overall = ?status.overall,
        connection = status.connection.state_description,
        locks_held = status.locks.held_keys,
        lock_waiters = status.locks.waiting,
        cache_entries = status.cache.entry_count,
        cache_hit_rate = status.cache.hit_rate(),
        completion_health = %status.completion.health,
        in_flight = status.completion.calls.in_flight,
        "System status"
    );
}

/// Delete chat documents that hold no messages.
async fn remove_empty_chats<D: StoreDriver>(state: &AppState<D>, metrics: &MaintenanceMetrics) {
    let result = match state.connection.ensure_connection().await {
        Ok(conn) => state.store.delete_empty(&conn).await.map_err(ApiError::from),
        Err(e) => Err(e.into()),
    };

    match result {
        Ok(0) => tracing::trace!("No empty chats to remove"),
        Ok(removed) => {
            metrics
                .empty_chats_removed
                .fetch_add(removed, Ordering::Relaxed);
            tracing::info!(removed, "Removed empty chats");
        }
        Err(e) => {
            metrics.cleanup_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(error = %e, "Empty chat cleanup failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        assert_eq!(
            MaintenanceConfig::default().interval,
            Duration::from_secs(DEFAULT_MAINTENANCE_INTERVAL_SECS)
        );
        assert_eq!(MaintenanceConfig::development().interval, Duration::from_secs(10));
        assert!(!MaintenanceConfig::production().log_status);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = MaintenanceConfig {
            interval: Duration::ZERO,
            log_status: true,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_snapshot_reads_counters() {
        let metrics = MaintenanceMetrics::new();
        metrics.cycles.fetch_add(3, Ordering::Relaxed);
        metrics.cache_entries_purged.fetch_add(5, Ordering::Relaxed);
        assert_eq!(
            metrics.snapshot(),
            MaintenanceSnapshot {
                cycles: 3,
                cache_entries_purged: 5,
                disconnected_cycles: 0,
                empty_chats_removed: 0,
                cleanup_errors: 0,
            }
        );
    }
}
