//! System status report.
//!
//! One serializable snapshot of every primitive plus a per-component
//! [`HealthCheck`] list and a rolled-up [`HealthStatus`].

use chrono::Utc;
use juris_agents::LockMetricsSnapshot;
use juris_core::{ConnectionState, HealthCheck, HealthState, HealthStatus, Timestamp};
use juris_llm::{CallMetricsSnapshot, ThrottleSnapshot};
use juris_storage::{CacheStats, ConnectionStatus};
use serde::Serialize;

/// Completion-service view of the report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionStatus {
    pub provider: String,
    pub health: HealthState,
    pub calls: CallMetricsSnapshot,
    pub throttle: ThrottleSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStatus {
    pub overall: HealthStatus,
    pub connection: ConnectionStatus,
    pub locks: LockMetricsSnapshot,
    pub cache: CacheStats,
    pub completion: CompletionStatus,
    pub checks: Vec<HealthCheck>,
    pub generated_at: Timestamp,
}

impl SystemStatus {
    /// Assemble a report from component snapshots.
    pub fn collect(
        connection: ConnectionStatus,
        locks: LockMetricsSnapshot,
        cache: CacheStats,
        completion: CompletionStatus,
    ) -> Self {
        let checks = vec![
            store_check(&connection),
            completion_check(&completion),
            HealthCheck::healthy("locks")
                .with_metadata("held_keys", locks.held_keys.into())
                .with_metadata("waiting", locks.waiting.into()),
            HealthCheck::healthy("cache")
                .with_metadata("entries", cache.entry_count.into())
                .with_metadata("hit_rate", cache.hit_rate().into()),
        ];
        let overall = rollup(&checks);

        Self {
            overall,
            connection,
            locks,
            cache,
            completion,
            checks,
            generated_at: Utc::now(),
        }
    }
}

fn store_check(connection: &ConnectionStatus) -> HealthCheck {
    let check = match connection.state {
        ConnectionState::Connected => HealthCheck::healthy("store"),
        ConnectionState::Connecting => HealthCheck::degraded("store", "connecting"),
        ConnectionState::Disconnecting => HealthCheck::unhealthy("store", "disconnecting"),
        ConnectionState::Disconnected if connection.gave_up => {
            HealthCheck::unhealthy("store", "reconnect attempts exhausted")
        }
        ConnectionState::Disconnected if connection.reconnect_scheduled => {
            HealthCheck::degraded("store", "reconnect scheduled")
        }
        ConnectionState::Disconnected => HealthCheck::unhealthy("store", "disconnected"),
    };
    check
        .with_metadata("driver", connection.driver.clone().into())
        .with_metadata("reconnect_attempts", connection.reconnect.count.into())
}

fn completion_check(completion: &CompletionStatus) -> HealthCheck {
    HealthCheck::from_state("completion", completion.health)
        .with_metadata("provider", completion.provider.clone().into())
        .with_metadata("success_rate", completion.calls.success_rate().into())
        .with_metadata(
            "effective_concurrency",
            completion.calls.effective_concurrency.into(),
        )
}

/// Worst status wins.
fn rollup(checks: &[HealthCheck]) -> HealthStatus {
    if checks.iter().any(|c| c.status == HealthStatus::Unhealthy) {
        HealthStatus::Unhealthy
    } else if checks.iter().any(|c| c.status == HealthStatus::Degraded) {
        HealthStatus::Degraded
    } else if checks.iter().all(|c| c.status == HealthStatus::Healthy) {
        HealthStatus::Healthy
    } else {
        HealthStatus::Unknown
    }
}
