use juris_core::{ConnectionState, Timestamp};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Notification published on every externally visible lifecycle change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Connected,
    ConnectFailed { reason: String },
    /// Unexpected drop, either signalled by the driver or forced by failed pings.
    ConnectionLost { reason: String },
    HealthCheckFailed { consecutive: u32 },
    ReconnectScheduled { attempt: u32, delay_ms: u64 },
    /// Terminal: automatic reconnection has stopped. The host decides
    /// whether to degrade or exit.
    ReconnectExhausted { attempts: u32 },
    Disconnected,
}

/// Reconnection bookkeeping. Reset on every successful connect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconnectAttempt {
    pub count: u32,
    pub last_attempt_at: Option<Timestamp>,
    #[serde(with = "duration_ms")]
    pub next_delay: Option<Duration>,
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }
}

/// Counters kept across the lifetime of the manager.
#[derive(Debug, Default)]
pub(crate) struct ConnectionMetrics {
    pub connections_opened: AtomicU64,
    pub connections_closed: AtomicU64,
    pub connection_errors: AtomicU64,
    pub reconnects_scheduled: AtomicU64,
    pub consecutive_ping_failures: AtomicU32,
}

impl ConnectionMetrics {
    pub fn record(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time view of the connection, for health reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub driver: String,
    pub state: ConnectionState,
    pub ready_state: u8,
    pub state_description: &'static str,
    pub is_connected: bool,
    pub reconnect: ReconnectAttempt,
    pub reconnect_scheduled: bool,
    pub health_check_active: bool,
    pub gave_up: bool,
    pub shutting_down: bool,
    pub consecutive_ping_failures: u32,
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub connection_errors: u64,
    pub reconnects_scheduled: u64,
    pub last_connected_at: Option<Timestamp>,
    pub last_disconnected_at: Option<Timestamp>,
}
