//! Connection lifecycle state machine.
//!
//! The lifecycle manager never assigns a state directly; it feeds
//! [`ConnectionEvent`]s through [`transition`], which rejects every pair not
//! on the diagram below.
//!
//! # State Transition Diagram
//!
//! ```text
//!                 ConnectRequested                ConnectSucceeded
//! Disconnected ───────────────────→ Connecting ─────────────────────→ Connected
//!      ↑  ↑                             │                             │     │
//!      │  └──────── ConnectFailed ──────┘                             │     │
//!      └────────────────────────── ConnectionLost ────────────────────┘     │
//!      │                                                                    │
//!      └── DisconnectCompleted ── Disconnecting ←── DisconnectRequested ────┘
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// STATES AND EVENTS
// ============================================================================

/// State of the shared data-store connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        }
    }

    /// Numeric code reported in status snapshots (0..=3, driver convention).
    pub fn ready_state(&self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connected => 1,
            ConnectionState::Connecting => 2,
            ConnectionState::Disconnecting => 3,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionEvent {
    ConnectRequested,
    ConnectSucceeded,
    ConnectFailed,
    /// Driver drop signal or health-check failure while connected.
    ConnectionLost,
    DisconnectRequested,
    DisconnectCompleted,
}

impl ConnectionEvent {
    pub const ALL: [ConnectionEvent; 6] = [
        ConnectionEvent::ConnectRequested,
        ConnectionEvent::ConnectSucceeded,
        ConnectionEvent::ConnectFailed,
        ConnectionEvent::ConnectionLost,
        ConnectionEvent::DisconnectRequested,
        ConnectionEvent::DisconnectCompleted,
    ];
}

/// Rejected transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: ConnectionState,
    pub event: ConnectionEvent,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid transition: {:?} in state {}", self.event, self.from)
    }
}

impl std::error::Error for InvalidTransition {}

// ============================================================================
// TRANSITION FUNCTION
// ============================================================================

/// Apply `event` to `state`.
pub fn transition(
    state: ConnectionState,
    event: ConnectionEvent,
) -> Result<ConnectionState, InvalidTransition> {
    use ConnectionEvent as E;
    use ConnectionState as S;

    match (state, event) {
        (S::Disconnected, E::ConnectRequested) => Ok(S::Connecting),
        (S::Connecting, E::ConnectSucceeded) => Ok(S::Connected),
        (S::Connecting, E::ConnectFailed) => Ok(S::Disconnected),
        (S::Connected, E::ConnectionLost) => Ok(S::Disconnected),
        (S::Connected, E::DisconnectRequested) => Ok(S::Disconnecting),
        (S::Disconnecting, E::DisconnectCompleted) => Ok(S::Disconnected),
        (from, event) => Err(InvalidTransition { from, event }),
    }
}
