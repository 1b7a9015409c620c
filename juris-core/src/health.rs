//! Unified health types
//!
//! `HealthState` is the three-valued view of an external dependency that the
//! limiter derives from call outcomes. `HealthCheck` is the serializable
//! per-component entry of a system status report.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Derived health of an external dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum HealthState {
    /// Calls proceed normally
    Available = 0,
    /// Recent failures; calls proceed but callers may prefer a cheaper path
    Degraded = 1,
    /// Calls fast-fail until a probe succeeds
    Unavailable = 2,
}

impl From<u8> for HealthState {
    fn from(value: u8) -> Self {
        match value {
            0 => HealthState::Available,
            1 => HealthState::Degraded,
            _ => HealthState::Unavailable,
        }
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthState::Available => "available",
            HealthState::Degraded => "degraded",
            HealthState::Unavailable => "unavailable",
        };
        f.write_str(s)
    }
}

/// Health status for a component in a status report.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Component is fully operational
    Healthy,
    /// Component is operational but degraded
    Degraded,
    /// Component is not operational
    Unhealthy,
    /// Health status is unknown (e.g., not yet checked)
    Unknown,
}

impl From<HealthState> for HealthStatus {
    fn from(state: HealthState) -> Self {
        match state {
            HealthState::Available => HealthStatus::Healthy,
            HealthState::Degraded => HealthStatus::Degraded,
            HealthState::Unavailable => HealthStatus::Unhealthy,
        }
    }
}

/// Detailed health check result for a component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Overall health status
    pub status: HealthStatus,
    /// Component name
    pub component: String,
    /// Detailed status message
    pub message: Option<String>,
    /// Response time in milliseconds (if applicable)
    pub response_time_ms: Option<i64>,
    /// Additional metadata
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl HealthCheck {
    /// Create a healthy check result.
    pub fn healthy(component: impl Into<String>) -> Self {
        Self::new(HealthStatus::Healthy, component, None)
    }

    /// Create a degraded check result.
    pub fn degraded(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Degraded, component, Some(message.into()))
    }

    /// Create an unhealthy check result.
    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Unhealthy, component, Some(message.into()))
    }

    /// Build a check result from a derived dependency state.
    pub fn from_state(component: impl Into<String>, state: HealthState) -> Self {
        match state {
            HealthState::Available => Self::healthy(component),
            other => Self::new(other.into(), component, Some(format!("service {}", other))),
        }
    }

    fn new(status: HealthStatus, component: impl Into<String>, message: Option<String>) -> Self {
        Self {
            status,
            component: component.into(),
            message,
            response_time_ms: None,
            metadata: None,
        }
    }

    /// Set the response time.
    pub fn with_response_time(mut self, ms: i64) -> Self {
        self.response_time_ms = Some(ms);
        self
    }

    /// Add metadata.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value);
        self
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_state_roundtrips_through_u8() {
        for state in [
            HealthState::Available,
            HealthState::Degraded,
            HealthState::Unavailable,
        ] {
            assert_eq!(HealthState::from(state as u8), state);
        }
    }

    #[test]
    fn test_from_state_sets_message_when_not_available() {
        let check = HealthCheck::from_state("completion", HealthState::Unavailable);
        assert_eq!(check.status, HealthStatus::Unhealthy);
        assert_eq!(check.message.as_deref(), Some("service unavailable"));

        let ok = HealthCheck::from_state("completion", HealthState::Available);
        assert!(ok.is_healthy());
        assert!(ok.message.is_none());
    }

    #[test]
    fn test_health_check_serializes_lowercase_status() {
        let check = HealthCheck::degraded("store", "slow").with_response_time(12);
        let json = serde_json::to_value(&check).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["response_time_ms"], 12);
    }
}
