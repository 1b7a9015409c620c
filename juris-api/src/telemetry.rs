//! Tracing subscriber setup
//!
//! One `tracing-subscriber` registry for the whole process: an `EnvFilter`
//! (from `RUST_LOG`, or the configured default) and a fmt layer that emits
//! either JSON lines or human-readable output.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::error::{ApiError, ApiResult};

const DEFAULT_LOG_FILTER: &str = "juris_api=debug,juris_storage=info,juris_agents=info,juris_llm=info,info";

/// Telemetry configuration from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Service name attached to every log line
    pub service_name: String,
    /// Environment (production, staging, development)
    pub environment: String,
    /// Emit JSON lines instead of pretty output
    pub json_logs: bool,
    /// Filter used when `RUST_LOG` is unset
    pub log_filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "juris".to_string(),
            environment: "development".to_string(),
            json_logs: false,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl TelemetryConfig {
    /// Create TelemetryConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `JURIS_SERVICE_NAME`: Service name (default: juris)
    /// - `JURIS_ENVIRONMENT`: Deployment environment (default: development)
    /// - `JURIS_LOG_JSON`: JSON output when "true" or "1" (default: false)
    /// - `JURIS_LOG_FILTER`: Fallback filter when `RUST_LOG` is unset
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            service_name: std::env::var("JURIS_SERVICE_NAME").unwrap_or(defaults.service_name),
            environment: std::env::var("JURIS_ENVIRONMENT").unwrap_or(defaults.environment),
            json_logs: std::env::var("JURIS_LOG_JSON")
                .map(|s| s == "true" || s == "1")
                .unwrap_or(defaults.json_logs),
            log_filter: std::env::var("JURIS_LOG_FILTER").unwrap_or(defaults.log_filter),
        }
    }
}

/// Install the global tracing subscriber.
///
/// Call once at startup, before anything logs. A second call fails with
/// [`ApiError::Telemetry`] because a global subscriber is already set.
pub fn init_tracing(config: &TelemetryConfig) -> ApiResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))
        .map_err(|e| ApiError::Telemetry {
            reason: format!("Invalid log filter {:?}: {}", config.log_filter, e),
        })?;

    let fmt_layer = if config.json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| ApiError::Telemetry {
            reason: format!("Failed to install tracing subscriber: {}", e),
        })?;

    tracing::info!(
        service = %config.service_name,
        environment = %config.environment,
        json = config.json_logs,
        "Tracing initialized"
    );
    Ok(())
}
