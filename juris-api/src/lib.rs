//! JURIS API - composition root for the chat backend
//!
//! Wires the coordination primitives into one [`AppState`] and exposes the
//! two paths that exercise them:
//!
//! - **write path** ([`ChatService::process_message`]): per-user lock,
//!   `ensure_connection`, read-modify-write of the chat document, then
//!   invalidation of the user's cached history.
//! - **read/respond path**: completion cache lookup, on miss a call through
//!   the retrying limiter, then cache fill. A second limiter call refreshes
//!   the stored conversation summary.
//!
//! Also here: the Postgres [`db::PostgresDriver`], tracing setup, the
//! maintenance job (cache purge, empty-chat cleanup) and the `juris` binary.

pub mod chat;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod state;
pub mod status;
pub mod telemetry;

pub use chat::{
    completion_key, history_key, history_prefix, lock_key, summary_prompt, ChatReply,
    ChatService, ReplySource, UnconfiguredProvider, MAX_HISTORY_MESSAGES,
};
pub use config::AppConfig;
pub use error::{ApiError, ApiResult};
pub use jobs::{maintenance_task, MaintenanceConfig, MaintenanceMetrics, MaintenanceSnapshot};
pub use state::{AppState, CacheValue};
pub use status::{CompletionStatus, SystemStatus};
pub use telemetry::{init_tracing, TelemetryConfig};
