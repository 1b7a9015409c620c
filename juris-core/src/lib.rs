//! JURIS Core - shared types for the chat backend coordination layer.
//!
//! This crate carries what every other JURIS crate agrees on:
//!
//! - `error`: per-domain error enums and the master `JurisError`
//! - `config`: configuration structs with env loading and validation
//! - `constants`: the `DEFAULT_*` values behind those configs
//! - `state`: the connection lifecycle state machine
//! - `health`: dependency health states and status-report entries
//! - `scheduler`: cancellable delayed tasks and tickers

pub mod config;
pub mod constants;
pub mod error;
pub mod health;
pub mod scheduler;
pub mod state;

pub use config::{
    CacheConfig, ConnectOptions, ConnectionConfig, HealthConfig, LimiterConfig, LockConfig,
    ThrottleConfig,
};
pub use error::{
    CacheError, ConfigError, ConnectionError, JurisError, JurisResult, LlmError, LockError,
    StorageError,
};
pub use health::{HealthCheck, HealthState, HealthStatus};
pub use scheduler::{every, schedule_after, TaskHandle};
pub use state::{transition, ConnectionEvent, ConnectionState, InvalidTransition};

/// Timestamp type used in status reports.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
