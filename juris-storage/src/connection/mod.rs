//! Shared data-store connection lifecycle.
//!
//! [`ConnectionManager`] drives a pluggable [`StoreDriver`] through the
//! state machine in `juris_core::state`, publishing every transition on a
//! watch channel and every lifecycle event on a broadcast channel.

mod driver;
mod manager;
mod status;

pub use driver::{redact_uri, DriverEvent, StoreDriver};
pub use manager::ConnectionManager;
pub use status::{ConnectionStatus, LifecycleEvent, ReconnectAttempt};
