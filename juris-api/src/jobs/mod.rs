//! Background jobs for the JURIS service
//!
//! - `maintenance`: purges expired cache entries and logs a status line
//!
//! # Usage
//!
//! ```ignore
//! use juris_api::jobs::{maintenance_task, MaintenanceConfig};
//! use tokio::sync::watch;
//!
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! let job = tokio::spawn(maintenance_task(Arc::clone(&state), MaintenanceConfig::default(), shutdown_rx));
//!
//! // On shutdown
//! let _ = shutdown_tx.send(true);
//! let metrics = job.await?;
//! ```

pub mod maintenance;

pub use maintenance::{maintenance_task, MaintenanceConfig, MaintenanceMetrics, MaintenanceSnapshot};
