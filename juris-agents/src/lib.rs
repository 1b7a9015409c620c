//! JURIS Agents - coordination between concurrent chat writers
//!
//! Every chat request for a user performs a read-modify-write on that
//! user's document. [`KeyedLockManager`] serializes those cycles per key:
//!
//! - `acquire_lock` / `release_lock`: explicit FIFO grants guarded by a token
//! - `lock`: RAII guard released on drop
//! - `with_lock`: scoped critical section
//! - `sweep_stale` / `spawn_sweeper`: reclaim holds abandoned by crashed writers
//!
//! Locks live in process memory. Replicas of the service do not see each
//! other's locks; running more than one replica against the same store
//! needs a store-level lock instead.

mod lock;
mod metrics;

pub use lock::{KeyedLockManager, LockEntry, LockGuard, LockToken};
pub use metrics::{LockMetrics, LockMetricsSnapshot};
