use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock activity counters since startup.
#[derive(Debug, Default)]
pub struct LockMetrics {
    /// Grants, immediate or after waiting
    pub acquisitions: AtomicU64,
    /// Acquires that had to queue
    pub contended: AtomicU64,
    pub timeouts: AtomicU64,
    pub releases: AtomicU64,
    /// Releases with a token that no longer holds the key
    pub mismatched_releases: AtomicU64,
    /// Holds reclaimed by the stale-lock sweeper
    pub stale_reclaimed: AtomicU64,
}

impl LockMetrics {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Counter values plus the current table occupancy.
    pub fn snapshot(&self, held_keys: usize, waiting: usize) -> LockMetricsSnapshot {
        LockMetricsSnapshot {
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            contended: self.contended.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            mismatched_releases: self.mismatched_releases.load(Ordering::Relaxed),
            stale_reclaimed: self.stale_reclaimed.load(Ordering::Relaxed),
            held_keys,
            waiting,
        }
    }
}

/// Snapshot of lock metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockMetricsSnapshot {
    pub acquisitions: u64,
    pub contended: u64,
    pub timeouts: u64,
    pub releases: u64,
    pub mismatched_releases: u64,
    pub stale_reclaimed: u64,
    pub held_keys: usize,
    pub waiting: usize,
}
