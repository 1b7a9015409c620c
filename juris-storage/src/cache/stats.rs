use serde::{Deserialize, Serialize};

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses, including expired reads.
    pub misses: u64,
    /// Number of entries removed to respect the bounds.
    pub evictions: u64,
    /// Number of entries removed because their TTL elapsed.
    pub expirations: u64,
    /// Number of `set` calls refused because the value exceeds the whole budget.
    pub rejections: u64,
    /// Number of entries currently in cache.
    pub entry_count: usize,
    /// Summed size estimate of all entries.
    pub memory_bytes: usize,
    pub max_entries: usize,
    pub max_memory_bytes: usize,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn memory_usage_mb(&self) -> f64 {
        self.memory_bytes as f64 / (1024.0 * 1024.0)
    }
}
