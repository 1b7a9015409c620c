//! In-process cache bounded by entry count and estimated memory.

use super::stats::CacheStats;
use juris_core::constants::CACHE_SIZE_FALLBACK_BYTES;
use juris_core::{CacheConfig, CacheError};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

// ============================================================================
// ENTRY
// ============================================================================

/// Per-entry overrides for [`BoundedTtlCache::set_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryOptions {
    /// Overrides the configured default TTL.
    pub ttl: Option<Duration>,
    /// Priority entries are evicted only once no ordinary entry is left.
    pub priority: bool,
}

impl EntryOptions {
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            priority: false,
        }
    }

    pub fn priority() -> Self {
        Self {
            ttl: None,
            priority: true,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
    size_bytes: usize,
    priority: bool,
    /// Recency stamp; key into the matching recency order.
    tick: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Estimated in-memory footprint of `value`: serialized JSON length × 2,
/// or a fixed fallback when the value cannot be serialized.
pub fn estimate_size<V: Serialize + ?Sized>(value: &V) -> usize {
    serde_json::to_vec(value)
        .map(|bytes| bytes.len() * 2)
        .unwrap_or(CACHE_SIZE_FALLBACK_BYTES)
}

// ============================================================================
// STATE
// ============================================================================

#[derive(Debug)]
struct CacheState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    /// Least recently used first.
    ordinary: BTreeMap<u64, String>,
    priority: BTreeMap<u64, String>,
    next_tick: u64,
    memory_bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
    rejections: u64,
}

impl<V> CacheState<V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            ordinary: BTreeMap::new(),
            priority: BTreeMap::new(),
            next_tick: 0,
            memory_bytes: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
            expirations: 0,
            rejections: 0,
        }
    }

    fn order_mut(&mut self, priority: bool) -> &mut BTreeMap<u64, String> {
        if priority {
            &mut self.priority
        } else {
            &mut self.ordinary
        }
    }

    fn bump_tick(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }

    /// Mark `key` most recently used.
    fn touch(&mut self, key: &str) {
        let tick = self.bump_tick();
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        let (old_tick, priority) = (entry.tick, entry.priority);
        entry.tick = tick;
        let order = self.order_mut(priority);
        if let Some(k) = order.remove(&old_tick) {
            order.insert(tick, k);
        }
    }

    fn insert(
        &mut self,
        key: String,
        value: V,
        expires_at: Instant,
        size_bytes: usize,
        priority: bool,
    ) {
        let tick = self.bump_tick();
        self.order_mut(priority).insert(tick, key.clone());
        self.memory_bytes += size_bytes;
        self.entries.insert(
            key,
            CacheEntry {
                value,
                expires_at,
                size_bytes,
                priority,
                tick,
            },
        );
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.order_mut(entry.priority).remove(&entry.tick);
        self.memory_bytes -= entry.size_bytes;
        Some(entry)
    }

    /// Evict the least recently used entry, ordinary entries first.
    /// `spare` is never chosen.
    fn evict_lru(&mut self, spare: Option<&str>) -> Option<String> {
        let pick = |order: &BTreeMap<u64, String>| {
            order
                .values()
                .find(|k| Some(k.as_str()) != spare)
                .cloned()
        };
        let victim = pick(&self.ordinary).or_else(|| pick(&self.priority))?;
        self.remove(&victim)?;
        self.evictions += 1;
        Some(victim)
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        self.expirations += expired.len() as u64;
        expired.len()
    }
}

// ============================================================================
// CACHE
// ============================================================================

/// LRU cache with per-entry TTL, bounded by entry count and by the summed
/// size estimate of its values.
///
/// After every `set`, `len() <= max_entries` and
/// `memory_bytes <= max_memory_bytes`. A value whose own estimate exceeds the
/// memory budget is refused instead of emptying the cache for it.
///
/// Internal faults never surface as failures of the read path: a poisoned
/// lock is logged and the read is a miss.
pub struct BoundedTtlCache<V> {
    config: CacheConfig,
    state: Mutex<CacheState<V>>,
}

impl<V> BoundedTtlCache<V>
where
    V: Serialize + Clone,
{
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState::new()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn lock(&self) -> Result<MutexGuard<'_, CacheState<V>>, CacheError> {
        self.state.lock().map_err(|_| {
            tracing::error!("Cache state lock poisoned");
            CacheError::LockPoisoned
        })
    }

    /// Unexpired value for `key`, marking it most recently used.
    /// Expired entries are removed on the way.
    pub fn get(&self, key: &str) -> Option<V> {
        let Ok(mut state) = self.lock() else {
            return None;
        };
        let now = Instant::now();

        let Some(expired) = state.entries.get(key).map(|e| e.is_expired(now)) else {
            state.misses += 1;
            return None;
        };

        if expired {
            state.remove(key);
            state.expirations += 1;
            state.misses += 1;
            tracing::trace!(key, "Cache entry expired");
            return None;
        }

        state.hits += 1;
        state.touch(key);
        state.entries.get(key).map(|e| e.value.clone())
    }

    /// Whether `key` holds an unexpired value. Does not affect recency or stats.
    pub fn contains_key(&self, key: &str) -> bool {
        let Ok(state) = self.lock() else {
            return false;
        };
        let now = Instant::now();
        state
            .entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    /// Store `value` under `key` with the default TTL.
    pub fn set(&self, key: impl Into<String>, value: V) -> Result<(), CacheError> {
        self.set_with(key, value, EntryOptions::default())
    }

    /// Store `value` under `key`, evicting least recently used entries until
    /// both bounds hold.
    pub fn set_with(
        &self,
        key: impl Into<String>,
        value: V,
        options: EntryOptions,
    ) -> Result<(), CacheError> {
        let key = key.into();
        let size_bytes = estimate_size(&value);
        let mut state = self.lock()?;

        // Replacing: the old value must not be served after this call.
        state.remove(&key);

        if size_bytes > self.config.max_memory_bytes {
            state.rejections += 1;
            tracing::warn!(
                key = %key,
                size_bytes,
                budget_bytes = self.config.max_memory_bytes,
                "Refusing cache entry larger than the memory budget"
            );
            return Err(CacheError::EntryTooLarge {
                key,
                size_bytes,
                budget_bytes: self.config.max_memory_bytes,
            });
        }

        while state.memory_bytes + size_bytes > self.config.max_memory_bytes {
            if state.evict_lru(None).is_none() {
                break;
            }
        }

        let ttl = options.ttl.unwrap_or(self.config.default_ttl);
        let expires_at = Instant::now() + ttl;
        state.insert(key.clone(), value, expires_at, size_bytes, options.priority);

        while state.entries.len() > self.config.max_entries {
            if state.evict_lru(Some(key.as_str())).is_none() {
                break;
            }
        }

        Ok(())
    }

    /// Remove `key`. Returns whether an entry was present.
    pub fn delete(&self, key: &str) -> bool {
        match self.lock() {
            Ok(mut state) => state.remove(key).is_some(),
            Err(_) => false,
        }
    }

    /// Remove every key starting with `prefix`. Returns the number removed.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let Ok(mut state) = self.lock() else {
            return 0;
        };
        let keys: Vec<String> = state
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        for key in &keys {
            state.remove(key);
        }
        if !keys.is_empty() {
            tracing::debug!(prefix, removed = keys.len(), "Invalidated cache prefix");
        }
        keys.len()
    }

    /// Drop every entry. Counters are kept.
    pub fn clear(&self) {
        if let Ok(mut state) = self.lock() {
            state.entries.clear();
            state.ordinary.clear();
            state.priority.clear();
            state.memory_bytes = 0;
        }
    }

    /// Remove all expired entries. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        match self.lock() {
            Ok(mut state) => state.purge_expired(Instant::now()),
            Err(_) => 0,
        }
    }

    /// Entry count, including entries that expired but were not yet purged.
    pub fn len(&self) -> usize {
        self.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            max_entries: self.config.max_entries,
            max_memory_bytes: self.config.max_memory_bytes,
            ..CacheStats::default()
        };
        if let Ok(state) = self.lock() {
            stats.hits = state.hits;
            stats.misses = state.misses;
            stats.evictions = state.evictions;
            stats.expirations = state.expirations;
            stats.rejections = state.rejections;
            stats.entry_count = state.entries.len();
            stats.memory_bytes = state.memory_bytes;
        }
        stats
    }
}

impl<V> std::fmt::Debug for BoundedTtlCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("BoundedTtlCache");
        s.field("max_entries", &self.config.max_entries)
            .field("max_memory_bytes", &self.config.max_memory_bytes);
        if let Ok(state) = self.state.lock() {
            s.field("entries", &state.entries.len())
                .field("memory_bytes", &state.memory_bytes);
        }
        s.finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Op {
        Set(u8, usize, bool),
        Get(u8),
        Delete(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..16, 0usize..40, any::<bool>()).prop_map(|(k, n, p)| Op::Set(k, n, p)),
            (0u8..16).prop_map(Op::Get),
            (0u8..16).prop_map(Op::Delete),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Entry count and summed size never exceed their bounds, whatever
        /// sequence of operations is applied.
        #[test]
        fn prop_bounds_hold_after_every_operation(
            max_entries in 1usize..8,
            max_memory in 16usize..200,
            ops in prop::collection::vec(op(), 1..60),
        ) {
            let cache: BoundedTtlCache<String> = BoundedTtlCache::new(
                CacheConfig::default()
                    .with_max_entries(max_entries)
                    .with_max_memory_bytes(max_memory),
            );

            for op in ops {
                match op {
                    Op::Set(k, n, priority) => {
                        let options = EntryOptions { ttl: None, priority };
                        let _ = cache.set_with(format!("k{k}"), "x".repeat(n), options);
                    }
                    Op::Get(k) => {
                        cache.get(&format!("k{k}"));
                    }
                    Op::Delete(k) => {
                        cache.delete(&format!("k{k}"));
                    }
                }
                let stats = cache.stats();
                prop_assert!(stats.entry_count <= max_entries);
                prop_assert!(stats.memory_bytes <= max_memory);
            }
        }

        /// The most recently written key is always readable right after a
        /// successful `set`.
        #[test]
        fn prop_latest_set_is_readable(
            keys in prop::collection::vec(0u8..10, 1..30),
        ) {
            let cache: BoundedTtlCache<u8> = BoundedTtlCache::new(
                CacheConfig::default().with_max_entries(3),
            );
            for k in keys {
                cache.set(format!("k{k}"), k).unwrap();
                prop_assert_eq!(cache.get(&format!("k{k}")), Some(k));
            }
        }
    }
}
