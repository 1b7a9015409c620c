//! Fuzz test for the bounded TTL cache
//!
//! Interprets the input as a sequence of cache operations and checks the
//! entry-count and memory bounds after every one.
//!
//! Run with: cargo +nightly fuzz run cache_ops_fuzz -- -max_total_time=60

#![no_main]

use juris_core::CacheConfig;
use juris_storage::cache::{BoundedTtlCache, EntryOptions};
use libfuzzer_sys::fuzz_target;
use std::time::Duration;

const MAX_ENTRIES: usize = 8;
const MAX_MEMORY_BYTES: usize = 512;

fuzz_target!(|data: &[u8]| {
    let cache: BoundedTtlCache<String> = BoundedTtlCache::new(CacheConfig {
        max_entries: MAX_ENTRIES,
        default_ttl: Duration::from_secs(60),
        max_memory_bytes: MAX_MEMORY_BYTES,
    });

    for op in data.chunks(3) {
        let [kind, key, len] = match *op {
            [a, b, c] => [a, b, c],
            _ => break,
        };
        let key = format!("k{}", key % 16);

        match kind % 5 {
            0 => {
                let _ = cache.set(key, "x".repeat(len as usize));
            }
            1 => {
                let _ = cache.set_with(key, "y".repeat(len as usize), EntryOptions::priority());
            }
            2 => {
                let _ = cache.get(&key);
            }
            3 => {
                cache.delete(&key);
            }
            _ => {
                cache.invalidate_prefix(&format!("k{}", key.len() % 2));
            }
        }

        let stats = cache.stats();
        assert!(stats.entry_count <= MAX_ENTRIES, "entry bound violated");
        assert!(stats.memory_bytes <= MAX_MEMORY_BYTES, "memory bound violated");
        assert_eq!(stats.entry_count, cache.len());
    }
});
