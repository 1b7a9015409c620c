//! Bounded TTL cache.
//!
//! One in-process cache shared by the chat read path. Entries carry their own
//! expiry and a size estimate; the cache evicts least recently used entries
//! to stay within both an entry-count and a memory budget.
//!
//! # Example
//!
//! ```
//! use juris_core::CacheConfig;
//! use juris_storage::cache::{BoundedTtlCache, EntryOptions};
//! use std::time::Duration;
//!
//! let cache = BoundedTtlCache::new(CacheConfig::default().with_max_entries(2));
//! cache.set("a", "1".to_string()).unwrap();
//! cache.set_with("b", "2".to_string(), EntryOptions::ttl(Duration::from_secs(5))).unwrap();
//! assert_eq!(cache.get("a").as_deref(), Some("1"));
//! ```

mod bounded;
mod stats;

pub use bounded::{estimate_size, BoundedTtlCache, EntryOptions};
pub use stats::CacheStats;
