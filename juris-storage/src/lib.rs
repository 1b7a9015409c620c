//! JURIS Storage - caching and the shared data-store connection
//!
//! - `cache`: the bounded TTL cache used by the chat read path
//! - `connection`: the store driver seam and the connection lifecycle manager
//! - `documents`: chat documents and the `ChatStore` persistence seam

pub mod cache;
pub mod connection;
pub mod documents;

pub use cache::{BoundedTtlCache, CacheStats, EntryOptions};
pub use connection::{
    ConnectionManager, ConnectionStatus, DriverEvent, LifecycleEvent, ReconnectAttempt,
    StoreDriver,
};
pub use documents::{ChatDocument, ChatMessage, ChatStore, Sender};
