//! Error types for JURIS operations

use thiserror::Error;

/// Data-store connection lifecycle errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("No connection URI has been provided")]
    MissingUri,

    #[error("Connect to {uri} failed: {reason}")]
    ConnectFailed { uri: String, reason: String },

    #[error("Connect timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Health-check ping failed: {reason}")]
    PingFailed { reason: String },

    #[error("Disconnect failed: {reason}")]
    DisconnectFailed { reason: String },

    #[error("Gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Connection manager has been shut down")]
    ShutDown,
}

/// Keyed lock errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("Timed out after {timeout_ms}ms waiting for lock on {key}")]
    Timeout { key: String, timeout_ms: u64 },

    #[error("Invalid lock key: {reason}")]
    InvalidKey { reason: String },

    #[error("Lock manager closed while waiting for {key}")]
    Closed { key: String },
}

/// Cache errors. Never fatal to the caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Entry {key} of {size_bytes} bytes exceeds the cache budget of {budget_bytes} bytes")]
    EntryTooLarge {
        key: String,
        size_bytes: usize,
        budget_bytes: usize,
    },

    #[error("Cache lock poisoned")]
    LockPoisoned,
}

/// Persistent store errors surfaced by the chat store seam.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Document not found: {id}")]
    NotFound { id: String },

    #[error("Read failed for {id}: {reason}")]
    ReadFailed { id: String, reason: String },

    #[error("Write failed for {id}: {reason}")]
    WriteFailed { id: String, reason: String },

    #[error("Serialization failed: {reason}")]
    Serialization { reason: String },
}

/// External completion service errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LlmError {
    #[error("No completion provider configured")]
    ProviderNotConfigured,

    #[error("Request to {provider} failed with status {status}: {message}")]
    RequestFailed {
        provider: String,
        status: i32,
        message: String,
    },

    #[error("Rate limited by {provider}, retry after {retry_after_ms}ms")]
    RateLimited {
        provider: String,
        retry_after_ms: i64,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Attempt {attempt} timed out after {timeout_ms}ms")]
    AttemptTimeout { attempt: u32, timeout_ms: u64 },

    #[error("Gave up after {attempts} attempts: {last_error}")]
    RetryExhausted {
        attempts: u32,
        last_error: Box<JurisError>,
    },

    #[error("{service} is unavailable, next probe in {retry_after_ms}ms")]
    ServiceUnavailable { service: String, retry_after_ms: u64 },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible options: {option_a} and {option_b}")]
    IncompatibleOptions { option_a: String, option_b: String },
}

/// Master error type for all JURIS errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JurisError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for JURIS operations.
pub type JurisResult<T> = Result<T, JurisError>;

// =============================================================================
// TESTS
// =============================================================================
