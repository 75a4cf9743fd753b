//! Core error type definitions

use std::fmt;
use std::path::PathBuf;

/// Result type alias for cache storage operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse outcome categories reported across the engine boundary.
///
/// Every [`Error`] maps onto exactly one kind; callers outside the engine
/// translate kinds into user-facing rejection reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No cache entry matched an exact-match query
    NotFound,
    /// Entry creation collided with a live entry
    Exists,
    /// The entry store or blob layer failed, or the cache is closed
    Storage,
    /// A pre-flight quota check rejected the write
    QuotaExceeded,
    /// The accumulated query result exceeded the configured cap
    QueryTooLarge,
    /// A named cache lookup targeted a name absent from the cache set
    CacheNameNotFound,
    /// The caller violated an operation contract
    InvalidArgument,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::Exists => "exists",
            ErrorKind::Storage => "storage",
            ErrorKind::QuotaExceeded => "quota exceeded",
            ErrorKind::QueryTooLarge => "query too large",
            ErrorKind::CacheNameNotFound => "cache name not found",
            ErrorKind::InvalidArgument => "invalid argument",
        };
        f.write_str(name)
    }
}

/// Core error type for cache storage operations using thiserror
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Nothing matched the request or key
    #[error("no cache entry matched '{target}'")]
    NotFound { target: String },

    /// An entry with this key is already live in the entry store
    #[error("cache entry '{key}' already exists")]
    Exists { key: String },

    /// Entry store or blob layer failure without an underlying I/O error
    #[error("storage failure during {operation}: {message}")]
    Storage {
        operation: &'static str,
        message: String,
    },

    /// File system operations
    #[error("file system {operation} operation failed for '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Binary record encoding/decoding
    #[error("failed to {operation} {record}: {source}")]
    Serialization {
        record: &'static str,
        operation: &'static str,
        #[source]
        source: bincode::Error,
    },

    /// The cache backend is closed or never opened
    #[error("cache '{cache_name}' is closed")]
    Closed { cache_name: String },

    /// Write rejected by the quota check
    #[error("quota exceeded: requested {requested} bytes, {available} bytes available")]
    QuotaExceeded { requested: u64, available: u64 },

    /// A query accumulated more result bytes than allowed
    #[error("query result too large: estimated {estimated} bytes exceeds limit of {limit} bytes")]
    QueryTooLarge { estimated: u64, limit: u64 },

    /// Named cache is not part of the cache set
    #[error("cache '{name}' does not exist")]
    CacheNameNotFound { name: String },

    /// The caller violated an operation contract
    #[error("invalid {operation}: {message}")]
    InvalidArgument {
        operation: &'static str,
        message: String,
    },
}

impl Error {
    /// Map this error onto the engine's outcome taxonomy
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::Exists { .. } => ErrorKind::Exists,
            Error::Storage { .. }
            | Error::Io { .. }
            | Error::Serialization { .. }
            | Error::Closed { .. } => ErrorKind::Storage,
            Error::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            Error::QueryTooLarge { .. } => ErrorKind::QueryTooLarge,
            Error::CacheNameNotFound { .. } => ErrorKind::CacheNameNotFound,
            Error::InvalidArgument { .. } => ErrorKind::InvalidArgument,
        }
    }

    /// True when the error only reports an absent entry
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self.kind(), ErrorKind::NotFound)
    }
}
