//! Builder methods for creating errors with context

use super::types::Error;
use std::path::PathBuf;

impl Error {
    /// Create a not-found error for a URL, key or cache name
    #[must_use]
    pub fn not_found(target: impl Into<String>) -> Self {
        Error::NotFound {
            target: target.into(),
        }
    }

    /// Create an entry collision error
    #[must_use]
    pub fn exists(key: impl Into<String>) -> Self {
        Error::Exists { key: key.into() }
    }

    /// Create a storage failure error
    #[must_use]
    pub fn storage(operation: &'static str, message: impl Into<String>) -> Self {
        Error::Storage {
            operation,
            message: message.into(),
        }
    }

    /// Create a file system error with path context
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, operation: &'static str, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            operation,
            source,
        }
    }

    /// Create an encoding error for a named record type
    #[must_use]
    pub fn encode(record: &'static str, source: bincode::Error) -> Self {
        Error::Serialization {
            record,
            operation: "encode",
            source,
        }
    }

    /// Create a decoding error for a named record type
    #[must_use]
    pub fn decode(record: &'static str, source: bincode::Error) -> Self {
        Error::Serialization {
            record,
            operation: "decode",
            source,
        }
    }

    /// Create a closed-backend error
    #[must_use]
    pub fn closed(cache_name: impl Into<String>) -> Self {
        Error::Closed {
            cache_name: cache_name.into(),
        }
    }

    /// Create a quota rejection
    #[must_use]
    pub fn quota_exceeded(requested: u64, available: u64) -> Self {
        Error::QuotaExceeded {
            requested,
            available,
        }
    }

    /// Create a query-size rejection
    #[must_use]
    pub fn query_too_large(estimated: u64, limit: u64) -> Self {
        Error::QueryTooLarge { estimated, limit }
    }

    /// Create a missing cache name error
    #[must_use]
    pub fn cache_name_not_found(name: impl Into<String>) -> Self {
        Error::CacheNameNotFound { name: name.into() }
    }

    /// Create a contract violation error
    #[must_use]
    pub fn invalid_argument(operation: &'static str, message: impl Into<String>) -> Self {
        Error::InvalidArgument {
            operation,
            message: message.into(),
        }
    }
}
