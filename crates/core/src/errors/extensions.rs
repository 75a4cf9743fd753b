//! Extension traits for error handling

use super::types::{Error, Result};

/// Extension trait for turning foreign failures into storage errors
pub trait ResultExt<T> {
    /// Report any failure as a storage error raised by `operation`
    fn storage_context(self, operation: &'static str) -> Result<T>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn storage_context(self, operation: &'static str) -> Result<T> {
        self.map_err(|e| Error::Storage {
            operation,
            message: e.to_string(),
        })
    }
}
