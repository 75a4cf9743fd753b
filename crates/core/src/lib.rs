//! Core domain types, errors, and constants for the cache storage engine.
//!
//! ## Key Components
//!
//! - **`errors`**: the `Error` enum, its `ErrorKind` taxonomy and the `Result`
//!   alias shared by every crate in the workspace.
//! - **`types`**: origins, requests, responses, headers and the option/batch
//!   descriptors that flow through cache operations.
//! - **`constants`**: stream indices, size caps and on-disk file names.

pub mod constants;
pub mod errors;
pub mod types;

pub use self::{
    constants::*,
    errors::{Error, ErrorKind, Result, ResultExt},
    types::*,
};
