//! Shared utilities for the cache storage workspace
//!
//! Small, dependency-light helpers used by the engine crate: durable file
//! replacement for the per-origin index and tracing subscriber setup.

pub mod atomic_file;
pub mod tracing;

pub use atomic_file::*;
