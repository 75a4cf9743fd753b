//! Origin-scoped request/response cache storage
//!
//! This crate provides:
//! - Named caches per origin, with a persisted, crash-safe index
//! - Exact, query-insensitive and `Vary`-aware request matching
//! - FIFO serialization of every operation on a cache or cache set
//! - Memory and disk entry stores, blob handles and quota accounting

pub mod backend;
pub mod blob;
pub mod config;
pub mod context;
pub mod manager;
pub mod metadata;
pub mod quota;
pub mod scheduler;
pub mod store;

pub use blob::{BlobHandle, BlobStorage};
pub use config::{BackendKind, CacheStorageConfig, CacheStorageConfigBuilder};
pub use context::{CacheStorageContext, StorageServices};
pub use manager::{CacheHandle, CacheLoader, CacheSetManager, DiskLoader, MemoryLoader};
pub use quota::{FixedQuotaManager, QuotaManager};
pub use scheduler::OperationScheduler;
pub use store::{BackendState, CacheMatch, CacheStore};

pub use cachestorage_core::{
    BatchOperation, BlobId, Error, ErrorKind, Headers, Origin, QueryOptions, Request, Response,
    ResponseType, Result,
};
