//! Domain types for the cache engine

pub mod http;
pub mod newtypes;
pub mod operations;

pub use http::{strip_query, Headers, Request, Response, ResponseType};
pub use newtypes::{storage_hash, BlobId, Origin};
pub use operations::{BatchOperation, QueryOptions};
