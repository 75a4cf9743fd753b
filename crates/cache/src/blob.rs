//! Response body blobs
//!
//! Bodies enter the engine as registered blobs and leave it as handles that
//! read lazily from an entry's body or side-data stream. A handle keeps its
//! entry alive, so it stays readable after the entry is doomed. Handles are
//! only registered on request, and a registered blob lives until released.

use crate::backend::Entry;
use bytes::Bytes;
use cachestorage_core::{BlobId, Error, Result};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
enum BlobSource {
    Bytes(Bytes),
    Entry { entry: Arc<dyn Entry>, index: usize },
}

/// Readable view of a body or side-data stream
#[derive(Clone)]
pub struct BlobHandle {
    id: BlobId,
    source: BlobSource,
    size: u64,
}

impl BlobHandle {
    /// Unregistered handle over stream `index` of `entry`, sized as of now
    pub async fn from_entry(entry: Arc<dyn Entry>, index: usize) -> Result<Self> {
        let size = entry.data_size(index).await?;
        Ok(Self {
            id: BlobId::new(),
            source: BlobSource::Entry { entry, index },
            size,
        })
    }

    pub fn id(&self) -> BlobId {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Read up to `len` bytes starting at `offset`
    pub async fn read(&self, offset: u64, len: usize) -> Result<Bytes> {
        if offset >= self.size {
            return Ok(Bytes::new());
        }
        let remaining = usize::try_from(self.size - offset).unwrap_or(usize::MAX);
        let len = len.min(remaining);
        match &self.source {
            BlobSource::Bytes(bytes) => {
                // offset < size == bytes.len(), so it fits in usize
                let start = offset as usize;
                Ok(bytes.slice(start..start + len))
            }
            BlobSource::Entry { entry, index } => entry.read_data(*index, offset, len).await,
        }
    }

    /// Read the whole blob
    pub async fn read_to_end(&self) -> Result<Bytes> {
        let len = usize::try_from(self.size)
            .map_err(|_| Error::storage("read blob", format!("blob of {} bytes", self.size)))?;
        self.read(0, len).await
    }
}

impl std::fmt::Debug for BlobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let source = match &self.source {
            BlobSource::Bytes(_) => "bytes".to_string(),
            BlobSource::Entry { entry, index } => format!("{}#{}", entry.key(), index),
        };
        f.debug_struct("BlobHandle")
            .field("id", &self.id)
            .field("source", &source)
            .field("size", &self.size)
            .finish()
    }
}

/// Registry resolving blob ids to readable handles
#[derive(Debug, Default)]
pub struct BlobStorage {
    blobs: DashMap<BlobId, BlobHandle>,
}

impl BlobStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register in-memory bytes as a blob
    pub fn register_bytes(&self, data: impl Into<Bytes>) -> BlobId {
        let data = data.into();
        let id = BlobId::new();
        let handle = BlobHandle {
            id,
            size: data.len() as u64,
            source: BlobSource::Bytes(data),
        };
        self.blobs.insert(id, handle);
        id
    }

    /// Register an existing handle, e.g. a matched body to be stored again
    pub fn register(&self, handle: &BlobHandle) -> BlobId {
        self.blobs.insert(handle.id, handle.clone());
        handle.id
    }

    /// Register stream `index` of `entry`, capturing its current size
    pub async fn create_from_entry(&self, entry: Arc<dyn Entry>, index: usize) -> Result<BlobId> {
        let handle = BlobHandle::from_entry(entry, index).await?;
        Ok(self.register(&handle))
    }

    pub fn resolve(&self, id: BlobId) -> Option<BlobHandle> {
        self.blobs.get(&id).map(|handle| handle.value().clone())
    }

    /// Forget a blob; outstanding handles stay readable
    pub fn release(&self, id: BlobId) -> bool {
        self.blobs.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

/// Copy `blob` into stream `index` of `entry` in chunks, returning bytes written
pub async fn stream_blob_to_entry(
    blob: &BlobHandle,
    entry: &dyn Entry,
    index: usize,
    chunk_size: usize,
) -> Result<u64> {
    let chunk_size = chunk_size.max(1);
    let mut offset = 0u64;
    while offset < blob.size() {
        let chunk = blob.read(offset, chunk_size).await?;
        if chunk.is_empty() {
            return Err(Error::storage(
                "stream body",
                format!("blob ended at {offset} of {} bytes", blob.size()),
            ));
        }
        let written = entry.write_data(index, offset, &chunk, false).await?;
        if written != chunk.len() {
            return Err(Error::storage(
                "stream body",
                format!("short write of {written}/{} bytes", chunk.len()),
            ));
        }
        offset += chunk.len() as u64;
    }
    debug!("Streamed {} body bytes into {}", offset, entry.key());
    Ok(offset)
}
