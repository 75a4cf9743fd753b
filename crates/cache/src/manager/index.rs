//! Persisted per-origin index of cache names and their storage directories
use cachestorage_core::{Error, Result, INDEX_VERSION};
use serde::{Deserialize, Serialize};

/// One cache in the index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub name: String,
    /// Directory under the origin root; `None` in legacy records, whose data
    /// lives in a directory named after the hash of the cache name
    pub storage_dir: Option<String>,
}

impl IndexEntry {
    pub fn new(name: impl Into<String>, storage_dir: Option<String>) -> Self {
        Self {
            name: name.into(),
            storage_dir,
        }
    }
}

/// The whole index record, in cache creation order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub version: u32,
    pub origin: String,
    pub caches: Vec<IndexEntry>,
}

impl IndexRecord {
    pub fn new(origin: impl Into<String>, caches: Vec<IndexEntry>) -> Self {
        Self {
            version: INDEX_VERSION,
            origin: origin.into(),
            caches,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::encode("cache index", e))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let record: Self =
            bincode::deserialize(bytes).map_err(|e| Error::decode("cache index", e))?;
        if record.version != INDEX_VERSION {
            return Err(Error::storage(
                "decode cache index",
                format!("unsupported index version {}", record.version),
            ));
        }
        Ok(record)
    }

    pub fn needs_migration(&self) -> bool {
        self.caches.iter().any(|cache| cache.storage_dir.is_none())
    }
}
