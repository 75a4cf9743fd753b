//! Entry-store abstraction backing a single cache
//!
//! An entry store is an opaque key → entry map. Each entry holds a fixed
//! number of byte streams addressed by index (metadata, body, side data)
//! with offset reads and writes. Dooming an entry makes it invisible to
//! lookups immediately; reclaiming its storage is the store's business.

mod disk;
mod memory;

pub use disk::{DiskEntry, DiskEntryStore};
pub use memory::{MemoryEntry, MemoryEntryStore};

use async_trait::async_trait;
use bytes::Bytes;
use cachestorage_core::{Error, Result, ENTRY_STREAM_COUNT};
use std::path::PathBuf;
use std::sync::Arc;

/// One live entry inside an entry store
#[async_trait]
pub trait Entry: Send + Sync {
    /// The key the entry was created under
    fn key(&self) -> &str;

    /// Read up to `len` bytes of stream `index` starting at `offset`
    async fn read_data(&self, index: usize, offset: u64, len: usize) -> Result<Bytes>;

    /// Write `data` at `offset`; with `truncate` the stream ends after it
    async fn write_data(&self, index: usize, offset: u64, data: &[u8], truncate: bool)
        -> Result<usize>;

    /// Current length of stream `index`
    async fn data_size(&self, index: usize) -> Result<u64>;
}

/// Cursor over the entries of a store
#[async_trait]
pub trait EntryIterator: Send {
    /// Next entry, or `None` once the store is exhausted
    async fn next_entry(&mut self) -> Result<Option<Arc<dyn Entry>>>;
}

/// Key → entry storage engine
#[async_trait]
pub trait EntryStore: Send + Sync {
    async fn open_entry(&self, key: &str) -> Result<Option<Arc<dyn Entry>>>;

    /// Create a fresh entry; fails with `Exists` if `key` is live
    async fn create_entry(&self, key: &str) -> Result<Arc<dyn Entry>>;

    /// Doom the entry for `key`, reporting whether one existed
    async fn doom_entry(&self, key: &str) -> Result<bool>;

    async fn calculate_size_of_all_entries(&self) -> Result<u64>;

    async fn iterate(&self) -> Result<Box<dyn EntryIterator>>;
}

/// Where a cache's entry store lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    Memory,
    Disk(PathBuf),
}

/// Open or create the entry store at `location`
pub async fn create_entry_store(location: &StoreLocation) -> Result<Arc<dyn EntryStore>> {
    match location {
        StoreLocation::Memory => Ok(Arc::new(MemoryEntryStore::new())),
        StoreLocation::Disk(path) => Ok(Arc::new(DiskEntryStore::open(path.clone()).await?)),
    }
}

/// Read an entire stream of `entry`
pub async fn read_stream(entry: &dyn Entry, index: usize) -> Result<Bytes> {
    let size = entry.data_size(index).await?;
    let len = usize::try_from(size)
        .map_err(|_| Error::storage("read entry stream", format!("stream of {size} bytes")))?;
    entry.read_data(index, 0, len).await
}

/// Snapshot iterator over a pre-collected entry list
pub(crate) struct SnapshotIterator {
    entries: std::vec::IntoIter<Arc<dyn Entry>>,
}

impl SnapshotIterator {
    pub(crate) fn new(entries: Vec<Arc<dyn Entry>>) -> Self {
        Self {
            entries: entries.into_iter(),
        }
    }
}

#[async_trait]
impl EntryIterator for SnapshotIterator {
    async fn next_entry(&mut self) -> Result<Option<Arc<dyn Entry>>> {
        Ok(self.entries.next())
    }
}

fn check_stream_index(index: usize) -> Result<()> {
    if index >= ENTRY_STREAM_COUNT {
        return Err(Error::invalid_argument(
            "entry stream",
            format!("index {index} out of range (entries have {ENTRY_STREAM_COUNT} streams)"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachestorage_core::{ErrorKind, INDEX_HEADERS, INDEX_RESPONSE_BODY};
    use tempfile::TempDir;

    async fn exercise_store(store: Arc<dyn EntryStore>) {
        let entry = store.create_entry("https://example.com/a").await.unwrap();
        assert_eq!(entry.key(), "https://example.com/a");

        let err = store
            .create_entry("https://example.com/a")
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Exists);

        entry
            .write_data(INDEX_HEADERS, 0, b"meta", true)
            .await
            .unwrap();
        entry
            .write_data(INDEX_RESPONSE_BODY, 0, b"hello world", true)
            .await
            .unwrap();
        // overwrite a middle range without truncating
        entry
            .write_data(INDEX_RESPONSE_BODY, 6, b"rusty", false)
            .await
            .unwrap();
        assert_eq!(
            read_stream(entry.as_ref(), INDEX_RESPONSE_BODY).await.unwrap(),
            Bytes::from_static(b"hello rusty")
        );
        // truncate shortens the stream
        entry
            .write_data(INDEX_RESPONSE_BODY, 0, b"bye", true)
            .await
            .unwrap();
        assert_eq!(entry.data_size(INDEX_RESPONSE_BODY).await.unwrap(), 3);
        assert_eq!(
            entry.read_data(INDEX_RESPONSE_BODY, 1, 10).await.unwrap(),
            Bytes::from_static(b"ye")
        );

        let reopened = store
            .open_entry("https://example.com/a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            read_stream(reopened.as_ref(), INDEX_HEADERS).await.unwrap(),
            Bytes::from_static(b"meta")
        );

        store.create_entry("https://example.com/b").await.unwrap();
        let mut keys = Vec::new();
        let mut iter = store.iterate().await.unwrap();
        while let Some(entry) = iter.next_entry().await.unwrap() {
            keys.push(entry.key().to_string());
        }
        keys.sort();
        assert_eq!(keys, vec!["https://example.com/a", "https://example.com/b"]);

        assert!(store.calculate_size_of_all_entries().await.unwrap() >= 7);

        assert!(store.doom_entry("https://example.com/a").await.unwrap());
        assert!(!store.doom_entry("https://example.com/a").await.unwrap());
        assert!(store
            .open_entry("https://example.com/a")
            .await
            .unwrap()
            .is_none());

        let err = entry.read_data(7, 0, 1).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_memory_store_contract() {
        let store = create_entry_store(&StoreLocation::Memory).await.unwrap();
        exercise_store(store).await;
    }

    #[tokio::test]
    async fn test_disk_store_contract() {
        let temp_dir = TempDir::new().unwrap();
        let location = StoreLocation::Disk(temp_dir.path().join("cache"));
        let store = create_entry_store(&location).await.unwrap();
        exercise_store(store).await;
    }

    #[tokio::test]
    async fn test_disk_store_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let location = StoreLocation::Disk(temp_dir.path().join("cache"));

        let store = create_entry_store(&location).await.unwrap();
        let entry = store.create_entry("https://example.com/p").await.unwrap();
        entry
            .write_data(INDEX_RESPONSE_BODY, 0, b"persisted", true)
            .await
            .unwrap();
        drop(entry);
        drop(store);

        let store = create_entry_store(&location).await.unwrap();
        let entry = store
            .open_entry("https://example.com/p")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            read_stream(entry.as_ref(), INDEX_RESPONSE_BODY)
                .await
                .unwrap(),
            Bytes::from_static(b"persisted")
        );
    }
}
