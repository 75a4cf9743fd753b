//! In-memory entry store
use super::{check_stream_index, Entry, EntryIterator, EntryStore, SnapshotIterator};
use async_trait::async_trait;
use bytes::Bytes;
use cachestorage_core::{Error, Result, ENTRY_STREAM_COUNT};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;

/// Entry whose streams live in process memory
#[derive(Debug)]
pub struct MemoryEntry {
    key: String,
    streams: RwLock<[Vec<u8>; ENTRY_STREAM_COUNT]>,
}

impl MemoryEntry {
    fn new(key: String) -> Self {
        Self {
            key,
            streams: RwLock::new(Default::default()),
        }
    }

    fn total_size(&self) -> u64 {
        self.streams.read().iter().map(|s| s.len() as u64).sum()
    }
}

#[async_trait]
impl Entry for MemoryEntry {
    fn key(&self) -> &str {
        &self.key
    }

    async fn read_data(&self, index: usize, offset: u64, len: usize) -> Result<Bytes> {
        check_stream_index(index)?;
        let streams = self.streams.read();
        let stream = &streams[index];
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(stream.len());
        let end = start.saturating_add(len).min(stream.len());
        Ok(Bytes::copy_from_slice(&stream[start..end]))
    }

    async fn write_data(
        &self,
        index: usize,
        offset: u64,
        data: &[u8],
        truncate: bool,
    ) -> Result<usize> {
        check_stream_index(index)?;
        let start = usize::try_from(offset)
            .map_err(|_| Error::invalid_argument("write entry", "offset out of range"))?;
        let end = start + data.len();

        let mut streams = self.streams.write();
        let stream = &mut streams[index];
        if stream.len() < start {
            stream.resize(start, 0);
        }
        if stream.len() < end {
            stream.resize(end, 0);
        }
        stream[start..end].copy_from_slice(data);
        if truncate {
            stream.truncate(end);
        }
        Ok(data.len())
    }

    async fn data_size(&self, index: usize) -> Result<u64> {
        check_stream_index(index)?;
        Ok(self.streams.read()[index].len() as u64)
    }
}

/// Entry store keeping every entry in a concurrent map
#[derive(Debug, Default)]
pub struct MemoryEntryStore {
    entries: DashMap<String, Arc<MemoryEntry>>,
}

impl MemoryEntryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl EntryStore for MemoryEntryStore {
    async fn open_entry(&self, key: &str) -> Result<Option<Arc<dyn Entry>>> {
        Ok(self
            .entries
            .get(key)
            .map(|entry| Arc::clone(entry.value()) as Arc<dyn Entry>))
    }

    async fn create_entry(&self, key: &str) -> Result<Arc<dyn Entry>> {
        use dashmap::mapref::entry::Entry as MapEntry;

        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(_) => Err(Error::exists(key)),
            MapEntry::Vacant(slot) => {
                let entry = Arc::new(MemoryEntry::new(key.to_string()));
                slot.insert(Arc::clone(&entry));
                Ok(entry)
            }
        }
    }

    async fn doom_entry(&self, key: &str) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn calculate_size_of_all_entries(&self) -> Result<u64> {
        Ok(self
            .entries
            .iter()
            .map(|entry| entry.value().total_size())
            .sum())
    }

    async fn iterate(&self) -> Result<Box<dyn EntryIterator>> {
        let snapshot: Vec<Arc<dyn Entry>> = self
            .entries
            .iter()
            .map(|entry| Arc::clone(entry.value()) as Arc<dyn Entry>)
            .collect();
        Ok(Box::new(SnapshotIterator::new(snapshot)))
    }
}
