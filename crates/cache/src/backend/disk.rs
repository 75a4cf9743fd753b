//! File-backed entry store
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/<hash[..2]>/<hash>.key   exact entry key
//! <root>/<hash[..2]>/<hash>.<n>   stream n
//! <root>/.doomed/<uuid>.<n>       streams of doomed entries still held open
//! ```
//!
//! `hash` is the hex sha256 of the key. A missing stream file reads as
//! empty.

use super::{check_stream_index, Entry, EntryIterator, EntryStore, SnapshotIterator};
use async_trait::async_trait;
use bytes::Bytes;
use cachestorage_core::{storage_hash, Error, Result, ENTRY_STREAM_COUNT};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::io::{ErrorKind as IoErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

const KEY_EXTENSION: &str = "key";
const DOOMED_DIR: &str = ".doomed";

/// Entry whose streams are files on disk
#[derive(Debug)]
pub struct DiskEntry {
    key: String,
    /// Path prefix; stream `n` lives at `<base>.<n>`
    base: RwLock<PathBuf>,
    doomed: AtomicBool,
}

impl DiskEntry {
    fn new(key: String, base: PathBuf) -> Self {
        Self {
            key,
            base: RwLock::new(base),
            doomed: AtomicBool::new(false),
        }
    }

    fn stream_path(&self, index: usize) -> PathBuf {
        with_suffix(&self.base.read(), &index.to_string())
    }
}

impl Drop for DiskEntry {
    fn drop(&mut self) {
        if !self.doomed.load(Ordering::Acquire) {
            return;
        }
        let base = self.base.get_mut().clone();
        for index in 0..ENTRY_STREAM_COUNT {
            let path = with_suffix(&base, &index.to_string());
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != IoErrorKind::NotFound {
                    debug!("Failed to reclaim doomed stream {}: {}", path.display(), e);
                }
            }
        }
    }
}

#[async_trait]
impl Entry for DiskEntry {
    fn key(&self) -> &str {
        &self.key
    }

    async fn read_data(&self, index: usize, offset: u64, len: usize) -> Result<Bytes> {
        check_stream_index(index)?;
        let path = self.stream_path(index);
        let mut file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(Bytes::new()),
            Err(e) => return Err(Error::io(path, "open entry stream", e)),
        };

        let file_len = file
            .metadata()
            .await
            .map_err(|e| Error::io(&path, "stat entry stream", e))?
            .len();
        if offset >= file_len || len == 0 {
            return Ok(Bytes::new());
        }
        let available = usize::try_from(file_len - offset).unwrap_or(usize::MAX);
        let mut buf = vec![0u8; len.min(available)];

        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| Error::io(&path, "seek entry stream", e))?;
        file.read_exact(&mut buf)
            .await
            .map_err(|e| Error::io(&path, "read entry stream", e))?;
        Ok(Bytes::from(buf))
    }

    async fn write_data(
        &self,
        index: usize,
        offset: u64,
        data: &[u8],
        truncate: bool,
    ) -> Result<usize> {
        check_stream_index(index)?;
        let path = self.stream_path(index);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await
            .map_err(|e| Error::io(&path, "open entry stream", e))?;

        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| Error::io(&path, "seek entry stream", e))?;
        file.write_all(data)
            .await
            .map_err(|e| Error::io(&path, "write entry stream", e))?;
        if truncate {
            file.set_len(offset + data.len() as u64)
                .await
                .map_err(|e| Error::io(&path, "truncate entry stream", e))?;
        }
        file.flush()
            .await
            .map_err(|e| Error::io(&path, "flush entry stream", e))?;
        Ok(data.len())
    }

    async fn data_size(&self, index: usize) -> Result<u64> {
        check_stream_index(index)?;
        let path = self.stream_path(index);
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(0),
            Err(e) => Err(Error::io(path, "stat entry stream", e)),
        }
    }
}

/// Entry store rooted at one directory
#[derive(Debug)]
pub struct DiskEntryStore {
    root: PathBuf,
    /// Entries currently held open, so dooming can move their files aside
    live: DashMap<String, Weak<DiskEntry>>,
}

impl DiskEntryStore {
    /// Open the store at `root`, creating the directory if needed
    pub async fn open(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)
            .await
            .map_err(|e| Error::io(&root, "create entry store directory", e))?;

        // Nothing can hold entries from a previous run.
        let doomed = root.join(DOOMED_DIR);
        if let Err(e) = fs::remove_dir_all(&doomed).await {
            if e.kind() != IoErrorKind::NotFound {
                warn!("Failed to clear {}: {}", doomed.display(), e);
            }
        }

        debug!("Opened disk entry store at {}", root.display());
        Ok(Self {
            root,
            live: DashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_base(&self, key: &str) -> PathBuf {
        let hash = storage_hash(key);
        self.root.join(&hash[..2]).join(hash)
    }

    fn key_path(&self, key: &str) -> PathBuf {
        with_suffix(&self.entry_base(key), KEY_EXTENSION)
    }

    /// Hand out the live entry for `key`, or a fresh handle to its files
    fn handle_for(&self, key: &str) -> Arc<DiskEntry> {
        use dashmap::mapref::entry::Entry as MapEntry;

        match self.live.entry(key.to_string()) {
            MapEntry::Occupied(mut slot) => {
                if let Some(entry) = slot.get().upgrade() {
                    return entry;
                }
                let entry = Arc::new(DiskEntry::new(key.to_string(), self.entry_base(key)));
                slot.insert(Arc::downgrade(&entry));
                entry
            }
            MapEntry::Vacant(slot) => {
                let entry = Arc::new(DiskEntry::new(key.to_string(), self.entry_base(key)));
                slot.insert(Arc::downgrade(&entry));
                entry
            }
        }
    }

    async fn read_key_file(path: &Path) -> Result<Option<String>> {
        match fs::read_to_string(path).await {
            Ok(key) => Ok(Some(key)),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(path, "read entry key", e)),
        }
    }

    async fn remove_streams(base: &Path) -> Result<()> {
        for index in 0..ENTRY_STREAM_COUNT {
            let path = with_suffix(base, &index.to_string());
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == IoErrorKind::NotFound => {}
                Err(e) => return Err(Error::io(path, "remove entry stream", e)),
            }
        }
        Ok(())
    }

    /// Move the streams of a still-open entry out of the keyed namespace
    async fn move_aside(&self, entry: &DiskEntry) -> Result<()> {
        let doomed_dir = self.root.join(DOOMED_DIR);
        fs::create_dir_all(&doomed_dir)
            .await
            .map_err(|e| Error::io(&doomed_dir, "create doomed directory", e))?;

        let old_base = entry.base.read().clone();
        let new_base = doomed_dir.join(Uuid::new_v4().to_string());
        for index in 0..ENTRY_STREAM_COUNT {
            let from = with_suffix(&old_base, &index.to_string());
            let to = with_suffix(&new_base, &index.to_string());
            match fs::rename(&from, &to).await {
                Ok(()) => {}
                Err(e) if e.kind() == IoErrorKind::NotFound => {}
                Err(e) => return Err(Error::io(from, "move doomed stream", e)),
            }
        }
        *entry.base.write() = new_base;
        entry.doomed.store(true, Ordering::Release);
        Ok(())
    }
}

#[async_trait]
impl EntryStore for DiskEntryStore {
    async fn open_entry(&self, key: &str) -> Result<Option<Arc<dyn Entry>>> {
        let key_path = self.key_path(key);
        match Self::read_key_file(&key_path).await? {
            Some(stored) if stored == key => Ok(Some(self.handle_for(key) as Arc<dyn Entry>)),
            Some(_) => {
                warn!("Hash collision on {}", key_path.display());
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn create_entry(&self, key: &str) -> Result<Arc<dyn Entry>> {
        let key_path = self.key_path(key);
        if let Some(parent) = key_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io(parent, "create entry shard", e))?;
        }

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&key_path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == IoErrorKind::AlreadyExists => return Err(Error::exists(key)),
            Err(e) => return Err(Error::io(key_path, "create entry key", e)),
        };

        // Leftover streams from an entry removed behind our back
        Self::remove_streams(&self.entry_base(key)).await?;

        file.write_all(key.as_bytes())
            .await
            .map_err(|e| Error::io(&key_path, "write entry key", e))?;
        file.flush()
            .await
            .map_err(|e| Error::io(&key_path, "flush entry key", e))?;

        Ok(self.handle_for(key))
    }

    async fn doom_entry(&self, key: &str) -> Result<bool> {
        let key_path = self.key_path(key);
        match Self::read_key_file(&key_path).await? {
            Some(stored) if stored == key => {}
            _ => return Ok(false),
        }

        fs::remove_file(&key_path)
            .await
            .map_err(|e| Error::io(&key_path, "remove entry key", e))?;

        let live = self.live.remove(key).and_then(|(_, weak)| weak.upgrade());
        match live {
            Some(entry) => self.move_aside(&entry).await?,
            None => Self::remove_streams(&self.entry_base(key)).await?,
        }
        debug!("Doomed disk entry {}", key);
        Ok(true)
    }

    async fn calculate_size_of_all_entries(&self) -> Result<u64> {
        let mut total = 0u64;
        for shard in list_dir(&self.root).await? {
            if shard.file_name().and_then(|n| n.to_str()) == Some(DOOMED_DIR) {
                continue;
            }
            if !fs::metadata(&shard).await.map(|m| m.is_dir()).unwrap_or(false) {
                continue;
            }
            for file in list_dir(&shard).await? {
                match fs::metadata(&file).await {
                    Ok(meta) if meta.is_file() => total += meta.len(),
                    Ok(_) => {}
                    Err(e) if e.kind() == IoErrorKind::NotFound => {}
                    Err(e) => return Err(Error::io(file, "stat entry file", e)),
                }
            }
        }
        Ok(total)
    }

    async fn iterate(&self) -> Result<Box<dyn EntryIterator>> {
        let mut entries: Vec<Arc<dyn Entry>> = Vec::new();
        for shard in list_dir(&self.root).await? {
            if shard.file_name().and_then(|n| n.to_str()) == Some(DOOMED_DIR) {
                continue;
            }
            if !fs::metadata(&shard).await.map(|m| m.is_dir()).unwrap_or(false) {
                continue;
            }
            for file in list_dir(&shard).await? {
                if file.extension().and_then(|e| e.to_str()) != Some(KEY_EXTENSION) {
                    continue;
                }
                if let Some(key) = Self::read_key_file(&file).await? {
                    entries.push(self.handle_for(&key));
                }
            }
        }
        Ok(Box::new(SnapshotIterator::new(entries)))
    }
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut path = base.as_os_str().to_owned();
    path.push(".");
    path.push(suffix);
    PathBuf::from(path)
}

async fn list_dir(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut read_dir = match fs::read_dir(dir).await {
        Ok(read_dir) => read_dir,
        Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::io(dir, "list directory", e)),
    };
    let mut paths = Vec::new();
    while let Some(item) = read_dir
        .next_entry()
        .await
        .map_err(|e| Error::io(dir, "list directory", e))?
    {
        paths.push(item.path());
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::read_stream;
    use cachestorage_core::INDEX_RESPONSE_BODY;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_entry_survives_doom() {
        let temp_dir = TempDir::new().unwrap();
        let store = DiskEntryStore::open(temp_dir.path().to_path_buf())
            .await
            .unwrap();

        let entry = store.create_entry("https://example.com/a").await.unwrap();
        entry
            .write_data(INDEX_RESPONSE_BODY, 0, b"old body", true)
            .await
            .unwrap();

        assert!(store.doom_entry("https://example.com/a").await.unwrap());
        let replacement = store.create_entry("https://example.com/a").await.unwrap();
        replacement
            .write_data(INDEX_RESPONSE_BODY, 0, b"new", true)
            .await
            .unwrap();

        assert_eq!(
            read_stream(entry.as_ref(), INDEX_RESPONSE_BODY).await.unwrap(),
            Bytes::from_static(b"old body")
        );
        assert_eq!(
            read_stream(replacement.as_ref(), INDEX_RESPONSE_BODY)
                .await
                .unwrap(),
            Bytes::from_static(b"new")
        );

        drop(entry);
        let doomed_files = list_dir(&temp_dir.path().join(DOOMED_DIR)).await.unwrap();
        assert!(doomed_files.is_empty());
    }

    #[tokio::test]
    async fn test_size_excludes_doomed_entries() {
        let temp_dir = TempDir::new().unwrap();
        let store = DiskEntryStore::open(temp_dir.path().to_path_buf())
            .await
            .unwrap();

        let entry = store.create_entry("k").await.unwrap();
        entry
            .write_data(INDEX_RESPONSE_BODY, 0, &[7u8; 100], true)
            .await
            .unwrap();
        // 1 byte key file plus 100 bytes of body
        assert_eq!(store.calculate_size_of_all_entries().await.unwrap(), 101);

        store.doom_entry("k").await.unwrap();
        assert_eq!(store.calculate_size_of_all_entries().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_missing_stream_reads_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = DiskEntryStore::open(temp_dir.path().to_path_buf())
            .await
            .unwrap();
        let entry = store.create_entry("k").await.unwrap();
        assert_eq!(entry.data_size(2).await.unwrap(), 0);
        assert!(entry.read_data(2, 0, 10).await.unwrap().is_empty());
    }
}
