//! Backend-specific cache creation, index persistence and cleanup
use super::index::{IndexEntry, IndexRecord};
use crate::backend::StoreLocation;
use crate::context::StorageServices;
use crate::store::CacheStore;
use async_trait::async_trait;
use cachestorage_core::{storage_hash, Error, Origin, Result, ResultExt, INDEX_FILE_NAME};
use cachestorage_utils::write_atomic;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What a cache set needs from its storage backend
#[async_trait]
pub trait CacheLoader: Send + Sync {
    /// Build the store for `name` bound to `storage_dir`
    fn create_cache(&self, name: &str, storage_dir: Option<&str>) -> CacheStore;

    /// Allocate a storage directory name for a new cache
    async fn prepare_new_cache_destination(&self) -> Result<Option<String>>;

    /// Atomically replace the persisted index
    async fn write_index(&self, caches: &[IndexEntry]) -> Result<()>;

    /// Read the persisted index, migrating and collecting orphans.
    /// An unusable index yields an empty list.
    async fn load_index(&self) -> Result<Vec<IndexEntry>>;

    /// Remove a deleted cache's storage
    async fn cleanup_cache(&self, storage_dir: Option<&str>) -> Result<()>;

    /// A cache was removed from the set; drop any reference held for it
    fn notify_cache_doomed(&self, name: &str);

    /// Remove everything stored for the origin
    async fn remove_origin(&self) -> Result<()>;
}

/// Loader for ephemeral origins
pub struct MemoryLoader {
    origin: Origin,
    services: Arc<StorageServices>,
    /// Keeps memory caches alive for the lifetime of the set
    retained: Mutex<HashMap<String, CacheStore>>,
}

impl MemoryLoader {
    pub fn new(origin: Origin, services: Arc<StorageServices>) -> Self {
        Self {
            origin,
            services,
            retained: Mutex::new(HashMap::new()),
        }
    }

    pub fn retained_count(&self) -> usize {
        self.retained.lock().len()
    }
}

#[async_trait]
impl CacheLoader for MemoryLoader {
    fn create_cache(&self, name: &str, _storage_dir: Option<&str>) -> CacheStore {
        let store = CacheStore::new(
            name,
            self.origin.clone(),
            StoreLocation::Memory,
            Arc::clone(&self.services),
        );
        self.retained.lock().insert(name.to_string(), store.clone());
        store
    }

    async fn prepare_new_cache_destination(&self) -> Result<Option<String>> {
        Ok(None)
    }

    async fn write_index(&self, _caches: &[IndexEntry]) -> Result<()> {
        Ok(())
    }

    async fn load_index(&self) -> Result<Vec<IndexEntry>> {
        Ok(Vec::new())
    }

    async fn cleanup_cache(&self, _storage_dir: Option<&str>) -> Result<()> {
        Ok(())
    }

    fn notify_cache_doomed(&self, name: &str) {
        self.retained.lock().remove(name);
    }

    async fn remove_origin(&self) -> Result<()> {
        self.retained.lock().clear();
        Ok(())
    }
}

/// Loader for persistent origins rooted at `origin_root`
pub struct DiskLoader {
    origin: Origin,
    origin_root: PathBuf,
    services: Arc<StorageServices>,
}

impl DiskLoader {
    pub fn new(origin: Origin, origin_root: PathBuf, services: Arc<StorageServices>) -> Self {
        Self {
            origin,
            origin_root,
            services,
        }
    }

    pub fn origin_root(&self) -> &Path {
        &self.origin_root
    }

    fn index_path(&self) -> PathBuf {
        self.origin_root.join(INDEX_FILE_NAME)
    }

    async fn write_record(&self, record: IndexRecord) -> Result<()> {
        let bytes = record.encode()?;
        let path = self.index_path();
        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
            .await
            .storage_context("write cache index")?
    }

    async fn read_record(&self) -> Result<Option<IndexRecord>> {
        let path = self.index_path();
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(path, "read cache index", e)),
        };
        let record = IndexRecord::decode(&bytes)?;
        if record.origin != self.origin.as_str() {
            return Err(Error::storage(
                "read cache index",
                format!("index belongs to {}", record.origin),
            ));
        }
        Ok(Some(record))
    }

    /// Move legacy cache directories into freshly allocated ones
    async fn migrate(&self, record: IndexRecord) -> Result<IndexRecord> {
        let mut caches = Vec::with_capacity(record.caches.len());
        for cache in record.caches {
            if cache.storage_dir.is_some() {
                caches.push(cache);
                continue;
            }
            let legacy = self.origin_root.join(storage_hash(&cache.name));
            let storage_dir = self.allocate_dir_name().await?;
            let target = self.origin_root.join(&storage_dir);
            fs::rename(&legacy, &target)
                .await
                .map_err(|e| Error::io(&legacy, "migrate legacy cache directory", e))?;
            info!(
                "Migrated cache '{}' of {} to {}",
                cache.name,
                self.origin,
                target.display()
            );
            caches.push(IndexEntry::new(cache.name, Some(storage_dir)));
        }

        let migrated = IndexRecord::new(self.origin.as_str(), caches);
        self.write_record(migrated.clone()).await?;
        Ok(migrated)
    }

    /// Remove directories under the origin root that the index does not name
    async fn collect_orphans(&self, caches: &[IndexEntry]) -> Result<()> {
        let referenced: HashSet<&str> = caches
            .iter()
            .filter_map(|cache| cache.storage_dir.as_deref())
            .collect();

        let mut read_dir = match fs::read_dir(&self.origin_root).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Error::io(&self.origin_root, "list origin directory", e)),
        };
        while let Some(item) = read_dir
            .next_entry()
            .await
            .map_err(|e| Error::io(&self.origin_root, "list origin directory", e))?
        {
            let is_dir = item.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            let name = item.file_name();
            let Some(name) = name.to_str() else { continue };
            if !is_dir || referenced.contains(name) {
                continue;
            }
            info!("Removing orphaned cache directory {}", item.path().display());
            if let Err(e) = fs::remove_dir_all(item.path()).await {
                warn!("Failed to remove {}: {}", item.path().display(), e);
            }
        }
        Ok(())
    }

    async fn allocate_dir_name(&self) -> Result<String> {
        loop {
            let candidate = Uuid::new_v4().to_string();
            // An unreadable root surfaces when the store opens its backend.
            if fs::metadata(self.origin_root.join(&candidate)).await.is_err() {
                return Ok(candidate);
            }
        }
    }
}

#[async_trait]
impl CacheLoader for DiskLoader {
    fn create_cache(&self, name: &str, storage_dir: Option<&str>) -> CacheStore {
        let dir = storage_dir.map_or_else(|| storage_hash(name), str::to_string);
        CacheStore::new(
            name,
            self.origin.clone(),
            StoreLocation::Disk(self.origin_root.join(dir)),
            Arc::clone(&self.services),
        )
    }

    async fn prepare_new_cache_destination(&self) -> Result<Option<String>> {
        self.allocate_dir_name().await.map(Some)
    }

    async fn write_index(&self, caches: &[IndexEntry]) -> Result<()> {
        self.write_record(IndexRecord::new(self.origin.as_str(), caches.to_vec()))
            .await
    }

    async fn load_index(&self) -> Result<Vec<IndexEntry>> {
        let record = match self.read_record().await {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(Vec::new()),
            Err(e) => {
                warn!("Ignoring unreadable cache index for {}: {}", self.origin, e);
                return Ok(Vec::new());
            }
        };

        let record = if record.needs_migration() {
            match self.migrate(record).await {
                Ok(record) => record,
                Err(e) => {
                    warn!(
                        "Legacy index migration for {} failed, starting empty: {}",
                        self.origin, e
                    );
                    return Ok(Vec::new());
                }
            }
        } else {
            record
        };

        // Orphans are collected again on the next load.
        if let Err(e) = self.collect_orphans(&record.caches).await {
            warn!("Skipping orphan collection for {}: {}", self.origin, e);
        }
        debug!(
            "Loaded {} caches for {} from {}",
            record.caches.len(),
            self.origin,
            self.index_path().display()
        );
        Ok(record.caches)
    }

    async fn cleanup_cache(&self, storage_dir: Option<&str>) -> Result<()> {
        let Some(storage_dir) = storage_dir else {
            return Ok(());
        };
        let path = self.origin_root.join(storage_dir);
        match fs::remove_dir_all(&path).await {
            Ok(()) => {
                debug!("Removed cache directory {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(path, "remove cache directory", e)),
        }
    }

    fn notify_cache_doomed(&self, name: &str) {
        debug!("Cache '{}' of {} doomed", name, self.origin);
    }

    async fn remove_origin(&self) -> Result<()> {
        match fs::remove_dir_all(&self.origin_root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(&self.origin_root, "remove origin directory", e)),
        }
    }
}
