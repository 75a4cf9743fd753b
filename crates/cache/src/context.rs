//! Process-level registry of per-origin cache sets
use crate::blob::BlobStorage;
use crate::config::{BackendKind, CacheStorageConfig};
use crate::manager::{CacheLoader, CacheSetManager, DiskLoader, IndexRecord, MemoryLoader};
use crate::quota::{FixedQuotaManager, QuotaManager};
use cachestorage_core::{Error, Origin, Result, INDEX_FILE_NAME};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::io::ErrorKind as IoErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info};

/// Collaborators shared by every store of a context
pub struct StorageServices {
    pub config: CacheStorageConfig,
    pub blobs: Arc<BlobStorage>,
    pub quota: Arc<dyn QuotaManager>,
}

impl StorageServices {
    /// Services with a fixed per-origin quota taken from `config`
    pub fn new(config: CacheStorageConfig) -> Self {
        let quota = Arc::new(FixedQuotaManager::new(config.default_quota_bytes));
        Self::with_quota_manager(config, quota)
    }

    pub fn with_quota_manager(config: CacheStorageConfig, quota: Arc<dyn QuotaManager>) -> Self {
        Self {
            config,
            blobs: Arc::new(BlobStorage::new()),
            quota,
        }
    }
}

impl std::fmt::Debug for StorageServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageServices")
            .field("config", &self.config)
            .field("blobs", &self.blobs.len())
            .finish()
    }
}

/// Owns one [`CacheSetManager`] per origin
#[derive(Debug)]
pub struct CacheStorageContext {
    services: Arc<StorageServices>,
    managers: Mutex<HashMap<Origin, CacheSetManager>>,
}

impl CacheStorageContext {
    pub fn new(config: CacheStorageConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_services(StorageServices::new(config)))
    }

    /// Use `quota` instead of the fixed per-origin allowance
    pub fn with_quota_manager(
        config: CacheStorageConfig,
        quota: Arc<dyn QuotaManager>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_services(StorageServices::with_quota_manager(
            config, quota,
        )))
    }

    fn from_services(services: StorageServices) -> Self {
        Self {
            services: Arc::new(services),
            managers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CacheStorageConfig {
        &self.services.config
    }

    pub fn blobs(&self) -> &BlobStorage {
        &self.services.blobs
    }

    pub fn quota(&self) -> Arc<dyn QuotaManager> {
        Arc::clone(&self.services.quota)
    }

    /// Storage root of `origin` for the disk backend
    pub fn origin_root(&self, origin: &Origin) -> PathBuf {
        self.services.config.root_dir.join(origin.storage_key())
    }

    /// The cache set of `origin`, created on first access
    pub fn manager_for(&self, origin: &Origin) -> CacheSetManager {
        let mut managers = self.managers.lock();
        if let Some(manager) = managers.get(origin) {
            return manager.clone();
        }

        let loader: Arc<dyn CacheLoader> = match self.services.config.backend {
            BackendKind::Memory => Arc::new(MemoryLoader::new(
                origin.clone(),
                Arc::clone(&self.services),
            )),
            BackendKind::Disk => Arc::new(DiskLoader::new(
                origin.clone(),
                self.origin_root(origin),
                Arc::clone(&self.services),
            )),
        };
        let manager = CacheSetManager::new(origin.clone(), Arc::clone(&self.services), loader);
        managers.insert(origin.clone(), manager.clone());
        debug!("Created cache set for {}", origin);
        manager
    }

    /// Origins with a loaded cache set or a persisted index
    pub async fn origins(&self) -> Result<Vec<Origin>> {
        let mut origins: BTreeSet<Origin> = self.managers.lock().keys().cloned().collect();
        if self.services.config.backend == BackendKind::Memory {
            return Ok(origins.into_iter().collect());
        }

        let root = &self.services.config.root_dir;
        let mut read_dir = match fs::read_dir(root).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(origins.into_iter().collect()),
            Err(e) => return Err(Error::io(root, "list storage root", e)),
        };
        while let Some(item) = read_dir
            .next_entry()
            .await
            .map_err(|e| Error::io(root, "list storage root", e))?
        {
            let index_path = item.path().join(INDEX_FILE_NAME);
            let Ok(bytes) = fs::read(&index_path).await else {
                continue;
            };
            match IndexRecord::decode(&bytes).and_then(|record| Origin::parse(&record.origin)) {
                Ok(origin) => {
                    origins.insert(origin);
                }
                Err(e) => debug!("Skipping {}: {}", index_path.display(), e),
            }
        }
        Ok(origins.into_iter().collect())
    }

    /// Bytes stored by every cache of `origin`
    pub async fn origin_usage(&self, origin: &Origin) -> Result<u64> {
        self.manager_for(origin).size().await
    }

    /// Close every cache of `origin` and remove its data, returning the bytes freed
    pub async fn delete_origin(&self, origin: &Origin) -> Result<u64> {
        let manager = self.manager_for(origin);
        let freed = manager.delete_all_data().await?;
        self.managers.lock().remove(origin);
        info!("Deleted origin {} ({} bytes)", origin, freed);
        Ok(freed)
    }
}
