//! Cache Set Manager: the named caches of one origin
//!
//! The manager owns every [`CacheStore`] of its origin and hands out counted
//! [`CacheHandle`]s. Structural changes are serialized on the manager's own
//! scheduler and persisted through its [`CacheLoader`].

mod handle;
mod index;
mod loader;

pub use handle::CacheHandle;
pub use index::{IndexEntry, IndexRecord};
pub use loader::{CacheLoader, DiskLoader, MemoryLoader};

use crate::context::StorageServices;
use crate::scheduler::OperationScheduler;
use crate::store::{BackendState, CacheMatch, CacheStore};
use cachestorage_core::{Error, Origin, QueryOptions, Request, Result};
use futures::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Per-origin set of named caches
#[derive(Clone)]
pub struct CacheSetManager {
    pub(crate) inner: Arc<ManagerInner>,
}

pub(crate) struct ManagerInner {
    origin: Origin,
    services: Arc<StorageServices>,
    loader: Arc<dyn CacheLoader>,
    scheduler: OperationScheduler,
    pub(crate) state: Mutex<ManagerState>,
}

#[derive(Default)]
pub(crate) struct ManagerState {
    initialized: bool,
    initializing: bool,
    ordered_cache_names: Vec<String>,
    cache_map: HashMap<String, CacheSlot>,
    /// Deleted caches still referenced by handles, keyed by store id
    doomed: HashMap<u64, DoomedCache>,
    /// Live handle count per store id
    pub(crate) handle_counts: HashMap<u64, usize>,
}

struct CacheSlot {
    storage_dir: Option<String>,
    /// Materialized on first open
    store: Option<CacheStore>,
}

struct DoomedCache {
    store: CacheStore,
    storage_dir: Option<String>,
}

impl CacheSetManager {
    pub fn new(
        origin: Origin,
        services: Arc<StorageServices>,
        loader: Arc<dyn CacheLoader>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                origin,
                services,
                loader,
                scheduler: OperationScheduler::new(),
                state: Mutex::new(ManagerState::default()),
            }),
        }
    }

    pub fn origin(&self) -> &Origin {
        &self.inner.origin
    }

    /// Open `name`, creating it if it does not exist
    pub async fn open_cache(&self, name: &str) -> Result<CacheHandle> {
        let name = name.to_string();
        self.schedule(move |manager| async move {
            if let Some(store) = manager.materialize(&name) {
                return Ok(manager.new_handle(store));
            }

            let storage_dir = manager.inner.loader.prepare_new_cache_destination().await?;
            let store = manager
                .inner
                .loader
                .create_cache(&name, storage_dir.as_deref());
            let entries = {
                let mut state = manager.inner.state.lock();
                state.cache_map.insert(
                    name.clone(),
                    CacheSlot {
                        storage_dir,
                        store: Some(store.clone()),
                    },
                );
                state.ordered_cache_names.push(name.clone());
                index_entries(&state)
            };

            // The cache stays usable even if the index could not be written.
            if let Err(e) = manager.inner.loader.write_index(&entries).await {
                warn!(
                    "Failed to persist index after creating '{}' for {}: {}",
                    name, manager.inner.origin, e
                );
            }
            info!("Created cache '{}' for {}", name, manager.inner.origin);
            Ok(manager.new_handle(store))
        })
        .await
    }

    pub async fn has_cache(&self, name: &str) -> Result<bool> {
        let name = name.to_string();
        self.schedule(move |manager| async move {
            Ok(manager.inner.state.lock().cache_map.contains_key(&name))
        })
        .await
    }

    /// Cache names in creation order
    pub async fn enumerate_caches(&self) -> Result<Vec<String>> {
        self.schedule(|manager| async move {
            Ok(manager.inner.state.lock().ordered_cache_names.clone())
        })
        .await
    }

    /// Remove `name` from the set.
    ///
    /// The store is torn down once its last handle is released.
    pub async fn delete_cache(&self, name: &str) -> Result<bool> {
        let name = name.to_string();
        self.schedule(move |manager| async move {
            let (position, entries) = {
                let mut state = manager.inner.state.lock();
                if !state.cache_map.contains_key(&name) {
                    return Err(Error::not_found(name));
                }
                let position = state
                    .ordered_cache_names
                    .iter()
                    .position(|existing| *existing == name);
                if let Some(position) = position {
                    state.ordered_cache_names.remove(position);
                }
                (position, index_entries(&state))
            };

            if let Err(e) = manager.inner.loader.write_index(&entries).await {
                warn!(
                    "Failed to persist index while deleting '{}' for {}: {}",
                    name, manager.inner.origin, e
                );
                if let Some(position) = position {
                    manager
                        .inner
                        .state
                        .lock()
                        .ordered_cache_names
                        .insert(position, name);
                }
                return Err(e);
            }

            let slot = manager.inner.state.lock().cache_map.remove(&name);
            let Some(slot) = slot else {
                return Ok(true);
            };
            manager.inner.loader.notify_cache_doomed(&name);

            let store = match slot.store {
                Some(store) => store,
                None => manager
                    .inner
                    .loader
                    .create_cache(&name, slot.storage_dir.as_deref()),
            };
            let in_use = {
                let mut state = manager.inner.state.lock();
                let in_use = state.handle_counts.get(&store.id()).copied().unwrap_or(0) > 0;
                if in_use {
                    state.doomed.insert(
                        store.id(),
                        DoomedCache {
                            store: store.clone(),
                            storage_dir: slot.storage_dir.clone(),
                        },
                    );
                }
                in_use
            };

            if in_use {
                debug!("Cache '{}' doomed with open handles", name);
            } else {
                manager
                    .finalize_doomed(DoomedCache {
                        store,
                        storage_dir: slot.storage_dir,
                    })
                    .await;
            }
            info!("Deleted cache '{}' for {}", name, manager.inner.origin);
            Ok(true)
        })
        .await
    }

    /// Match against the cache called `name`
    pub async fn match_cache(
        &self,
        name: &str,
        request: Request,
        options: QueryOptions,
    ) -> Result<CacheMatch> {
        let name = name.to_string();
        self.schedule(move |manager| async move {
            let store = manager
                .materialize(&name)
                .ok_or_else(|| Error::cache_name_not_found(&name))?;
            let handle = manager.new_handle(store);
            handle.match_request(request, options).await
        })
        .await
    }

    /// Match against every cache in creation order; the first hit wins
    pub async fn match_all_caches(
        &self,
        request: Request,
        options: QueryOptions,
    ) -> Result<CacheMatch> {
        self.schedule(move |manager| async move {
            let target = request.url.to_string();
            for store in manager.materialize_all() {
                let handle = manager.new_handle(store);
                match handle.match_request(request.clone(), options).await {
                    Ok(found) => return Ok(found),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => warn!(
                        "Skipping cache '{}' while matching {}: {}",
                        handle.name(),
                        target,
                        e
                    ),
                }
            }
            Err(Error::not_found(target))
        })
        .await
    }

    /// Total size of every cache in the set
    pub async fn size(&self) -> Result<u64> {
        self.schedule(|manager| async move {
            let stores = manager.materialize_all();
            let sizes = join_all(stores.iter().map(|store| store.size())).await;
            Ok(stores
                .iter()
                .zip(sizes)
                .map(|(store, size)| size.unwrap_or_else(|_| store.last_known_size()))
                .sum())
        })
        .await
    }

    /// Total size of every cache, closing each one
    pub async fn get_size_then_close_all_caches(&self) -> Result<u64> {
        self.schedule(|manager| async move { Ok(manager.close_all().await) })
            .await
    }

    /// Close every cache and remove all of the origin's stored data
    pub async fn delete_all_data(&self) -> Result<u64> {
        self.schedule(|manager| async move {
            let freed = manager.close_all().await;
            manager.inner.loader.remove_origin().await?;
            {
                let mut state = manager.inner.state.lock();
                state.ordered_cache_names.clear();
                state.cache_map.clear();
            }
            info!("Deleted all cache data for {} ({} bytes)", manager.inner.origin, freed);
            Ok(freed)
        })
        .await
    }

    /// Number of deleted caches still held open by handles
    pub fn doomed_cache_count(&self) -> usize {
        self.inner.state.lock().doomed.len()
    }

    fn schedule<F, Fut, T>(&self, operation: F) -> BoxFuture<'static, Result<T>>
    where
        F: FnOnce(CacheSetManager) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.lazy_init();
        let manager = self.clone();
        Box::pin(self.inner.scheduler.submit(async move { operation(manager).await }))
    }

    fn lazy_init(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.initialized || state.initializing {
                return;
            }
            debug_assert!(!self.inner.scheduler.has_scheduled_operations());
            state.initializing = true;
        }

        let manager = self.clone();
        drop(self.inner.scheduler.submit(async move {
            manager.init().await;
            Ok(())
        }));
    }

    async fn init(&self) {
        let caches = match self.inner.loader.load_index().await {
            Ok(caches) => caches,
            Err(e) => {
                warn!("Failed to load cache index for {}: {}", self.inner.origin, e);
                Vec::new()
            }
        };

        let mut state = self.inner.state.lock();
        for cache in caches {
            state.ordered_cache_names.push(cache.name.clone());
            state.cache_map.insert(
                cache.name,
                CacheSlot {
                    storage_dir: cache.storage_dir,
                    store: None,
                },
            );
        }
        state.initializing = false;
        state.initialized = true;
    }

    /// The store for `name`, created from its slot on first use and
    /// recreated once the previous one has closed
    fn materialize(&self, name: &str) -> Option<CacheStore> {
        let mut state = self.inner.state.lock();
        let slot = state.cache_map.get_mut(name)?;
        if let Some(store) = &slot.store {
            if store.backend_state() != BackendState::Closed {
                return Some(store.clone());
            }
            debug!("Replacing closed store of cache '{}'", name);
        }
        let store = self
            .inner
            .loader
            .create_cache(name, slot.storage_dir.as_deref());
        slot.store = Some(store.clone());
        Some(store)
    }

    fn materialize_all(&self) -> Vec<CacheStore> {
        let names = self.inner.state.lock().ordered_cache_names.clone();
        names.iter().filter_map(|name| self.materialize(name)).collect()
    }

    async fn close_all(&self) -> u64 {
        let stores = self.materialize_all();
        let sizes = join_all(stores.iter().map(|store| store.get_size_then_close())).await;
        stores
            .iter()
            .zip(sizes)
            .map(|(store, size)| size.unwrap_or_else(|_| store.last_known_size()))
            .sum()
    }

    fn new_handle(&self, store: CacheStore) -> CacheHandle {
        CacheHandle::new(store, Arc::downgrade(&self.inner))
    }

    /// Close the store, which releases its quota, and remove its storage
    async fn finalize_doomed(&self, doomed: DoomedCache) {
        let DoomedCache { store, storage_dir } = doomed;
        let size = match store.get_size_then_close().await {
            Ok(size) => size,
            Err(_) => store.last_known_size(),
        };
        if let Err(e) = self.inner.loader.cleanup_cache(storage_dir.as_deref()).await {
            warn!(
                "Failed to clean up deleted cache '{}' of {}: {}",
                store.name(),
                self.inner.origin,
                e
            );
        }
        debug!("Finalized deleted cache '{}' ({} bytes)", store.name(), size);
    }

    /// Called by the last handle of `store_id`; finalizes it if doomed
    pub(crate) fn release_store(&self, store_id: u64) {
        let doomed = self.inner.state.lock().doomed.remove(&store_id);
        let Some(doomed) = doomed else {
            return;
        };
        if tokio::runtime::Handle::try_current().is_err() {
            warn!(
                "No runtime to finalize deleted cache '{}'; left for orphan collection",
                doomed.store.name()
            );
            return;
        }
        let manager = self.clone();
        drop(self.inner.scheduler.submit(async move {
            manager.finalize_doomed(doomed).await;
            Ok(())
        }));
    }
}

impl std::fmt::Debug for CacheSetManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("CacheSetManager")
            .field("origin", &self.inner.origin)
            .field("caches", &state.ordered_cache_names)
            .field("doomed", &state.doomed.len())
            .finish()
    }
}

fn index_entries(state: &ManagerState) -> Vec<IndexEntry> {
    state
        .ordered_cache_names
        .iter()
        .map(|name| {
            let storage_dir = state
                .cache_map
                .get(name)
                .and_then(|slot| slot.storage_dir.clone());
            IndexEntry::new(name.clone(), storage_dir)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StoreLocation;
    use crate::config::CacheStorageConfig;
    use cachestorage_core::{ErrorKind, Response};
    use tempfile::TempDir;

    fn memory_manager() -> CacheSetManager {
        let origin = Origin::parse("https://example.com").unwrap();
        let services = Arc::new(StorageServices::new(CacheStorageConfig::default()));
        let loader = Arc::new(MemoryLoader::new(origin.clone(), Arc::clone(&services)));
        CacheSetManager::new(origin, services, loader)
    }

    fn disk_manager(root: &std::path::Path) -> CacheSetManager {
        let origin = Origin::parse("https://example.com").unwrap();
        let services = Arc::new(StorageServices::new(CacheStorageConfig::default()));
        let loader = Arc::new(DiskLoader::new(
            origin.clone(),
            root.to_path_buf(),
            Arc::clone(&services),
        ));
        CacheSetManager::new(origin, services, loader)
    }

    #[tokio::test]
    async fn test_open_reuses_existing_store() {
        let manager = memory_manager();
        let first = manager.open_cache("v1").await.unwrap();
        let second = manager.open_cache("v1").await.unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(manager.enumerate_caches().await.unwrap(), vec!["v1"]);
        assert_eq!(manager.inner.state.lock().handle_counts[&first.id()], 2);
    }

    #[tokio::test]
    async fn test_enumeration_follows_creation_order() {
        let manager = memory_manager();
        for name in ["c", "a", "b"] {
            manager.open_cache(name).await.unwrap();
        }
        assert_eq!(manager.enumerate_caches().await.unwrap(), vec!["c", "a", "b"]);
        assert!(manager.has_cache("a").await.unwrap());
        assert!(!manager.has_cache("z").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_missing_cache_is_not_found() {
        let manager = memory_manager();
        let err = manager.delete_cache("nope").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_match_unknown_cache_name() {
        let manager = memory_manager();
        let err = manager
            .match_cache(
                "nope",
                Request::get("https://example.com/").unwrap(),
                QueryOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CacheNameNotFound);
    }

    #[tokio::test]
    async fn test_doomed_cache_waits_for_last_handle() {
        let temp_dir = TempDir::new().unwrap();
        let manager = disk_manager(temp_dir.path());

        let handle = manager.open_cache("v1").await.unwrap();
        handle
            .put(
                Request::get("https://example.com/a").unwrap(),
                Response::new(200, "OK"),
                None,
            )
            .await
            .unwrap();
        let StoreLocation::Disk(dir) = handle.location().clone() else {
            panic!("disk manager produced a memory cache");
        };
        assert!(dir.exists());

        assert!(manager.delete_cache("v1").await.unwrap());
        assert_eq!(manager.doomed_cache_count(), 1);
        assert!(!manager.has_cache("v1").await.unwrap());
        // Still usable through the outstanding handle
        assert_eq!(handle.keys(None, QueryOptions::default()).await.unwrap().len(), 1);

        drop(handle);
        // Any later manager operation runs after the finalization
        manager.enumerate_caches().await.unwrap();
        assert_eq!(manager.doomed_cache_count(), 0);
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_index_survives_restart() {
        let temp_dir = TempDir::new().unwrap();
        {
            let manager = disk_manager(temp_dir.path());
            manager.open_cache("first").await.unwrap();
            manager.open_cache("second").await.unwrap();
            manager.delete_cache("first").await.unwrap();
            manager.open_cache("third").await.unwrap();
        }

        let manager = disk_manager(temp_dir.path());
        assert_eq!(
            manager.enumerate_caches().await.unwrap(),
            vec!["second", "third"]
        );
    }

    #[tokio::test]
    async fn test_delete_rolls_back_on_index_failure() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("origin");
        let manager = disk_manager(&root);
        manager.open_cache("a").await.unwrap();
        manager.open_cache("b").await.unwrap();

        // Replace the origin root with a file so the index cannot be written
        std::fs::remove_dir_all(&root).unwrap();
        std::fs::write(&root, b"blocked").unwrap();

        let err = manager.delete_cache("a").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert_eq!(manager.enumerate_caches().await.unwrap(), vec!["a", "b"]);
        assert!(manager.has_cache("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_open_survives_index_failure() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("origin");
        std::fs::write(&root, b"blocked").unwrap();

        let manager = disk_manager(&root);
        let handle = manager.open_cache("v1").await.unwrap();
        assert_eq!(handle.name(), "v1");
        assert!(manager.has_cache("v1").await.unwrap());
    }

    #[tokio::test]
    async fn test_reopen_replaces_store_with_failed_backend() {
        let temp_dir = TempDir::new().unwrap();
        let manager = disk_manager(temp_dir.path());

        let handle = manager.open_cache("v1").await.unwrap();
        let StoreLocation::Disk(dir) = handle.location().clone() else {
            panic!("disk manager produced a memory cache");
        };
        std::fs::write(&dir, b"blocked").unwrap();

        let err = handle
            .put(
                Request::get("https://example.com/a").unwrap(),
                Response::new(200, "OK"),
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert_eq!(handle.backend_state(), BackendState::Closed);
        let failed_id = handle.id();
        drop(handle);
        std::fs::remove_file(&dir).unwrap();

        let reopened = manager.open_cache("v1").await.unwrap();
        assert_ne!(reopened.id(), failed_id);
        assert_eq!(reopened.location(), &StoreLocation::Disk(dir));
        reopened
            .put(
                Request::get("https://example.com/a").unwrap(),
                Response::new(200, "OK"),
                None,
            )
            .await
            .unwrap();
        assert_eq!(reopened.backend_state(), BackendState::Open);
        assert_eq!(manager.enumerate_caches().await.unwrap(), vec!["v1"]);
    }

    #[tokio::test]
    async fn test_size_fans_out_and_close_all_reopens_lazily() {
        let manager = memory_manager();
        let a = manager.open_cache("a").await.unwrap();
        let b = manager.open_cache("b").await.unwrap();
        for (handle, url) in [(&a, "https://example.com/a"), (&b, "https://example.com/b")] {
            handle
                .put(
                    Request::get(url).unwrap(),
                    Response::new(200, "OK").with_header("X-Cache", "hit"),
                    None,
                )
                .await
                .unwrap();
        }
        let a_size = a.size().await.unwrap();
        let b_size = b.size().await.unwrap();
        assert!(a_size > 0 && b_size > 0);

        assert_eq!(manager.size().await.unwrap(), a_size + b_size);
        assert_eq!(
            manager.get_size_then_close_all_caches().await.unwrap(),
            a_size + b_size
        );
        assert_eq!(a.backend_state(), BackendState::Closed);
        assert_eq!(b.backend_state(), BackendState::Closed);
        let (usage, _) = manager
            .inner
            .services
            .quota
            .get_usage_and_quota(manager.origin())
            .await
            .unwrap();
        assert_eq!(usage, 0);

        let reopened = manager.open_cache("a").await.unwrap();
        assert_ne!(reopened.id(), a.id());
        assert_eq!(reopened.size().await.unwrap(), 0);
        assert_eq!(reopened.backend_state(), BackendState::Open);
    }
}
