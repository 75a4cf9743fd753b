//! Counted handles to cache stores
use super::{CacheSetManager, ManagerInner};
use crate::store::CacheStore;
use std::ops::Deref;
use std::sync::Weak;

/// Reference to a cache store owned by a [`CacheSetManager`].
///
/// The manager counts live handles per store. When a deleted cache's last
/// handle goes away the manager reclaims its storage.
pub struct CacheHandle {
    store: CacheStore,
    manager: Weak<ManagerInner>,
}

impl CacheHandle {
    pub(super) fn new(store: CacheStore, manager: Weak<ManagerInner>) -> Self {
        if let Some(inner) = manager.upgrade() {
            *inner
                .state
                .lock()
                .handle_counts
                .entry(store.id())
                .or_insert(0) += 1;
        }
        Self { store, manager }
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }
}

impl Deref for CacheHandle {
    type Target = CacheStore;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

impl Clone for CacheHandle {
    fn clone(&self) -> Self {
        Self::new(self.store.clone(), self.manager.clone())
    }
}

impl Drop for CacheHandle {
    fn drop(&mut self) {
        let Some(inner) = self.manager.upgrade() else {
            return;
        };
        let id = self.store.id();
        let last = {
            let mut state = inner.state.lock();
            match state.handle_counts.get_mut(&id) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    state.handle_counts.remove(&id);
                    true
                }
                None => false,
            }
        };
        if last {
            CacheSetManager { inner }.release_store(id);
        }
    }
}

impl std::fmt::Debug for CacheHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheHandle")
            .field("store", &self.store)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheStorageConfig;
    use crate::context::StorageServices;
    use crate::manager::MemoryLoader;
    use cachestorage_core::Origin;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_counts_follow_clones_and_drops() {
        let origin = Origin::parse("https://example.com").unwrap();
        let services = Arc::new(StorageServices::new(CacheStorageConfig::default()));
        let loader = Arc::new(MemoryLoader::new(origin.clone(), Arc::clone(&services)));
        let manager = CacheSetManager::new(origin, services, loader);

        let handle = manager.open_cache("v1").await.unwrap();
        let id = handle.id();
        let copy = handle.clone();
        assert_eq!(manager.inner.state.lock().handle_counts[&id], 2);

        drop(handle);
        assert_eq!(manager.inner.state.lock().handle_counts[&id], 1);
        drop(copy);
        assert!(!manager.inner.state.lock().handle_counts.contains_key(&id));
    }

    #[tokio::test]
    async fn test_handle_outliving_manager_is_harmless() {
        let origin = Origin::parse("https://example.com").unwrap();
        let services = Arc::new(StorageServices::new(CacheStorageConfig::default()));
        let loader = Arc::new(MemoryLoader::new(origin.clone(), Arc::clone(&services)));
        let manager = CacheSetManager::new(origin, services, loader);

        let handle = manager.open_cache("v1").await.unwrap();
        drop(manager);
        assert_eq!(handle.name(), "v1");
        drop(handle);
    }
}
