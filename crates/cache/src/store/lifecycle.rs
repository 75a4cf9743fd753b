//! Backend creation, size bookkeeping and shutdown

use super::{BackendState, CacheStore};
use crate::backend::{create_entry_store, EntryStore};
use cachestorage_core::Result;
use std::sync::Arc;
use tracing::{debug, warn};

impl CacheStore {
    /// Queue backend creation ahead of the first operation
    pub(super) fn lazy_init(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.backend_state != BackendState::Uninitialized || state.initializing {
                return;
            }
            debug_assert!(!self.inner.scheduler.has_scheduled_operations());
            state.initializing = true;
        }

        let store = self.clone();
        // Completion is observed through the state machine, not the result.
        drop(
            self.inner
                .scheduler
                .submit(async move { store.init_backend().await }),
        );
    }

    async fn init_backend(&self) -> Result<()> {
        let created = match create_entry_store(&self.inner.location).await {
            Ok(entry_store) => entry_store
                .calculate_size_of_all_entries()
                .await
                .map(|size| (entry_store, size)),
            Err(e) => Err(e),
        };

        let opened_size = {
            let mut state = self.inner.state.lock();
            state.initializing = false;
            match created {
                Ok((entry_store, size)) => {
                    debug!(
                        "Opened cache '{}' for {} ({} bytes)",
                        self.inner.name, self.inner.origin, size
                    );
                    state.entry_store = Some(entry_store);
                    state.cache_size = size;
                    state.backend_state = BackendState::Open;
                    size
                }
                Err(e) => {
                    warn!(
                        "Failed to create backend for cache '{}' of {}: {}",
                        self.inner.name, self.inner.origin, e
                    );
                    state.backend_state = BackendState::Closed;
                    return Err(e);
                }
            }
        };

        // Usage covers every loaded cache.
        if opened_size > 0 {
            self.inner
                .services
                .quota
                .notify_storage_modified(&self.inner.origin, opened_size as i64)
                .await;
        }
        Ok(())
    }

    /// Recompute the aggregate size and report the change to quota
    pub(super) async fn update_cache_size(&self, entry_store: &Arc<dyn EntryStore>) -> Result<u64> {
        let new_size = entry_store.calculate_size_of_all_entries().await?;
        let delta = {
            let mut state = self.inner.state.lock();
            let delta = new_size as i64 - state.cache_size as i64;
            state.cache_size = new_size;
            delta
        };
        if delta != 0 {
            self.inner
                .services
                .quota
                .notify_storage_modified(&self.inner.origin, delta)
                .await;
        }
        Ok(new_size)
    }

    /// Aggregate byte size of all entries
    pub async fn size(&self) -> Result<u64> {
        self.schedule(|store| async move {
            store.entry_store()?;
            Ok(store.last_known_size())
        })
        .await
    }

    /// Read the size and close the backend as one scheduled unit
    pub async fn get_size_then_close(&self) -> Result<u64> {
        self.schedule(|store| async move {
            store.entry_store()?;
            Ok(store.close_backend().await)
        })
        .await
    }

    /// Close the backend; later operations fail fast
    pub async fn close(&self) -> Result<()> {
        self.schedule(|store| async move {
            store.close_backend().await;
            Ok(())
        })
        .await
    }

    /// Drop the backend and release its usage from quota, returning its size
    async fn close_backend(&self) -> u64 {
        let released = {
            let mut state = self.inner.state.lock();
            let was_open = state.backend_state == BackendState::Open;
            state.backend_state = BackendState::Closed;
            state.entry_store = None;
            if !was_open {
                return state.cache_size;
            }
            debug!("Closing cache '{}' of {}", self.inner.name, self.inner.origin);
            state.cache_size
        };
        if released > 0 {
            self.inner
                .services
                .quota
                .notify_storage_modified(&self.inner.origin, -(released as i64))
                .await;
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Entry, StoreLocation};
    use crate::context::StorageServices;
    use crate::config::CacheStorageConfig;
    use cachestorage_core::{ErrorKind, Origin, INDEX_RESPONSE_BODY};
    use tempfile::TempDir;

    fn store_at(location: StoreLocation) -> CacheStore {
        let services = Arc::new(StorageServices::new(CacheStorageConfig::default()));
        CacheStore::new(
            "v1",
            Origin::parse("https://example.com").unwrap(),
            location,
            services,
        )
    }

    #[tokio::test]
    async fn test_first_operation_opens_backend() {
        let store = store_at(StoreLocation::Memory);
        assert_eq!(store.backend_state(), BackendState::Uninitialized);

        assert_eq!(store.size().await.unwrap(), 0);
        assert_eq!(store.backend_state(), BackendState::Open);
    }

    #[tokio::test]
    async fn test_closed_store_fails_fast() {
        let store = store_at(StoreLocation::Memory);
        store.close().await.unwrap();
        assert_eq!(store.backend_state(), BackendState::Closed);

        let err = store.size().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert!(!store.inner.scheduler.has_scheduled_operations());
    }

    #[tokio::test]
    async fn test_failed_backend_creation_closes_store() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();

        let store = store_at(StoreLocation::Disk(blocker.join("cache")));
        let err = store.size().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert_eq!(store.backend_state(), BackendState::Closed);
    }

    #[tokio::test]
    async fn test_get_size_then_close_is_terminal() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_at(StoreLocation::Disk(temp_dir.path().join("cache")));

        assert_eq!(store.get_size_then_close().await.unwrap(), 0);
        assert_eq!(store.backend_state(), BackendState::Closed);
        assert!(store.get_size_then_close().await.is_err());
    }

    #[tokio::test]
    async fn test_close_releases_quota_usage() {
        let store = store_at(StoreLocation::Memory);
        let origin = store.origin().clone();
        store.size().await.unwrap();
        let entry_store = store.entry_store().unwrap();
        let entry = entry_store.create_entry("https://example.com/a").await.unwrap();
        entry
            .write_data(INDEX_RESPONSE_BODY, 0, &[7u8; 64], true)
            .await
            .unwrap();
        let size = store.update_cache_size(&entry_store).await.unwrap();
        assert!(size >= 64);

        let quota = Arc::clone(&store.inner.services.quota);
        assert_eq!(quota.get_usage_and_quota(&origin).await.unwrap().0, size);
        assert_eq!(store.get_size_then_close().await.unwrap(), size);
        assert_eq!(quota.get_usage_and_quota(&origin).await.unwrap().0, 0);
    }
}
