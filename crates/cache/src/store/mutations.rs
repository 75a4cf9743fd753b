//! Put, Delete, batch operations and side data

use super::query::QueryMode;
use super::CacheStore;
use crate::backend::{read_stream, Entry, EntryStore};
use crate::blob::{stream_blob_to_entry, BlobHandle};
use crate::metadata::EntryMetadata;
use crate::quota::remaining_quota;
use bytes::Bytes;
use cachestorage_core::{
    BatchOperation, BlobId, Error, QueryOptions, Request, Response, Result, INDEX_HEADERS,
    INDEX_RESPONSE_BODY, INDEX_SIDE_DATA,
};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, warn};
use url::Url;

impl CacheStore {
    /// Store `response` for `request`, replacing any entry with the same URL
    pub async fn put(
        &self,
        request: Request,
        response: Response,
        body: Option<BlobId>,
    ) -> Result<()> {
        self.schedule(move |store| async move {
            let entry_store = store.entry_store()?;
            store.put_entry(&entry_store, request, response, body).await
        })
        .await
    }

    /// Remove matching entries.
    ///
    /// With `ignore_search` every entry matching after query stripping is
    /// removed and an empty match is not an error. Otherwise exactly the
    /// entry keyed by the request URL is removed, or `NotFound` reported.
    pub async fn delete(&self, request: Request, options: QueryOptions) -> Result<()> {
        self.schedule(move |store| async move {
            let entry_store = store.entry_store()?;
            store.delete_entries(&entry_store, &request, options).await
        })
        .await
    }

    /// Run several puts, or a single delete, as one scheduled unit.
    ///
    /// Every suboperation runs even if an earlier one fails; the first
    /// failure is reported.
    pub async fn batch_operation(&self, operations: Vec<BatchOperation>) -> Result<()> {
        let puts = operations.iter().filter(|op| op.is_put()).count();
        let deletes = operations.len() - puts;
        if puts > 0 && deletes > 0 {
            return Err(Error::invalid_argument(
                "batch",
                "puts and deletes cannot be mixed in one batch",
            ));
        }
        if deletes > 1 {
            return Err(Error::invalid_argument(
                "batch",
                format!("at most one delete per batch, got {deletes}"),
            ));
        }

        self.schedule(move |store| async move {
            let entry_store = store.entry_store()?;

            let required: u64 = operations
                .iter()
                .filter_map(|op| match op {
                    BatchOperation::Put { body: Some(id), .. } => {
                        store.inner.services.blobs.resolve(*id)
                    }
                    _ => None,
                })
                .map(|blob| blob.size())
                .sum();
            if required > 0 {
                let available =
                    remaining_quota(store.inner.services.quota.as_ref(), &store.inner.origin)
                        .await?;
                if required > available {
                    return Err(Error::quota_exceeded(required, available));
                }
            }

            let mut first_error = None;
            for operation in operations {
                let outcome = match operation {
                    BatchOperation::Put {
                        request,
                        response,
                        body,
                    } => store.put_entry(&entry_store, request, response, body).await,
                    BatchOperation::Delete { request, options } => {
                        store.delete_entries(&entry_store, &request, options).await
                    }
                };
                if let Err(e) = outcome {
                    debug!("Batch suboperation on '{}' failed: {}", store.inner.name, e);
                    first_error.get_or_insert(e);
                }
            }
            first_error.map_or(Ok(()), Err)
        })
        .await
    }

    /// Replace the side data of the entry for `url`, provided the stored
    /// response still has `expected_response_time`
    pub async fn write_side_data(
        &self,
        url: Url,
        expected_response_time: SystemTime,
        data: Bytes,
    ) -> Result<()> {
        self.schedule(move |store| async move {
            let entry_store = store.entry_store()?;
            let entry = entry_store
                .open_entry(url.as_str())
                .await?
                .ok_or_else(|| Error::not_found(url.as_str()))?;

            let raw = read_stream(entry.as_ref(), INDEX_HEADERS).await?;
            let metadata = EntryMetadata::decode(&raw)?;
            if metadata.response.response_time != expected_response_time {
                return Err(Error::not_found(url.as_str()));
            }

            let existing = entry.data_size(INDEX_SIDE_DATA).await?;
            let growth = (data.len() as u64).saturating_sub(existing);
            store.check_quota(growth).await?;

            entry.write_data(INDEX_SIDE_DATA, 0, &data, true).await?;
            store.update_cache_size(&entry_store).await?;
            Ok(())
        })
        .await
    }

    async fn check_quota(&self, requested: u64) -> Result<()> {
        if requested == 0 {
            return Ok(());
        }
        let available =
            remaining_quota(self.inner.services.quota.as_ref(), &self.inner.origin).await?;
        if requested > available {
            return Err(Error::quota_exceeded(requested, available));
        }
        Ok(())
    }

    async fn put_entry(
        &self,
        entry_store: &Arc<dyn EntryStore>,
        request: Request,
        response: Response,
        body: Option<BlobId>,
    ) -> Result<()> {
        if !request.is_get() {
            return Err(Error::invalid_argument(
                "put",
                format!("only GET requests can be stored, got {}", request.method),
            ));
        }
        if body.is_some() && response.is_redirect() {
            return Err(Error::invalid_argument(
                "put",
                "redirect responses cannot carry a body",
            ));
        }

        let key = request.cache_key().to_string();
        if entry_store.doom_entry(&key).await? {
            self.update_cache_size(entry_store).await?;
        }

        let blob = match body {
            Some(id) => Some(self.inner.services.blobs.resolve(id).ok_or_else(|| {
                Error::storage("put", format!("body blob {id} could not be resolved"))
            })?),
            None => None,
        };

        let metadata = EntryMetadata::new(&request, response, self.next_entry_time()).encode()?;
        let body_size = blob.as_ref().map_or(0, BlobHandle::size);
        self.check_quota(metadata.len() as u64 + body_size).await?;

        let entry = entry_store.create_entry(&key).await?;
        if let Err(e) = self.write_entry(entry.as_ref(), &metadata, blob.as_ref()).await {
            warn!("Failed to write entry {} in cache '{}': {}", key, self.inner.name, e);
            if let Err(doom_err) = entry_store.doom_entry(&key).await {
                warn!("Failed to doom partial entry {}: {}", key, doom_err);
            }
            self.update_cache_size(entry_store).await?;
            return Err(e);
        }

        let size = self.update_cache_size(entry_store).await?;
        debug!(
            "Put {} into cache '{}' ({} body bytes, cache now {} bytes)",
            key, self.inner.name, body_size, size
        );
        Ok(())
    }

    async fn write_entry(
        &self,
        entry: &dyn Entry,
        metadata: &[u8],
        blob: Option<&BlobHandle>,
    ) -> Result<()> {
        entry.write_data(INDEX_HEADERS, 0, metadata, true).await?;
        if let Some(blob) = blob {
            let chunk_size = self.inner.services.config.body_chunk_size;
            stream_blob_to_entry(blob, entry, INDEX_RESPONSE_BODY, chunk_size).await?;
        }
        Ok(())
    }

    async fn delete_entries(
        &self,
        entry_store: &Arc<dyn EntryStore>,
        request: &Request,
        options: QueryOptions,
    ) -> Result<()> {
        if !options.ignore_search {
            if !entry_store.doom_entry(request.cache_key()).await? {
                return Err(Error::not_found(request.cache_key()));
            }
            self.update_cache_size(entry_store).await?;
            return Ok(());
        }

        let matches = self
            .query_cache(entry_store, Some(request), options, QueryMode::RequestsOnly)
            .await?;
        let mut removed = 0usize;
        for matched in &matches {
            if entry_store.doom_entry(matched.request.cache_key()).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            self.update_cache_size(entry_store).await?;
        }
        debug!(
            "Deleted {} entries matching {} from cache '{}'",
            removed, request.url, self.inner.name
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StoreLocation;
    use crate::config::CacheStorageConfig;
    use crate::context::StorageServices;
    use cachestorage_core::{ErrorKind, Origin};
    use std::time::Duration;

    fn memory_store(quota: u64) -> CacheStore {
        let config = CacheStorageConfig::builder()
            .with_default_quota_bytes(quota)
            .build()
            .unwrap();
        CacheStore::new(
            "v1",
            Origin::parse("https://example.com").unwrap(),
            StoreLocation::Memory,
            Arc::new(StorageServices::new(config)),
        )
    }

    fn get(url: &str) -> Request {
        Request::get(url).unwrap()
    }

    #[tokio::test]
    async fn test_put_rejects_non_get() {
        let store = memory_store(1 << 20);
        let request = Request::new("POST", "https://example.com/a").unwrap();
        let err = store
            .put(request, Response::new(200, "OK"), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_put_rejects_body_on_redirect() {
        let store = memory_store(1 << 20);
        let body = store.inner.services.blobs.register_bytes(&b"x"[..]);
        let err = store
            .put(get("https://example.com/r"), Response::new(301, "Moved"), Some(body))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_unresolvable_blob_fails_without_entry() {
        let store = memory_store(1 << 20);
        let err = store
            .put(get("https://example.com/a"), Response::new(200, "OK"), Some(BlobId::new()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert!(store.keys(None, QueryOptions::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_put_over_quota_is_rejected() {
        let store = memory_store(64);
        let body = store.inner.services.blobs.register_bytes(vec![0u8; 1024]);
        let err = store
            .put(get("https://example.com/big"), Response::new(200, "OK"), Some(body))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
        assert_eq!(store.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_batch_validation() {
        let store = memory_store(1 << 20);
        let put = BatchOperation::Put {
            request: get("https://example.com/a"),
            response: Response::new(200, "OK"),
            body: None,
        };
        let delete = BatchOperation::Delete {
            request: get("https://example.com/a"),
            options: QueryOptions::default(),
        };

        let err = store
            .batch_operation(vec![put.clone(), delete.clone()])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let err = store
            .batch_operation(vec![delete.clone(), delete])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        store.batch_operation(Vec::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_batch_quota_preflight_runs_nothing() {
        let store = memory_store(100);
        let blobs = &store.inner.services.blobs;
        let operations = (0..3)
            .map(|i| BatchOperation::Put {
                request: get(&format!("https://example.com/{i}")),
                response: Response::new(200, "OK"),
                body: Some(blobs.register_bytes(vec![1u8; 40])),
            })
            .collect();

        let err = store.batch_operation(operations).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
        assert!(store.keys(None, QueryOptions::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_size_follows_mutations_and_quota() {
        let store = memory_store(1 << 20);
        let origin = store.origin().clone();
        let body = store.inner.services.blobs.register_bytes(vec![9u8; 500]);
        store
            .put(get("https://example.com/a"), Response::new(200, "OK"), Some(body))
            .await
            .unwrap();

        let size = store.size().await.unwrap();
        assert!(size > 500);
        let (usage, _) = store
            .inner
            .services
            .quota
            .get_usage_and_quota(&origin)
            .await
            .unwrap();
        assert_eq!(usage, size);

        store
            .delete(get("https://example.com/a"), QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(store.size().await.unwrap(), 0);
        let (usage, _) = store
            .inner
            .services
            .quota
            .get_usage_and_quota(&origin)
            .await
            .unwrap();
        assert_eq!(usage, 0);
    }

    #[tokio::test]
    async fn test_side_data_requires_live_entry() {
        let store = memory_store(1 << 20);
        let url = Url::parse("https://example.com/missing").unwrap();
        let err = store
            .write_side_data(url, SystemTime::now(), Bytes::from_static(b"code"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_entry_times_strictly_increase() {
        let store = memory_store(1 << 20);
        let mut previous = store.next_entry_time();
        for _ in 0..100 {
            let next = store.next_entry_time();
            assert!(next > previous);
            assert!(next.duration_since(previous).unwrap() >= Duration::from_nanos(1));
            previous = next;
        }
    }
}
