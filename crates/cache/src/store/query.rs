//! Match, MatchAll and Keys, plus the query walk they share

use super::CacheStore;
use crate::backend::{read_stream, Entry, EntryStore};
use crate::blob::BlobHandle;
use crate::metadata::EntryMetadata;
use cachestorage_core::{
    strip_query, Error, Headers, QueryOptions, Request, Response, Result, INDEX_HEADERS,
    INDEX_RESPONSE_BODY, INDEX_SIDE_DATA,
};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, warn};
use url::Url;

/// A matched entry
#[derive(Debug, Clone)]
pub struct CacheMatch {
    pub request: Request,
    pub response: Response,
    /// Body handle, absent for an empty body
    pub body: Option<BlobHandle>,
    /// Side-data handle, absent when none was written
    pub side_data: Option<BlobHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum QueryMode {
    RequestsOnly,
    RequestsAndResponses,
}

pub(super) struct QueryResult {
    pub request: Request,
    pub response: Option<Response>,
    pub entry: Arc<dyn Entry>,
    pub entry_time: SystemTime,
}

impl QueryResult {
    /// Open body and side-data handles for a result carrying a response
    async fn into_match(self) -> Result<CacheMatch> {
        let response = self.response.ok_or_else(|| {
            Error::storage("match", format!("no response loaded for {}", self.entry.key()))
        })?;
        Ok(CacheMatch {
            body: entry_blob(&self.entry, INDEX_RESPONSE_BODY).await?,
            side_data: entry_blob(&self.entry, INDEX_SIDE_DATA).await?,
            request: self.request,
            response,
        })
    }
}

impl CacheStore {
    /// First entry matching `request`, oldest entry winning
    pub async fn match_request(
        &self,
        request: Request,
        options: QueryOptions,
    ) -> Result<CacheMatch> {
        self.schedule(move |store| async move {
            let entry_store = store.entry_store()?;
            let results = store
                .query_cache(
                    &entry_store,
                    Some(&request),
                    options,
                    QueryMode::RequestsAndResponses,
                )
                .await?;
            let first = results.into_iter().next();
            match first {
                Some(result) => result.into_match().await,
                None => Err(Error::not_found(request.url.as_str())),
            }
        })
        .await
    }

    /// Every entry matching `request`, or every entry when `request` is `None`
    pub async fn match_all(
        &self,
        request: Option<Request>,
        options: QueryOptions,
    ) -> Result<Vec<CacheMatch>> {
        self.schedule(move |store| async move {
            let entry_store = store.entry_store()?;
            let results = store
                .query_cache(
                    &entry_store,
                    request.as_ref(),
                    options,
                    QueryMode::RequestsAndResponses,
                )
                .await?;
            let mut matches = Vec::with_capacity(results.len());
            for result in results {
                matches.push(result.into_match().await?);
            }
            Ok(matches)
        })
        .await
    }

    /// Requests of every matching entry
    pub async fn keys(
        &self,
        request: Option<Request>,
        options: QueryOptions,
    ) -> Result<Vec<Request>> {
        self.schedule(move |store| async move {
            let entry_store = store.entry_store()?;
            let results = store
                .query_cache(&entry_store, request.as_ref(), options, QueryMode::RequestsOnly)
                .await?;
            Ok(results.into_iter().map(|result| result.request).collect())
        })
        .await
    }

    /// Walk the entry store for entries matching `request`.
    ///
    /// Runs inside a scheduled operation. Entries whose metadata cannot be
    /// decoded are doomed on the way.
    pub(super) async fn query_cache(
        &self,
        entry_store: &Arc<dyn EntryStore>,
        request: Option<&Request>,
        options: QueryOptions,
        mode: QueryMode,
    ) -> Result<Vec<QueryResult>> {
        if let Some(request) = request {
            if !options.ignore_method && !request.is_get() {
                return Ok(Vec::new());
            }
        }

        let fast_path = request.filter(|_| !options.ignore_search);
        let candidates: Vec<Arc<dyn Entry>> = match fast_path {
            Some(request) => entry_store
                .open_entry(request.cache_key())
                .await?
                .into_iter()
                .collect(),
            None => {
                let mut iter = entry_store.iterate().await?;
                let mut entries = Vec::new();
                while let Some(entry) = iter.next_entry().await? {
                    entries.push(entry);
                }
                entries
            }
        };

        let limit = self.inner.services.config.max_query_result_bytes;
        let stripped_target = request.map(Request::url_without_query);
        let mut estimated = 0u64;
        let mut doomed_any = false;
        let mut results = Vec::new();

        for entry in candidates {
            if let Some(request) = request {
                let url_matches = if options.ignore_search {
                    stripped_target.as_deref() == stripped_key(entry.key()).as_deref()
                } else {
                    entry.key() == request.cache_key()
                };
                if !url_matches {
                    continue;
                }
            }

            let raw = read_stream(entry.as_ref(), INDEX_HEADERS).await?;
            let metadata = match EntryMetadata::decode(&raw) {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!(
                        "Dooming corrupt entry {} in cache '{}': {}",
                        entry.key(),
                        self.inner.name,
                        e
                    );
                    entry_store.doom_entry(entry.key()).await?;
                    doomed_any = true;
                    continue;
                }
            };

            let cached_request = match metadata.to_request(entry.key()) {
                Ok(cached_request) => cached_request,
                Err(e) => {
                    debug!("Skipping entry with unusable key {}: {}", entry.key(), e);
                    continue;
                }
            };

            if let Some(request) = request {
                if !options.ignore_vary
                    && !vary_matches(&metadata.response, &request.headers, &cached_request.headers)
                {
                    continue;
                }
            }

            estimated += cached_request.estimated_size();
            let response = match mode {
                QueryMode::RequestsAndResponses => {
                    estimated += metadata.response.estimated_size();
                    Some(metadata.response)
                }
                QueryMode::RequestsOnly => None,
            };

            if estimated > limit {
                return Err(Error::query_too_large(estimated, limit));
            }
            results.push(QueryResult {
                request: cached_request,
                response,
                entry,
                entry_time: metadata.entry_time,
            });
        }

        if doomed_any {
            self.update_cache_size(entry_store).await?;
        }

        if fast_path.is_none() {
            results.sort_by_key(|result| result.entry_time);
        }
        Ok(results)
    }
}

/// Handle for a non-empty stream of `entry`
async fn entry_blob(entry: &Arc<dyn Entry>, index: usize) -> Result<Option<BlobHandle>> {
    if entry.data_size(index).await? == 0 {
        return Ok(None);
    }
    Ok(Some(BlobHandle::from_entry(Arc::clone(entry), index).await?))
}

fn stripped_key(key: &str) -> Option<String> {
    Url::parse(key).ok().map(|url| strip_query(&url))
}

/// True if the cached response's `Vary` headers agree between the two requests
fn vary_matches(cached_response: &Response, request: &Headers, cached_request: &Headers) -> bool {
    let Some(vary) = cached_response.headers.get("Vary") else {
        return true;
    };
    for name in vary.split(',').map(str::trim).filter(|name| !name.is_empty()) {
        if name == "*" {
            return false;
        }
        if request.get(name) != cached_request.get(name) {
            return false;
        }
    }
    true
}
