//! Cache Store: the request/response collection behind one named cache
//!
//! Every public operation is serialized through the store's own
//! [`OperationScheduler`]. The entry store is created lazily by the first
//! operation and the state machine only ever moves forward:
//! `Uninitialized -> Open -> Closed` or `Uninitialized -> Closed`.

mod lifecycle;
mod mutations;
mod query;

pub use query::CacheMatch;

use crate::backend::{EntryStore, StoreLocation};
use crate::context::StorageServices;
use crate::scheduler::OperationScheduler;
use cachestorage_core::{Error, Origin, Result};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a store's backing entry store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Uninitialized,
    Open,
    Closed,
}

/// Handle to one named cache's store. Clones share the same store.
#[derive(Clone)]
pub struct CacheStore {
    pub(crate) inner: Arc<CacheStoreInner>,
}

pub(crate) struct CacheStoreInner {
    /// Process-unique identity, keys the manager's handle counts
    pub id: u64,
    pub name: String,
    pub origin: Origin,
    pub location: StoreLocation,
    pub services: Arc<StorageServices>,
    pub scheduler: OperationScheduler,
    pub state: Mutex<StoreState>,
}

pub(crate) struct StoreState {
    pub backend_state: BackendState,
    pub entry_store: Option<Arc<dyn EntryStore>>,
    /// Aggregate entry bytes as of the last mutation
    pub cache_size: u64,
    pub initializing: bool,
    /// Last entry time handed out; entry times strictly increase
    pub last_entry_time: SystemTime,
}

impl CacheStore {
    pub(crate) fn new(
        name: impl Into<String>,
        origin: Origin,
        location: StoreLocation,
        services: Arc<StorageServices>,
    ) -> Self {
        Self {
            inner: Arc::new(CacheStoreInner {
                id: NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed),
                name: name.into(),
                origin,
                location,
                services,
                scheduler: OperationScheduler::new(),
                state: Mutex::new(StoreState {
                    backend_state: BackendState::Uninitialized,
                    entry_store: None,
                    cache_size: 0,
                    initializing: false,
                    last_entry_time: SystemTime::UNIX_EPOCH,
                }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn origin(&self) -> &Origin {
        &self.inner.origin
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn location(&self) -> &StoreLocation {
        &self.inner.location
    }

    pub fn backend_state(&self) -> BackendState {
        self.inner.state.lock().backend_state
    }

    /// Size recorded by the last completed mutation, without scheduling
    pub fn last_known_size(&self) -> u64 {
        self.inner.state.lock().cache_size
    }

    /// Schedule `operation` behind any pending work, initializing the backend
    /// first if needed. A closed store fails fast without touching the queue.
    fn schedule<F, Fut, T>(&self, operation: F) -> BoxFuture<'static, Result<T>>
    where
        F: FnOnce(CacheStore) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        if self.backend_state() == BackendState::Closed {
            let err = Error::closed(self.name());
            return Box::pin(async move { Err(err) });
        }
        self.lazy_init();
        let store = self.clone();
        Box::pin(self.inner.scheduler.submit(async move { operation(store).await }))
    }

    /// The open entry store, or a closed-backend error
    fn entry_store(&self) -> Result<Arc<dyn EntryStore>> {
        let state = self.inner.state.lock();
        match (&state.backend_state, &state.entry_store) {
            (BackendState::Open, Some(store)) => Ok(Arc::clone(store)),
            _ => Err(Error::closed(&self.inner.name)),
        }
    }

    /// Hand out an entry time strictly after every earlier one
    fn next_entry_time(&self) -> SystemTime {
        let mut state = self.inner.state.lock();
        let now = SystemTime::now();
        let entry_time = if now > state.last_entry_time {
            now
        } else {
            state.last_entry_time + std::time::Duration::from_micros(1)
        };
        state.last_entry_time = entry_time;
        entry_time
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("CacheStore")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("origin", &self.inner.origin)
            .field("backend_state", &state.backend_state)
            .field("cache_size", &state.cache_size)
            .finish()
    }
}
