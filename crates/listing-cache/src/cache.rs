use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use clouddisk_api::{EndpointError, FolderListing};
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::store::BoundedMap;

/// Cache key: a folder id, `None` for the root folder.
pub type FolderKey = Option<i64>;

type FetchResult = Result<FolderListing, EndpointError>;
type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

/// What concurrent misses for the same folder do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissPolicy {
    /// Every caller fetches on its own; the last write wins.
    Independent,
    /// One fetch per folder is in flight; later callers wait for it.
    #[default]
    Coalesce,
}

/// A listing replaced by a background refresh of the viewed folder.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshedListing {
    pub key: FolderKey,
    pub listing: FolderListing,
}

struct State {
    entries: BoundedMap<FolderKey, FolderListing>,
    inflight: HashMap<FolderKey, SharedFetch>,
    viewing: Option<FolderKey>,
}

struct Inner {
    state: Mutex<State>,
    policy: MissPolicy,
    refresh_tx: mpsc::UnboundedSender<RefreshedListing>,
    refresh_rx: Mutex<Option<mpsc::UnboundedReceiver<RefreshedListing>>>,
}

/// Bounded folder listing cache.
///
/// Cloning is cheap; clones share the same entries.
#[derive(Clone)]
pub struct ListingCache {
    inner: Arc<Inner>,
}

enum Plan<Fut> {
    Hit(FolderListing, Fut),
    Fetch(Fut),
    Join(SharedFetch),
}

impl ListingCache {
    pub fn new(capacity: usize, policy: MissPolicy) -> Self {
        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    entries: BoundedMap::new(capacity),
                    inflight: HashMap::new(),
                    viewing: None,
                }),
                policy,
                refresh_tx,
                refresh_rx: Mutex::new(Some(refresh_rx)),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn policy(&self) -> MissPolicy {
        self.inner.policy
    }

    pub fn capacity(&self) -> usize {
        self.state().entries.capacity()
    }

    /// Cached listing for `key`, without fetching.
    pub fn get(&self, key: FolderKey) -> Option<FolderListing> {
        self.state().entries.get(&key).cloned()
    }

    /// Stores `listing`, evicting the oldest folder when full.
    pub fn put(&self, key: FolderKey, listing: FolderListing) {
        if let Some((evicted, _)) = self.state().entries.insert(key, listing) {
            debug!(folder = ?evicted, "listing evicted");
        }
    }

    /// Drops the cached listing of `key` and forgets any fetch in flight
    /// for it, so that fetch's result is not stored.
    pub fn invalidate(&self, key: FolderKey) -> bool {
        let mut state = self.state();
        state.inflight.remove(&key);
        let removed = state.entries.remove(&key).is_some();
        if removed {
            debug!(folder = ?key, "listing invalidated");
        }
        removed
    }

    pub fn clear(&self) {
        let mut state = self.state();
        state.entries.clear();
        state.inflight.clear();
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().entries.is_empty()
    }

    /// Cached folders from oldest to newest.
    pub fn keys(&self) -> Vec<FolderKey> {
        self.state().entries.keys().copied().collect()
    }

    /// Records which folder is on screen. Background refreshes of that
    /// folder are pushed to the refresh channel.
    pub fn set_viewing(&self, key: FolderKey) {
        self.state().viewing = Some(key);
    }

    pub fn clear_viewing(&self) {
        self.state().viewing = None;
    }

    pub fn viewing(&self) -> Option<FolderKey> {
        self.state().viewing
    }

    /// Takes the refresh channel receiver. Only the first call returns it.
    pub fn take_refreshes(&self) -> Option<mpsc::UnboundedReceiver<RefreshedListing>> {
        self.inner
            .refresh_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Returns the listing of `key`.
    ///
    /// On a hit the cached value is returned at once and `fetch` runs in the
    /// background to refresh it. On a miss `fetch` is awaited and its result
    /// stored. `fetch` is called exactly once; its future is only polled when
    /// a fetch is actually needed.
    pub async fn get_or_fetch<F, Fut>(&self, key: FolderKey, fetch: F) -> FetchResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FetchResult> + Send + 'static,
    {
        let fut = fetch();
        let plan = {
            let mut state = self.state();
            if let Some(listing) = state.entries.get(&key) {
                Plan::Hit(listing.clone(), fut)
            } else {
                match self.inner.policy {
                    MissPolicy::Independent => Plan::Fetch(fut),
                    MissPolicy::Coalesce => {
                        let shared = match state.inflight.get(&key) {
                            Some(shared) => shared.clone(),
                            None => {
                                let shared = fut.boxed().shared();
                                state.inflight.insert(key, shared.clone());
                                shared
                            }
                        };
                        Plan::Join(shared)
                    }
                }
            }
        };

        match plan {
            Plan::Hit(listing, fut) => {
                debug!(folder = ?key, "listing cache hit");
                self.spawn_refresh(key, fut);
                Ok(listing)
            }
            Plan::Fetch(fut) => {
                debug!(folder = ?key, "listing cache miss");
                let listing = fut.await?;
                self.put(key, listing.clone());
                Ok(listing)
            }
            Plan::Join(shared) => {
                debug!(folder = ?key, "listing cache miss");
                let result = shared.clone().await;

                // The first waiter to finish retires the fetch and stores it.
                let mut state = self.state();
                if state.inflight.get(&key).is_some_and(|s| s.ptr_eq(&shared)) {
                    state.inflight.remove(&key);
                    if let Ok(listing) = &result {
                        if let Some((evicted, _)) = state.entries.insert(key, listing.clone()) {
                            debug!(folder = ?evicted, "listing evicted");
                        }
                    }
                }
                result
            }
        }
    }

    fn spawn_refresh<Fut>(&self, key: FolderKey, fut: Fut)
    where
        Fut: Future<Output = FetchResult> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            match fut.await {
                Ok(listing) => {
                    let notify = {
                        let mut state = inner.state.lock().unwrap_or_else(PoisonError::into_inner);
                        state.entries.replace(&key, listing.clone()) && state.viewing == Some(key)
                    };
                    debug!(folder = ?key, notify, "listing refreshed");
                    if notify {
                        let _ = inner.refresh_tx.send(RefreshedListing { key, listing });
                    }
                }
                Err(e) => {
                    warn!(folder = ?key, error = %e, "background listing refresh failed");
                }
            }
        });
    }
}
