//! Cached Resource Module
//!
//! Store-level fetch policy layered on top of [`RequestCache`]. A store keeps
//! the last value it loaded and skips the cache entirely while that value is
//! younger than `max_age`; older values can be served stale while a
//! background fetch revalidates them.

use std::error::Error as StdError;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::RequestCache;
use crate::error::Result;

/// Last value loaded by a store.
#[derive(Debug)]
struct Snapshot<T> {
    value: Arc<T>,
    fetched_at: Instant,
}

impl<T> Clone for Snapshot<T> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            fetched_at: self.fetched_at,
        }
    }
}

impl<T> Snapshot<T> {
    fn is_fresh(&self, max_age: Duration) -> bool {
        self.fetched_at.elapsed() < max_age
    }
}

// == Cached Resource ==
/// One store-held resource bound to a cache key.
#[derive(Debug)]
pub struct CachedResource<T> {
    key: String,
    max_age: Duration,
    snapshot: RwLock<Option<Snapshot<T>>>,
    /// Bumped on every reset; loads started in an older epoch are not kept
    epoch: AtomicU64,
}

impl<T> CachedResource<T>
where
    T: Send + Sync + 'static,
{
    pub fn new(key: impl Into<String>, max_age: Duration) -> Self {
        Self {
            key: key.into(),
            max_age,
            snapshot: RwLock::new(None),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Last loaded value, fresh or not.
    pub async fn current(&self) -> Option<Arc<T>> {
        self.snapshot
            .read()
            .await
            .as_ref()
            .map(|snapshot| Arc::clone(&snapshot.value))
    }

    pub async fn is_fresh(&self) -> bool {
        self.snapshot
            .read()
            .await
            .as_ref()
            .is_some_and(|snapshot| snapshot.is_fresh(self.max_age))
    }

    // == Load ==
    /// Returns the held value while it is younger than `max_age`, otherwise
    /// loads through the cache.
    pub async fn load<F, Fut, E>(&self, cache: &RequestCache, fetcher: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync>> + Send + 'static,
    {
        if let Some(snapshot) = self.snapshot.read().await.as_ref() {
            if snapshot.is_fresh(self.max_age) {
                debug!(key = %self.key, "resource fresh, skipping fetch");
                return Ok(Arc::clone(&snapshot.value));
            }
        }

        self.fetch_through(cache, fetcher).await
    }

    // == Refresh ==
    /// Drops the cache entry and loads again, e.g. after a mutation.
    pub async fn refresh<F, Fut, E>(&self, cache: &RequestCache, fetcher: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync>> + Send + 'static,
    {
        cache.invalidate(&self.key);
        self.fetch_through(cache, fetcher).await
    }

    // == Stale While Revalidate ==
    /// Serves the held value immediately even if it is stale.
    ///
    /// A stale value triggers a background fetch through the cache; a failed
    /// revalidation keeps the stale value. With nothing held yet, waits for
    /// the fetch.
    pub async fn load_stale_while_revalidate<F, Fut, E>(
        self: &Arc<Self>,
        cache: &RequestCache,
        fetcher: F,
    ) -> Result<Arc<T>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync>> + Send + 'static,
    {
        let held = self.snapshot.read().await.clone();

        match held {
            Some(snapshot) if snapshot.is_fresh(self.max_age) => Ok(snapshot.value),
            Some(snapshot) => {
                debug!(key = %self.key, "serving stale resource, revalidating");
                let resource = Arc::clone(self);
                let cache = cache.clone();
                tokio::spawn(async move {
                    if let Err(err) = resource.fetch_through(&cache, fetcher).await {
                        warn!(key = %resource.key, error = %err, "revalidation failed");
                    }
                });
                Ok(snapshot.value)
            }
            None => self.fetch_through(cache, fetcher).await,
        }
    }

    // == Reset ==
    /// Forgets the held value, e.g. on sign-out.
    ///
    /// Loads still in flight complete for their callers but are not kept.
    pub async fn reset(&self) {
        let mut snapshot = self.snapshot.write().await;
        self.epoch.fetch_add(1, Ordering::SeqCst);
        *snapshot = None;
    }

    async fn fetch_through<F, Fut, E>(&self, cache: &RequestCache, fetcher: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync>> + Send + 'static,
    {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let value = cache.get(&self.key, fetcher).await?;

        let mut snapshot = self.snapshot.write().await;
        if self.epoch.load(Ordering::SeqCst) == epoch {
            *snapshot = Some(Snapshot {
                value: Arc::clone(&value),
                fetched_at: Instant::now(),
            });
        } else {
            debug!(key = %self.key, "resource reset during fetch, result not kept");
        }
        Ok(value)
    }
}
