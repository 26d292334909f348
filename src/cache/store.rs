//! Cache Store Module
//!
//! Keyed request de-duplication: concurrent or rapidly repeated fetches for the
//! same key share one operation while that operation is fresh.

use std::any::{type_name, Any};
use std::error::Error as StdError;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::channel::oneshot;
use futures::FutureExt;
use regex::Regex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::entry::{CacheEntry, EntryState, Operation, Outcome, Payload};
use crate::cache::{CacheStats, StatsRecorder, DEFAULT_TTL};
use crate::config::Config;
use crate::error::{CacheError, FetchFailure, Result};

// == Request Cache ==
/// Process-wide, keyed, time-bounded memoizer for asynchronous fetches.
///
/// Clones share the same entries, so one instance is built at startup and
/// handed to every store that needs it.
#[derive(Debug, Clone)]
pub struct RequestCache {
    /// Registered operations by key
    entries: Arc<DashMap<String, CacheEntry>>,
    /// Shared counters
    stats: Arc<StatsRecorder>,
    /// Source of entry generations
    next_generation: Arc<AtomicU64>,
    /// Freshness window applied by `get`
    ttl: Duration,
}

impl RequestCache {
    // == Constructor ==
    /// Creates an empty cache whose entries stay fresh for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            stats: Arc::new(StatsRecorder::new()),
            next_generation: Arc::new(AtomicU64::new(0)),
            ttl,
        }
    }

    /// Creates a cache using the TTL from the configuration.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.ttl())
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    // == Get ==
    /// Returns the fresh operation registered under `key`, or registers a new
    /// one produced by `fetcher`.
    ///
    /// Registration happens when `get` is called, before the returned future
    /// is polled. Every caller that arrives while the entry is fresh shares
    /// the same result, success or failure. A failed operation removes its
    /// entry before the error is delivered, so the next call retries.
    ///
    /// The fetcher runs as a tokio task, so this must be called from within a
    /// runtime.
    pub fn get<T, F, Fut, E>(
        &self,
        key: &str,
        fetcher: F,
    ) -> impl Future<Output = Result<Arc<T>>> + Send + 'static
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync>> + Send + 'static,
    {
        self.get_with_ttl(key, self.ttl, fetcher)
    }

    /// Same as [`get`](Self::get), with a TTL for a newly registered entry.
    ///
    /// A fresh existing entry keeps the TTL it was registered with.
    pub fn get_with_ttl<T, F, Fut, E>(
        &self,
        key: &str,
        ttl: Duration,
        fetcher: F,
    ) -> impl Future<Output = Result<Arc<T>>> + Send + 'static
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync>> + Send + 'static,
    {
        let operation = self.acquire(key, ttl, fetcher);
        let key = key.to_owned();

        async move {
            let payload = operation.await?;
            payload
                .downcast::<T>()
                .map_err(|_| CacheError::TypeMismatch {
                    key,
                    expected: type_name::<T>(),
                })
        }
    }

    /// Check-then-insert under the shard lock; the fetch is spawned only
    /// after the lock is released.
    fn acquire<T, F, Fut, E>(&self, key: &str, ttl: Duration, fetcher: F) -> Operation
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync>> + Send + 'static,
    {
        let now = Instant::now();

        let (operation, fetch) = {
            let slot = self.entries.entry(key.to_owned());

            if let Entry::Occupied(occupied) = &slot {
                let existing = occupied.get();
                if existing.is_fresh(now) {
                    self.stats.record_hit();
                    debug!(
                        key,
                        generation = existing.generation,
                        ttl_remaining = ?existing.ttl_remaining(now),
                        "request cache hit"
                    );
                    return existing.operation.clone();
                }
            }

            self.stats.record_miss();
            let (entry, fetch) = self.prepare_operation(key, ttl, fetcher);
            let operation = entry.operation.clone();
            debug!(key, generation = entry.generation, "request cache miss, fetching");
            slot.insert(entry);
            (operation, fetch)
        };

        tokio::spawn(fetch);
        operation
    }

    /// Builds the entry and the fetch task that settles it.
    ///
    /// The task reports through a oneshot channel. If the task is dropped
    /// before settling (runtime shutdown), the sender is dropped with it and
    /// every sharing caller observes `Aborted`.
    fn prepare_operation<T, F, Fut, E>(
        &self,
        key: &str,
        ttl: Duration,
        fetcher: F,
    ) -> (CacheEntry, impl Future<Output = ()> + Send + 'static)
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync>> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel::<Outcome>();
        let mut registration = Registration {
            entries: Arc::clone(&self.entries),
            stats: Arc::clone(&self.stats),
            key: key.to_owned(),
            generation,
            settled: false,
        };

        let fetch = async move {
            let settled = AssertUnwindSafe(async move { fetcher().await })
                .catch_unwind()
                .await;

            let outcome = match settled {
                Ok(Ok(value)) => {
                    registration.settled = true;
                    Ok(Arc::new(value) as Payload)
                }
                Ok(Err(source)) => {
                    let boxed: Box<dyn StdError + Send + Sync> = source.into();
                    let source: FetchFailure = Arc::from(boxed);
                    Err(CacheError::Fetch {
                        key: registration.key.clone(),
                        source,
                    })
                }
                Err(panic) => Err(CacheError::Aborted {
                    key: registration.key.clone(),
                    reason: panic_message(panic.as_ref()),
                }),
            };

            if let Err(err) = &outcome {
                warn!(key = %registration.key, error = %err, "request cache fetch failed");
                registration.release();
            }

            // Every caller may have stopped waiting
            let _ = sender.send(outcome);
        };

        let entries = Arc::clone(&self.entries);
        let operation_key = key.to_owned();
        let operation = async move {
            match receiver.await {
                Ok(outcome) => outcome,
                Err(oneshot::Canceled) => {
                    entries.remove_if(&operation_key, |_, entry| entry.generation == generation);
                    Err(CacheError::Aborted {
                        key: operation_key,
                        reason: "fetch task was cancelled".to_string(),
                    })
                }
            }
        }
        .boxed()
        .shared();

        (CacheEntry::new(operation, ttl, generation), fetch)
    }

    // == Invalidate ==
    /// Removes the entry for `key`. Returns whether one was present.
    pub fn invalidate(&self, key: &str) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.stats.record_invalidations(1);
            debug!(key, "request cache entry invalidated");
        }
        removed
    }

    // == Invalidate Pattern ==
    /// Removes every entry whose key matches `pattern`.
    ///
    /// Returns the number of entries removed.
    pub fn invalidate_pattern(&self, pattern: &Regex) -> usize {
        let removed = self.remove_where(|key| pattern.is_match(key));
        debug!(pattern = %pattern, removed, "request cache pattern invalidated");
        removed
    }

    /// Removes every entry whose key starts with `prefix`.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let removed = self.remove_where(|key| key.starts_with(prefix));
        debug!(prefix, removed, "request cache prefix invalidated");
        removed
    }

    // == Clear ==
    /// Removes all entries unconditionally.
    pub fn clear(&self) {
        let removed = self.remove_where(|_| true);
        debug!(removed, "request cache cleared");
    }

    fn remove_where(&self, mut matches: impl FnMut(&str) -> bool) -> usize {
        let mut removed = 0;
        self.entries.retain(|key, _| {
            let hit = matches(key.as_str());
            if hit {
                removed += 1;
            }
            !hit
        });
        self.stats.record_invalidations(removed);
        removed
    }

    // == Purge Expired ==
    /// Removes all entries older than their TTL, pending ones included.
    ///
    /// Stale entries are never served, so this only reclaims memory.
    /// Returns the number of entries removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let fresh = entry.is_fresh(now);
            if !fresh {
                removed += 1;
            }
            fresh
        });
        removed
    }

    // == Inspection ==
    /// True if `get(key, ..)` would be served without invoking a fetcher.
    pub fn contains_fresh(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .get(key)
            .is_some_and(|entry| entry.is_fresh(now))
    }

    /// Lifecycle state of the entry under `key`, if any.
    pub fn entry_state(&self, key: &str) -> Option<EntryState> {
        let now = Instant::now();
        self.entries.get(key).map(|entry| entry.state(now))
    }

    /// Number of registered entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot(self.entries.len())
    }
}

impl Default for RequestCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

/// Removes its entry unless the fetch succeeded.
///
/// Owned by the fetch task, so a task dropped by runtime shutdown, polled or
/// not, releases its key just like a failed one.
struct Registration {
    entries: Arc<DashMap<String, CacheEntry>>,
    stats: Arc<StatsRecorder>,
    key: String,
    generation: u64,
    settled: bool,
}

impl Registration {
    fn release(&mut self) {
        if self.settled {
            return;
        }
        self.settled = true;
        // Only the entry this task registered; a newer one may have replaced it
        let generation = self.generation;
        self.entries
            .remove_if(&self.key, |_, entry| entry.generation == generation);
        self.stats.record_failure();
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if !self.settled {
            warn!(key = %self.key, "request cache fetch cancelled");
            self.release();
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "fetcher panicked".to_string()
    }
}
