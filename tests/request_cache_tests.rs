//! Integration Tests for the Request Cache
//!
//! Exercises the public API end to end: de-duplication, TTL expiry,
//! failure handling and invalidation.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, BoxFuture, FutureExt};
use regex::Regex;
use request_cache::cache::EntryState;
use request_cache::{keys, CacheError, RequestCache};
use tokio_test::{assert_err, assert_ok};

const TTL: Duration = Duration::from_secs(30);

// == Helper Functions ==

type Fetched<T> = BoxFuture<'static, Result<T, BackendError>>;

#[derive(Debug, Clone, PartialEq)]
struct BackendError(String);

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "backend error: {}", self.0)
    }
}

impl std::error::Error for BackendError {}

/// Fetcher that counts invocations and resolves to `value` after `delay`.
fn fetch_after<T: Send + 'static>(
    calls: &Arc<AtomicUsize>,
    delay: Duration,
    value: T,
) -> impl FnOnce() -> Fetched<T> + Send + 'static {
    let calls = Arc::clone(calls);
    move || {
        calls.fetch_add(1, Ordering::SeqCst);
        async move {
            tokio::time::sleep(delay).await;
            Ok(value)
        }
        .boxed()
    }
}

fn fetch<T: Send + 'static>(
    calls: &Arc<AtomicUsize>,
    value: T,
) -> impl FnOnce() -> Fetched<T> + Send + 'static {
    fetch_after(calls, Duration::ZERO, value)
}

fn fail_after(
    calls: &Arc<AtomicUsize>,
    delay: Duration,
    message: &str,
) -> impl FnOnce() -> Fetched<String> + Send + 'static {
    let calls = Arc::clone(calls);
    let message = message.to_string();
    move || {
        calls.fetch_add(1, Ordering::SeqCst);
        async move {
            tokio::time::sleep(delay).await;
            Err(BackendError(message))
        }
        .boxed()
    }
}

fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

// == De-duplication ==

#[tokio::test(start_paused = true)]
async fn test_two_calls_before_settlement_share_one_fetch() {
    let cache = RequestCache::new(TTL);
    let calls = counter();

    let first = cache.get("k", fetch_after(&calls, Duration::from_millis(100), 1u32));
    let second = cache.get("k", fetch_after(&calls, Duration::from_millis(100), 2u32));

    let (first, second) = tokio::join!(first, second);
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(*first, 1);
    assert!(Arc::ptr_eq(&first, &second));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_burst_invokes_fetcher_once() {
    let cache = RequestCache::new(TTL);
    let calls = counter();

    let pending: Vec<_> = (0..10)
        .map(|i| {
            cache.get(
                "user-campaigns:1",
                fetch_after(&calls, Duration::from_millis(250), format!("value-{i}")),
            )
        })
        .collect();

    let results = join_all(pending).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(results.len(), 10);
    for result in results {
        assert_eq!(result.unwrap().as_str(), "value-0");
    }
    assert_eq!(cache.stats().hits, 9);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_burst_across_worker_threads_invokes_fetcher_once() {
    let cache = RequestCache::new(TTL);
    let calls = counter();

    let handles: Vec<_> = (0..32)
        .map(|_| {
            let cache = cache.clone();
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                cache
                    .get("lookup-tables", fetch_after(&calls, Duration::from_millis(50), 42u64))
                    .await
            })
        })
        .collect();

    for handle in join_all(handles).await {
        assert_eq!(*handle.unwrap().unwrap(), 42);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_independent_keys_do_not_interact() {
    let cache = RequestCache::new(TTL);
    let calls_a = counter();
    let calls_b = counter();

    let b = cache.get("b", fetch(&calls_b, "bee"));
    let a = cache.get("a", fetch(&calls_a, "ay"));
    let (a, b) = tokio::join!(a, b);

    assert_eq!(*a.unwrap(), "ay");
    assert_eq!(*b.unwrap(), "bee");
    assert_eq!(calls_a.load(Ordering::SeqCst), 1);
    assert_eq!(calls_b.load(Ordering::SeqCst), 1);
}

// == TTL ==

#[tokio::test(start_paused = true)]
async fn test_expired_entry_is_refetched_not_redelivered() {
    let cache = RequestCache::new(TTL);
    let calls = counter();

    let first = cache.get("k", fetch(&calls, "a")).await.unwrap();
    tokio::time::advance(TTL + Duration::from_millis(1)).await;
    let second = cache.get("k", fetch(&calls, "b")).await.unwrap();

    assert_eq!(*first, "a");
    assert_eq!(*second, "b");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_entry_served_until_just_before_ttl() {
    let cache = RequestCache::new(TTL);
    let calls = counter();

    cache.get("k", fetch(&calls, "a")).await.unwrap();
    tokio::time::advance(TTL - Duration::from_millis(1)).await;
    let value = cache.get("k", fetch(&calls, "b")).await.unwrap();

    assert_eq!(*value, "a");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_fresh_entry_keeps_its_registered_ttl() {
    let cache = RequestCache::new(TTL);
    let calls = counter();

    let short = Duration::from_secs(10);
    cache
        .get_with_ttl("lookup-tables", short, fetch(&calls, 1u8))
        .await
        .unwrap();

    // A longer TTL on a hit does not extend the existing entry
    let hit = cache
        .get_with_ttl("lookup-tables", Duration::from_secs(600), fetch(&calls, 2u8))
        .await
        .unwrap();
    assert_eq!(*hit, 1);

    tokio::time::advance(short).await;
    assert!(!cache.contains_fresh("lookup-tables"));

    let refetched = cache
        .get_with_ttl("lookup-tables", Duration::from_secs(600), fetch(&calls, 3u8))
        .await
        .unwrap();
    assert_eq!(*refetched, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // The replacement carries the TTL it was registered with
    tokio::time::advance(Duration::from_secs(300)).await;
    assert!(cache.contains_fresh("lookup-tables"));
}

#[tokio::test(start_paused = true)]
async fn test_stale_pending_entry_is_replaced() {
    let cache = RequestCache::new(TTL);
    let calls = counter();

    // Outlives its own TTL before settling
    let slow = cache.get("k", fetch_after(&calls, TTL * 2, "slow"));
    tokio::time::advance(TTL).await;
    let fast = cache.get("k", fetch(&calls, "fast"));

    let (slow, fast) = tokio::join!(slow, fast);
    assert_eq!(*slow.unwrap(), "slow");
    assert_eq!(*fast.unwrap(), "fast");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

// == Failures ==

#[tokio::test]
async fn test_failure_is_not_cached() {
    let cache = RequestCache::new(TTL);
    let failing_calls = counter();
    let calls = counter();

    let err = assert_err!(
        cache
            .get("k", fail_after(&failing_calls, Duration::ZERO, "offline"))
            .await
    );
    assert_eq!(
        err.fetch_error::<BackendError>(),
        Some(&BackendError("offline".to_string()))
    );

    let value = assert_ok!(cache.get("k", fetch(&calls, "ok".to_string())).await);
    assert_eq!(value.as_str(), "ok");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.stats().failures, 1);
}

#[tokio::test(start_paused = true)]
async fn test_sharing_callers_all_observe_the_failure() {
    let cache = RequestCache::new(TTL);
    let calls = counter();

    let pending: Vec<_> = (0..5)
        .map(|_| cache.get("k", fail_after(&calls, Duration::from_millis(10), "denied")))
        .collect();

    for result in join_all(pending).await {
        let err = result.unwrap_err();
        assert!(matches!(err, CacheError::Fetch { .. }));
        assert!(err.fetch_error::<BackendError>().is_some());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(cache.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_old_failure_does_not_evict_newer_entry() {
    let cache = RequestCache::new(TTL);
    let failing_calls = counter();
    let calls = counter();

    let doomed = cache.get("k", fail_after(&failing_calls, Duration::from_millis(100), "late"));
    cache.invalidate("k");
    let fresh = cache.get("k", fetch(&calls, "new".to_string())).await.unwrap();

    assert!(doomed.await.is_err());
    assert_eq!(fresh.as_str(), "new");
    assert!(cache.contains_fresh("k"));

    let again = cache.get("k", fetch(&calls, "other".to_string())).await.unwrap();
    assert_eq!(again.as_str(), "new");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_fetch_cancelled_by_runtime_shutdown_is_not_cached() {
    let cache = RequestCache::new(TTL);
    let calls = counter();

    let first = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let orphaned = first.block_on(async {
        let pending = cache.get("k", fetch_after(&calls, Duration::from_secs(3600), 1u32));
        tokio::task::yield_now().await;
        pending
    });
    // Shutdown drops the fetch task before it settles
    drop(first);

    assert!(cache.is_empty());
    assert_eq!(cache.stats().failures, 1);

    let second = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let before = calls.load(Ordering::SeqCst);
    let value = second
        .block_on(async { cache.get("k", fetch(&calls, 2u32)).await })
        .unwrap();

    assert_eq!(*value, 2);
    assert_eq!(calls.load(Ordering::SeqCst), before + 1);

    // The orphaned caller sees the cancellation without evicting the new entry
    let err = second.block_on(orphaned).unwrap_err();
    assert!(matches!(err, CacheError::Aborted { .. }));
    assert_eq!(err.key(), "k");
    assert!(cache.contains_fresh("k"));
}

#[tokio::test]
async fn test_dropped_callers_do_not_cancel_the_fetch() {
    let cache = RequestCache::new(TTL);
    let calls = counter();

    drop(cache.get("k", fetch_after(&calls, Duration::from_millis(10), 5u8)));
    let value = cache.get("k", fetch(&calls, 6u8)).await.unwrap();

    assert_eq!(*value, 5);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// == Invalidation ==

#[tokio::test]
async fn test_invalidate_forces_refetch() {
    let cache = RequestCache::new(TTL);
    let calls = counter();

    cache.get("k", fetch(&calls, 1u8)).await.unwrap();
    assert!(cache.invalidate("k"));
    cache.get("k", fetch(&calls, 1u8)).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_invalidate_pattern_matches_by_key() {
    let cache = RequestCache::new(TTL);
    let calls = counter();

    for key in ["user-campaigns:1", "user-campaigns:2", "profile:1"] {
        cache.get(key, fetch(&calls, key.to_string())).await.unwrap();
    }

    let removed = cache.invalidate_pattern(&Regex::new("^user-campaigns:").unwrap());
    assert_eq!(removed, 2);
    assert!(!cache.contains_fresh("user-campaigns:1"));
    assert!(!cache.contains_fresh("user-campaigns:2"));

    let profile = cache
        .get("profile:1", fetch(&calls, "refetched".to_string()))
        .await
        .unwrap();
    assert_eq!(profile.as_str(), "profile:1");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_clear_empties_unconditionally() {
    let cache = RequestCache::new(TTL);
    let calls = counter();

    cache.get(&keys::scoped(keys::PROFILE, 1), fetch(&calls, 1u32)).await.unwrap();
    cache.get(keys::LOOKUP_TABLES, fetch(&calls, 2u32)).await.unwrap();
    tokio::time::advance(TTL).await;
    cache
        .get(&keys::scoped(keys::CAMPAIGN_MEMBERS, 9), fetch(&calls, 3u32))
        .await
        .unwrap();
    let pending = cache.get(
        &keys::scoped(keys::INVITATIONS, 9),
        fetch_after(&calls, Duration::from_secs(1), 4u32),
    );
    assert_eq!(
        cache.entry_state(&keys::scoped(keys::INVITATIONS, 9)),
        Some(EntryState::Pending)
    );

    cache.clear();
    assert!(cache.is_empty());
    assert_eq!(*pending.await.unwrap(), 4);

    let before = calls.load(Ordering::SeqCst);
    for key in [
        keys::scoped(keys::PROFILE, 1),
        keys::LOOKUP_TABLES.to_string(),
        keys::scoped(keys::CAMPAIGN_MEMBERS, 9),
        keys::scoped(keys::INVITATIONS, 9),
    ] {
        cache.get(&key, fetch(&calls, 0u32)).await.unwrap();
    }
    assert_eq!(calls.load(Ordering::SeqCst), before + 4);
}

#[tokio::test]
async fn test_clones_share_entries() {
    let cache = RequestCache::new(TTL);
    let store_view = cache.clone();
    let calls = counter();

    cache.get("profile:1", fetch(&calls, 1u8)).await.unwrap();
    store_view.get("profile:1", fetch(&calls, 2u8)).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    store_view.clear();
    assert!(cache.is_empty());
}
