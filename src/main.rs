//! Request Cache demo driver
//!
//! Replays a short client session against an in-process fake backend and
//! logs how many backend calls the cache saved.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use request_cache::{keys, spawn_cleanup_task, CachedResource, Config, RequestCache};

/// Stand-in for the hosted backend; counts round trips.
#[derive(Debug, Default)]
struct FakeBackend {
    calls: AtomicUsize,
}

impl FakeBackend {
    async fn user_campaigns(&self, user_id: u32) -> anyhow::Result<Vec<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;
        Ok(vec![
            format!("Curse of the Pale Keep ({user_id})"),
            format!("Sunken Vault ({user_id})"),
        ])
    }

    async fn profile(&self, user_id: u32) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(format!("adventurer-{user_id}"))
    }

    fn round_trips(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "request_cache=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    info!(
        "Configuration loaded: ttl={}ms, cleanup_interval={}s, resource_max_age={}s",
        config.ttl_ms, config.cleanup_interval, config.resource_max_age
    );

    let cache = RequestCache::from_config(&config);
    let cleanup_handle = spawn_cleanup_task(cache.clone(), config.cleanup_interval());
    let backend = Arc::new(FakeBackend::default());
    let user_id = 7;

    // Several views mount at once and all ask for the campaign list
    let campaigns_key = keys::scoped(keys::USER_CAMPAIGNS, user_id);
    let loads = (0..10).map(|_| {
        let backend = Arc::clone(&backend);
        cache.get(&campaigns_key, move || async move {
            backend.user_campaigns(user_id).await
        })
    });
    for campaigns in join_all(loads).await {
        let campaigns = campaigns?;
        info!(count = campaigns.len(), "campaign list loaded");
    }

    let profile = CachedResource::new(
        keys::scoped(keys::PROFILE, user_id),
        config.resource_max_age(),
    );
    for _ in 0..3 {
        let backend = Arc::clone(&backend);
        let name = profile
            .load(&cache, move || async move { backend.profile(user_id).await })
            .await?;
        info!(%name, "profile loaded");
    }

    // Creating a campaign changes every campaign list
    let removed = cache.invalidate_pattern(&keys::family_pattern(keys::USER_CAMPAIGNS));
    info!(removed, "campaign lists invalidated after mutation");

    // Sign-out
    cache.clear();
    profile.reset().await;

    info!(
        backend_round_trips = backend.round_trips(),
        stats = %serde_json::to_string(&cache.stats())?,
        "session replay complete"
    );

    cleanup_handle.abort();
    Ok(())
}
