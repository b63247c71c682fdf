//! Short-lived cache of provider health results.
//!
//! Health probes hit the network; callers listing providers repeatedly
//! reuse a result until its TTL expires.

use moka::future::Cache;
use std::future::Future;
use std::time::Duration;

/// Health results keyed by provider instance name.
#[derive(Clone)]
pub struct HealthCache {
    cache: Cache<String, bool>,
}

impl HealthCache {
    pub fn new(ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(1_024)
            .time_to_live(ttl)
            .build();

        Self { cache }
    }

    pub async fn get(&self, provider: &str) -> Option<bool> {
        self.cache.get(provider).await
    }

    pub async fn insert(&self, provider: impl Into<String>, healthy: bool) {
        self.cache.insert(provider.into(), healthy).await;
    }

    /// Cached result, or run `probe` and remember what it says.
    pub async fn get_or_probe<F>(&self, provider: &str, probe: F) -> bool
    where
        F: Future<Output = bool>,
    {
        self.cache.get_with(provider.to_string(), probe).await
    }

    pub async fn invalidate(&self, provider: &str) {
        self.cache.invalidate(provider).await;
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }
}

impl Default for HealthCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl std::fmt::Debug for HealthCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthCache")
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}
