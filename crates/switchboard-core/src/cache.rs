//! Tenant-scoped cache with TTL and explicit invalidation
//!
//! Every key is physically namespaced by tenant, so a scan over one
//! tenant's prefix can never return another tenant's entries. The cache is
//! best-effort: a failing cache store degrades to always-miss and every
//! cached lookup has a fallback to the authoritative store.

use async_trait::async_trait;
use lru::LruCache;
use serde_json::Value;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::EngineError;

/// Default absolute expiry for cached entries
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

const KEY_PREFIX: &str = "switchboard";
const DEFAULT_CAPACITY: usize = 4096;

/// Raw cache backend over string keys and JSON values.
///
/// Implementations may fail (network-backed stores); callers go through
/// [`TenantCache`], which converts failures into misses.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, EngineError>;
    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), EngineError>;
    async fn delete(&self, key: &str) -> Result<(), EngineError>;
    /// Delete every key starting with `prefix`
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, EngineError>;
}

/// In-process LRU cache store with per-entry absolute expiry
pub struct MemoryCache {
    entries: Mutex<LruCache<String, (Value, Instant)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Value>, EngineError> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((_, expires)) if *expires <= Instant::now() => {
                entries.pop(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), EngineError> {
        let expires = Instant::now() + ttl;
        self.entries
            .lock()
            .await
            .put(key.to_string(), (value, expires));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), EngineError> {
        self.entries.lock().await.pop(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, EngineError> {
        let mut entries = self.entries.lock().await;
        let keys: Vec<String> = entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            entries.pop(key);
        }
        Ok(keys.len())
    }
}

/// Tenant-namespacing wrapper over a [`CacheStore`].
///
/// Builds physical keys of the form `switchboard:{tenant}:{category}:{key}`
/// and converts any store failure into a miss.
#[derive(Clone)]
pub struct TenantCache {
    store: Arc<dyn CacheStore>,
    ttl: Duration,
}

impl TenantCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            ttl: DEFAULT_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn build_key(tenant_id: &str, category: &str, key: &str) -> String {
        format!("{KEY_PREFIX}:{tenant_id}:{category}:{key}")
    }

    pub async fn get(&self, tenant_id: &str, category: &str, key: &str) -> Option<Value> {
        let cache_key = Self::build_key(tenant_id, category, key);
        match self.store.get(&cache_key).await {
            Ok(Some(value)) => {
                debug!(tenant_id, category, key, "cache hit");
                Some(value)
            }
            Ok(None) => {
                debug!(tenant_id, category, key, "cache miss");
                None
            }
            Err(e) => {
                warn!(tenant_id, category, key, error = %e, "cache get failed, treating as miss");
                None
            }
        }
    }

    pub async fn set(&self, tenant_id: &str, category: &str, key: &str, value: Value) {
        let cache_key = Self::build_key(tenant_id, category, key);
        if let Err(e) = self.store.set(&cache_key, value, self.ttl).await {
            warn!(tenant_id, category, key, error = %e, "cache set failed, continuing without cache");
        }
    }

    pub async fn invalidate(&self, tenant_id: &str, category: &str, key: &str) {
        let cache_key = Self::build_key(tenant_id, category, key);
        if let Err(e) = self.store.delete(&cache_key).await {
            warn!(tenant_id, category, key, error = %e, "cache delete failed");
        }
    }

    /// Remove every entry belonging to one tenant
    pub async fn invalidate_tenant(&self, tenant_id: &str) {
        let prefix = format!("{KEY_PREFIX}:{tenant_id}:");
        match self.store.delete_prefix(&prefix).await {
            Ok(deleted) => debug!(tenant_id, deleted, "tenant cache cleared"),
            Err(e) => warn!(tenant_id, error = %e, "tenant cache clear failed"),
        }
    }

    /// Remove every entry across all tenants
    pub async fn invalidate_all(&self) {
        let prefix = format!("{KEY_PREFIX}:");
        match self.store.delete_prefix(&prefix).await {
            Ok(deleted) => debug!(deleted, "cache cleared for all tenants"),
            Err(e) => warn!(error = %e, "cache clear failed"),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::BrokenCache;
    use super::*;
    use serde_json::json;

    fn tenant_cache() -> TenantCache {
        TenantCache::new(Arc::new(MemoryCache::new()))
    }

    #[tokio::test]
    async fn test_get_set_roundtrip() {
        let cache = tenant_cache();
        cache.set("acme", "handler", "billing", json!({"x": 1})).await;
        let value = cache.get("acme", "handler", "billing").await;
        assert_eq!(value, Some(json!({"x": 1})));
    }

    #[tokio::test]
    async fn test_tenant_isolation() {
        let cache = tenant_cache();
        cache.set("acme", "handler", "billing", json!("acme-data")).await;

        // Identical category and key under another tenant must miss
        assert!(cache.get("globex", "handler", "billing").await.is_none());

        // Sweeping globex must not touch acme
        cache.invalidate_tenant("globex").await;
        assert!(cache.get("acme", "handler", "billing").await.is_some());
    }

    #[tokio::test]
    async fn test_invalidate_exact_key() {
        let cache = tenant_cache();
        cache.set("acme", "capability", "t1", json!(1)).await;
        cache.set("acme", "capability", "t2", json!(2)).await;
        cache.invalidate("acme", "capability", "t1").await;
        assert!(cache.get("acme", "capability", "t1").await.is_none());
        assert!(cache.get("acme", "capability", "t2").await.is_some());
    }

    #[tokio::test]
    async fn test_invalidate_tenant_sweep() {
        let cache = tenant_cache();
        cache.set("acme", "handler", "a", json!(1)).await;
        cache.set("acme", "capability", "b", json!(2)).await;
        cache.invalidate_tenant("acme").await;
        assert!(cache.get("acme", "handler", "a").await.is_none());
        assert!(cache.get("acme", "capability", "b").await.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_all() {
        let cache = tenant_cache();
        cache.set("acme", "handler", "a", json!(1)).await;
        cache.set("globex", "handler", "a", json!(2)).await;
        cache.invalidate_all().await;
        assert!(cache.get("acme", "handler", "a").await.is_none());
        assert!(cache.get("globex", "handler", "a").await.is_none());
    }

    #[tokio::test]
    async fn test_expired_entry_misses() {
        let store = Arc::new(MemoryCache::new());
        let cache = TenantCache::new(store).with_ttl(Duration::from_millis(10));
        cache.set("acme", "handler", "a", json!(1)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get("acme", "handler", "a").await.is_none());
    }

    #[tokio::test]
    async fn test_broken_store_degrades_to_miss() {
        let cache = TenantCache::new(Arc::new(BrokenCache));
        // Every operation completes without error
        cache.set("acme", "handler", "a", json!(1)).await;
        assert!(cache.get("acme", "handler", "a").await.is_none());
        cache.invalidate("acme", "handler", "a").await;
        cache.invalidate_tenant("acme").await;
        cache.invalidate_all().await;
    }

    #[tokio::test]
    async fn test_lru_capacity_bound() {
        let store = Arc::new(MemoryCache::with_capacity(2));
        let cache = TenantCache::new(store);
        cache.set("acme", "c", "1", json!(1)).await;
        cache.set("acme", "c", "2", json!(2)).await;
        cache.set("acme", "c", "3", json!(3)).await;
        // Oldest entry was evicted
        assert!(cache.get("acme", "c", "1").await.is_none());
        assert!(cache.get("acme", "c", "3").await.is_some());
    }
}
