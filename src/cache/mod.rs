//! Cache-aside layer with tag-based invalidation.
//!
//! [`CacheService`] never surfaces backend failures: every operation degrades
//! to its neutral result (`None`, `false`, empty collection) when the backend
//! is absent or errors, so callers can treat caching purely as an optimization.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

pub mod backend;
pub mod redis_backend;

pub use backend::{CacheBackend, CacheError, InMemoryCacheBackend, KeyTtl};
pub use redis_backend::RedisCacheBackend;

use crate::metrics::{
    record_cache_backend_error, CACHE_BACKGROUND_WRITE_FAILURES, CACHE_HITS, CACHE_MISSES,
};

const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_millis(500);

/// Index key holding the members of `tag`
pub fn tag_key(tag: &str) -> String {
    format!("tag:{}", tag)
}

/// Write options for [`CacheService::set`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheOptions {
    /// `None` or zero stores the value without expiry
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
}

impl CacheOptions {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            tags: Vec::new(),
        }
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    fn expiry(&self) -> Option<Duration> {
        self.ttl.filter(|ttl| !ttl.is_zero())
    }
}

#[derive(Clone)]
pub struct CacheService {
    backend: Option<Arc<dyn CacheBackend>>,
    write_timeout: Duration,
}

impl std::fmt::Debug for CacheService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheService")
            .field("enabled", &self.is_enabled())
            .field("write_timeout", &self.write_timeout)
            .finish()
    }
}

impl CacheService {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend: Some(backend),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    /// A cache with no backend; every operation is a neutral no-op
    pub fn disabled() -> Self {
        Self {
            backend: None,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    /// Bound for the background write issued by [`CacheService::get_or_set`]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    /// Round-trips the backend; `None` when the cache is disabled
    pub async fn health_check(&self) -> Option<bool> {
        let backend = self.backend.as_ref()?;
        Some(backend.ping().await.is_ok())
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let backend = self.backend.as_ref()?;
        let raw = match backend.get(key).await {
            Ok(raw) => raw,
            Err(e) => {
                record_cache_backend_error("get");
                error!(key, error = %e, "cache get failed");
                return None;
            }
        };

        let Some(raw) = raw else {
            CACHE_MISSES.inc();
            return None;
        };

        match serde_json::from_str(&raw) {
            Ok(value) => {
                CACHE_HITS.inc();
                Some(value)
            }
            Err(e) => {
                CACHE_MISSES.inc();
                error!(key, error = %e, "cached value could not be deserialized");
                None
            }
        }
    }

    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        options: &CacheOptions,
    ) -> bool {
        let Some(backend) = self.backend.as_ref() else {
            return false;
        };
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                error!(key, error = %e, "value could not be serialized for cache");
                return false;
            }
        };

        match write_entry(backend.as_ref(), key, &raw, options).await {
            Ok(()) => true,
            Err(e) => {
                record_cache_backend_error("set");
                error!(key, error = %e, "cache set failed");
                false
            }
        }
    }

    pub async fn delete(&self, key: &str) -> bool {
        self.delete_many(&[key.to_string()]).await
    }

    pub async fn delete_many(&self, keys: &[String]) -> bool {
        let Some(backend) = self.backend.as_ref() else {
            return false;
        };
        match backend.delete(keys).await {
            Ok(_) => true,
            Err(e) => {
                record_cache_backend_error("delete");
                error!(?keys, error = %e, "cache delete failed");
                false
            }
        }
    }

    /// Deletes every key indexed under `tag`, then the index itself.
    ///
    /// Keys tagged while the invalidation is in flight may survive it.
    pub async fn invalidate_tag(&self, tag: &str) -> bool {
        let Some(backend) = self.backend.as_ref() else {
            return false;
        };
        let index = tag_key(tag);

        let result = async {
            let mut keys = backend.smembers(&index).await?;
            let members = keys.len();
            keys.push(index.clone());
            backend.delete(&keys).await?;
            Ok::<_, CacheError>(members)
        }
        .await;

        match result {
            Ok(members) => {
                debug!(tag, members, "invalidated cache tag");
                true
            }
            Err(e) => {
                record_cache_backend_error("invalidate_tag");
                error!(tag, error = %e, "cache tag invalidation failed");
                false
            }
        }
    }

    /// Returns the cached value, or computes it with `factory`.
    ///
    /// A computed value is returned immediately; the cache write runs on a
    /// background task bounded by the write timeout, and its failure is only
    /// logged and counted. Factory errors are returned as-is and nothing is
    /// cached.
    pub async fn get_or_set<T, E, F, Fut>(
        &self,
        key: &str,
        factory: F,
        options: CacheOptions,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(cached) = self.get::<T>(key).await {
            return Ok(cached);
        }

        let value = factory().await?;

        if let Some(backend) = self.backend.clone() {
            match serde_json::to_string(&value) {
                Ok(raw) => {
                    self.spawn_write(backend, key.to_string(), raw, options);
                }
                Err(e) => {
                    CACHE_BACKGROUND_WRITE_FAILURES.inc();
                    error!(key, error = %e, "computed value could not be serialized for cache");
                }
            }
        }

        Ok(value)
    }

    fn spawn_write(
        &self,
        backend: Arc<dyn CacheBackend>,
        key: String,
        raw: String,
        options: CacheOptions,
    ) {
        let timeout = self.write_timeout;
        tokio::spawn(async move {
            let outcome =
                tokio::time::timeout(timeout, write_entry(backend.as_ref(), &key, &raw, &options))
                    .await
                    .unwrap_or(Err(CacheError::Timeout));

            if let Err(e) = outcome {
                CACHE_BACKGROUND_WRITE_FAILURES.inc();
                warn!(key = %key, error = %e, "background cache write failed");
            }
        });
    }

    pub async fn increment(&self, key: &str, by: i64) -> Option<i64> {
        let backend = self.backend.as_ref()?;
        backend
            .incr_by(key, by)
            .await
            .map_err(|e| {
                record_cache_backend_error("increment");
                error!(key, error = %e, "cache increment failed");
            })
            .ok()
    }

    pub async fn hset<T: Serialize + ?Sized>(&self, key: &str, field: &str, value: &T) -> bool {
        let Some(backend) = self.backend.as_ref() else {
            return false;
        };
        let Ok(raw) = serde_json::to_string(value) else {
            error!(key, field, "hash field could not be serialized for cache");
            return false;
        };
        match backend.hset(key, field, &raw).await {
            Ok(()) => true,
            Err(e) => {
                record_cache_backend_error("hset");
                error!(key, field, error = %e, "cache hset failed");
                false
            }
        }
    }

    pub async fn hget<T: DeserializeOwned>(&self, key: &str, field: &str) -> Option<T> {
        let backend = self.backend.as_ref()?;
        let raw = backend
            .hget(key, field)
            .await
            .map_err(|e| {
                record_cache_backend_error("hget");
                error!(key, field, error = %e, "cache hget failed");
            })
            .ok()??;
        serde_json::from_str(&raw)
            .map_err(|e| error!(key, field, error = %e, "hash field could not be deserialized"))
            .ok()
    }

    /// All fields of a hash; fields that fail to deserialize are skipped
    pub async fn hgetall<T: DeserializeOwned>(&self, key: &str) -> HashMap<String, T> {
        let Some(backend) = self.backend.as_ref() else {
            return HashMap::new();
        };
        match backend.hgetall(key).await {
            Ok(fields) => fields
                .into_iter()
                .filter_map(|(field, raw)| {
                    serde_json::from_str(&raw).ok().map(|value| (field, value))
                })
                .collect(),
            Err(e) => {
                record_cache_backend_error("hgetall");
                error!(key, error = %e, "cache hgetall failed");
                HashMap::new()
            }
        }
    }

    pub async fn zadd(&self, key: &str, score: f64, member: &str) -> bool {
        let Some(backend) = self.backend.as_ref() else {
            return false;
        };
        match backend.zadd(key, score, member).await {
            Ok(()) => true,
            Err(e) => {
                record_cache_backend_error("zadd");
                error!(key, error = %e, "cache zadd failed");
                false
            }
        }
    }

    pub async fn zrange(&self, key: &str, start: isize, stop: isize) -> Vec<String> {
        let Some(backend) = self.backend.as_ref() else {
            return Vec::new();
        };
        backend.zrange(key, start, stop).await.unwrap_or_else(|e| {
            record_cache_backend_error("zrange");
            error!(key, error = %e, "cache zrange failed");
            Vec::new()
        })
    }

    /// Flushes the whole backing store. Test and ops use only.
    pub async fn clear(&self) -> bool {
        let Some(backend) = self.backend.as_ref() else {
            return false;
        };
        match backend.flush().await {
            Ok(()) => {
                warn!("cache flushed");
                true
            }
            Err(e) => {
                record_cache_backend_error("clear");
                error!(error = %e, "cache flush failed");
                false
            }
        }
    }
}

/// Writes the value, then registers it under each tag.
///
/// A member without expiry makes the tag index persistent; otherwise the
/// index TTL is only ever extended so it outlives every member.
async fn write_entry(
    backend: &dyn CacheBackend,
    key: &str,
    raw: &str,
    options: &CacheOptions,
) -> Result<(), CacheError> {
    let expiry = options.expiry();
    backend.set(key, raw, expiry).await?;

    for tag in &options.tags {
        let index = tag_key(tag);
        let current = backend.ttl(&index).await?;
        backend.sadd(&index, key).await?;

        match (expiry, current) {
            (None, KeyTtl::Expires(_)) => backend.persist(&index).await?,
            (Some(ttl), KeyTtl::Missing) => backend.expire(&index, ttl).await?,
            (Some(ttl), KeyTtl::Expires(remaining)) if remaining < ttl => {
                backend.expire(&index, ttl).await?
            }
            _ => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache() -> (CacheService, Arc<InMemoryCacheBackend>) {
        let backend = Arc::new(InMemoryCacheBackend::new());
        (CacheService::new(backend.clone()), backend)
    }

    /// Backend whose every call fails
    struct FailingBackend;

    #[async_trait]
    impl CacheBackend for FailingBackend {
        async fn get(&self, _: &str) -> Result<Option<String>, CacheError> {
            Ok(None)
        }
        async fn set(&self, _: &str, _: &str, _: Option<Duration>) -> Result<(), CacheError> {
            Err(CacheError::Backend("connection refused".into()))
        }
        async fn delete(&self, _: &[String]) -> Result<u64, CacheError> {
            Err(CacheError::Backend("connection refused".into()))
        }
        async fn ttl(&self, _: &str) -> Result<KeyTtl, CacheError> {
            Err(CacheError::Backend("connection refused".into()))
        }
        async fn expire(&self, _: &str, _: Duration) -> Result<(), CacheError> {
            Err(CacheError::Backend("connection refused".into()))
        }
        async fn persist(&self, _: &str) -> Result<(), CacheError> {
            Err(CacheError::Backend("connection refused".into()))
        }
        async fn sadd(&self, _: &str, _: &str) -> Result<(), CacheError> {
            Err(CacheError::Backend("connection refused".into()))
        }
        async fn smembers(&self, _: &str) -> Result<Vec<String>, CacheError> {
            Err(CacheError::Backend("connection refused".into()))
        }
        async fn incr_by(&self, _: &str, _: i64) -> Result<i64, CacheError> {
            Err(CacheError::Backend("connection refused".into()))
        }
        async fn hset(&self, _: &str, _: &str, _: &str) -> Result<(), CacheError> {
            Err(CacheError::Backend("connection refused".into()))
        }
        async fn hget(&self, _: &str, _: &str) -> Result<Option<String>, CacheError> {
            Err(CacheError::Backend("connection refused".into()))
        }
        async fn hgetall(&self, _: &str) -> Result<HashMap<String, String>, CacheError> {
            Err(CacheError::Backend("connection refused".into()))
        }
        async fn zadd(&self, _: &str, _: f64, _: &str) -> Result<(), CacheError> {
            Err(CacheError::Backend("connection refused".into()))
        }
        async fn zrange(&self, _: &str, _: isize, _: isize) -> Result<Vec<String>, CacheError> {
            Err(CacheError::Backend("connection refused".into()))
        }
        async fn flush(&self) -> Result<(), CacheError> {
            Err(CacheError::Backend("connection refused".into()))
        }
        async fn ping(&self) -> Result<(), CacheError> {
            Err(CacheError::Backend("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn invalidate_tag_removes_tagged_keys() {
        let (cache, backend) = cache();
        let options = CacheOptions::with_ttl(Duration::from_secs(60)).tag("products");

        assert!(cache.set("p:1", &json!({ "name": "Icons" }), &options).await);
        assert!(cache.set("p:2", &json!({ "name": "Fonts" }), &options).await);
        assert!(cache.set("other", &1, &CacheOptions::default()).await);

        assert!(cache.invalidate_tag("products").await);
        assert_eq!(cache.get::<Value>("p:1").await, None);
        assert_eq!(cache.get::<Value>("p:2").await, None);
        assert_eq!(cache.get::<i32>("other").await, Some(1));
        assert_eq!(backend.ttl("tag:products").await.unwrap(), KeyTtl::Missing);
    }

    #[tokio::test]
    async fn zero_ttl_persists_value_and_tag() {
        let (cache, backend) = cache();
        let options = CacheOptions {
            ttl: Some(Duration::ZERO),
            tags: vec!["t".into()],
        };

        assert!(cache.set("k", &json!({ "a": 1 }), &options).await);
        assert_eq!(cache.get::<Value>("k").await, Some(json!({ "a": 1 })));
        assert_eq!(backend.ttl("k").await.unwrap(), KeyTtl::Persistent);
        assert_eq!(backend.ttl("tag:t").await.unwrap(), KeyTtl::Persistent);
    }

    #[tokio::test]
    async fn tag_ttl_is_never_shortened() {
        let (cache, backend) = cache();
        cache
            .set("long", &1, &CacheOptions::with_ttl(Duration::from_secs(600)).tag("t"))
            .await;
        cache
            .set("short", &2, &CacheOptions::with_ttl(Duration::from_secs(5)).tag("t"))
            .await;

        match backend.ttl("tag:t").await.unwrap() {
            KeyTtl::Expires(remaining) => assert!(remaining > Duration::from_secs(500)),
            other => panic!("unexpected tag ttl {:?}", other),
        }

        // A persistent member pins the index
        cache.set("forever", &3, &CacheOptions::default().tag("t")).await;
        assert_eq!(backend.ttl("tag:t").await.unwrap(), KeyTtl::Persistent);
        cache
            .set("later", &4, &CacheOptions::with_ttl(Duration::from_secs(5)).tag("t"))
            .await;
        assert_eq!(backend.ttl("tag:t").await.unwrap(), KeyTtl::Persistent);
    }

    #[tokio::test]
    async fn undeserializable_value_is_a_miss() {
        let (cache, backend) = cache();
        backend.set("k", "not json", None).await.unwrap();
        assert_eq!(cache.get::<Value>("k").await, None);
    }

    #[tokio::test]
    async fn get_or_set_calls_factory_once_per_miss() {
        let (cache, _) = cache();
        let calls = Arc::new(AtomicUsize::new(0));

        let compute = || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(json!({ "price": 12.5 }))
            }
        };

        let first = cache
            .get_or_set("p:1", compute, CacheOptions::default())
            .await
            .unwrap();
        assert_eq!(first, json!({ "price": 12.5 }));

        // Wait for the background write to land
        for _ in 0..50 {
            if cache.get::<Value>("p:1").await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let second = cache
            .get_or_set("p:1", compute, CacheOptions::default())
            .await
            .unwrap();
        assert_eq!(second, first);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn get_or_set_returns_value_when_cache_write_fails() {
        let cache = CacheService::new(Arc::new(FailingBackend));
        let before = CACHE_BACKGROUND_WRITE_FAILURES.get();

        let value = cache
            .get_or_set("k", || async { Ok::<_, String>(7) }, CacheOptions::default())
            .await
            .unwrap();
        assert_eq!(value, 7);

        for _ in 0..50 {
            if CACHE_BACKGROUND_WRITE_FAILURES.get() > before {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(CACHE_BACKGROUND_WRITE_FAILURES.get() > before);
    }

    #[tokio::test]
    async fn factory_errors_propagate() {
        let (cache, _) = cache();
        let result: Result<i32, String> = cache
            .get_or_set("k", || async { Err("db down".to_string()) }, CacheOptions::default())
            .await;
        assert_eq!(result, Err("db down".to_string()));
    }

    #[tokio::test]
    async fn disabled_cache_returns_neutral_values() {
        let cache = CacheService::disabled();
        assert!(!cache.is_enabled());
        assert!(!cache.set("k", &1, &CacheOptions::default()).await);
        assert_eq!(cache.get::<i32>("k").await, None);
        assert!(!cache.delete("k").await);
        assert!(!cache.invalidate_tag("t").await);
        assert_eq!(cache.increment("n", 1).await, None);
        assert!(!cache.hset("h", "f", &1).await);
        assert_eq!(cache.hget::<i32>("h", "f").await, None);
        assert!(cache.hgetall::<i32>("h").await.is_empty());
        assert!(!cache.zadd("z", 1.0, "m").await);
        assert!(cache.zrange("z", 0, -1).await.is_empty());
        assert!(!cache.clear().await);
        assert_eq!(cache.health_check().await, None);

        let value = cache
            .get_or_set("k", || async { Ok::<_, String>(3) }, CacheOptions::default())
            .await
            .unwrap();
        assert_eq!(value, 3);
    }

    #[tokio::test]
    async fn failing_backend_never_raises() {
        let cache = CacheService::new(Arc::new(FailingBackend));
        assert!(!cache.set("k", &1, &CacheOptions::default()).await);
        assert!(!cache.delete_many(&["a".into(), "b".into()]).await);
        assert!(!cache.invalidate_tag("t").await);
        assert_eq!(cache.increment("n", 1).await, None);
        assert!(cache.zrange("z", 0, -1).await.is_empty());
        assert_eq!(cache.health_check().await, Some(false));
    }

    #[tokio::test]
    async fn hash_and_sorted_set_helpers() {
        let (cache, _) = cache();
        assert!(cache.hset("stats", "views", &10).await);
        assert!(cache.hset("stats", "sales", &2).await);
        assert_eq!(cache.hget::<i32>("stats", "views").await, Some(10));
        let all = cache.hgetall::<i32>("stats").await;
        assert_eq!(all.get("sales"), Some(&2));

        assert!(cache.zadd("top", 5.0, "p:1").await);
        assert!(cache.zadd("top", 1.0, "p:2").await);
        assert_eq!(cache.zrange("top", 0, -1).await, vec!["p:2", "p:1"]);
        assert_eq!(cache.increment("visits", 1).await, Some(1));

        assert!(cache.clear().await);
        assert_eq!(cache.hget::<i32>("stats", "views").await, None);
    }
}
