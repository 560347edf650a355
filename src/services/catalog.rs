use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::cache::{CacheOptions, CacheService};
use crate::entities::product::Model as ProductModel;
use crate::errors::ServiceError;
use crate::repositories::ProductCatalog;

/// Tag shared by every cached product entry
pub const PRODUCTS_TAG: &str = "products";

pub fn product_key(id: &str) -> String {
    format!("product:{}", id)
}

/// Cache-aside decorator over a product catalog.
///
/// Lookups are cached under `product:{id}` and tagged with both
/// [`PRODUCTS_TAG`] and the product's own key, so either a catalog-wide or a
/// single-product invalidation evicts them. Missing products are not cached.
#[derive(Clone)]
pub struct CachedProductCatalog {
    inner: Arc<dyn ProductCatalog>,
    cache: CacheService,
    ttl: Duration,
}

impl CachedProductCatalog {
    pub fn new(inner: Arc<dyn ProductCatalog>, cache: CacheService, ttl: Duration) -> Self {
        Self { inner, cache, ttl }
    }

    pub async fn invalidate(&self, id: &str) -> bool {
        self.cache.invalidate_tag(&product_key(id)).await
    }

    pub async fn invalidate_all(&self) -> bool {
        self.cache.invalidate_tag(PRODUCTS_TAG).await
    }
}

enum Lookup {
    Missing,
    Failed(ServiceError),
}

impl From<ServiceError> for Lookup {
    fn from(err: ServiceError) -> Self {
        Lookup::Failed(err)
    }
}

#[async_trait]
impl ProductCatalog for CachedProductCatalog {
    async fn find_by_id(&self, id: &str) -> Result<Option<ProductModel>, ServiceError> {
        let key = product_key(id);
        let options = CacheOptions::with_ttl(self.ttl)
            .tag(PRODUCTS_TAG)
            .tag(key.clone());

        let lookup = self
            .cache
            .get_or_set(
                &key,
                || async {
                    debug!(product_id = id, "product cache miss");
                    self.inner.find_by_id(id).await?.ok_or(Lookup::Missing)
                },
                options,
            )
            .await;

        match lookup {
            Ok(product) => Ok(Some(product)),
            Err(Lookup::Missing) => Ok(None),
            Err(Lookup::Failed(e)) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCacheBackend;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct CountingCatalog {
        products: Mutex<HashMap<String, ProductModel>>,
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl ProductCatalog for CountingCatalog {
        async fn find_by_id(&self, id: &str) -> Result<Option<ProductModel>, ServiceError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(self.products.lock().await.get(id).cloned())
        }
    }

    fn product(id: &str) -> ProductModel {
        ProductModel {
            id: id.to_string(),
            name: "Icon Pack".into(),
            description: Some("400 vector icons".into()),
            images: json!(["https://cdn.example.com/icons.png"]),
            price: dec!(19.99),
            currency: "usd".into(),
            is_active: true,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    async fn wait_for_cached(cache: &CacheService, key: &str) {
        for _ in 0..50 {
            if cache.get::<ProductModel>(key).await.is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} was never cached", key);
    }

    #[tokio::test]
    async fn second_lookup_is_served_from_cache() {
        let inner = Arc::new(CountingCatalog::default());
        inner
            .products
            .lock()
            .await
            .insert("prod-1".into(), product("prod-1"));
        let cache = CacheService::new(Arc::new(InMemoryCacheBackend::new()));
        let catalog = CachedProductCatalog::new(inner.clone(), cache.clone(), Duration::from_secs(60));

        let first = catalog.find_by_id("prod-1").await.unwrap().unwrap();
        wait_for_cached(&cache, "product:prod-1").await;
        let second = catalog.find_by_id("prod-1").await.unwrap().unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(inner.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidation_forces_a_fresh_lookup() {
        let inner = Arc::new(CountingCatalog::default());
        inner
            .products
            .lock()
            .await
            .insert("prod-1".into(), product("prod-1"));
        let cache = CacheService::new(Arc::new(InMemoryCacheBackend::new()));
        let catalog = CachedProductCatalog::new(inner.clone(), cache.clone(), Duration::from_secs(60));

        catalog.find_by_id("prod-1").await.unwrap();
        wait_for_cached(&cache, "product:prod-1").await;

        assert!(catalog.invalidate_all().await);
        catalog.find_by_id("prod-1").await.unwrap();
        assert_eq!(inner.lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_products_are_not_cached() {
        let inner = Arc::new(CountingCatalog::default());
        let cache = CacheService::new(Arc::new(InMemoryCacheBackend::new()));
        let catalog = CachedProductCatalog::new(inner.clone(), cache, Duration::from_secs(60));

        assert!(catalog.find_by_id("nope").await.unwrap().is_none());
        assert!(catalog.find_by_id("nope").await.unwrap().is_none());
        assert_eq!(inner.lookups.load(Ordering::SeqCst), 2);
    }
}
