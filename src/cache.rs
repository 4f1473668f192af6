//! Offline product catalog.
//!
//! Read-through snapshot of the backend catalog so the checkout screen can
//! ring up sales without a connection. Every refresh replaces the whole
//! snapshot; rows are never merged.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use crate::error::{RefreshError, StorageError};
use crate::gateway::RemoteGateway;
use crate::models::{CachedProduct, Session};
use crate::store::{LocalStore, META_CATALOG_REFRESHED_AT, META_CATALOG_VERSION};

/// Outcome of [`ProductCache::sync_from_remote`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogRefresh {
    pub updated: bool,
    pub version: String,
    pub count: usize,
}

/// Stable version for a catalog payload, independent of response timestamps.
fn catalog_digest(products: &[CachedProduct]) -> String {
    let serialized = serde_json::to_string(products).unwrap_or_else(|_| "[]".to_string());
    let mut hasher = DefaultHasher::new();
    serialized.hash(&mut hasher);
    format!("digest:{:016x}", hasher.finish())
}

/// One row per product id. A later duplicate replaces an earlier one and
/// keeps the later position.
fn dedupe_by_id(products: &[CachedProduct]) -> Vec<CachedProduct> {
    let mut seen = HashSet::new();
    let mut kept: Vec<CachedProduct> = products
        .iter()
        .rev()
        .filter(|p| seen.insert(p.id.clone()))
        .cloned()
        .collect();
    kept.reverse();
    kept
}

#[derive(Clone)]
pub struct ProductCache {
    store: Arc<dyn LocalStore>,
}

impl ProductCache {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    /// Replace the snapshot with `products` in one step.
    pub fn refresh(&self, products: &[CachedProduct]) -> Result<(), StorageError> {
        let products = dedupe_by_id(products);
        let version = catalog_digest(&products);
        self.store.replace_products(&products, &version, Utc::now())?;
        debug!(count = products.len(), version = %version, "Product cache replaced");
        Ok(())
    }

    /// Last snapshot. Empty if the cache was never populated.
    pub fn read_all(&self) -> Result<Vec<CachedProduct>, StorageError> {
        self.store.load_products()
    }

    pub fn get(&self, id: &str) -> Result<Option<CachedProduct>, StorageError> {
        Ok(self.store.load_products()?.into_iter().find(|p| p.id == id))
    }

    pub fn version(&self) -> Result<Option<String>, StorageError> {
        self.store.get_meta(META_CATALOG_VERSION)
    }

    pub fn last_refreshed_at(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        let raw = self.store.get_meta(META_CATALOG_REFRESHED_AT)?;
        Ok(raw.and_then(|value| match DateTime::parse_from_rfc3339(&value) {
            Ok(parsed) => Some(parsed.with_timezone(&Utc)),
            Err(e) => {
                warn!(value = %value, error = %e, "Ignoring unparseable catalog refresh time");
                None
            }
        }))
    }

    /// Pull the catalog from the backend and store it if it changed.
    ///
    /// A failed fetch leaves the previous snapshot in place.
    pub async fn sync_from_remote(
        &self,
        gateway: &dyn RemoteGateway,
        session: &Session,
    ) -> Result<CatalogRefresh, RefreshError> {
        let products = gateway.fetch_products(session).await.map_err(|e| {
            if e.is_transient() {
                debug!(error = %e, "catalog fetch deferred");
            } else {
                warn!(error = %e, "catalog fetch rejected");
            }
            e
        })?;

        let products = dedupe_by_id(&products);
        let version = catalog_digest(&products);
        if self.version()?.as_deref() == Some(version.as_str()) {
            trace!(version = %version, count = products.len(), "Product cache already current");
            return Ok(CatalogRefresh {
                updated: false,
                version,
                count: products.len(),
            });
        }

        self.store.replace_products(&products, &version, Utc::now())?;
        info!(version = %version, count = products.len(), "Product cache updated");
        Ok(CatalogRefresh {
            updated: true,
            version,
            count: products.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::error::GatewayError;
    use crate::gateway::testing::ScriptedGateway;
    use crate::store::MemoryStore;

    fn product(id: &str, price: f64) -> CachedProduct {
        CachedProduct {
            id: id.to_string(),
            name: format!("Product {id}"),
            price,
            stock: 10,
            category: None,
            cost_price: None,
        }
    }

    fn sqlite_cache() -> ProductCache {
        ProductCache::new(Arc::new(db::open_in_memory().expect("in-memory db")))
    }

    #[test]
    fn test_read_all_empty_before_first_refresh() {
        let cache = sqlite_cache();
        assert!(cache.read_all().unwrap().is_empty());
        assert!(cache.last_refreshed_at().unwrap().is_none());
        assert!(cache.version().unwrap().is_none());
    }

    #[test]
    fn test_duplicate_ids_resolve_the_same_on_both_stores() {
        let payload = [product("a", 1.0), product("b", 2.0), product("a", 9.0)];
        let memory = ProductCache::new(Arc::new(MemoryStore::new()));
        let sqlite = sqlite_cache();
        memory.refresh(&payload).unwrap();
        sqlite.refresh(&payload).unwrap();

        let expected = vec![product("b", 2.0), product("a", 9.0)];
        assert_eq!(memory.read_all().unwrap(), expected);
        assert_eq!(sqlite.read_all().unwrap(), expected);
        assert_eq!(memory.version().unwrap(), sqlite.version().unwrap());
    }

    #[test]
    fn test_refresh_replaces_whole_snapshot() {
        let cache = sqlite_cache();
        cache.refresh(&[product("a", 1.0), product("b", 2.0)]).unwrap();
        cache.refresh(&[product("c", 3.0)]).unwrap();

        let all = cache.read_all().unwrap();
        assert_eq!(all, vec![product("c", 3.0)]);
        assert!(cache.get("a").unwrap().is_none());
        assert_eq!(cache.get("c").unwrap().map(|p| p.price), Some(3.0));
        assert!(cache.last_refreshed_at().unwrap().is_some());
    }

    #[test]
    fn test_digest_tracks_content() {
        let a = catalog_digest(&[product("a", 1.0)]);
        assert_eq!(a, catalog_digest(&[product("a", 1.0)]));
        assert_ne!(a, catalog_digest(&[product("a", 1.5)]));
        assert!(a.starts_with("digest:"));
    }

    #[tokio::test]
    async fn test_sync_from_remote_skips_unchanged_catalog() {
        let cache = sqlite_cache();
        let gateway = ScriptedGateway::new();
        gateway.set_products(vec![product("a", 1.0)]);
        let session = Session::new("cashier-1");

        let first = cache.sync_from_remote(&gateway, &session).await.unwrap();
        assert!(first.updated);
        assert_eq!(first.count, 1);

        let second = cache.sync_from_remote(&gateway, &session).await.unwrap();
        assert!(!second.updated);
        assert_eq!(second.version, first.version);

        gateway.set_products(vec![product("a", 1.0), product("b", 2.0)]);
        let third = cache.sync_from_remote(&gateway, &session).await.unwrap();
        assert!(third.updated);
        assert_eq!(cache.read_all().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_previous_snapshot() {
        let cache = ProductCache::new(Arc::new(MemoryStore::new()));
        cache.refresh(&[product("a", 1.0)]).unwrap();

        let gateway = ScriptedGateway::new();
        gateway.fail_products(GatewayError::transient("offline"));
        let err = cache
            .sync_from_remote(&gateway, &Session::new("cashier-1"))
            .await
            .unwrap_err();

        assert!(matches!(err, RefreshError::Gateway(_)));
        assert_eq!(cache.read_all().unwrap(), vec![product("a", 1.0)]);
    }
}
