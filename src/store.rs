//! Durable storage capability used by the sale queue and the catalog cache.
//!
//! `LocalStore` is the seam between the sync core and whatever embedded
//! storage the platform offers. `db::DbState` is the SQLite implementation
//! used on terminals; `MemoryStore` backs ephemeral sessions and tests.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::error::StorageError;
use crate::models::{CachedProduct, PendingSale, RejectedSale};

/// Key/value namespaces the sync core needs from local storage.
///
/// Pending sales, the catalog snapshot, the rejection log and sync metadata
/// live in separate namespaces; clearing one never touches another.
pub trait LocalStore: Send + Sync {
    /// Store a sale keyed by its id. Returns `false` if the id already exists;
    /// the existing record is left untouched.
    fn insert_pending(&self, sale: &PendingSale) -> Result<bool, StorageError>;

    /// All pending sales in insertion order.
    fn list_pending(&self) -> Result<Vec<PendingSale>, StorageError>;

    /// Delete a pending sale. Returns `false` when the id was absent.
    fn delete_pending(&self, id: &str) -> Result<bool, StorageError>;

    fn count_pending(&self) -> Result<usize, StorageError>;

    /// Atomically move a pending sale into the rejection log.
    fn reject_pending(&self, rejected: &RejectedSale) -> Result<(), StorageError>;

    fn list_rejected(&self) -> Result<Vec<RejectedSale>, StorageError>;

    fn clear_rejected(&self) -> Result<usize, StorageError>;

    /// Replace the whole catalog snapshot in one step.
    fn replace_products(
        &self,
        products: &[CachedProduct],
        version: &str,
        refreshed_at: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// The last snapshot in the order it was written.
    fn load_products(&self) -> Result<Vec<CachedProduct>, StorageError>;

    fn get_meta(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn set_meta(&self, key: &str, value: &str) -> Result<(), StorageError>;
}

pub(crate) const META_CATALOG_VERSION: &str = "catalog_version";
pub(crate) const META_CATALOG_REFRESHED_AT: &str = "catalog_refreshed_at";
pub(crate) const META_LAST_SYNC_AT: &str = "last_sync_at";

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    pending: Vec<PendingSale>,
    rejected: Vec<RejectedSale>,
    products: Vec<CachedProduct>,
    meta: HashMap<String, String>,
}

/// Non-persistent store. Everything is lost when the process exits.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail, as a full or revoked store would.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("quota exceeded".into()));
        }
        Ok(())
    }
}

impl LocalStore for MemoryStore {
    fn insert_pending(&self, sale: &PendingSale) -> Result<bool, StorageError> {
        self.check_writable()?;
        let mut inner = self.inner.lock()?;
        if inner.pending.iter().any(|s| s.id == sale.id) {
            return Ok(false);
        }
        inner.pending.push(sale.clone());
        Ok(true)
    }

    fn list_pending(&self) -> Result<Vec<PendingSale>, StorageError> {
        Ok(self.inner.lock()?.pending.clone())
    }

    fn delete_pending(&self, id: &str) -> Result<bool, StorageError> {
        self.check_writable()?;
        let mut inner = self.inner.lock()?;
        let before = inner.pending.len();
        inner.pending.retain(|s| s.id != id);
        Ok(inner.pending.len() != before)
    }

    fn count_pending(&self) -> Result<usize, StorageError> {
        Ok(self.inner.lock()?.pending.len())
    }

    fn reject_pending(&self, rejected: &RejectedSale) -> Result<(), StorageError> {
        self.check_writable()?;
        let mut inner = self.inner.lock()?;
        inner.pending.retain(|s| s.id != rejected.sale.id);
        inner.rejected.retain(|r| r.sale.id != rejected.sale.id);
        inner.rejected.push(rejected.clone());
        Ok(())
    }

    fn list_rejected(&self) -> Result<Vec<RejectedSale>, StorageError> {
        Ok(self.inner.lock()?.rejected.clone())
    }

    fn clear_rejected(&self) -> Result<usize, StorageError> {
        self.check_writable()?;
        let mut inner = self.inner.lock()?;
        let cleared = inner.rejected.len();
        inner.rejected.clear();
        Ok(cleared)
    }

    fn replace_products(
        &self,
        products: &[CachedProduct],
        version: &str,
        refreshed_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.check_writable()?;
        let mut inner = self.inner.lock()?;
        inner.products = products.to_vec();
        inner
            .meta
            .insert(META_CATALOG_VERSION.to_string(), version.to_string());
        inner.meta.insert(
            META_CATALOG_REFRESHED_AT.to_string(),
            refreshed_at.to_rfc3339(),
        );
        Ok(())
    }

    fn load_products(&self) -> Result<Vec<CachedProduct>, StorageError> {
        Ok(self.inner.lock()?.products.clone())
    }

    fn get_meta(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.inner.lock()?.meta.get(key).cloned())
    }

    fn set_meta(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.check_writable()?;
        self.inner
            .lock()?
            .meta
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}
