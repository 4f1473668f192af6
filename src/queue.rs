//! Local durable queue of sales awaiting remote confirmation.
//!
//! Both the checkout path (`enqueue`) and the sync engine (`remove`,
//! `reject`) mutate the queue through this type, which forwards to a single
//! [`LocalStore`]. A sale is safe the moment `enqueue` returns `Ok`.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::models::{PendingSale, RejectedSale, SaleDraft, Session};
use crate::store::LocalStore;

#[derive(Clone)]
pub struct SaleQueue {
    store: Arc<dyn LocalStore>,
}

impl SaleQueue {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    /// Persist a sale before anything else happens to it.
    ///
    /// Re-enqueueing an id that is already queued is accepted and leaves the
    /// stored record untouched.
    pub fn enqueue(&self, sale: &PendingSale) -> Result<(), StorageError> {
        sale.validate()?;
        let inserted = self.store.insert_pending(sale).map_err(|e| {
            warn!(sale_id = %sale.id, error = %e, "Failed to persist sale locally");
            e
        })?;
        if inserted {
            info!(
                sale_id = %sale.id,
                total = sale.total,
                items = sale.items.len(),
                "Sale queued for sync"
            );
        } else {
            debug!(sale_id = %sale.id, "Sale already queued, keeping stored record");
        }
        Ok(())
    }

    /// Build a sale from a checkout draft for `session` and queue it.
    pub fn enqueue_draft(
        &self,
        draft: SaleDraft,
        session: &Session,
    ) -> Result<PendingSale, StorageError> {
        let sale = PendingSale::from_draft(draft, session)?;
        self.enqueue(&sale)?;
        Ok(sale)
    }

    /// Pending sales in creation order.
    pub fn list_pending(&self) -> Result<Vec<PendingSale>, StorageError> {
        self.store.list_pending()
    }

    /// Delete a confirmed sale. Absent ids are not an error.
    pub fn remove(&self, id: &str) -> Result<(), StorageError> {
        if !self.store.delete_pending(id)? {
            debug!(sale_id = %id, "remove: sale not in queue");
        }
        Ok(())
    }

    pub fn pending_count(&self) -> Result<usize, StorageError> {
        self.store.count_pending()
    }

    pub fn contains(&self, id: &str) -> Result<bool, StorageError> {
        Ok(self.store.list_pending()?.iter().any(|s| s.id == id))
    }

    /// Drop a sale the backend refused and keep it in the rejection log.
    pub fn reject(&self, sale: &PendingSale, reason: &str) -> Result<RejectedSale, StorageError> {
        let rejected = RejectedSale {
            sale: sale.clone(),
            reason: reason.to_string(),
            rejected_at: Utc::now(),
        };
        self.store.reject_pending(&rejected)?;
        warn!(sale_id = %sale.id, reason = %reason, "Sale rejected by backend, removed from queue");
        Ok(rejected)
    }

    pub fn rejected(&self) -> Result<Vec<RejectedSale>, StorageError> {
        self.store.list_rejected()
    }

    pub fn clear_rejected(&self) -> Result<usize, StorageError> {
        let cleared = self.store.clear_rejected()?;
        if cleared > 0 {
            info!(cleared, "Cleared rejected sales");
        }
        Ok(cleared)
    }

    pub(crate) fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }
}
