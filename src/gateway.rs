//! Contract for the backend the sync engine delivers sales to.
//!
//! The HTTP implementation lives in `api.rs`. Implementations must be
//! idempotent on the sale id: resubmitting an accepted sale returns the
//! original server id instead of creating a second sale.

use async_trait::async_trait;

use crate::error::GatewayError;
use crate::models::{CachedProduct, PendingSale, ServerId, Session};

#[async_trait]
pub trait RemoteGateway: Send + Sync {
    /// Deliver one completed sale. `sale.id` is the idempotency key.
    async fn submit_sale(
        &self,
        sale: &PendingSale,
        session: &Session,
    ) -> Result<ServerId, GatewayError>;

    /// Current catalog for the offline product cache. Best-effort.
    async fn fetch_products(&self, session: &Session) -> Result<Vec<CachedProduct>, GatewayError>;
}
