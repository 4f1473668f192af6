//! Catalyst sync core.
//!
//! Offline-first sales recording for POS terminals: completed sales are
//! written to a local durable queue first and delivered to the admin
//! dashboard in the background once the terminal is online. A product
//! catalog snapshot is cached locally so checkout keeps working offline.

use anyhow::Context;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

pub mod api;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod credentials;
pub mod db;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod models;
pub mod queue;
pub mod service;
pub mod store;
pub mod sync;

pub use api::HttpGateway;
pub use cache::{CatalogRefresh, ProductCache};
pub use config::SyncConfig;
pub use connectivity::{ConnectivityMonitor, ConnectivityState, Subscription};
pub use error::{ConfigError, FailureClass, GatewayError, RefreshError, StorageError};
pub use gateway::RemoteGateway;
pub use models::{
    CachedProduct, PaymentMethod, PendingSale, RejectedSale, SaleDraft, SaleLineItem, ServerId,
    Session,
};
pub use queue::SaleQueue;
pub use service::{ServiceOptions, SyncEvent, SyncService, SyncStatus};
pub use store::{LocalStore, MemoryStore};
pub use sync::{RecordState, SyncEngine, SyncEntry, SyncOutcome, SyncReport};

/// Refresh the catalog snapshot, logging rather than failing.
async fn refresh_catalog(cache: &ProductCache, gateway: &dyn RemoteGateway, session: &Session) {
    match cache.sync_from_remote(gateway, session).await {
        Ok(refresh) if refresh.updated => {
            info!(count = refresh.count, version = %refresh.version, "Catalog refreshed")
        }
        Ok(_) => debug!("Catalog unchanged"),
        Err(e) => warn!(error = %e, "Catalog refresh failed; keeping cached snapshot"),
    }
}

/// Run the headless sync daemon until Ctrl-C.
pub async fn run(config: SyncConfig) -> anyhow::Result<()> {
    let (admin_url, api_key) = config.remote()?;

    let store: Arc<dyn LocalStore> =
        Arc::new(db::init(&config.data_dir).context("failed to open local database")?);
    let gateway = Arc::new(HttpGateway::new(
        admin_url,
        api_key,
        config.terminal_id.clone(),
        Some(config.submit_timeout),
    )?);
    credentials::remember_terminal(Some(gateway.base_url()), config.terminal_id.as_deref());

    let queue = SaleQueue::new(store.clone());
    let cache = ProductCache::new(store);
    info!(
        pending = queue.pending_count()?,
        cached_products = cache.read_all()?.len(),
        "Local state loaded"
    );

    let initially_online = gateway.check_health().await;
    let monitor = ConnectivityMonitor::new(initially_online);
    let engine = SyncEngine::new(queue, gateway.clone(), config.submit_timeout);
    let service = SyncService::start(engine, monitor, config.service_options());

    let mut session = Session::new(config.cashier_id.clone());
    if let Some(terminal_id) = &config.terminal_id {
        session = session.with_terminal(terminal_id.clone());
    }
    service.set_session(session.clone());

    let probe_gateway = gateway.clone();
    service.spawn_health_probe(config.health_interval, move || {
        let gateway = probe_gateway.clone();
        async move { gateway.check_health().await }
    });

    if initially_online {
        refresh_catalog(&cache, gateway.as_ref(), &session).await;
    }

    // Surface service events in the log and refresh the catalog whenever the
    // terminal comes back online.
    let mut events = service.subscribe();
    let event_log = tokio::spawn(async move {
        let mut was_online = initially_online;
        loop {
            match events.recv().await {
                Ok(SyncEvent::StatusChanged(status)) => {
                    debug!(
                        online = status.online,
                        pending = status.pending,
                        rejected = status.rejected,
                        "sync status"
                    );
                    if status.online && !was_online {
                        refresh_catalog(&cache, gateway.as_ref(), &session).await;
                    }
                    was_online = status.online;
                }
                Ok(SyncEvent::DrainCompleted(report)) => info!(
                    synced = report.synced().len(),
                    failed = report.failed().len(),
                    remaining = report.remaining,
                    "Drain completed"
                ),
                Ok(SyncEvent::SaleRejected { sale_id, reason }) => {
                    warn!(sale_id = %sale_id, reason = %reason, "Sale rejected by admin dashboard")
                }
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "event log lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    info!("Sync daemon running; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    service.shutdown().await;
    event_log.abort();
    Ok(())
}
