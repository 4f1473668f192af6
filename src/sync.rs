//! Sync engine: drains the local sale queue into the admin dashboard.
//!
//! One pass reads every pending sale in creation order and submits them one
//! at a time. A confirmed sale is deleted locally; a sale the backend refuses
//! outright moves to the rejection log; a transient failure stops the pass
//! and leaves that sale and everything after it queued for the next trigger.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, StorageError};
use crate::gateway::RemoteGateway;
use crate::models::{PendingSale, ServerId, Session};
use crate::queue::SaleQueue;
use crate::store::META_LAST_SYNC_AT;

const MIN_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Lifecycle of a queued sale inside a drain.
///
/// `Pending -> InFlight -> Synced | Deferred | Failed`. A deferred sale is
/// pending again for the next pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    Pending,
    InFlight,
    Synced,
    Deferred,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    Synced { server_id: ServerId },
    Deferred { reason: String, status: Option<u16> },
    Failed { reason: String, status: Option<u16> },
}

impl SyncOutcome {
    pub fn state(&self) -> RecordState {
        match self {
            SyncOutcome::Synced { .. } => RecordState::Synced,
            SyncOutcome::Deferred { .. } => RecordState::Deferred,
            SyncOutcome::Failed { .. } => RecordState::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncEntry {
    pub sale_id: String,
    #[serde(flatten)]
    pub outcome: SyncOutcome,
}

/// Per-sale outcomes of one drain pass, in submission order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub entries: Vec<SyncEntry>,
    /// Sales left untouched because an earlier sale hit a transient failure.
    pub not_attempted: Vec<String>,
    /// Queue length once the pass finished.
    pub remaining: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SyncReport {
    fn ids_in(&self, state: RecordState) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| e.outcome.state() == state)
            .map(|e| e.sale_id.as_str())
            .collect()
    }

    pub fn synced(&self) -> Vec<&str> {
        self.ids_in(RecordState::Synced)
    }

    pub fn failed(&self) -> Vec<&str> {
        self.ids_in(RecordState::Failed)
    }

    pub fn deferred(&self) -> Vec<&str> {
        self.ids_in(RecordState::Deferred)
    }

    /// True when a transient failure cut the pass short.
    pub fn stopped_early(&self) -> bool {
        self.entries
            .last()
            .is_some_and(|e| e.outcome.state() == RecordState::Deferred)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Reason of the deferral that stopped the pass, if any.
    pub fn deferral_reason(&self) -> Option<&str> {
        self.entries.last().and_then(|e| match &e.outcome {
            SyncOutcome::Deferred { reason, .. } => Some(reason.as_str()),
            _ => None,
        })
    }
}

pub struct SyncEngine {
    queue: SaleQueue,
    gateway: Arc<dyn RemoteGateway>,
    submit_timeout: Duration,
    drain_lock: AsyncMutex<()>,
}

impl SyncEngine {
    pub fn new(
        queue: SaleQueue,
        gateway: Arc<dyn RemoteGateway>,
        submit_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            gateway,
            submit_timeout,
            drain_lock: AsyncMutex::new(()),
        }
    }

    pub fn queue(&self) -> &SaleQueue {
        &self.queue
    }

    pub fn gateway(&self) -> &Arc<dyn RemoteGateway> {
        &self.gateway
    }

    pub fn is_draining(&self) -> bool {
        self.drain_lock.try_lock().is_err()
    }

    /// Run one pass. Waits for a pass already in progress and then runs
    /// against the queue it left behind, so no sale is submitted twice.
    pub async fn drain(&self, session: &Session) -> Result<SyncReport, StorageError> {
        let _pass = self.drain_lock.lock().await;
        self.run_pass(session).await
    }

    /// Run one pass unless another is already active.
    pub async fn try_drain(&self, session: &Session) -> Result<Option<SyncReport>, StorageError> {
        let Ok(_pass) = self.drain_lock.try_lock() else {
            debug!("drain already in progress, skipping");
            return Ok(None);
        };
        self.run_pass(session).await.map(Some)
    }

    pub fn last_sync_at(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        let raw = self.queue.store().get_meta(META_LAST_SYNC_AT)?;
        Ok(raw
            .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map(|t| t.with_timezone(&Utc)))
    }

    async fn submit(
        &self,
        sale: &PendingSale,
        session: &Session,
    ) -> Result<ServerId, GatewayError> {
        let attempt = self.gateway.submit_sale(sale, session);
        match tokio::time::timeout(self.submit_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::transient(format!(
                "submit timed out after {}ms",
                self.submit_timeout.as_millis()
            ))),
        }
    }

    async fn run_pass(&self, session: &Session) -> Result<SyncReport, StorageError> {
        let started_at = Utc::now();
        let pending = self.queue.list_pending()?;
        if pending.is_empty() {
            return Ok(SyncReport {
                entries: Vec::new(),
                not_attempted: Vec::new(),
                remaining: 0,
                started_at,
                finished_at: Utc::now(),
            });
        }
        info!(pending = pending.len(), "Draining sale queue");

        let mut entries = Vec::with_capacity(pending.len());
        let mut not_attempted = Vec::new();

        for (index, sale) in pending.iter().enumerate() {
            debug!(sale_id = %sale.id, state = ?RecordState::InFlight, "Submitting sale");
            match self.submit(sale, session).await {
                Ok(server_id) => {
                    // The backend has the sale; a failed delete only means the
                    // next pass resubmits it under the same idempotency key.
                    if let Err(e) = self.queue.remove(&sale.id) {
                        warn!(
                            sale_id = %sale.id,
                            error = %e,
                            "Synced sale could not be removed locally"
                        );
                    }
                    entries.push(SyncEntry {
                        sale_id: sale.id.clone(),
                        outcome: SyncOutcome::Synced { server_id },
                    });
                }
                Err(err) if err.is_transient() => {
                    info!(
                        sale_id = %sale.id,
                        error = %err,
                        "Transient sync failure; keeping queue pending"
                    );
                    entries.push(SyncEntry {
                        sale_id: sale.id.clone(),
                        outcome: SyncOutcome::Deferred {
                            reason: err.to_string(),
                            status: err.status(),
                        },
                    });
                    not_attempted = pending[index + 1..].iter().map(|s| s.id.clone()).collect();
                    break;
                }
                Err(err) => {
                    let reason = err.to_string();
                    if let Err(e) = self.queue.reject(sale, &reason) {
                        // Still queued; report it as pending, not dropped.
                        warn!(
                            sale_id = %sale.id,
                            error = %e,
                            "Rejected sale could not be moved to the rejection log"
                        );
                        entries.push(SyncEntry {
                            sale_id: sale.id.clone(),
                            outcome: SyncOutcome::Deferred {
                                reason: format!("{reason} (rejection not recorded: {e})"),
                                status: err.status(),
                            },
                        });
                        not_attempted =
                            pending[index + 1..].iter().map(|s| s.id.clone()).collect();
                        break;
                    }
                    entries.push(SyncEntry {
                        sale_id: sale.id.clone(),
                        outcome: SyncOutcome::Failed {
                            reason,
                            status: err.status(),
                        },
                    });
                }
            }
        }

        let finished_at = Utc::now();
        let synced = entries
            .iter()
            .filter(|e| e.outcome.state() == RecordState::Synced)
            .count();
        if synced > 0 {
            if let Err(e) = self
                .queue
                .store()
                .set_meta(META_LAST_SYNC_AT, &finished_at.to_rfc3339())
            {
                warn!(error = %e, "Failed to persist last sync time");
            }
        }

        let remaining = self.queue.pending_count().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to count pending sales after drain");
            pending.len() - synced
        });
        info!(
            synced,
            attempted = entries.len(),
            not_attempted = not_attempted.len(),
            remaining,
            "Drain pass complete"
        );

        Ok(SyncReport {
            entries,
            not_attempted,
            remaining,
            started_at,
            finished_at,
        })
    }
}

// ---------------------------------------------------------------------------
// Retry scheduling
// ---------------------------------------------------------------------------

/// Spread retries from many terminals without a random source.
pub(crate) fn deterministic_jitter_ms(seed: u64) -> u64 {
    (seed % 700) + 50
}

/// Delay before the next timer-driven pass after `failures` consecutive
/// transient stops: `base * 2^(failures-1)`, clamped to `[1s, max]`, plus
/// jitter.
pub(crate) fn backoff_delay(base: Duration, failures: u32, max: Duration, seed: u64) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    let raw = base.saturating_mul(1u32 << exponent);
    let bounded = raw.clamp(MIN_RETRY_DELAY, max.max(MIN_RETRY_DELAY));
    bounded + Duration::from_millis(deterministic_jitter_ms(seed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::gateway::testing::ScriptedGateway;
    use crate::models::{PaymentMethod, SaleDraft, SaleLineItem};
    use crate::store::{LocalStore, MemoryStore};

    fn sale(id: &str, total: f64) -> PendingSale {
        PendingSale {
            id: id.to_string(),
            items: vec![SaleLineItem::new("p-1", "Widget", 1, total, 1.0)],
            subtotal: total,
            total,
            discount: 0.0,
            tax: 0.0,
            payment_method: PaymentMethod::Cash,
            cashier_id: "cashier-1".into(),
            notes: None,
            created_at: Utc::now(),
        }
    }

    fn engine_with(
        store: Arc<dyn LocalStore>,
        timeout: Duration,
    ) -> (Arc<SyncEngine>, Arc<ScriptedGateway>) {
        let gateway = Arc::new(ScriptedGateway::new());
        let engine = SyncEngine::new(SaleQueue::new(store), gateway.clone(), timeout);
        (Arc::new(engine), gateway)
    }

    fn engine() -> (Arc<SyncEngine>, Arc<ScriptedGateway>) {
        engine_with(
            Arc::new(db::open_in_memory().expect("in-memory db")),
            Duration::from_secs(5),
        )
    }

    fn session() -> Session {
        Session::new("cashier-1")
    }

    #[tokio::test]
    async fn test_drain_all_succeed_in_order() {
        let (engine, gateway) = engine();
        for id in ["s1", "s2", "s3"] {
            engine.queue().enqueue(&sale(id, 1.0)).unwrap();
        }

        let report = engine.drain(&session()).await.unwrap();

        assert_eq!(report.synced(), vec!["s1", "s2", "s3"]);
        assert_eq!(gateway.attempts(), vec!["s1", "s2", "s3"]);
        assert_eq!(report.remaining, 0);
        assert!(!report.stopped_early());
        assert!(engine.queue().list_pending().unwrap().is_empty());
        assert!(engine.last_sync_at().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_empty_queue_makes_no_calls() {
        let (engine, gateway) = engine();
        let report = engine.drain(&session()).await.unwrap();
        assert!(report.is_empty());
        assert!(gateway.attempts().is_empty());
        assert!(engine.last_sync_at().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transient_failure_stops_pass() {
        let (engine, gateway) = engine();
        for id in ["s1", "s2", "s3", "s4"] {
            engine.queue().enqueue(&sale(id, 1.0)).unwrap();
        }
        gateway.fail_next("s2", GatewayError::from_status(503, "maintenance"));

        let report = engine.drain(&session()).await.unwrap();

        assert_eq!(report.synced(), vec!["s1"]);
        assert_eq!(report.deferred(), vec!["s2"]);
        assert_eq!(report.not_attempted, vec!["s3", "s4"]);
        assert_eq!(report.remaining, 3);
        assert!(report.stopped_early());
        assert_eq!(report.deferral_reason(), Some("maintenance"));
        assert_eq!(gateway.attempts(), vec!["s1", "s2"]);

        let ids: Vec<String> = engine
            .queue()
            .list_pending()
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["s2", "s3", "s4"]);

        // Next pass picks up where this one stopped.
        let report = engine.drain(&session()).await.unwrap();
        assert_eq!(report.synced(), vec!["s2", "s3", "s4"]);
        assert_eq!(report.remaining, 0);
    }

    #[tokio::test]
    async fn test_permanent_failure_drops_sale_and_continues() {
        let (engine, gateway) = engine();
        engine.queue().enqueue(&sale("B", 1.0)).unwrap();
        engine.queue().enqueue(&sale("C", 2.0)).unwrap();
        gateway.fail_next("B", GatewayError::from_status(422, "Validation failed"));

        let report = engine.drain(&session()).await.unwrap();

        assert_eq!(report.failed(), vec!["B"]);
        assert_eq!(report.synced(), vec!["C"]);
        assert_eq!(report.remaining, 0);
        assert!(engine.queue().list_pending().unwrap().is_empty());

        let rejected = engine.queue().rejected().unwrap();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].sale.id, "B");
        assert_eq!(rejected[0].reason, "Validation failed");
    }

    #[tokio::test]
    async fn test_offline_sale_delivered_on_next_drain() {
        let (engine, gateway) = engine();
        let draft = SaleDraft {
            items: vec![
                SaleLineItem::new("p-1", "Espresso Beans 1kg", 2, 19.99, 12.5),
                SaleLineItem::new("p-2", "Paper Filters", 1, 4.99, 2.0),
            ],
            discount: 0.0,
            tax: 8.0,
            payment_method: PaymentMethod::Cash,
            notes: None,
        };
        let s1 = engine.queue().enqueue_draft(draft, &session()).unwrap();
        assert_eq!(s1.total, 52.97);
        assert_eq!(engine.queue().list_pending().unwrap(), vec![s1.clone()]);

        let report = engine.drain(&session()).await.unwrap();
        assert_eq!(report.synced(), vec![s1.id.as_str()]);
        assert!(engine.queue().list_pending().unwrap().is_empty());
        assert_eq!(gateway.server_sale_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_drains_never_double_submit() {
        let (engine, gateway) = engine();
        gateway.set_delay(Duration::from_millis(10));
        for i in 0..5 {
            engine.queue().enqueue(&sale(&format!("s{i}"), 1.0)).unwrap();
        }

        let s = session();
        let (a, b) = tokio::join!(engine.drain(&s), engine.drain(&s));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.synced().len() + b.synced().len(), 5);
        assert_eq!(gateway.attempts().len(), 5);
        assert_eq!(gateway.server_sale_count(), 5);
        assert_eq!(gateway.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_try_drain_skips_while_busy() {
        let (engine, gateway) = engine();
        gateway.set_delay(Duration::from_millis(100));
        engine.queue().enqueue(&sale("s1", 1.0)).unwrap();

        let background = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.drain(&session()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(engine.is_draining());
        assert!(engine.try_drain(&session()).await.unwrap().is_none());

        let report = background.await.unwrap().unwrap();
        assert_eq!(report.synced(), vec!["s1"]);
        assert!(!engine.is_draining());
    }

    #[tokio::test]
    async fn test_submit_timeout_is_transient() {
        let (engine, gateway) = engine_with(
            Arc::new(db::open_in_memory().unwrap()),
            Duration::from_millis(20),
        );
        gateway.set_delay(Duration::from_millis(500));
        engine.queue().enqueue(&sale("s1", 1.0)).unwrap();
        engine.queue().enqueue(&sale("s2", 1.0)).unwrap();

        let report = engine.drain(&session()).await.unwrap();

        assert_eq!(report.deferred(), vec!["s1"]);
        assert_eq!(report.not_attempted, vec!["s2"]);
        assert_eq!(engine.queue().pending_count().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_failed_local_delete_resubmits_idempotently() {
        let store = Arc::new(MemoryStore::new());
        let (engine, gateway) = engine_with(store.clone(), Duration::from_secs(5));
        engine.queue().enqueue(&sale("s1", 1.0)).unwrap();

        store.set_fail_writes(true);
        let report = engine.drain(&session()).await.unwrap();
        assert_eq!(report.synced(), vec!["s1"]);
        assert_eq!(report.remaining, 1);

        store.set_fail_writes(false);
        let report = engine.drain(&session()).await.unwrap();
        assert_eq!(report.synced(), vec!["s1"]);
        assert_eq!(report.remaining, 0);

        assert_eq!(gateway.attempts(), vec!["s1", "s1"]);
        assert_eq!(gateway.server_sale_count(), 1);
    }

    #[tokio::test]
    async fn test_unrecorded_rejection_stays_pending() {
        let store = Arc::new(MemoryStore::new());
        let (engine, gateway) = engine_with(store.clone(), Duration::from_secs(5));
        engine.queue().enqueue(&sale("B", 1.0)).unwrap();
        engine.queue().enqueue(&sale("C", 2.0)).unwrap();
        gateway.fail_next("B", GatewayError::from_status(422, "Validation failed"));

        store.set_fail_writes(true);
        let report = engine.drain(&session()).await.unwrap();

        assert!(report.failed().is_empty());
        assert_eq!(report.deferred(), vec!["B"]);
        assert_eq!(report.not_attempted, vec!["C"]);
        assert_eq!(report.remaining, 2);
        assert!(engine.queue().rejected().unwrap().is_empty());
        assert_eq!(gateway.attempts(), vec!["B"]);
    }

    #[test]
    fn test_jitter_range() {
        for seed in [0u64, 1, 699, 700, 12_345, u64::MAX] {
            let jitter = deterministic_jitter_ms(seed);
            assert!((50..750).contains(&jitter));
        }
        assert_eq!(deterministic_jitter_ms(42), deterministic_jitter_ms(42));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let base = Duration::from_secs(10);
        let max = Duration::from_secs(300);
        let strip = |d: Duration| d - Duration::from_millis(deterministic_jitter_ms(7));

        assert_eq!(strip(backoff_delay(base, 1, max, 7)), Duration::from_secs(10));
        assert_eq!(strip(backoff_delay(base, 2, max, 7)), Duration::from_secs(20));
        assert_eq!(strip(backoff_delay(base, 3, max, 7)), Duration::from_secs(40));
        assert_eq!(strip(backoff_delay(base, 30, max, 7)), max);
        assert_eq!(
            strip(backoff_delay(Duration::ZERO, 1, max, 7)),
            Duration::from_secs(1)
        );
    }
}
