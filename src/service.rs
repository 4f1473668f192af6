//! Long-running sync service.
//!
//! Owns the background worker that turns triggers into drain passes:
//! new sales, the online edge, explicit `sync_now` calls and a periodic
//! timer. Any number of triggers raised while a pass is running collapse into
//! one follow-up pass. Status changes, drain reports and rejected sales are
//! published on a broadcast channel for UI layers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::connectivity::{ConnectivityMonitor, Subscription};
use crate::error::StorageError;
use crate::models::{PendingSale, RejectedSale, SaleDraft, Session};
use crate::sync::{backoff_delay, SyncEngine, SyncOutcome, SyncReport};

const EVENT_CAPACITY: usize = 64;
const MIN_TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy)]
pub struct ServiceOptions {
    /// Period of timer-driven passes and the base of the retry backoff.
    pub sync_interval: Duration,
    pub max_backoff: Duration,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(10),
            max_backoff: Duration::from_secs(300),
        }
    }
}

/// Snapshot for a sync indicator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub online: bool,
    pub pending: usize,
    pub rejected: usize,
    pub draining: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    StatusChanged(SyncStatus),
    DrainCompleted(SyncReport),
    SaleRejected { sale_id: String, reason: String },
}

#[derive(Debug, Default)]
struct RetryState {
    failures: u32,
    retry_at: Option<Instant>,
    last_error: Option<String>,
}

struct Shared {
    engine: SyncEngine,
    monitor: ConnectivityMonitor,
    session: Mutex<Option<Session>>,
    trigger: Notify,
    events: broadcast::Sender<SyncEvent>,
    retry: Mutex<RetryState>,
    options: ServiceOptions,
}

impl Shared {
    fn current_session(&self) -> Option<Session> {
        self.session.lock().ok().and_then(|s| s.clone())
    }

    fn status(&self) -> Result<SyncStatus, StorageError> {
        let queue = self.engine.queue();
        let (last_error, consecutive_failures) = match self.retry.lock() {
            Ok(retry) => (retry.last_error.clone(), retry.failures),
            Err(_) => (None, 0),
        };
        Ok(SyncStatus {
            online: self.monitor.is_online(),
            pending: queue.pending_count()?,
            rejected: queue.rejected()?.len(),
            draining: self.engine.is_draining(),
            last_sync_at: self.engine.last_sync_at()?,
            last_error,
            consecutive_failures,
        })
    }

    fn publish_status(&self) {
        match self.status() {
            Ok(status) => {
                let _ = self.events.send(SyncEvent::StatusChanged(status));
            }
            Err(e) => warn!(error = %e, "Failed to read sync status"),
        }
    }

    fn in_backoff(&self) -> bool {
        self.retry
            .lock()
            .ok()
            .and_then(|r| r.retry_at)
            .is_some_and(|at| Instant::now() < at)
    }

    fn record_outcome(&self, report: &SyncReport) {
        let Ok(mut retry) = self.retry.lock() else {
            return;
        };
        if report.stopped_early() {
            retry.failures = retry.failures.saturating_add(1);
            let seed = report
                .deferred()
                .first()
                .map(|id| id.bytes().map(u64::from).sum::<u64>())
                .unwrap_or_default()
                + u64::from(retry.failures);
            let delay = backoff_delay(
                self.options.sync_interval,
                retry.failures,
                self.options.max_backoff,
                seed,
            );
            retry.retry_at = Some(Instant::now() + delay);
            retry.last_error = report.deferral_reason().map(str::to_string);
            info!(
                failures = retry.failures,
                retry_in_ms = delay.as_millis() as u64,
                "Sync deferred; backing off timed retries"
            );
        } else {
            if retry.failures > 0 {
                info!(after_failures = retry.failures, "Sync recovered");
            }
            *retry = RetryState::default();
        }
    }

    /// One pass if online and signed in. `explicit` triggers ignore backoff.
    async fn drain_once(&self, explicit: bool) -> Option<SyncReport> {
        if !self.monitor.is_online() {
            trace!("offline; deferring drain");
            return None;
        }
        let Some(session) = self.current_session() else {
            debug!("no active session; deferring drain");
            return None;
        };
        if !explicit && self.in_backoff() {
            trace!("timed drain skipped during backoff");
            return None;
        }

        match self.engine.drain(&session).await {
            Ok(report) => {
                self.record_outcome(&report);
                for entry in &report.entries {
                    if let SyncOutcome::Failed { reason, .. } = &entry.outcome {
                        let _ = self.events.send(SyncEvent::SaleRejected {
                            sale_id: entry.sale_id.clone(),
                            reason: reason.clone(),
                        });
                    }
                }
                if !report.is_empty() {
                    let _ = self.events.send(SyncEvent::DrainCompleted(report.clone()));
                    self.publish_status();
                }
                Some(report)
            }
            Err(e) => {
                warn!(error = %e, "Drain aborted by local storage failure");
                if let Ok(mut retry) = self.retry.lock() {
                    retry.last_error = Some(e.to_string());
                }
                self.publish_status();
                None
            }
        }
    }
}

async fn run_worker(shared: Arc<Shared>, cancel: CancellationToken) {
    let period = shared.options.sync_interval.max(MIN_TICK);
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("Sync worker started (interval: {}s)", period.as_secs());

    loop {
        let explicit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = shared.trigger.notified() => true,
            _ = ticker.tick() => false,
        };
        shared.drain_once(explicit).await;
    }
    info!("Sync worker stopped");
}

pub struct SyncService {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    tasks: TaskTracker,
    online_edge: Mutex<Option<Subscription>>,
}

impl SyncService {
    /// Start the worker on the current tokio runtime. A first pass is queued
    /// immediately so sales left over from a previous run go out as soon as
    /// the terminal is online with a session.
    pub fn start(
        engine: SyncEngine,
        monitor: ConnectivityMonitor,
        options: ServiceOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            engine,
            monitor: monitor.clone(),
            session: Mutex::new(None),
            trigger: Notify::new(),
            events,
            retry: Mutex::new(RetryState::default()),
            options,
        });

        let on_online: Weak<Shared> = Arc::downgrade(&shared);
        let on_offline: Weak<Shared> = Arc::downgrade(&shared);
        let subscription = monitor.on_change(
            move || {
                if let Some(shared) = on_online.upgrade() {
                    info!("Network restored; resuming queued sync");
                    shared.publish_status();
                    shared.trigger.notify_one();
                }
            },
            move || {
                if let Some(shared) = on_offline.upgrade() {
                    info!("Network offline; deferring remote sync and keeping queue pending");
                    shared.publish_status();
                }
            },
        );

        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();
        tasks.spawn(run_worker(shared.clone(), cancel.clone()));
        shared.trigger.notify_one();

        Self {
            shared,
            cancel,
            tasks,
            online_edge: Mutex::new(Some(subscription)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.shared.events.subscribe()
    }

    pub fn monitor(&self) -> &ConnectivityMonitor {
        &self.shared.monitor
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.shared.engine
    }

    /// Sign a cashier in. Queued sales start draining if online.
    pub fn set_session(&self, session: Session) {
        if let Ok(mut current) = self.shared.session.lock() {
            info!(cashier_id = %session.cashier_id, "Sync session set");
            *current = Some(session);
        }
        self.shared.trigger.notify_one();
    }

    /// Sign out. Queued sales stay queued until the next session.
    pub fn clear_session(&self) {
        if let Ok(mut current) = self.shared.session.lock() {
            if current.take().is_some() {
                info!("Sync session cleared");
            }
        }
    }

    pub fn session(&self) -> Option<Session> {
        self.shared.current_session()
    }

    /// Persist a completed checkout and kick the worker.
    ///
    /// Returns once the sale is durable locally; delivery happens in the
    /// background. With no active session, `session` becomes the active one.
    pub fn record_sale(
        &self,
        draft: SaleDraft,
        session: &Session,
    ) -> Result<PendingSale, StorageError> {
        let sale = self.shared.engine.queue().enqueue_draft(draft, session)?;
        if let Ok(mut current) = self.shared.session.lock() {
            if current.is_none() {
                *current = Some(session.clone());
            }
        }
        self.shared.publish_status();
        if self.shared.monitor.is_online() {
            self.shared.trigger.notify_one();
        }
        Ok(sale)
    }

    /// Ask the worker for a pass now, bypassing any backoff.
    pub fn sync_now(&self) {
        debug!("sync requested");
        self.shared.trigger.notify_one();
    }

    /// Run a pass on the caller's task and return its report. `None` when
    /// offline or signed out.
    pub async fn drain_now(&self) -> Option<SyncReport> {
        self.shared.drain_once(true).await
    }

    pub fn status(&self) -> Result<SyncStatus, StorageError> {
        self.shared.status()
    }

    pub fn rejected_sales(&self) -> Result<Vec<RejectedSale>, StorageError> {
        self.shared.engine.queue().rejected()
    }

    pub fn clear_rejected(&self) -> Result<usize, StorageError> {
        let cleared = self.shared.engine.queue().clear_rejected()?;
        self.shared.publish_status();
        Ok(cleared)
    }

    /// Poll `probe` every `interval` and feed the result into the monitor.
    /// Used where the platform gives no connectivity signal of its own.
    pub fn spawn_health_probe<F, Fut>(&self, interval: Duration, probe: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let monitor = self.shared.monitor.clone();
        let cancel = self.cancel.clone();
        self.tasks.spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(MIN_TICK));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let online = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    online = probe() => online,
                };
                monitor.set_online(online);
            }
            debug!("Health probe stopped");
        });
    }

    /// Stop background tasks. A pass already running finishes first.
    pub async fn shutdown(&self) {
        info!("Sync service shutting down");
        if let Ok(mut edge) = self.online_edge.lock() {
            if let Some(subscription) = edge.take() {
                subscription.cancel();
            }
        }
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        info!("Sync service stopped");
    }
}

impl Drop for SyncService {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
