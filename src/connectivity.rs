//! Online/offline signal with edge-triggered listeners.
//!
//! The monitor never probes the network itself; it trusts whatever the
//! platform reports through [`ConnectivityMonitor::set_online`]. A false
//! "online" is harmless because the sync engine handles per-sale failures.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Current signal plus the number of transitions seen so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectivityState {
    pub online: bool,
    pub transitions: u64,
}

type Callback = Arc<dyn Fn() + Send + Sync>;

struct Listener {
    on_online: Callback,
    on_offline: Callback,
}

struct Inner {
    state: watch::Sender<ConnectivityState>,
    listeners: Mutex<HashMap<u64, Listener>>,
    next_listener_id: AtomicU64,
}

/// Cheap to clone; all clones share one signal.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<Inner>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (state, _) = watch::channel(ConnectivityState {
            online: initially_online,
            transitions: 0,
        });
        Self {
            inner: Arc::new(Inner {
                state,
                listeners: Mutex::new(HashMap::new()),
                next_listener_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn is_online(&self) -> bool {
        self.inner.state.borrow().online
    }

    pub fn state(&self) -> ConnectivityState {
        *self.inner.state.borrow()
    }

    /// Async view of the signal for tasks that prefer awaiting to callbacks.
    pub fn watch(&self) -> watch::Receiver<ConnectivityState> {
        self.inner.state.subscribe()
    }

    /// Feed a platform report into the monitor.
    ///
    /// Returns `true` when the report was a transition. Repeated reports of
    /// the current state are dropped without touching the counter or the
    /// listeners.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.inner.state.send_if_modified(|state| {
            if state.online == online {
                return false;
            }
            state.online = online;
            state.transitions += 1;
            true
        });
        if !changed {
            return false;
        }

        let transitions = self.inner.state.borrow().transitions;
        if online {
            info!(transitions, "Connectivity: online");
        } else {
            info!(transitions, "Connectivity: offline");
        }

        // Snapshot under the lock, call outside it so a callback may
        // subscribe or unsubscribe without deadlocking.
        let callbacks: Vec<Callback> = match self.inner.listeners.lock() {
            Ok(listeners) => listeners
                .values()
                .map(|l| {
                    if online {
                        l.on_online.clone()
                    } else {
                        l.on_offline.clone()
                    }
                })
                .collect(),
            Err(e) => {
                warn!("connectivity listeners lock poisoned: {e}");
                Vec::new()
            }
        };
        for callback in callbacks {
            callback();
        }
        true
    }

    /// Register a pair of edge callbacks. Both are removed together when the
    /// returned [`Subscription`] is cancelled or dropped.
    pub fn on_change<F, G>(&self, on_online: F, on_offline: G) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
        G: Fn() + Send + Sync + 'static,
    {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let listener = Listener {
            on_online: Arc::new(on_online),
            on_offline: Arc::new(on_offline),
        };
        match self.inner.listeners.lock() {
            Ok(mut listeners) => {
                listeners.insert(id, listener);
            }
            Err(e) => warn!("connectivity listeners lock poisoned: {e}"),
        }
        debug!(listener_id = id, "Connectivity listener registered");
        Subscription {
            id,
            monitor: Arc::downgrade(&self.inner),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().map(|l| l.len()).unwrap_or(0)
    }
}

/// Handle for a registered listener pair.
#[must_use = "dropping a Subscription unregisters its listeners"]
pub struct Subscription {
    id: u64,
    monitor: Weak<Inner>,
}

impl Subscription {
    /// Remove both listeners now.
    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(inner) = self.monitor.upgrade() else {
            return;
        };
        let Ok(mut listeners) = inner.listeners.lock() else {
            return;
        };
        if listeners.remove(&self.id).is_some() {
            debug!(listener_id = self.id, "Connectivity listener removed");
        }
    }
}
