//! Registry of live listeners and their connections.
//!
//! The tracker is the authority for graceful drain: `end()` atomically
//! swaps the registry for an empty one, after which no new connection can
//! be tracked, and the returned records let shutdown force-close whatever
//! was still open.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::stats::Stats;
use crate::{conn_key, ListenerKind};

/// Listener identity: the bound port as a decimal string.
pub type ListenerId = String;

/// Per-connection kill switch.
///
/// `fire` is level-triggered: a waiter that subscribes after the trigger
/// still observes it.
#[derive(Debug, Default)]
struct KillSwitch {
    fired: AtomicBool,
    notify: Notify,
}

impl KillSwitch {
    fn fire(&self) {
        self.fired.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    async fn triggered(&self) {
        let mut notified = pin!(self.notify.notified());
        notified.as_mut().enable();
        if self.fired.load(Ordering::Acquire) {
            return;
        }
        notified.await;
    }
}

/// One bound listener and its live connections.
#[derive(Debug)]
pub struct ListenerEntry {
    id: ListenerId,
    kind: ListenerKind,
    addr: SocketAddr,
    listening: AtomicBool,
    max_conns: AtomicUsize,
    conns: DashMap<String, Arc<KillSwitch>>,
}

impl ListenerEntry {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> ListenerKind {
        self.kind
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    pub fn set_listening(&self, on: bool) {
        self.listening.store(on, Ordering::Release);
    }

    /// Current per-listener connection cap.
    pub fn max_conns(&self) -> usize {
        self.max_conns.load(Ordering::Acquire)
    }

    /// Applies a new cap; affects subsequent accepts only.
    pub fn set_max_conns(&self, cap: usize) {
        self.max_conns.store(cap, Ordering::Release);
    }

    /// Number of currently tracked connections.
    pub fn conn_count(&self) -> usize {
        self.conns.len()
    }

    /// Fires the kill switch of every tracked connection.
    pub fn kill_all(&self) {
        for entry in self.conns.iter() {
            entry.value().fire();
        }
    }
}

/// Guard for one tracked connection.
///
/// Dropping the guard removes the connection from its listener's map and
/// decrements the open-connection gauge, exactly once.
pub struct ConnGuard {
    listener: Arc<ListenerEntry>,
    key: String,
    kill: Arc<KillSwitch>,
    stats: Arc<Stats>,
}

impl ConnGuard {
    /// Resolves when shutdown force-closes this connection.
    pub async fn killed(&self) {
        self.kill.triggered().await;
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.listener.conns.remove(&self.key);
        self.stats.dec_open_conns();
    }
}

/// Process-wide connection tracker.
pub struct ConnTracker {
    listeners: Mutex<Vec<Arc<ListenerEntry>>>,
    ended: AtomicBool,
    stats: Arc<Stats>,
}

impl ConnTracker {
    pub fn new(stats: Arc<Stats>) -> Arc<Self> {
        Arc::new(Self {
            listeners: Mutex::new(Vec::new()),
            ended: AtomicBool::new(false),
            stats,
        })
    }

    /// Registers a bound listener. Returns `None` once the tracker has
    /// ended; the caller must not start accepting.
    pub fn track_server(
        &self,
        kind: ListenerKind,
        addr: SocketAddr,
        max_conns: usize,
    ) -> Option<Arc<ListenerEntry>> {
        if self.ended.load(Ordering::Acquire) {
            return None;
        }

        let entry = Arc::new(ListenerEntry {
            id: addr.port().to_string(),
            kind,
            addr,
            listening: AtomicBool::new(true),
            max_conns: AtomicUsize::new(max_conns),
            conns: DashMap::new(),
        });

        self.listeners.lock().push(entry.clone());
        Some(entry)
    }

    /// Tracks an accepted connection.
    ///
    /// Returns `None` when the tracker has ended or the listener is no
    /// longer listening; the caller **must** close the socket then.
    pub fn track_conn(
        &self,
        listener: &Arc<ListenerEntry>,
        peer: SocketAddr,
    ) -> Option<ConnGuard> {
        if self.ended.load(Ordering::Acquire) || !listener.is_listening() {
            return None;
        }

        let key = conn_key(&peer);
        let kill = Arc::new(KillSwitch::default());
        listener.conns.insert(key.clone(), kill.clone());
        self.stats.inc_open_conns();

        Some(ConnGuard {
            listener: listener.clone(),
            key,
            kill,
            stats: self.stats.clone(),
        })
    }

    /// Snapshot of the registered listeners.
    pub fn servers(&self) -> Vec<Arc<ListenerEntry>> {
        self.listeners.lock().clone()
    }

    /// Total tracked connections across all listeners.
    pub fn conn_count(&self) -> usize {
        self.listeners.lock().iter().map(|l| l.conn_count()).sum()
    }

    /// True once `end()` has run.
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// Terminally swaps the registry for an empty one and returns the
    /// prior listeners with their connection maps. All subsequent
    /// `track_conn` calls return `None`.
    pub fn end(&self) -> Vec<Arc<ListenerEntry>> {
        self.ended.store(true, Ordering::Release);
        let drained = std::mem::take(&mut *self.listeners.lock());
        for listener in &drained {
            listener.set_listening(false);
        }
        drained
    }
}
