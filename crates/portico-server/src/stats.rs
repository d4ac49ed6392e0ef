//! Process-wide counters and the admission snapshot.

use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Snapshot produced by the admission controller on every tick.
///
/// Replaced as a whole so readers never observe a half-updated tuple.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdmissionSnapshot {
    /// 1-minute load average as percent of CPU count.
    pub avg1: f64,
    /// 5-minute load average as percent of CPU count.
    pub avg5: f64,
    /// 15-minute load average as percent of CPU count.
    pub avg15: f64,
    /// Pressure accumulator.
    pub adj: i64,
    /// Cap applied to every listener.
    pub max_conns: usize,
}

/// Front-end statistics.
///
/// Counters are monotonic except `open_conns`, which is a live gauge.
#[derive(Debug)]
pub struct Stats {
    /// Resolver dispatches.
    pub reqs: AtomicU64,

    /// Health-check hits.
    pub checks: AtomicU64,

    /// TLS handshake and client errors.
    pub tls_errors: AtomicU64,

    /// Connections refused by admission.
    pub drops: AtomicU64,

    /// Connections accepted or dropped, lifetime.
    pub total_conns: AtomicU64,

    /// Currently tracked connections.
    pub open_conns: AtomicU64,

    /// Sockets closed by the idle timer.
    pub timeouts: AtomicU64,

    /// Heap usage reports written.
    pub heap_snaps: AtomicU64,

    bp: ArcSwap<AdmissionSnapshot>,
}

impl Default for Stats {
    fn default() -> Self {
        Self {
            reqs: AtomicU64::new(0),
            checks: AtomicU64::new(0),
            tls_errors: AtomicU64::new(0),
            drops: AtomicU64::new(0),
            total_conns: AtomicU64::new(0),
            open_conns: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            heap_snaps: AtomicU64::new(0),
            bp: ArcSwap::from_pointee(AdmissionSnapshot::default()),
        }
    }
}

impl Stats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Publishes a new admission snapshot.
    pub fn set_bp(&self, snapshot: AdmissionSnapshot) {
        self.bp.store(Arc::new(snapshot));
    }

    /// Returns the current admission snapshot.
    pub fn bp(&self) -> Arc<AdmissionSnapshot> {
        self.bp.load_full()
    }

    pub fn inc_reqs(&self) -> u64 {
        self.reqs.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn inc_checks(&self) {
        self.checks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_tls_errors(&self) {
        self.tls_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_drops(&self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_total_conns(&self) {
        self.total_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_open_conns(&self) {
        self.open_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_open_conns(&self) {
        self.open_conns.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_timeouts(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// One-line summary for periodic logging.
    pub fn summary(&self) -> String {
        let bp = self.bp();
        format!(
            "reqs={} checks={} conns={}/{} open={} drops={} timeouts={} tls_errors={} bp=({:.0},{:.0},{:.0},{},{})",
            self.reqs.load(Ordering::Relaxed),
            self.checks.load(Ordering::Relaxed),
            self.total_conns.load(Ordering::Relaxed),
            bp.max_conns,
            self.open_conns.load(Ordering::Relaxed),
            self.drops.load(Ordering::Relaxed),
            self.timeouts.load(Ordering::Relaxed),
            self.tls_errors.load(Ordering::Relaxed),
            bp.avg1,
            bp.avg5,
            bp.avg15,
            bp.adj,
            bp.max_conns,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = Stats::new();
        assert_eq!(stats.inc_reqs(), 1);
        assert_eq!(stats.inc_reqs(), 2);

        stats.inc_open_conns();
        stats.inc_open_conns();
        stats.dec_open_conns();
        assert_eq!(stats.open_conns.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_bp_swapped_whole() {
        let stats = Stats::new();
        assert_eq!(stats.bp().max_conns, 0);

        stats.set_bp(AdmissionSnapshot {
            avg1: 50.0,
            avg5: 40.0,
            avg15: 30.0,
            adj: 3,
            max_conns: 256,
        });

        let bp = stats.bp();
        assert_eq!(bp.adj, 3);
        assert_eq!(bp.max_conns, 256);
        assert_eq!(bp.avg1, 50.0);
    }
}
