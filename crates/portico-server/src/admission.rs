//! Load-adaptive admission control.
//!
//! Every five seconds the controller samples load averages (normalised to
//! percent of CPU count) and memory, accumulates a pressure integer `adj`,
//! recomputes the per-listener connection cap, and publishes the whole
//! snapshot as `bp`. Sustained pressure escalates: first a hard cap cut,
//! then process shutdown. Pressure is not an error; only the escalation
//! thresholds have side effects.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{System, SystemExt};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::stats::{AdmissionSnapshot, Stats};
use crate::tracker::ConnTracker;

/// Cadence of admission ticks.
pub const ADJ_PERIOD: Duration = Duration::from_secs(5);

/// Sustained stress for ~6 minutes forces shutdown.
const SHUTDOWN_ADJ: i64 = 72;

/// Sustained stress for ~4 minutes halves the connection floor.
const STRESS_ADJ: i64 = 48;

const LOW_RAM_FRACTION: f64 = 0.10;
const VERY_LOW_RAM_FRACTION: f64 = 0.025;
const ADJ_DECAY: f64 = 0.75;

/// One OS-level sample.
#[derive(Debug, Clone, Copy)]
pub struct SystemSample {
    /// Load averages as percent of CPU count.
    pub avg1: f64,
    pub avg5: f64,
    pub avg15: f64,
    pub free_mem: u64,
    pub total_mem: u64,
}

/// Periodic controller retuning every listener's `max_connections`.
pub struct AdmissionController {
    stats: Arc<Stats>,
    tracker: Arc<ConnTracker>,
    min_conns: usize,
    max_conns: usize,
    in_cloud: bool,
    adj: AtomicI64,
    mem_trace: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    sys: Mutex<System>,
    cpu_count: usize,
}

impl AdmissionController {
    pub fn new(
        stats: Arc<Stats>,
        tracker: Arc<ConnTracker>,
        min_conns: usize,
        max_conns: usize,
        in_cloud: bool,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Arc<Self> {
        let mut sys = System::new();
        sys.refresh_cpu();
        let cpu_count = sys.cpus().len().max(1);

        Arc::new(Self {
            stats,
            tracker,
            min_conns,
            max_conns,
            in_cloud,
            adj: AtomicI64::new(0),
            mem_trace: AtomicBool::new(false),
            shutdown_tx,
            sys: Mutex::new(sys),
            cpu_count,
        })
    }

    /// One periodic tick: sample the OS and retune.
    pub fn tick(&self) {
        let sample = self.sample();
        self.retune(None, sample);
    }

    /// Applies an explicit cap (drain uses 1), clamped into
    /// `[min_conns, max_conns]`; resets the pressure accumulator.
    pub fn adjust_max_conns(&self, cap: usize) {
        let sample = self.sample();
        self.retune(Some(cap), sample);
    }

    fn sample(&self) -> SystemSample {
        let mut sys = self.sys.lock();
        sys.refresh_memory();
        let load = sys.load_average();
        let scale = 100.0 / self.cpu_count as f64;

        SystemSample {
            avg1: load.one * scale,
            avg5: load.five * scale,
            avg15: load.fifteen * scale,
            free_mem: sys.available_memory(),
            total_mem: sys.total_memory(),
        }
    }

    /// Core retune step, separated from sampling so tests can drive it.
    pub(crate) fn retune(&self, explicit: Option<usize>, s: SystemSample) {
        let total = s.total_mem.max(1) as f64;
        let low_ram = (s.free_mem as f64) < LOW_RAM_FRACTION * total;
        let very_low_ram = (s.free_mem as f64) < VERY_LOW_RAM_FRACTION * total;

        let mut adj = self.adj.load(Ordering::Acquire);

        let n = match explicit {
            Some(cap) => {
                adj = 0;
                cap.clamp(self.min_conns, self.max_conns)
            }
            None => {
                adj += pressure_delta(s.avg1, s.avg5);

                if adj > SHUTDOWN_ADJ || (very_low_ram && self.in_cloud) {
                    warn!(
                        adj,
                        very_low_ram,
                        "sustained pressure, initiating shutdown"
                    );
                    let _ = self.shutdown_tx.send(());
                }

                let (cap, decay) =
                    compute_cap(s.avg1, s.avg5, low_ram, self.min_conns, self.max_conns);

                // The stress override applies to the cap only; calm-load
                // decay still runs, so the accumulator can come back down.
                let stress = adj > STRESS_ADJ;
                if stress {
                    warn!(adj, avg1 = s.avg1, avg5 = s.avg5, "load stress, capping hard");
                }
                if decay {
                    adj = (adj as f64 * ADJ_DECAY).floor() as i64;
                }
                let cap = if stress { self.min_conns / 2 } else { cap };

                if adj > 0 {
                    debug!(adj, avg1 = s.avg1, avg5 = s.avg5, "elevated load");
                    if !self.mem_trace.swap(true, Ordering::AcqRel) {
                        info!("memory tracing enabled");
                    }
                } else if self.mem_trace.swap(false, Ordering::AcqRel) {
                    info!("memory tracing disabled");
                }

                cap
            }
        };

        self.adj.store(adj, Ordering::Release);

        for listener in self.tracker.servers() {
            listener.set_max_conns(n);
        }

        self.stats.set_bp(AdmissionSnapshot {
            avg1: s.avg1,
            avg5: s.avg5,
            avg15: s.avg15,
            adj,
            max_conns: n,
        });
    }

    /// Current pressure value.
    pub fn adj(&self) -> i64 {
        self.adj.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn set_adj(&self, adj: i64) {
        self.adj.store(adj, Ordering::Release);
    }
}

/// Additive pressure update.
fn pressure_delta(avg1: f64, avg5: f64) -> i64 {
    let mut delta = 0;
    if avg5 > 90.0 {
        delta += 3;
    }
    if avg1 > 100.0 {
        delta += 2;
    }
    if avg1 > avg5 {
        delta += 1;
    }
    delta
}

/// Cap ladder. The second return is true when the load is calm enough to
/// decay the pressure accumulator.
fn compute_cap(
    avg1: f64,
    avg5: f64,
    low_ram: bool,
    min_conns: usize,
    max_conns: usize,
) -> (usize, bool) {
    let scaled = |f: f64| ((max_conns as f64 * f) as usize).max(min_conns);

    if avg1 > 100.0 {
        (min_conns, false)
    } else if avg1 > 90.0 || avg5 > 80.0 || low_ram {
        (scaled(0.2), false)
    } else if avg1 > 80.0 || avg5 > 75.0 {
        (scaled(0.4), false)
    } else if avg1 > 70.0 {
        (scaled(0.6), false)
    } else {
        (max_conns, true)
    }
}

/// Runs the admission timer until shutdown.
pub fn spawn_ticker(
    controller: Arc<AdmissionController>,
    mut shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(ADJ_PERIOD);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => controller.tick(),
                _ = shutdown.recv() => {
                    debug!("admission timer stopped");
                    return;
                }
            }
        }
    })
}
