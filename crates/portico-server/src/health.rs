//! Health checks, the request heartbeat, and gated heap reports.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use sysinfo::{ProcessExt, System, SystemExt};
use tracing::{debug, info, warn};

use crate::stats::Stats;
use crate::FrontendConfig;

/// Stats are logged every this many resolver dispatches.
const LOG_EVERY: u64 = 8192;

/// Heap reports are spaced `max_conns * HEAP_REPORT_MUL` dispatches apart.
const HEAP_REPORT_MUL: u64 = 16;

/// Hard cap on heap reports per process.
const MAX_HEAP_REPORTS: u64 = 20;

/// Builds the health-check router: `GET /` answers 200 immediately.
pub fn router(stats: Arc<Stats>) -> Router {
    Router::new().route("/", get(check)).with_state(stats)
}

async fn check(State(stats): State<Arc<Stats>>) -> StatusCode {
    stats.inc_checks();
    StatusCode::OK
}

/// Called at the start of every resolver dispatch.
///
/// Bumps `reqs`, periodically logs the stats summary, and writes a heap
/// usage report when the diagnostic gate is open. Report writing happens
/// off the async threads.
pub struct Heartbeat {
    stats: Arc<Stats>,
    measure_heap: bool,
    on_local: bool,
    report_every: u64,
    report_dir: PathBuf,
}

impl Heartbeat {
    pub fn new(stats: Arc<Stats>, cfg: &FrontendConfig) -> Arc<Self> {
        Arc::new(Self {
            stats,
            measure_heap: cfg.measure_heap,
            on_local: cfg.on_local,
            report_every: (cfg.max_conns as u64).max(1) * HEAP_REPORT_MUL,
            report_dir: std::env::temp_dir(),
        })
    }

    pub fn beat(&self) {
        let reqs = self.stats.inc_reqs();

        if reqs % LOG_EVERY == 0 {
            info!(summary = %self.stats.summary(), "front-end stats");
        }

        if self.should_report(reqs) {
            let snaps = self.stats.heap_snaps.fetch_add(1, Ordering::Relaxed);
            if snaps < MAX_HEAP_REPORTS {
                self.spawn_report(snaps);
            }
        }
    }

    /// Writes one final report during drain, subject to the same gate.
    pub fn final_report(&self) {
        if !self.measure_heap {
            return;
        }
        let snaps = self.stats.heap_snaps.fetch_add(1, Ordering::Relaxed);
        if snaps < MAX_HEAP_REPORTS {
            self.spawn_report(snaps);
        }
    }

    fn should_report(&self, reqs: u64) -> bool {
        if !self.measure_heap || reqs % self.report_every != 0 {
            return false;
        }
        // Cloud heap dumps are costly; only take them under pressure.
        self.on_local || self.stats.bp().adj > 0
    }

    fn spawn_report(&self, seq: u64) {
        let stats = self.stats.clone();
        let path = self
            .report_dir
            .join(format!("portico-heap-{}-{seq}.json", std::process::id()));

        tokio::task::spawn_blocking(move || match write_report(&path, &stats) {
            Ok(()) => debug!(path = %path.display(), "heap report written"),
            Err(e) => warn!(error = %e, "heap report failed"),
        });
    }
}

#[derive(Serialize)]
struct HeapReport {
    rss_bytes: u64,
    virtual_bytes: u64,
    total_mem_bytes: u64,
    available_mem_bytes: u64,
    reqs: u64,
    open_conns: u64,
}

fn write_report(path: &std::path::Path, stats: &Stats) -> std::io::Result<()> {
    let mut sys = System::new();
    sys.refresh_memory();

    let pid = sysinfo::get_current_pid()
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    sys.refresh_process(pid);

    let (rss, virt) = sys
        .process(pid)
        .map(|p| (p.memory(), p.virtual_memory()))
        .unwrap_or((0, 0));

    let report = HeapReport {
        rss_bytes: rss,
        virtual_bytes: virt,
        total_mem_bytes: sys.total_memory(),
        available_mem_bytes: sys.available_memory(),
        reqs: stats.reqs.load(Ordering::Relaxed),
        open_conns: stats.open_conns.load(Ordering::Relaxed),
    };

    let json = serde_json::to_vec_pretty(&report)?;
    std::fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::AdmissionSnapshot;
    use axum::body::Body;
    use http::Request;
    use tower::util::ServiceExt;

    #[tokio::test]
    async fn test_health_route_counts_checks() {
        let stats = Stats::new();
        let app = router(stats.clone());

        let res = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(stats.checks.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_heartbeat_counts_reqs() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();

        let stats = Stats::new();
        let hb = Heartbeat::new(stats.clone(), &FrontendConfig::default());

        hb.beat();
        hb.beat();
        assert_eq!(stats.reqs.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_report_gate() {
        let stats = Stats::new();
        let mut cfg = FrontendConfig::default();
        cfg.measure_heap = true;
        cfg.on_local = false;
        cfg.max_conns = 1;
        let hb = Heartbeat::new(stats.clone(), &cfg);

        // Cloud + no pressure: gate closed even on a report boundary.
        assert!(!hb.should_report(HEAP_REPORT_MUL));

        // Pressure opens the gate.
        stats.set_bp(AdmissionSnapshot {
            adj: 5,
            ..Default::default()
        });
        assert!(hb.should_report(HEAP_REPORT_MUL));
        assert!(!hb.should_report(HEAP_REPORT_MUL + 1));

        // Disabled measurement closes it regardless.
        let mut cfg = FrontendConfig::default();
        cfg.measure_heap = false;
        let hb = Heartbeat::new(stats, &cfg);
        assert!(!hb.should_report(HEAP_REPORT_MUL));
    }

    #[test]
    fn test_write_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heap.json");
        let stats = Stats::new();

        write_report(&path, &stats).unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("rss_bytes"));
        assert!(raw.contains("total_mem_bytes"));
    }
}
