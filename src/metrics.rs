// ═══════════════════════════════════════════════════════════════
// METRICS COLLECTOR - How many bids did we file, and how often did it break
// ═══════════════════════════════════════════════════════════════
//
// Atomic counters, one row per source, indexed by SourceId::index().
// Nothing here takes a lock; the /metrics handler reads everything with
// relaxed loads and nobody minds if `saved` and `runs` are one run apart.
//
// Per source we track:
// - runs that returned 200 and runs that returned 500
// - entries saved, rows skipped, per-record errors
// - how long the last run took (float seconds)

use portable_atomic::{AtomicF64, AtomicU64, Ordering};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::dedup::DedupSnapshot;
use crate::models::{ScrapeReport, SourceId};

/// Counters for one source
struct SourceCounters {
    runs: AtomicU64,
    failed_runs: AtomicU64,
    saved: AtomicU64,
    skipped: AtomicU64,
    errors: AtomicU64,
    last_run_seconds: AtomicF64,
}

impl SourceCounters {
    fn new() -> Self {
        Self {
            runs: AtomicU64::new(0),
            failed_runs: AtomicU64::new(0),
            saved: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            last_run_seconds: AtomicF64::new(0.0),
        }
    }

    fn snapshot(&self) -> SourceMetrics {
        SourceMetrics {
            runs: self.runs.load(Ordering::Relaxed),
            failed_runs: self.failed_runs.load(Ordering::Relaxed),
            saved: self.saved.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            last_run_seconds: self.last_run_seconds.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct SourceMetrics {
    pub runs: u64,
    pub failed_runs: u64,
    pub saved: u64,
    pub skipped: u64,
    pub errors: u64,
    pub last_run_seconds: f64,
}

/// The metrics snapshot - what gets serialized to JSON
#[derive(Debug, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub uptime_seconds: u64,
    pub total_runs: u64,
    pub total_saved: u64,
    pub sources: BTreeMap<&'static str, SourceMetrics>,
    pub dedup: DedupSnapshot,
    pub status: String,
}

pub struct MetricsCollector {
    sources: [SourceCounters; 4],
    start_time: Instant,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            sources: std::array::from_fn(|_| SourceCounters::new()),
            start_time: Instant::now(),
        }
    }

    fn counters(&self, source: SourceId) -> &SourceCounters {
        &self.sources[source.index()]
    }

    /// A run that made it to the JSON summary.
    pub fn record_run(&self, source: SourceId, report: &ScrapeReport, elapsed: Duration) {
        let c = self.counters(source);
        c.runs.fetch_add(1, Ordering::Relaxed);
        c.saved.fetch_add(report.saved.len() as u64, Ordering::Relaxed);
        c.skipped.fetch_add(report.skipped.len() as u64, Ordering::Relaxed);
        c.errors.fetch_add(report.errors.len() as u64, Ordering::Relaxed);
        c.last_run_seconds.store(elapsed.as_secs_f64(), Ordering::Relaxed);
    }

    /// A run that ended in a 500.
    pub fn record_failure(&self, source: SourceId, elapsed: Duration) {
        let c = self.counters(source);
        c.failed_runs.fetch_add(1, Ordering::Relaxed);
        c.last_run_seconds.store(elapsed.as_secs_f64(), Ordering::Relaxed);
    }

    pub fn snapshot(&self, dedup: DedupSnapshot) -> MetricsSnapshot {
        let sources: BTreeMap<_, _> = SourceId::ALL
            .into_iter()
            .map(|id| (id.as_str(), self.counters(id).snapshot()))
            .collect();

        MetricsSnapshot {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            total_runs: sources.values().map(|s| s.runs + s.failed_runs).sum(),
            total_saved: sources.values().map(|s| s.saved).sum(),
            sources,
            dedup,
            status: "operational".to_string(),
        }
    }
}
