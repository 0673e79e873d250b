//! Lock-free counters and the process-global sync metrics surface.
//!
//! Recording is a relaxed atomic add; snapshots are plain loads. The `stats`
//! command and log lines read from [`global_metrics`].

#![forbid(unsafe_code)]

use serde::Serialize;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Counter {
    v: AtomicU64,
}

impl Counter {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            v: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc(&self) {
        self.v.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(&self, delta: u64) {
        self.v.fetch_add(delta, Ordering::Relaxed);
    }

    #[inline]
    pub fn load(&self) -> u64 {
        self.v.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct GaugeU64 {
    v: AtomicU64,
}

impl GaugeU64 {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            v: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn set(&self, value: u64) {
        self.v.store(value, Ordering::Relaxed);
    }

    #[inline]
    pub fn load(&self) -> u64 {
        self.v.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn fetch_max(&self, value: u64) {
        self.v.fetch_max(value, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    pub ticks_total: Counter,
    pub updates_total: Counter,
    pub busy_skips_total: Counter,
    pub deferred_total: Counter,
    pub failures_total: Counter,
    pub queue_regenerations_total: Counter,
    pub queue_depth: GaugeU64,
    pub slowest_update_ms: GaugeU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerMetricsSnapshot {
    pub ticks_total: u64,
    pub updates_total: u64,
    pub busy_skips_total: u64,
    pub deferred_total: u64,
    pub failures_total: u64,
    pub queue_regenerations_total: u64,
    pub queue_depth: u64,
    pub slowest_update_ms: u64,
}

impl SchedulerMetrics {
    #[must_use]
    pub fn snapshot(&self) -> SchedulerMetricsSnapshot {
        SchedulerMetricsSnapshot {
            ticks_total: self.ticks_total.load(),
            updates_total: self.updates_total.load(),
            busy_skips_total: self.busy_skips_total.load(),
            deferred_total: self.deferred_total.load(),
            failures_total: self.failures_total.load(),
            queue_regenerations_total: self.queue_regenerations_total.load(),
            queue_depth: self.queue_depth.load(),
            slowest_update_ms: self.slowest_update_ms.load(),
        }
    }
}

#[derive(Debug, Default)]
pub struct CacheMetrics {
    pub status_hits_total: Counter,
    pub status_misses_total: Counter,
    pub status_stale_fallbacks_total: Counter,
    pub access_queries_total: Counter,
    pub access_failures_total: Counter,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheMetricsSnapshot {
    pub status_hits_total: u64,
    pub status_misses_total: u64,
    pub status_stale_fallbacks_total: u64,
    pub access_queries_total: u64,
    pub access_failures_total: u64,
}

impl CacheMetrics {
    #[must_use]
    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            status_hits_total: self.status_hits_total.load(),
            status_misses_total: self.status_misses_total.load(),
            status_stale_fallbacks_total: self.status_stale_fallbacks_total.load(),
            access_queries_total: self.access_queries_total.load(),
            access_failures_total: self.access_failures_total.load(),
        }
    }
}

#[derive(Debug, Default)]
pub struct InheritMetrics {
    pub runs_total: Counter,
    pub files_scanned_total: Counter,
    pub files_written_total: Counter,
    pub files_skipped_total: Counter,
}

#[derive(Debug, Clone, Serialize)]
pub struct InheritMetricsSnapshot {
    pub runs_total: u64,
    pub files_scanned_total: u64,
    pub files_written_total: u64,
    pub files_skipped_total: u64,
}

impl InheritMetrics {
    #[must_use]
    pub fn snapshot(&self) -> InheritMetricsSnapshot {
        InheritMetricsSnapshot {
            runs_total: self.runs_total.load(),
            files_scanned_total: self.files_scanned_total.load(),
            files_written_total: self.files_written_total.load(),
            files_skipped_total: self.files_skipped_total.load(),
        }
    }
}

#[derive(Debug, Default)]
pub struct GlobalMetrics {
    pub scheduler: SchedulerMetrics,
    pub cache: CacheMetrics,
    pub inherit: InheritMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct GlobalMetricsSnapshot {
    pub scheduler: SchedulerMetricsSnapshot,
    pub cache: CacheMetricsSnapshot,
    pub inherit: InheritMetricsSnapshot,
}

impl GlobalMetrics {
    #[must_use]
    pub fn snapshot(&self) -> GlobalMetricsSnapshot {
        GlobalMetricsSnapshot {
            scheduler: self.scheduler.snapshot(),
            cache: self.cache.snapshot(),
            inherit: self.inherit.snapshot(),
        }
    }
}

static GLOBAL_METRICS: LazyLock<GlobalMetrics> = LazyLock::new(GlobalMetrics::default);

#[must_use]
pub fn global_metrics() -> &'static GlobalMetrics {
    &GLOBAL_METRICS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_accumulates() {
        let c = Counter::new();
        c.inc();
        c.add(4);
        assert_eq!(c.load(), 5);
    }

    #[test]
    fn gauge_fetch_max_keeps_largest() {
        let g = GaugeU64::new();
        g.fetch_max(10);
        g.fetch_max(3);
        assert_eq!(g.load(), 10);
        g.set(1);
        assert_eq!(g.load(), 1);
    }

    #[test]
    fn snapshot_serializes() {
        let m = GlobalMetrics::default();
        m.scheduler.ticks_total.inc();
        let json = serde_json::to_value(m.snapshot()).unwrap();
        assert_eq!(json["scheduler"]["ticks_total"], 1);
    }
}
