//! Monitoring - counters, gauges, histograms.
//!
//! A small registry safe under concurrent update, exposed per actor via
//! `get_metrics()` and exported on shutdown when `EXPORT_METRICS_ON_SHUTDOWN`
//! is set. Observation never fails and never blocks the dispatch path.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

// =============================================================================
// Histogram
// =============================================================================

/// Fixed-bucket histogram of durations in milliseconds.
///
/// Bucket bounds cover the latencies a dispatch path actually sees; anything
/// slower lands in the overflow bucket.
#[derive(Debug)]
pub struct Histogram {
    bounds: &'static [f64],
    buckets: Vec<AtomicU64>,
    count: AtomicU64,
    sum_micros: AtomicU64,
}

const DEFAULT_BOUNDS: &[f64] = &[1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0];

impl Histogram {
    fn new() -> Self {
        Self {
            bounds: DEFAULT_BOUNDS,
            buckets: (0..=DEFAULT_BOUNDS.len()).map(|_| AtomicU64::new(0)).collect(),
            count: AtomicU64::new(0),
            sum_micros: AtomicU64::new(0),
        }
    }

    fn observe(&self, millis: f64) {
        let idx = self
            .bounds
            .iter()
            .position(|b| millis <= *b)
            .unwrap_or(self.bounds.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((millis * 1000.0) as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            count: self.count.load(Ordering::Relaxed),
            sum_ms: self.sum_micros.load(Ordering::Relaxed) as f64 / 1000.0,
            buckets: self
                .bounds
                .iter()
                .copied()
                .chain(std::iter::once(f64::INFINITY))
                .zip(self.buckets.iter().map(|b| b.load(Ordering::Relaxed)))
                .map(|(le, n)| (format!("{le}"), n))
                .collect(),
        }
    }
}

/// Point-in-time view of a histogram.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum_ms: f64,
    pub buckets: BTreeMap<String, u64>,
}

impl HistogramSnapshot {
    /// Mean observed value, or zero when empty.
    pub fn mean_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum_ms / self.count as f64
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Counter / gauge / histogram registry for one runtime.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    counters: DashMap<String, AtomicU64>,
    gauges: DashMap<String, AtomicI64>,
    histograms: DashMap<String, Histogram>,
}

/// Everything the registry knows, serializable for `get_metrics()`.
#[derive(Debug, Clone, Serialize, Default)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, i64>,
    pub histograms: BTreeMap<String, HistogramSnapshot>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `delta` to a named counter, creating it at zero first.
    pub fn increment(&self, name: &str, delta: u64) {
        self.counters
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(delta, Ordering::Relaxed);
    }

    /// Set a gauge to an absolute value.
    pub fn set_gauge(&self, name: &str, value: i64) {
        self.gauges
            .entry(name.to_string())
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }

    /// Record one duration observation in milliseconds.
    pub fn observe(&self, name: &str, millis: f64) {
        self.histograms
            .entry(name.to_string())
            .or_insert_with(Histogram::new)
            .observe(millis);
    }

    /// Read one counter (zero when absent).
    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Read one gauge (zero when absent).
    pub fn gauge(&self, name: &str) -> i64 {
        self.gauges
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Snapshot every metric.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self
                .counters
                .iter()
                .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
                .collect(),
            gauges: self
                .gauges
                .iter()
                .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
                .collect(),
            histograms: self
                .histograms
                .iter()
                .map(|e| (e.key().clone(), e.value().snapshot()))
                .collect(),
        }
    }

    /// Log the snapshot (shutdown export path).
    pub fn export(&self) {
        match serde_json::to_string(&self.snapshot()) {
            Ok(json) => tracing::info!(metrics = %json, "metrics export"),
            Err(e) => tracing::warn!(error = %e, "metrics export failed"),
        }
    }
}

// Timer is deliberately not RAII: dispatch records the duration only after it
// knows the outcome label.
/// Measures one dispatch; caller decides when to stop.
pub struct Timer {
    started: std::time::Instant,
}

impl Timer {
    pub fn start() -> Self {
        Self {
            started: std::time::Instant::now(),
        }
    }

    /// Elapsed time in milliseconds.
    pub fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_accumulates() {
        let m = MetricsRegistry::new();
        m.increment("commands_total", 1);
        m.increment("commands_total", 2);
        assert_eq!(m.counter("commands_total"), 3);
        assert_eq!(m.counter("missing"), 0);
    }

    #[test]
    fn test_gauge_sets_absolute() {
        let m = MetricsRegistry::new();
        m.set_gauge("inflight", 4);
        m.set_gauge("inflight", 2);
        assert_eq!(m.gauge("inflight"), 2);
    }

    #[test]
    fn test_histogram_buckets_and_mean() {
        let m = MetricsRegistry::new();
        m.observe("command_duration", 3.0);
        m.observe("command_duration", 30.0);
        m.observe("command_duration", 30_000.0);

        let snap = m.snapshot();
        let h = &snap.histograms["command_duration"];
        assert_eq!(h.count, 3);
        assert!((h.mean_ms() - 10_011.0).abs() < 1.0);
        // The 30s observation lands in the overflow bucket.
        assert_eq!(h.buckets["inf"], 1);
    }

    #[test]
    fn test_concurrent_increments() {
        use std::sync::Arc;

        let m = Arc::new(MetricsRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = m.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        m.increment("hits", 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(m.counter("hits"), 8000);
    }

    #[test]
    fn test_snapshot_serializes() {
        let m = MetricsRegistry::new();
        m.increment("a", 1);
        m.set_gauge("b", -2);
        m.observe("c", 12.0);
        let v = serde_json::to_value(m.snapshot()).unwrap();
        assert_eq!(v["counters"]["a"], 1);
        assert_eq!(v["gauges"]["b"], -2);
        assert_eq!(v["histograms"]["c"]["count"], 1);
    }

    #[test]
    fn test_timer_measures() {
        let t = Timer::start();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(t.elapsed_ms() >= 5.0);
    }
}
