//! Scheduler metrics.
//!
//! Metric namespaces:
//! - trellis.txn.*
//! - trellis.op.*
//! - trellis.retry.*
//! - trellis.refresh.*
//! - trellis.graph.*

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

/// Metric names.
pub mod metrics {
    /// Committed transactions counter.
    pub const TXN_COMMITTED: &str = "trellis.txn.committed_total";
    /// Partially failed transactions counter.
    pub const TXN_PARTIALLY_FAILED: &str = "trellis.txn.partially_failed_total";
    /// Cancelled transactions counter.
    pub const TXN_CANCELLED: &str = "trellis.txn.cancelled_total";
    /// Transaction duration histogram (ms).
    pub const TXN_DURATION_MS: &str = "trellis.txn.duration_ms";
    /// Dispatched descriptor operations counter.
    pub const OP_DISPATCHED: &str = "trellis.op.dispatched_total";
    /// Failed descriptor operations counter.
    pub const OP_FAILED: &str = "trellis.op.failed_total";
    /// Descriptor operation latency histogram (ms).
    pub const OP_LATENCY_MS: &str = "trellis.op.latency_ms";
    /// Retry queue depth gauge.
    pub const RETRY_QUEUE_DEPTH: &str = "trellis.retry.queue_depth";
    /// Keys that ran out of attempts counter.
    pub const RETRY_EXHAUSTED: &str = "trellis.retry.exhausted_total";
    /// Refresh runs counter.
    pub const REFRESH_RUNS: &str = "trellis.refresh.runs_total";
    /// Failed dumps counter.
    pub const REFRESH_DUMP_FAILURES: &str = "trellis.refresh.dump_failures_total";
    /// Drift corrections counter.
    pub const REFRESH_DRIFT: &str = "trellis.refresh.drift_total";
    /// Graph node count gauge.
    pub const GRAPH_NODES: &str = "trellis.graph.nodes";
}

/// Metrics registry.
#[derive(Debug)]
pub struct MetricsRegistry {
    /// Counter metrics.
    counters: RwLock<HashMap<String, AtomicU64>>,
    /// Gauge metrics.
    gauges: RwLock<HashMap<String, AtomicU64>>,
    /// Histogram observations (simplified: just count and sum).
    histograms: RwLock<HashMap<String, HistogramData>>,
}

impl MetricsRegistry {
    /// Create a new metrics registry.
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
            gauges: RwLock::new(HashMap::new()),
            histograms: RwLock::new(HashMap::new()),
        }
    }

    /// Increment a counter.
    pub fn counter_inc(&self, name: &str) {
        self.counter_add(name, 1);
    }

    /// Add to a counter.
    pub fn counter_add(&self, name: &str, value: u64) {
        let counters = self.counters.read();
        if let Some(counter) = counters.get(name) {
            counter.fetch_add(value, Ordering::Relaxed);
            return;
        }
        drop(counters);

        self.counters
            .write()
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(value, Ordering::Relaxed);
    }

    /// Get counter value.
    pub fn counter_get(&self, name: &str) -> u64 {
        self.counters
            .read()
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Set a gauge value.
    pub fn gauge_set(&self, name: &str, value: u64) {
        let gauges = self.gauges.read();
        if let Some(gauge) = gauges.get(name) {
            gauge.store(value, Ordering::Relaxed);
            return;
        }
        drop(gauges);

        self.gauges
            .write()
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .store(value, Ordering::Relaxed);
    }

    /// Get gauge value.
    pub fn gauge_get(&self, name: &str) -> u64 {
        self.gauges
            .read()
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Record a histogram observation.
    pub fn histogram_observe(&self, name: &str, value: f64) {
        let histograms = self.histograms.read();
        if let Some(data) = histograms.get(name) {
            data.observe(value);
            return;
        }
        drop(histograms);

        self.histograms
            .write()
            .entry(name.to_string())
            .or_insert_with(HistogramData::new)
            .observe(value);
    }

    /// Get histogram data.
    pub fn histogram_get(&self, name: &str) -> Option<HistogramSnapshot> {
        self.histograms.read().get(name).map(|h| h.snapshot())
    }

    /// Counter values sorted by name.
    pub fn counters(&self) -> BTreeMap<String, u64> {
        self.counters
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect()
    }

    /// Gauge values sorted by name.
    pub fn gauges(&self) -> BTreeMap<String, u64> {
        self.gauges
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect()
    }

    /// Export metrics in Prometheus format.
    pub fn export_prometheus(&self) -> String {
        let mut output = String::new();

        for (name, value) in self.counters() {
            let prometheus_name = name.replace('.', "_");
            output.push_str(&format!(
                "# TYPE {} counter\n{} {}\n",
                prometheus_name, prometheus_name, value
            ));
        }

        for (name, value) in self.gauges() {
            let prometheus_name = name.replace('.', "_");
            output.push_str(&format!(
                "# TYPE {} gauge\n{} {}\n",
                prometheus_name, prometheus_name, value
            ));
        }

        let histograms = self.histograms.read();
        let mut names: Vec<&String> = histograms.keys().collect();
        names.sort();
        for name in names {
            let Some(data) = histograms.get(name) else {
                continue;
            };
            let prometheus_name = name.replace('.', "_");
            let snapshot = data.snapshot();
            output.push_str(&format!(
                "# TYPE {} histogram\n{}_count {}\n{}_sum {}\n",
                prometheus_name, prometheus_name, snapshot.count, prometheus_name, snapshot.sum
            ));
        }

        output
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Histogram data storage.
#[derive(Debug)]
struct HistogramData {
    count: AtomicU64,
    stats: Mutex<(f64, f64, f64)>,
}

impl HistogramData {
    fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            stats: Mutex::new((0.0, f64::MAX, f64::MIN)),
        }
    }

    fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        let mut stats = self.stats.lock();
        stats.0 += value;
        stats.1 = stats.1.min(value);
        stats.2 = stats.2.max(value);
    }

    fn snapshot(&self) -> HistogramSnapshot {
        let (sum, min, max) = *self.stats.lock();
        HistogramSnapshot {
            count: self.count.load(Ordering::Relaxed),
            sum,
            min,
            max,
        }
    }
}

/// Histogram snapshot.
#[derive(Debug, Clone)]
pub struct HistogramSnapshot {
    /// Number of observations.
    pub count: u64,
    /// Sum of all observations.
    pub sum: f64,
    /// Minimum value observed.
    pub min: f64,
    /// Maximum value observed.
    pub max: f64,
}

impl HistogramSnapshot {
    /// Calculate mean.
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Scheduler metrics collector.
#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    registry: MetricsRegistry,
}

impl SchedulerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the underlying registry.
    pub fn registry(&self) -> &MetricsRegistry {
        &self.registry
    }

    // === Transactions ===

    pub fn record_txn_committed(&self, duration_ms: u64) {
        self.registry.counter_inc(metrics::TXN_COMMITTED);
        self.registry
            .histogram_observe(metrics::TXN_DURATION_MS, duration_ms as f64);
    }

    pub fn record_txn_partially_failed(&self, duration_ms: u64) {
        self.registry.counter_inc(metrics::TXN_PARTIALLY_FAILED);
        self.registry
            .histogram_observe(metrics::TXN_DURATION_MS, duration_ms as f64);
    }

    pub fn record_txn_cancelled(&self) {
        self.registry.counter_inc(metrics::TXN_CANCELLED);
    }

    // === Descriptor operations ===

    /// Record a dispatched operation, per descriptor and operation.
    pub fn record_op(&self, descriptor: &str, op: &str, latency_ms: u64) {
        self.registry.counter_inc(metrics::OP_DISPATCHED);
        let metric = format!("{}.{}.{}", metrics::OP_DISPATCHED, descriptor, op);
        self.registry.counter_inc(&metric);
        self.registry
            .histogram_observe(metrics::OP_LATENCY_MS, latency_ms as f64);
    }

    /// Record a failed operation, per descriptor and error kind.
    pub fn record_op_failure(&self, descriptor: &str, kind: &str) {
        self.registry.counter_inc(metrics::OP_FAILED);
        let metric = format!("{}.{}.{}", metrics::OP_FAILED, descriptor, kind);
        self.registry.counter_inc(&metric);
    }

    // === Retries ===

    pub fn set_retry_queue_depth(&self, depth: usize) {
        self.registry
            .gauge_set(metrics::RETRY_QUEUE_DEPTH, depth as u64);
    }

    pub fn record_retry_exhausted(&self) {
        self.registry.counter_inc(metrics::RETRY_EXHAUSTED);
    }

    // === Refresh ===

    pub fn record_refresh(&self, drifts: usize, failed_dumps: usize) {
        self.registry.counter_inc(metrics::REFRESH_RUNS);
        self.registry
            .counter_add(metrics::REFRESH_DRIFT, drifts as u64);
        self.registry
            .counter_add(metrics::REFRESH_DUMP_FAILURES, failed_dumps as u64);
    }

    // === Graph ===

    pub fn set_graph_nodes(&self, count: usize) {
        self.registry.gauge_set(metrics::GRAPH_NODES, count as u64);
    }

    /// Export all metrics in Prometheus format.
    pub fn export(&self) -> String {
        self.registry.export_prometheus()
    }
}
