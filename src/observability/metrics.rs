//! Metrics for breaker, retry, fallback and resource-gate activity.
//!
//! Components take an optional `Arc<dyn MetricsCollector>`; nothing is
//! recorded when none is attached.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Sink for recovery-layer metrics.
pub trait MetricsCollector: Send + Sync {
    /// Adds `value` to the counter `name`.
    fn increment_counter(&self, name: &str, value: u64, labels: &[(&str, &str)]);

    /// Records one observation in the histogram `name`.
    fn record_histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]);

    /// Sets the gauge `name` to `value`.
    fn set_gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]);
}

/// Collector that keeps every metric in memory.
///
/// Labelled series are stored under `name:k1=v1,k2=v2`.
///
/// # Examples
///
/// ```
/// use integrations_vibezen::observability::{InMemoryMetricsCollector, MetricsCollector};
///
/// let collector = InMemoryMetricsCollector::new();
/// collector.increment_counter("retries", 2, &[("operation", "generate")]);
/// assert_eq!(collector.get_counter("retries:operation=generate"), 2);
/// ```
#[derive(Default)]
pub struct InMemoryMetricsCollector {
    counters: RwLock<HashMap<String, AtomicU64>>,
    histograms: RwLock<HashMap<String, Vec<f64>>>,
    gauges: RwLock<HashMap<String, f64>>,
}

impl InMemoryMetricsCollector {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter, 0 if never incremented.
    pub fn get_counter(&self, name: &str) -> u64 {
        self.counters
            .read()
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// All observations of a histogram, in recording order.
    pub fn get_histogram(&self, name: &str) -> Vec<f64> {
        self.histograms
            .read()
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Last value of a gauge.
    pub fn get_gauge(&self, name: &str) -> Option<f64> {
        self.gauges.read().get(name).copied()
    }

    /// Drops every recorded series.
    pub fn reset(&self) {
        self.counters.write().clear();
        self.histograms.write().clear();
        self.gauges.write().clear();
    }

    fn series_key(name: &str, labels: &[(&str, &str)]) -> String {
        if labels.is_empty() {
            return name.to_string();
        }
        let labels: Vec<String> = labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        format!("{}:{}", name, labels.join(","))
    }
}

impl MetricsCollector for InMemoryMetricsCollector {
    fn increment_counter(&self, name: &str, value: u64, labels: &[(&str, &str)]) {
        let key = Self::series_key(name, labels);
        if let Some(counter) = self.counters.read().get(&key) {
            counter.fetch_add(value, Ordering::Relaxed);
            return;
        }
        self.counters
            .write()
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(value, Ordering::Relaxed);
    }

    fn record_histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        let key = Self::series_key(name, labels);
        self.histograms.write().entry(key).or_default().push(value);
    }

    fn set_gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        let key = Self::series_key(name, labels);
        self.gauges.write().insert(key, value);
    }
}

/// Collector that discards everything.
pub struct NoopMetricsCollector;

impl MetricsCollector for NoopMetricsCollector {
    fn increment_counter(&self, _name: &str, _value: u64, _labels: &[(&str, &str)]) {}
    fn record_histogram(&self, _name: &str, _value: f64, _labels: &[(&str, &str)]) {}
    fn set_gauge(&self, _name: &str, _value: f64, _labels: &[(&str, &str)]) {}
}

/// Metric names emitted by the recovery layer.
pub mod metric_names {
    /// Breaker state gauge per breaker (0=closed, 1=open, 2=half-open)
    pub const CIRCUIT_BREAKER_STATE: &str = "vibezen.circuit_breaker.state";

    /// Calls rejected by an open or saturated half-open breaker
    pub const CIRCUIT_BREAKER_REJECTIONS: &str = "vibezen.circuit_breaker.rejections";

    /// Retry attempts (excluding the first attempt) per operation
    pub const RETRY_ATTEMPTS: &str = "vibezen.retry.attempts";

    /// Operations that exhausted every retry
    pub const RETRY_EXHAUSTED: &str = "vibezen.retry.exhausted";

    /// Degraded results served by a fallback strategy
    pub const FALLBACK_USED: &str = "vibezen.fallback.used";

    /// Resource gate rejections, labelled by gate
    pub const RESOURCE_LIMIT_HITS: &str = "vibezen.resources.limit_hits";

    /// Sampled process memory in MB
    pub const MEMORY_USAGE_MB: &str = "vibezen.resources.memory_mb";

    /// Sampled process CPU percent
    pub const CPU_PERCENT: &str = "vibezen.resources.cpu_percent";

    /// Tasks currently running under the resource manager
    pub const ACTIVE_TASKS: &str = "vibezen.resources.active_tasks";
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counter_accumulates_per_label_set() {
        let collector = InMemoryMetricsCollector::new();

        collector.increment_counter("rejections", 1, &[("breaker", "cache_exact")]);
        collector.increment_counter("rejections", 2, &[("breaker", "cache_exact")]);
        collector.increment_counter("rejections", 1, &[("breaker", "o3_search")]);

        assert_eq!(collector.get_counter("rejections:breaker=cache_exact"), 3);
        assert_eq!(collector.get_counter("rejections:breaker=o3_search"), 1);
        assert_eq!(collector.get_counter("rejections"), 0);
    }

    #[test]
    fn test_histogram_and_gauge() {
        let collector = InMemoryMetricsCollector::new();

        collector.record_histogram("delay_ms", 100.0, &[]);
        collector.record_histogram("delay_ms", 250.0, &[]);
        collector.set_gauge("state", 1.0, &[]);
        collector.set_gauge("state", 0.0, &[]);

        assert_eq!(collector.get_histogram("delay_ms"), vec![100.0, 250.0]);
        assert_eq!(collector.get_gauge("state"), Some(0.0));
        assert_eq!(collector.get_gauge("missing"), None);
    }

    #[test]
    fn test_reset_clears_series() {
        let collector = InMemoryMetricsCollector::new();
        collector.increment_counter("c", 5, &[]);
        collector.set_gauge("g", 1.0, &[]);

        collector.reset();

        assert_eq!(collector.get_counter("c"), 0);
        assert_eq!(collector.get_gauge("g"), None);
    }

    #[test]
    fn test_series_key_with_labels() {
        let key = InMemoryMetricsCollector::series_key("m", &[("k1", "v1"), ("k2", "v2")]);
        assert_eq!(key, "m:k1=v1,k2=v2");
    }

    #[test]
    fn test_concurrent_counter_increments() {
        let collector = Arc::new(InMemoryMetricsCollector::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let collector = Arc::clone(&collector);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        collector.increment_counter("concurrent", 1, &[]);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(collector.get_counter("concurrent"), 400);
    }

    #[test]
    fn test_noop_collector() {
        let collector = NoopMetricsCollector;
        collector.increment_counter("x", 1, &[]);
        collector.record_histogram("x", 1.0, &[]);
        collector.set_gauge("x", 1.0, &[]);
    }
}
