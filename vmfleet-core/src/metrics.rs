//! Operational metrics for a fleet node
//!
//! A small in-process registry of counters, gauges and duration histograms.
//! Each node owns one and exposes it through the `metrics` command.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Metrics registry for collecting node metrics
#[derive(Debug, Clone, Default)]
pub struct MetricsRegistry {
    counters: Arc<RwLock<HashMap<String, u64>>>,
    gauges: Arc<RwLock<HashMap<String, f64>>>,
    histograms: Arc<RwLock<HashMap<String, Histogram>>>,
}

/// Samples kept per histogram for percentiles
pub const HISTOGRAM_WINDOW: usize = 1024;

/// Running totals plus a bounded window of the most recent samples
#[derive(Debug, Clone, Default)]
struct Histogram {
    count: usize,
    sum: Duration,
    min: Duration,
    max: Duration,
    recent: VecDeque<Duration>,
}

impl Histogram {
    fn record(&mut self, duration: Duration) {
        if self.count == 0 || duration < self.min {
            self.min = duration;
        }
        self.max = self.max.max(duration);
        self.count += 1;
        self.sum = self.sum.saturating_add(duration);

        if self.recent.len() == HISTOGRAM_WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(duration);
    }

    fn stats(&self) -> Option<HistogramStats> {
        if self.count == 0 {
            return None;
        }
        let mut window: Vec<Duration> = self.recent.iter().copied().collect();
        window.sort();
        let at = |pct: usize| window[((window.len() * pct) / 100).min(window.len() - 1)];

        Some(HistogramStats {
            count: self.count,
            mean: self.sum / u32::try_from(self.count).unwrap_or(u32::MAX),
            min: self.min,
            max: self.max,
            p50: at(50),
            p99: at(99),
        })
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by 1
    pub fn increment_counter(&self, name: &str) {
        self.increment_counter_by(name, 1);
    }

    pub fn increment_counter_by(&self, name: &str, value: u64) {
        let mut counters = self.counters.write();
        *counters.entry(name.to_string()).or_insert(0) += value;
    }

    pub fn set_gauge(&self, name: &str, value: f64) {
        self.gauges.write().insert(name.to_string(), value);
    }

    /// Record a duration in a histogram
    pub fn record_duration(&self, name: &str, duration: Duration) {
        self.histograms
            .write()
            .entry(name.to_string())
            .or_default()
            .record(duration);
    }

    pub fn get_counter(&self, name: &str) -> u64 {
        self.counters.read().get(name).copied().unwrap_or(0)
    }

    pub fn get_gauge(&self, name: &str) -> f64 {
        self.gauges.read().get(name).copied().unwrap_or(0.0)
    }

    pub fn get_histogram_stats(&self, name: &str) -> Option<HistogramStats> {
        self.histograms.read().get(name)?.stats()
    }

    /// Get a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self.counters.read().iter().map(|(k, v)| (k.clone(), *v)).collect(),
            gauges: self.gauges.read().iter().map(|(k, v)| (k.clone(), *v)).collect(),
            histograms: self
                .histograms
                .read()
                .iter()
                .filter_map(|(k, h)| h.stats().map(|s| (k.clone(), s)))
                .collect(),
        }
    }

    /// Start a timer that records into `name` when stopped or dropped
    pub fn timer(&self, name: &str) -> Timer {
        Timer {
            name: name.to_string(),
            start: Instant::now(),
            registry: self.clone(),
            recorded: false,
        }
    }
}

/// Statistics for a histogram. Percentiles cover the most recent
/// [`HISTOGRAM_WINDOW`] samples; the rest cover every sample.
#[derive(Debug, Clone)]
pub struct HistogramStats {
    pub count: usize,
    pub mean: Duration,
    pub min: Duration,
    pub max: Duration,
    pub p50: Duration,
    pub p99: Duration,
}

/// A snapshot of all metrics at a point in time, sorted by name
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, f64>,
    pub histograms: BTreeMap<String, HistogramStats>,
}

impl MetricsSnapshot {
    /// Flattens the snapshot into `name`, `value` rows
    pub fn rows(&self) -> Vec<Vec<String>> {
        let mut rows = Vec::new();
        for (name, value) in &self.counters {
            rows.push(vec![name.clone(), value.to_string()]);
        }
        for (name, value) in &self.gauges {
            rows.push(vec![name.clone(), value.to_string()]);
        }
        for (name, stats) in &self.histograms {
            rows.push(vec![
                name.clone(),
                format!(
                    "count={} mean={:?} p50={:?} p99={:?} max={:?}",
                    stats.count, stats.mean, stats.p50, stats.p99, stats.max
                ),
            ]);
        }
        rows
    }
}

/// Timer for measuring operation durations
pub struct Timer {
    name: String,
    start: Instant,
    registry: MetricsRegistry,
    recorded: bool,
}

impl Timer {
    /// Stop the timer and record the duration
    pub fn stop(mut self) {
        self.record();
    }

    fn record(&mut self) {
        if !self.recorded {
            self.recorded = true;
            self.registry
                .record_duration(&self.name, self.start.elapsed());
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.record();
    }
}

/// Metric names used throughout the node
pub mod names {
    pub const VM_LAUNCHED: &str = "vm_launched_total";
    pub const VM_LAUNCH_FAILED: &str = "vm_launch_failed_total";
    pub const VM_LAUNCH_DURATION: &str = "vm_launch_duration_seconds";
    pub const VM_KILLED: &str = "vm_killed_total";
    pub const VM_FLUSHED: &str = "vm_flushed_total";
    pub const VM_COUNT: &str = "vm_count";
    pub const VLAN_ALLOCATED: &str = "vlan_allocated_total";
    pub const AGGREGATION_PEER_ERRORS: &str = "aggregation_peer_errors_total";
    pub const COMMANDS_PROCESSED: &str = "commands_processed_total";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_metrics() {
        let metrics = MetricsRegistry::new();

        assert_eq!(metrics.get_counter("test.counter"), 0);
        metrics.increment_counter("test.counter");
        metrics.increment_counter_by("test.counter", 5);
        assert_eq!(metrics.get_counter("test.counter"), 6);
    }

    #[test]
    fn test_histogram_metrics() {
        let metrics = MetricsRegistry::new();
        assert!(metrics.get_histogram_stats("h").is_none());

        for ms in [10, 20, 30, 40, 50] {
            metrics.record_duration("h", Duration::from_millis(ms));
        }

        let stats = metrics.get_histogram_stats("h").unwrap();
        assert_eq!(stats.count, 5);
        assert_eq!(stats.min, Duration::from_millis(10));
        assert_eq!(stats.max, Duration::from_millis(50));
        assert_eq!(stats.p50, Duration::from_millis(30));
    }

    #[test]
    fn test_histogram_memory_is_bounded() {
        let metrics = MetricsRegistry::new();
        let total = HISTOGRAM_WINDOW + 500;
        for ms in 1..=total as u64 {
            metrics.record_duration("h", Duration::from_millis(ms));
        }

        let stats = metrics.get_histogram_stats("h").unwrap();
        assert_eq!(stats.count, total);
        assert_eq!(stats.min, Duration::from_millis(1));
        assert_eq!(stats.max, Duration::from_millis(total as u64));
        // oldest samples have left the percentile window
        assert!(stats.p50 > Duration::from_millis(500));
        assert_eq!(metrics.histograms.read()["h"].recent.len(), HISTOGRAM_WINDOW);
    }

    #[test]
    fn test_timer_records_once() {
        let metrics = MetricsRegistry::new();
        let timer = metrics.timer("t");
        timer.stop();

        assert_eq!(metrics.get_histogram_stats("t").unwrap().count, 1);
    }

    #[test]
    fn test_snapshot_rows() {
        let metrics = MetricsRegistry::new();
        metrics.increment_counter(names::VM_LAUNCHED);
        metrics.set_gauge(names::VM_COUNT, 3.0);
        metrics.record_duration(names::VM_LAUNCH_DURATION, Duration::from_millis(5));

        let rows = metrics.snapshot().rows();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], vec![names::VM_LAUNCHED.to_string(), "1".to_string()]);
    }
}
