//! Ambient in-process metrics: counters, gauges and a latency histogram,
//! mirroring the original's `count_invocations`/`measure_latency` decorators.
//!
//! These are observable in-process only — no exporter is wired up here. A
//! Prometheus (or any other) sink can read `Metrics::snapshot` and publish it;
//! that wiring is out of scope for this crate.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Default, Clone)]
pub struct CounterSnapshot {
    pub value: u64,
}

#[derive(Debug, Default, Clone)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum: Duration,
    pub max: Duration,
}

#[derive(Default)]
struct Histogram {
    count: u64,
    sum: Duration,
    max: Duration,
}

impl Histogram {
    fn record(&mut self, value: Duration) {
        self.count += 1;
        self.sum += value;
        if value > self.max {
            self.max = value;
        }
    }

    fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            count: self.count,
            sum: self.sum,
            max: self.max,
        }
    }
}

/// Process-wide registry of named counters, gauges and latency histograms,
/// keyed by `(metric_name, label)` — e.g. `("tasks_dequeued_total", handler_name)`.
#[derive(Default)]
pub struct Metrics {
    counters: Mutex<HashMap<(&'static str, String), u64>>,
    gauges: Mutex<HashMap<(&'static str, String), i64>>,
    histograms: Mutex<HashMap<(&'static str, String), Histogram>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, name: &'static str, label: impl Into<String>) {
        let mut counters = self.counters.lock().unwrap();
        *counters.entry((name, label.into())).or_insert(0) += 1;
    }

    /// Sets a point-in-time gauge, e.g. the scheduler's current queue length.
    pub fn set_gauge(&self, name: &'static str, label: impl Into<String>, value: i64) {
        let mut gauges = self.gauges.lock().unwrap();
        gauges.insert((name, label.into()), value);
    }

    pub fn gauge_snapshot(&self, name: &'static str, label: &str) -> i64 {
        let gauges = self.gauges.lock().unwrap();
        gauges.get(&(name, label.to_string())).copied().unwrap_or(0)
    }

    pub fn observe_latency(&self, name: &'static str, label: impl Into<String>, value: Duration) {
        let mut histograms = self.histograms.lock().unwrap();
        histograms.entry((name, label.into())).or_default().record(value);
    }

    /// Times `f`, observes the elapsed duration against `name`/`label`, and
    /// returns `f`'s result unchanged — mirrors `measure_latency`.
    pub fn timed<T>(&self, name: &'static str, label: impl Into<String>, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let result = f();
        self.observe_latency(name, label, start.elapsed());
        result
    }

    pub fn counter_snapshot(&self, name: &'static str, label: &str) -> CounterSnapshot {
        let counters = self.counters.lock().unwrap();
        CounterSnapshot {
            value: counters.get(&(name, label.to_string())).copied().unwrap_or(0),
        }
    }

    pub fn histogram_snapshot(&self, name: &'static str, label: &str) -> HistogramSnapshot {
        let histograms = self.histograms.lock().unwrap();
        histograms
            .get(&(name, label.to_string()))
            .map(Histogram::snapshot)
            .unwrap_or_default()
    }
}

pub const METRIC_TASKS_ENQUEUED: &str = "taskq_tasks_enqueued_total";
pub const METRIC_TASKS_DEQUEUED: &str = "taskq_tasks_dequeued_total";
pub const METRIC_TASKS_SUCCEEDED: &str = "taskq_tasks_succeeded_total";
pub const METRIC_TASKS_FAILED: &str = "taskq_tasks_failed_total";
pub const METRIC_TASKS_DEAD: &str = "taskq_tasks_dead_total";
pub const METRIC_TASKS_KILLED: &str = "taskq_tasks_killed_total";
pub const METRIC_TASK_DURATION: &str = "taskq_task_duration_seconds";
pub const METRIC_LEASE_ACQUIRE_ATTEMPTS: &str = "taskq_lease_acquire_attempts_total";
pub const METRIC_LEASE_ACQUIRED: &str = "taskq_lease_acquired_total";
pub const METRIC_QUEUE_LENGTH: &str = "taskq_queue_length";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_label() {
        let metrics = Metrics::new();
        metrics.increment(METRIC_TASKS_ENQUEUED, "scrape_feed");
        metrics.increment(METRIC_TASKS_ENQUEUED, "scrape_feed");
        metrics.increment(METRIC_TASKS_ENQUEUED, "other");

        assert_eq!(metrics.counter_snapshot(METRIC_TASKS_ENQUEUED, "scrape_feed").value, 2);
        assert_eq!(metrics.counter_snapshot(METRIC_TASKS_ENQUEUED, "other").value, 1);
    }

    #[test]
    fn gauge_reflects_latest_set_value() {
        let metrics = Metrics::new();
        metrics.set_gauge(METRIC_QUEUE_LENGTH, "default", 3);
        metrics.set_gauge(METRIC_QUEUE_LENGTH, "default", 7);
        assert_eq!(metrics.gauge_snapshot(METRIC_QUEUE_LENGTH, "default"), 7);
    }

    #[test]
    fn histogram_tracks_count_and_max() {
        let metrics = Metrics::new();
        metrics.observe_latency(METRIC_TASK_DURATION, "h", Duration::from_millis(10));
        metrics.observe_latency(METRIC_TASK_DURATION, "h", Duration::from_millis(30));

        let snapshot = metrics.histogram_snapshot(METRIC_TASK_DURATION, "h");
        assert_eq!(snapshot.count, 2);
        assert_eq!(snapshot.max, Duration::from_millis(30));
    }
}
