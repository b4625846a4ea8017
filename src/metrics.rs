//! Task metrics.
//!
//! The aggregator reports every terminal task to a `MetricsSink`. Two
//! series are recorded:
//!
//! - `agentflow_tasks_total{agent,status}` counter
//! - `agentflow_task_duration_seconds{agent}` histogram

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

pub const TASKS_TOTAL: &str = "agentflow_tasks_total";
pub const TASK_DURATION_SECONDS: &str = "agentflow_task_duration_seconds";

/// Destination for per-task metrics.
pub trait MetricsSink: Send + Sync {
    /// Record one task reaching a terminal state.
    fn task_finished(&self, agent: &str, status: &str, duration: Duration);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn task_finished(&self, _agent: &str, _status: &str, _duration: Duration) {}
}

fn duration_buckets() -> Vec<f64> {
    vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0]
}

#[derive(Debug, Clone)]
struct Histogram {
    buckets: Vec<f64>,
    counts: Vec<u64>,
    sum: f64,
    count: u64,
}

impl Histogram {
    fn new() -> Self {
        let buckets = duration_buckets();
        let counts = vec![0; buckets.len()];
        Self {
            buckets,
            counts,
            sum: 0.0,
            count: 0,
        }
    }

    fn observe(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        for (i, boundary) in self.buckets.iter().enumerate() {
            if value <= *boundary {
                self.counts[i] += 1;
            }
        }
    }
}

#[derive(Debug, Default)]
struct Series {
    counters: BTreeMap<(String, String), u64>,
    histograms: BTreeMap<String, Histogram>,
}

/// In-process metrics store with Prometheus text rendering.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    series: Mutex<Series>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of `agentflow_tasks_total{agent,status}`.
    pub fn task_count(&self, agent: &str, status: &str) -> u64 {
        self.lock()
            .counters
            .get(&(agent.to_string(), status.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Number of duration observations recorded for `agent`.
    pub fn duration_count(&self, agent: &str) -> u64 {
        self.lock()
            .histograms
            .get(agent)
            .map(|h| h.count)
            .unwrap_or(0)
    }

    /// Render all series in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let series = self.lock();
        let mut out = String::new();

        out.push_str(&format!("# TYPE {} counter\n", TASKS_TOTAL));
        for ((agent, status), value) in &series.counters {
            out.push_str(&format!(
                "{}{{agent=\"{}\",status=\"{}\"}} {}\n",
                TASKS_TOTAL, agent, status, value
            ));
        }

        out.push_str(&format!("# TYPE {} histogram\n", TASK_DURATION_SECONDS));
        for (agent, h) in &series.histograms {
            for (boundary, count) in h.buckets.iter().zip(&h.counts) {
                out.push_str(&format!(
                    "{}_bucket{{agent=\"{}\",le=\"{}\"}} {}\n",
                    TASK_DURATION_SECONDS, agent, boundary, count
                ));
            }
            out.push_str(&format!(
                "{}_bucket{{agent=\"{}\",le=\"+Inf\"}} {}\n",
                TASK_DURATION_SECONDS, agent, h.count
            ));
            out.push_str(&format!(
                "{}_sum{{agent=\"{}\"}} {}\n",
                TASK_DURATION_SECONDS, agent, h.sum
            ));
            out.push_str(&format!(
                "{}_count{{agent=\"{}\"}} {}\n",
                TASK_DURATION_SECONDS, agent, h.count
            ));
        }
        out
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Series> {
        self.series.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl MetricsSink for InMemoryMetrics {
    fn task_finished(&self, agent: &str, status: &str, duration: Duration) {
        let mut series = self.lock();
        *series
            .counters
            .entry((agent.to_string(), status.to_string()))
            .or_insert(0) += 1;
        series
            .histograms
            .entry(agent.to_string())
            .or_insert_with(Histogram::new)
            .observe(duration.as_secs_f64());
    }
}
