//! Collection of per-task results into an `ExecutionReport`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agents::AgentOutcome;
use crate::core::{DependencyGraph, SkipReason, TaskState};
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::review::ReviewId;

/// Final record of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub name: String,
    pub agent: String,
    #[serde(flatten)]
    pub state: TaskState,
    pub attempts: u32,
    /// Outcome of the last attempt, if any attempt finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<AgentOutcome>,
    /// Why the task did not succeed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Time spent in agent attempts, summed over retries.
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_id: Option<ReviewId>,
}

/// Number of tasks per final state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub succeeded: usize,
    pub failed: usize,
    /// Skipped because a dependency failed or was skipped.
    pub skipped: usize,
    pub cancelled: usize,
}

impl StateCounts {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.skipped + self.cancelled
    }
}

/// Result of a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub run_id: Uuid,
    pub project: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// One entry per task, in manifest order.
    pub tasks: Vec<TaskReport>,
}

impl ExecutionReport {
    pub fn task(&self, name: &str) -> Option<&TaskReport> {
        self.tasks.iter().find(|t| t.name == name)
    }

    /// Final state of `name`, if the task exists.
    pub fn state(&self, name: &str) -> Option<&TaskState> {
        self.task(name).map(|t| &t.state)
    }

    pub fn counts(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for task in &self.tasks {
            match &task.state {
                TaskState::Succeeded => counts.succeeded += 1,
                TaskState::Failed => counts.failed += 1,
                TaskState::Skipped(SkipReason::Upstream { .. }) => counts.skipped += 1,
                TaskState::Skipped(SkipReason::Cancelled) => counts.cancelled += 1,
                TaskState::Pending | TaskState::Ready | TaskState::Running => {}
            }
        }
        counts
    }

    /// True when no task failed.
    pub fn is_success(&self) -> bool {
        !self.tasks.iter().any(|t| t.state == TaskState::Failed)
    }

    /// Process exit code for this report: 0 on success, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }

    /// Human-readable multi-line summary.
    pub fn summary(&self) -> String {
        let counts = self.counts();
        let mut out = format!(
            "Project {} finished in {:.1}s: {} succeeded, {} failed, {} skipped, {} cancelled\n",
            self.project,
            self.duration_ms as f64 / 1000.0,
            counts.succeeded,
            counts.failed,
            counts.skipped,
            counts.cancelled
        );
        for task in &self.tasks {
            out.push_str(&format!(
                "  {:<24} {:<28} attempts={}",
                task.name,
                task.state.to_string(),
                task.attempts
            ));
            if let Some(id) = task.review_id {
                out.push_str(&format!(" review={}", id));
            }
            if let Some(error) = &task.error {
                out.push_str(&format!(" error={}", error));
            }
            out.push('\n');
        }
        out
    }
}

#[derive(Debug)]
struct Entry {
    report: TaskReport,
    elapsed: Duration,
}

/// Accumulates per-task results during a run.
pub struct ResultAggregator {
    run_id: Uuid,
    project: String,
    started_at: DateTime<Utc>,
    started: Instant,
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
    metrics: Arc<dyn MetricsSink>,
}

impl ResultAggregator {
    pub fn new(graph: &DependencyGraph) -> Self {
        Self::with_metrics(graph, Arc::new(NoopMetrics))
    }

    pub fn with_metrics(graph: &DependencyGraph, metrics: Arc<dyn MetricsSink>) -> Self {
        let mut entries = Vec::with_capacity(graph.len());
        let mut index = HashMap::with_capacity(graph.len());
        for (i, task) in graph.tasks().enumerate() {
            index.insert(task.name.clone(), i);
            entries.push(Entry {
                report: TaskReport {
                    name: task.name.clone(),
                    agent: task.agent.clone(),
                    state: TaskState::Pending,
                    attempts: 0,
                    outcome: None,
                    error: None,
                    duration_ms: 0,
                    review_id: None,
                },
                elapsed: Duration::ZERO,
            });
        }
        Self {
            run_id: Uuid::new_v4(),
            project: graph.project().to_string(),
            started_at: Utc::now(),
            started: Instant::now(),
            entries,
            index,
            metrics,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    fn entry(&mut self, name: &str) -> Option<&mut Entry> {
        let i = *self.index.get(name)?;
        self.entries.get_mut(i)
    }

    /// Add the wall time of one attempt to the task's total.
    pub fn record_attempt(&mut self, name: &str, duration: Duration) {
        if let Some(entry) = self.entry(name) {
            entry.elapsed += duration;
        }
    }

    /// Remember the review opened for the task.
    pub fn record_review(&mut self, name: &str, review_id: ReviewId) {
        if let Some(entry) = self.entry(name) {
            entry.report.review_id = Some(review_id);
        }
    }

    /// Store the task's terminal state and report it to the metrics sink.
    pub fn record_terminal(
        &mut self,
        name: &str,
        state: TaskState,
        attempts: u32,
        outcome: Option<AgentOutcome>,
        error: Option<String>,
    ) {
        let metrics = Arc::clone(&self.metrics);
        let Some(entry) = self.entry(name) else {
            tracing::warn!(task = name, "terminal state for unknown task");
            return;
        };
        metrics.task_finished(&entry.report.agent, state.label(), entry.elapsed);

        entry.report.state = state;
        entry.report.attempts = attempts;
        entry.report.outcome = outcome;
        entry.report.error = error;
        entry.report.duration_ms = duration_ms(entry.elapsed);
    }

    pub fn counts(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for entry in &self.entries {
            match &entry.report.state {
                TaskState::Succeeded => counts.succeeded += 1,
                TaskState::Failed => counts.failed += 1,
                TaskState::Skipped(SkipReason::Upstream { .. }) => counts.skipped += 1,
                TaskState::Skipped(SkipReason::Cancelled) => counts.cancelled += 1,
                _ => {}
            }
        }
        counts
    }

    /// Produce the report, tasks in manifest order.
    pub fn finalize(self) -> ExecutionReport {
        ExecutionReport {
            run_id: self.run_id,
            project: self.project,
            started_at: self.started_at,
            finished_at: Utc::now(),
            duration_ms: duration_ms(self.started.elapsed()),
            tasks: self.entries.into_iter().map(|e| e.report).collect(),
        }
    }
}

impl std::fmt::Debug for ResultAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultAggregator")
            .field("run_id", &self.run_id)
            .field("project", &self.project)
            .field("entries", &self.entries)
            .finish_non_exhaustive()
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
