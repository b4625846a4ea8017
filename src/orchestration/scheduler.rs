//! Execution scheduler for validated task graphs.
//!
//! The scheduler drives every task of a `DependencyGraph` from `Pending`
//! to a terminal state. It is single-writer: one loop owns all per-task
//! runtime records, and every unit of in-flight work (an agent attempt, a
//! review wait, a retry backoff timer) runs as a tokio task in a `JoinSet`
//! that hands its result back to the loop. Only the loop applies state
//! transitions, so no task record is ever shared between threads.
//!
//! Transitions:
//!
//! - `Pending -> Ready` once every dependency has `Succeeded`
//! - `Pending -> Skipped(Upstream)` once any dependency is `Failed` or
//!   `Skipped` (transitively, without ever running)
//! - `Ready -> Running` on dispatch, incrementing the attempt counter
//! - `Running -> Succeeded` on a successful outcome
//! - `Running -> Ready` on failure while `attempt <= retries`
//! - `Running -> Failed` on failure once the retries are spent
//!
//! A `Ready` task may carry a hold (awaiting review, or retry backoff)
//! that keeps it from being dispatched until the hold is released.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use petgraph::graph::NodeIndex;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::agents::{run_agent, AgentOutcome, AgentRegistry};
use crate::core::{DependencyGraph, ManifestValidator, ProjectManifest, SkipReason, TaskState};
use crate::error::Result;
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::orchestration::aggregator::{ExecutionReport, ResultAggregator, StateCounts};
use crate::orchestration::retry::RetryPolicy;
use crate::orchestration::review_gate::{ReviewDecision, ReviewGate};
use crate::retrieval::{Retriever, DEFAULT_RESULTS};
use crate::review::{InMemoryReviewStore, ReviewId};

/// Events emitted by the scheduler for task lifecycle changes.
///
/// These allow callers (the CLI, tests) to follow a run without polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// All dependencies succeeded; the task became `Ready`.
    Promoted { task: String },
    /// An attempt was dispatched.
    Started { task: String, attempt: u32 },
    /// An attempt failed and the task will run again after `delay`.
    Retrying {
        task: String,
        attempt: u32,
        delay: Duration,
    },
    /// The task's outcome flagged issues and a review was opened.
    ReviewRequested { task: String, review_id: ReviewId },
    /// The task reached a terminal state.
    Finished { task: String, state: TaskState },
    /// Every task is terminal.
    RunComplete { counts: StateCounts },
}

/// Tunables of a run.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Delay policy between a failed attempt and the next.
    pub retry: RetryPolicy,
    /// How often review status is polled.
    pub review_poll_interval: Duration,
    /// Deadline for a review decision; `None` waits indefinitely.
    pub review_timeout: Option<Duration>,
    /// Number of context documents retrieved per task.
    pub max_context_results: usize,
    /// On cancellation, abort in-flight attempts instead of draining them.
    pub abort_in_flight_on_cancel: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::Immediate,
            review_poll_interval: Duration::from_secs(1),
            review_timeout: None,
            max_context_results: DEFAULT_RESULTS,
            abort_in_flight_on_cancel: false,
        }
    }
}

/// Executes validated task graphs.
///
/// # Example
///
/// ```ignore
/// let scheduler = ExecutionScheduler::new(Arc::new(registry))
///     .with_retriever(Arc::new(retriever))
///     .with_config(SchedulerConfig::default());
/// let report = scheduler.execute(&manifest, CancellationToken::new()).await?;
/// ```
pub struct ExecutionScheduler {
    registry: Arc<AgentRegistry>,
    retriever: Option<Arc<dyn Retriever>>,
    review_gate: ReviewGate,
    metrics: Arc<dyn MetricsSink>,
    config: SchedulerConfig,
    events: Option<mpsc::UnboundedSender<SchedulerEvent>>,
}

impl ExecutionScheduler {
    /// Create a scheduler with default config, no retriever, no metrics and
    /// an in-memory review store.
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self {
            registry,
            retriever: None,
            review_gate: ReviewGate::new(Arc::new(InMemoryReviewStore::new())),
            metrics: Arc::new(NoopMetrics),
            config: SchedulerConfig::default(),
            events: None,
        }
    }

    pub fn with_retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn with_review_gate(mut self, gate: ReviewGate) -> Self {
        self.review_gate = gate;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Send lifecycle events to `tx`.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<SchedulerEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Validate `manifest` against the registry, then run it.
    ///
    /// Only validation errors are returned; task failures are reported in
    /// the `ExecutionReport`.
    pub async fn execute(
        &self,
        manifest: &ProjectManifest,
        cancel: CancellationToken,
    ) -> Result<ExecutionReport> {
        let graph = ManifestValidator::new(&self.registry).validate(manifest)?;
        Ok(self.run(&graph, cancel).await)
    }

    /// Run every task of `graph` to a terminal state.
    pub async fn run(&self, graph: &DependencyGraph, cancel: CancellationToken) -> ExecutionReport {
        tracing::info!(project = graph.project(), tasks = graph.len(), "starting run");
        Run::new(self, graph).drive(cancel).await
    }

    fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

/// Marker that keeps a `Ready` task from being dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hold {
    AwaitingReview,
    Backoff,
}

#[derive(Debug, Clone, Default)]
struct TaskRuntime {
    state: TaskState,
    attempts: u32,
    hold: Option<Hold>,
    last_outcome: Option<AgentOutcome>,
    last_error: Option<String>,
    review_id: Option<ReviewId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitKind {
    Attempt,
    ReviewOpen,
    ReviewWait,
    Backoff,
}

struct UnitInfo {
    node: NodeIndex,
    kind: UnitKind,
    handle: AbortHandle,
}

/// What a unit of work hands back to the loop.
enum UnitResult {
    Attempt {
        node: NodeIndex,
        outcome: AgentOutcome,
        elapsed: Duration,
    },
    ReviewOpened {
        node: NodeIndex,
        result: Result<ReviewId>,
    },
    ReviewDecided {
        node: NodeIndex,
        review_id: ReviewId,
        result: Result<ReviewDecision>,
    },
    BackoffElapsed {
        node: NodeIndex,
    },
}

/// State of one run. Owned by the scheduler loop.
struct Run<'a> {
    scheduler: &'a ExecutionScheduler,
    graph: &'a DependencyGraph,
    tasks: Vec<TaskRuntime>,
    units: JoinSet<UnitResult>,
    in_flight: HashMap<Id, UnitInfo>,
    aggregator: ResultAggregator,
    cancelled: bool,
}

impl<'a> Run<'a> {
    fn new(scheduler: &'a ExecutionScheduler, graph: &'a DependencyGraph) -> Self {
        Self {
            scheduler,
            graph,
            tasks: vec![TaskRuntime::default(); graph.len()],
            units: JoinSet::new(),
            in_flight: HashMap::new(),
            aggregator: ResultAggregator::with_metrics(graph, Arc::clone(&scheduler.metrics)),
            cancelled: false,
        }
    }

    async fn drive(mut self, cancel: CancellationToken) -> ExecutionReport {
        let graph = self.graph;
        for node in graph.nodes() {
            if let Some(skip) = self.evaluate(node) {
                self.finish(node, skip);
            }
        }

        loop {
            if cancel.is_cancelled() && !self.cancelled {
                self.cancel();
            }
            if !self.cancelled {
                self.dispatch_ready();
            }
            if self.units.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled(), if !self.cancelled => self.cancel(),
                joined = self.units.join_next_with_id() => match joined {
                    Some(Ok((id, result))) => {
                        self.in_flight.remove(&id);
                        self.handle(result);
                    }
                    Some(Err(e)) => self.handle_join_error(e),
                    None => {}
                },
            }
        }

        self.finish_remaining();
        let report = self.aggregator.finalize();
        let counts = report.counts();
        tracing::info!(
            project = %report.project,
            succeeded = counts.succeeded,
            failed = counts.failed,
            skipped = counts.skipped,
            cancelled = counts.cancelled,
            "run complete"
        );
        self.scheduler.emit(SchedulerEvent::RunComplete { counts });
        report
    }

    fn rt(&mut self, node: NodeIndex) -> &mut TaskRuntime {
        &mut self.tasks[node.index()]
    }

    fn spawn<F>(&mut self, node: NodeIndex, kind: UnitKind, unit: F)
    where
        F: Future<Output = UnitResult> + Send + 'static,
    {
        let handle = self.units.spawn(unit);
        self.in_flight.insert(handle.id(), UnitInfo { node, kind, handle });
    }

    /// Promote a `Pending` task whose dependencies all succeeded, or
    /// return the skip state it must take when one of them is blocking.
    /// Tasks in any other state are left alone, which makes promotion fire
    /// at most once per task.
    fn evaluate(&mut self, node: NodeIndex) -> Option<TaskState> {
        if self.tasks[node.index()].state != TaskState::Pending {
            return None;
        }
        let graph = self.graph;
        let deps = graph.dependencies(node);

        if let Some(&blocker) = deps
            .iter()
            .find(|d| self.tasks[d.index()].state.blocks_dependents())
        {
            let dependency = graph.task(blocker).name.clone();
            return Some(TaskState::Skipped(SkipReason::Upstream { dependency }));
        }
        if deps
            .iter()
            .all(|d| self.tasks[d.index()].state == TaskState::Succeeded)
        {
            let name = &graph.task(node).name;
            tracing::debug!(task = %name, "promoted");
            self.rt(node).state = TaskState::Ready;
            self.scheduler.emit(SchedulerEvent::Promoted { task: name.clone() });
        }
        None
    }

    fn dispatch_ready(&mut self) {
        let graph = self.graph;
        let ready: Vec<NodeIndex> = graph
            .nodes()
            .filter(|n| {
                let rt = &self.tasks[n.index()];
                rt.state == TaskState::Ready && rt.hold.is_none()
            })
            .collect();
        for node in ready {
            self.dispatch(node);
        }
    }

    fn dispatch(&mut self, node: NodeIndex) {
        let graph = self.graph;
        let spec = graph.task(node);
        let rt = self.rt(node);
        rt.state = TaskState::Running;
        rt.attempts += 1;
        let attempt = rt.attempts;

        tracing::info!(task = %spec.name, agent = %spec.agent, attempt, "dispatching");
        self.scheduler.emit(SchedulerEvent::Started {
            task: spec.name.clone(),
            attempt,
        });

        let agent = self.scheduler.registry.resolve(&spec.agent);
        let retrieval = spec
            .context_query
            .clone()
            .and_then(|q| self.scheduler.retriever.clone().map(|r| (r, q)));
        let n = self.scheduler.config.max_context_results;
        let prompt = spec.description.clone();
        let span = tracing::info_span!("task", name = %spec.name, attempt);

        self.spawn(
            node,
            UnitKind::Attempt,
            async move {
                let started = Instant::now();
                let outcome = match agent {
                    Err(e) => AgentOutcome::failed(e.to_string()),
                    Ok(agent) => {
                        let context = match retrieval {
                            Some((retriever, query)) => retriever.retrieve_context(&query, n).await,
                            None => Ok(Vec::new()),
                        };
                        match context {
                            Ok(context) => run_agent(agent.as_ref(), &prompt, &context).await,
                            Err(e) => AgentOutcome::failed(format!("context retrieval failed: {}", e)),
                        }
                    }
                };
                UnitResult::Attempt {
                    node,
                    outcome,
                    elapsed: started.elapsed(),
                }
            }
            .instrument(span),
        );
    }

    fn handle(&mut self, result: UnitResult) {
        match result {
            UnitResult::Attempt {
                node,
                outcome,
                elapsed,
            } => {
                let graph = self.graph;
                self.aggregator.record_attempt(&graph.task(node).name, elapsed);
                if self.tasks[node.index()].state == TaskState::Running {
                    self.on_attempt(node, outcome);
                }
            }
            UnitResult::ReviewOpened { node, result } => {
                if !self.tasks[node.index()].state.is_terminal() {
                    self.on_review_opened(node, result);
                }
            }
            UnitResult::ReviewDecided {
                node,
                review_id,
                result,
            } => {
                if !self.tasks[node.index()].state.is_terminal() {
                    self.on_review_decided(node, review_id, result);
                }
            }
            UnitResult::BackoffElapsed { node } => {
                let rt = self.rt(node);
                if rt.state == TaskState::Ready && rt.hold == Some(Hold::Backoff) {
                    rt.hold = None;
                }
            }
        }
    }

    fn on_attempt(&mut self, node: NodeIndex, outcome: AgentOutcome) {
        let graph = self.graph;
        let spec = graph.task(node);

        if !outcome.is_success() {
            let error = outcome
                .error
                .clone()
                .unwrap_or_else(|| "agent reported failure".to_string());
            self.rt(node).last_outcome = Some(outcome);
            self.on_failed_attempt(node, error);
            return;
        }

        let issues = outcome.issues();
        self.rt(node).last_outcome = Some(outcome);
        if !spec.requires_review || issues.is_empty() {
            self.finish(node, TaskState::Succeeded);
            return;
        }
        if self.cancelled {
            self.finish(node, TaskState::Skipped(SkipReason::Cancelled));
            return;
        }

        tracing::info!(task = %spec.name, issues = issues.len(), "holding for review");
        let rt = self.rt(node);
        rt.state = TaskState::Ready;
        rt.hold = Some(Hold::AwaitingReview);

        let gate = self.scheduler.review_gate.clone();
        let project = graph.project().to_string();
        let task = spec.name.clone();
        self.spawn(node, UnitKind::ReviewOpen, async move {
            let result = gate.create_review(&project, &task, issues).await;
            UnitResult::ReviewOpened { node, result }
        });
    }

    fn on_review_opened(&mut self, node: NodeIndex, result: Result<ReviewId>) {
        let graph = self.graph;
        let name = &graph.task(node).name;
        let review_id = match result {
            Ok(id) => id,
            Err(e) => {
                self.rt(node).hold = None;
                self.on_failed_attempt(node, format!("review store error: {}", e));
                return;
            }
        };

        self.rt(node).review_id = Some(review_id);
        self.aggregator.record_review(name, review_id);
        self.scheduler.emit(SchedulerEvent::ReviewRequested {
            task: name.clone(),
            review_id,
        });

        let gate = self.scheduler.review_gate.clone();
        let poll = self.scheduler.config.review_poll_interval;
        let timeout = self.scheduler.config.review_timeout;
        self.spawn(node, UnitKind::ReviewWait, async move {
            let result = gate.await_decision(review_id, poll, timeout).await;
            UnitResult::ReviewDecided {
                node,
                review_id,
                result,
            }
        });
    }

    fn on_review_decided(&mut self, node: NodeIndex, review_id: ReviewId, result: Result<ReviewDecision>) {
        self.rt(node).hold = None;
        match result {
            Ok(ReviewDecision::Approved) => self.finish(node, TaskState::Succeeded),
            Ok(ReviewDecision::Rejected { feedback }) => {
                let error = match feedback {
                    Some(feedback) => format!("review {} rejected: {}", review_id, feedback),
                    None => format!("review {} rejected", review_id),
                };
                self.rt(node).last_error = Some(error);
                self.finish(node, TaskState::Failed);
            }
            Ok(ReviewDecision::TimedOut) => {
                self.rt(node).last_error = Some(format!("review {} timed out", review_id));
                self.finish(node, TaskState::Failed);
            }
            Err(e) => self.on_failed_attempt(node, format!("review store error: {}", e)),
        }
    }

    /// Re-queue the task if it has retries left, otherwise fail it.
    fn on_failed_attempt(&mut self, node: NodeIndex, error: String) {
        let graph = self.graph;
        let spec = graph.task(node);
        let rt = self.rt(node);
        rt.last_error = Some(error.clone());
        let attempt = rt.attempts;

        if attempt >= spec.max_attempts() {
            tracing::warn!(task = %spec.name, attempts = attempt, error = %error, "retries exhausted");
            self.finish(node, TaskState::Failed);
            return;
        }
        if self.cancelled {
            self.finish(node, TaskState::Skipped(SkipReason::Cancelled));
            return;
        }

        let delay = self.scheduler.config.retry.delay(attempt);
        tracing::warn!(
            task = %spec.name,
            attempt,
            retries = spec.retries,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "attempt failed, retrying"
        );
        self.scheduler.emit(SchedulerEvent::Retrying {
            task: spec.name.clone(),
            attempt,
            delay,
        });

        let rt = self.rt(node);
        rt.state = TaskState::Ready;
        if !delay.is_zero() {
            rt.hold = Some(Hold::Backoff);
            self.spawn(node, UnitKind::Backoff, async move {
                tokio::time::sleep(delay).await;
                UnitResult::BackoffElapsed { node }
            });
        }
    }

    fn handle_join_error(&mut self, e: JoinError) {
        let Some(info) = self.in_flight.remove(&e.id()) else {
            return;
        };
        let node = info.node;
        if self.tasks[node.index()].state.is_terminal() {
            return;
        }

        if e.is_cancelled() {
            if info.kind == UnitKind::Attempt {
                self.finish(node, TaskState::Skipped(SkipReason::Cancelled));
            }
            return;
        }

        let graph = self.graph;
        tracing::error!(task = %graph.task(node).name, kind = ?info.kind, error = %e, "unit of work panicked");
        match info.kind {
            UnitKind::Attempt => self.on_failed_attempt(node, format!("attempt panicked: {}", e)),
            UnitKind::ReviewOpen | UnitKind::ReviewWait => {
                self.rt(node).hold = None;
                self.on_failed_attempt(node, format!("review wait panicked: {}", e));
            }
            UnitKind::Backoff => self.rt(node).hold = None,
        }
    }

    /// Stop dispatching, abort review waits and backoff timers (and
    /// attempts too when configured), and skip every task not yet running.
    fn cancel(&mut self) {
        self.cancelled = true;
        let abort_attempts = self.scheduler.config.abort_in_flight_on_cancel;
        tracing::info!(
            in_flight = self.in_flight.len(),
            abort_attempts,
            "run cancelled"
        );

        for info in self.in_flight.values() {
            if info.kind != UnitKind::Attempt || abort_attempts {
                info.handle.abort();
            }
        }

        let graph = self.graph;
        for node in graph.nodes() {
            if matches!(
                self.tasks[node.index()].state,
                TaskState::Pending | TaskState::Ready
            ) {
                self.finish(node, TaskState::Skipped(SkipReason::Cancelled));
            }
        }
    }

    /// Move `node` to a terminal state and re-evaluate its dependents
    /// (unless the run is cancelled). Cascade skips are walked breadth
    /// first with a worklist, so chain length never grows the stack.
    fn finish(&mut self, node: NodeIndex, state: TaskState) {
        let graph = self.graph;
        self.settle(node, state);

        let mut settled = VecDeque::from([node]);
        while let Some(done) = settled.pop_front() {
            if self.cancelled {
                break;
            }
            for dependent in graph.dependents(done) {
                if let Some(skip) = self.evaluate(dependent) {
                    self.settle(dependent, skip);
                    settled.push_back(dependent);
                }
            }
        }
    }

    /// Record the terminal state of a single task.
    fn settle(&mut self, node: NodeIndex, state: TaskState) {
        let graph = self.graph;
        let name = &graph.task(node).name;

        let rt = &mut self.tasks[node.index()];
        rt.state = state.clone();
        rt.hold = None;
        let error = match state {
            TaskState::Succeeded => None,
            _ => rt.last_error.clone(),
        };
        let attempts = rt.attempts;
        let outcome = rt.last_outcome.clone();

        match &state {
            TaskState::Succeeded => tracing::info!(task = %name, attempts, "task succeeded"),
            TaskState::Failed => {
                tracing::error!(task = %name, attempts, error = ?error, "task failed")
            }
            other => tracing::info!(task = %name, state = %other, "task skipped"),
        }

        self.aggregator
            .record_terminal(name, state.clone(), attempts, outcome, error);
        self.scheduler.emit(SchedulerEvent::Finished {
            task: name.clone(),
            state,
        });
    }

    fn finish_remaining(&mut self) {
        let graph = self.graph;
        for node in graph.nodes() {
            if !self.tasks[node.index()].state.is_terminal() {
                tracing::warn!(task = %graph.task(node).name, "task never reached a terminal state");
                self.finish(node, TaskState::Skipped(SkipReason::Cancelled));
            }
        }
    }
}
