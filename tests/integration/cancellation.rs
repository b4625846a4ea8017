//! Cancellation tests.
//!
//! Each test cancels a run at a precise point (observed through
//! scheduler events) and checks which tasks drain, which are aborted
//! and which end `Skipped(Cancelled)`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use agentflow::agents::testing::{ScriptedAgent, StaticAgent};
use agentflow::agents::AgentOutcome;
use agentflow::core::{SkipReason, TaskSpec, TaskState};
use agentflow::orchestration::{ExecutionReport, RetryPolicy, SchedulerConfig, SchedulerEvent};
use agentflow::review::{ReviewStatus, ReviewStore};

use crate::fixtures::{agent, fast_config, manifest, registry, shared, state, SchedulerHarness, RUN_DEADLINE};

const CANCELLED: TaskState = TaskState::Skipped(SkipReason::Cancelled);

/// Run `tasks` and cancel as soon as an event matches `trigger`.
async fn run_and_cancel_on<F>(harness: &mut SchedulerHarness, tasks: Vec<TaskSpec>, trigger: F) -> ExecutionReport
where
    F: Fn(&SchedulerEvent) -> bool,
{
    let cancel = CancellationToken::new();
    let SchedulerHarness {
        scheduler, event_rx, ..
    } = harness;
    let pipeline = manifest(tasks);
    let run = scheduler.execute(&pipeline, cancel.clone());
    let watcher = watch(event_rx, &cancel, trigger);

    let (report, ()) = tokio::time::timeout(RUN_DEADLINE, async { tokio::join!(run, watcher) })
        .await
        .expect("run did not finish in time");
    report.expect("manifest should validate")
}

async fn watch<F>(events: &mut mpsc::UnboundedReceiver<SchedulerEvent>, cancel: &CancellationToken, trigger: F)
where
    F: Fn(&SchedulerEvent) -> bool,
{
    while let Some(event) = events.recv().await {
        if trigger(&event) {
            cancel.cancel();
            return;
        }
        if matches!(event, SchedulerEvent::RunComplete { .. }) {
            return;
        }
    }
}

fn started(name: &'static str) -> impl Fn(&SchedulerEvent) -> bool {
    move |e| matches!(e, SchedulerEvent::Started { task, .. } if task == name)
}

/// Test: Drain on cancel
/// Given slow A -> B
/// When the run is cancelled while A runs
/// Then A drains to success and B ends cancelled
#[tokio::test]
async fn test_cancel_drains_in_flight_attempts() {
    let slow = Arc::new(ScriptedAgent::new(AgentOutcome::completed()).with_delay(Duration::from_millis(100)));
    let mut harness = SchedulerHarness::new(registry(vec![
        ("Slow", shared(&slow)),
        ("Ok", agent(StaticAgent::succeeding())),
    ]));

    let report = run_and_cancel_on(
        &mut harness,
        vec![
            TaskSpec::new("A", "Slow", "long job"),
            TaskSpec::new("B", "Ok", "after A").depends_on("A"),
        ],
        started("A"),
    )
    .await;

    assert_eq!(state(&report, "A"), TaskState::Succeeded);
    assert_eq!(state(&report, "B"), CANCELLED);
    assert_eq!(slow.calls(), 1);
    assert_eq!(report.counts().cancelled, 1);
    assert!(report.is_success(), "cancellation alone is not a failure");
}

/// Test: Abort on cancel
/// Given abort_in_flight_on_cancel
/// When the run is cancelled while a very slow attempt runs
/// Then the attempt is dropped and the task ends cancelled
#[tokio::test]
async fn test_cancel_aborts_in_flight_when_configured() {
    let config = SchedulerConfig {
        abort_in_flight_on_cancel: true,
        ..fast_config()
    };
    let mut harness = SchedulerHarness::with_config(
        registry(vec![(
            "Stuck",
            agent(ScriptedAgent::new(AgentOutcome::completed()).with_delay(Duration::from_secs(3600))),
        )]),
        config,
    );

    let report = run_and_cancel_on(&mut harness, vec![TaskSpec::new("A", "Stuck", "never ends")], started("A")).await;

    assert_eq!(state(&report, "A"), CANCELLED);
    assert_eq!(report.task("A").unwrap().attempts, 1);
}

/// Test: A drained failure does not retry
/// Given A with retries left whose running attempt fails after cancel
/// Then A ends cancelled instead of re-queueing
#[tokio::test]
async fn test_drained_failure_with_budget_is_cancelled() {
    let flaky = Arc::new(ScriptedAgent::always_failing().with_delay(Duration::from_millis(50)));
    let mut harness = SchedulerHarness::new(registry(vec![("Flaky", shared(&flaky))]));

    let report = run_and_cancel_on(
        &mut harness,
        vec![TaskSpec::new("A", "Flaky", "fails").with_retries(5)],
        started("A"),
    )
    .await;

    assert_eq!(state(&report, "A"), CANCELLED);
    assert_eq!(flaky.calls(), 1);
    assert_eq!(report.task("A").unwrap().error.as_deref(), Some("always fails"));
}

/// Test: A drained failure without budget still fails
#[tokio::test]
async fn test_drained_failure_without_budget_fails() {
    let mut harness = SchedulerHarness::new(registry(vec![(
        "Flaky",
        agent(ScriptedAgent::always_failing().with_delay(Duration::from_millis(50))),
    )]));

    let report = run_and_cancel_on(&mut harness, vec![TaskSpec::new("A", "Flaky", "fails")], started("A")).await;

    assert_eq!(state(&report, "A"), TaskState::Failed);
    assert_eq!(report.exit_code(), 1);
}

/// Test: Cancel during a review wait
/// Then the gated task ends cancelled and the review is left undecided
#[tokio::test]
async fn test_cancel_abandons_review_wait() {
    let mut harness = SchedulerHarness::new(registry(vec![
        ("Scan", agent(StaticAgent::flagging(vec![json!("finding")]))),
        ("Ok", agent(StaticAgent::succeeding())),
    ]));

    let report = run_and_cancel_on(
        &mut harness,
        vec![
            TaskSpec::new("scan", "Scan", "scan").with_review(),
            TaskSpec::new("deploy", "Ok", "deploy").depends_on("scan"),
        ],
        |e| matches!(e, SchedulerEvent::ReviewRequested { .. }),
    )
    .await;

    assert_eq!(state(&report, "scan"), CANCELLED);
    assert_eq!(state(&report, "deploy"), CANCELLED);
    assert!(report.task("scan").unwrap().review_id.is_some());

    let reviews = harness.store.list().await.unwrap();
    assert_eq!(reviews[0].status, ReviewStatus::Pending);
}

/// Test: Cancel during a retry backoff
#[tokio::test]
async fn test_cancel_interrupts_backoff() {
    let config = SchedulerConfig {
        retry: RetryPolicy::fixed(Duration::from_secs(3600)),
        ..fast_config()
    };
    let flaky = Arc::new(ScriptedAgent::always_failing());
    let mut harness = SchedulerHarness::with_config(registry(vec![("Flaky", shared(&flaky))]), config);

    let report = run_and_cancel_on(
        &mut harness,
        vec![TaskSpec::new("A", "Flaky", "backs off").with_retries(3)],
        |e| matches!(e, SchedulerEvent::Retrying { .. }),
    )
    .await;

    assert_eq!(state(&report, "A"), CANCELLED);
    assert_eq!(report.task("A").unwrap().attempts, 1);
    assert_eq!(flaky.calls(), 1);
}
