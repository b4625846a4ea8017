//! Scheduler execution tests.
//!
//! These tests verify ordering, retry budgets, cascading skips,
//! concurrent dispatch and context retrieval through the public
//! `ExecutionScheduler` API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Barrier;

use agentflow::agents::testing::{ScriptedAgent, StaticAgent, Step};
use agentflow::agents::AgentOutcome;
use agentflow::core::{SkipReason, TaskSpec, TaskState};
use agentflow::orchestration::{RetryPolicy, SchedulerConfig, SchedulerEvent};
use agentflow::retrieval::{KeywordRetriever, Retriever};
use agentflow::{Error, Result};

use crate::fixtures::{
    agent, fast_config, manifest, promotions, registry, shared, started, state, SchedulerHarness,
};

fn upstream(dependency: &str) -> TaskState {
    TaskState::Skipped(SkipReason::Upstream {
        dependency: dependency.to_string(),
    })
}

/// Test: Linear pipeline
/// Given A -> B -> C with agents that always succeed
/// When the scheduler runs
/// Then all three succeed, each once, in dependency order
#[tokio::test]
async fn test_linear_pipeline_succeeds_in_order() {
    let mut harness = SchedulerHarness::new(registry(vec![("Ok", agent(StaticAgent::succeeding()))]));

    let report = harness
        .execute(vec![
            TaskSpec::new("A", "Ok", "first"),
            TaskSpec::new("B", "Ok", "second").depends_on("A"),
            TaskSpec::new("C", "Ok", "third").depends_on("B"),
        ])
        .await;

    for name in ["A", "B", "C"] {
        assert_eq!(state(&report, name), TaskState::Succeeded);
        assert_eq!(report.task(name).unwrap().attempts, 1);
    }
    assert!(report.is_success());
    assert_eq!(report.exit_code(), 0);

    let events = harness.events();
    assert_eq!(started(&events), vec!["A", "B", "C"]);
    assert!(matches!(
        events.last(),
        Some(SchedulerEvent::RunComplete { counts }) if counts.succeeded == 3
    ));
}

/// Test: Retry bound
/// Given A with retries = 2 whose agent always fails
/// Then A fails after exactly 3 attempts
#[tokio::test]
async fn test_retry_budget_bounds_attempts() {
    let flaky = Arc::new(ScriptedAgent::always_failing());
    let mut harness = SchedulerHarness::new(registry(vec![("Flaky", shared(&flaky))]));

    let report = harness
        .execute(vec![TaskSpec::new("A", "Flaky", "never works").with_retries(2)])
        .await;

    assert_eq!(state(&report, "A"), TaskState::Failed);
    assert_eq!(report.task("A").unwrap().attempts, 3);
    assert_eq!(flaky.calls(), 3);
    assert_eq!(report.exit_code(), 1);

    let retries = harness
        .events()
        .into_iter()
        .filter(|e| matches!(e, SchedulerEvent::Retrying { .. }))
        .count();
    assert_eq!(retries, 2);
}

/// Test: Recovery within budget
/// Given A failing twice with retries = 2
/// Then A succeeds on the third attempt and its dependent runs
#[tokio::test]
async fn test_recovers_within_retry_budget() {
    let flaky = Arc::new(ScriptedAgent::failing_first(2));
    let harness = SchedulerHarness::new(registry(vec![
        ("Flaky", shared(&flaky)),
        ("Ok", agent(StaticAgent::succeeding())),
    ]));

    let report = harness
        .execute(vec![
            TaskSpec::new("A", "Flaky", "eventually works").with_retries(2),
            TaskSpec::new("B", "Ok", "after A").depends_on("A"),
        ])
        .await;

    assert_eq!(state(&report, "A"), TaskState::Succeeded);
    assert_eq!(report.task("A").unwrap().attempts, 3);
    assert!(report.task("A").unwrap().error.is_none());
    assert_eq!(state(&report, "B"), TaskState::Succeeded);
}

/// Test: Cascade
/// Given A -> B, A -> C, independent D, with A always failing
/// Then B and C are skipped without running and D succeeds
#[tokio::test]
async fn test_failure_cascades_to_dependents_only() {
    let downstream = Arc::new(ScriptedAgent::new(AgentOutcome::completed()));
    let mut harness = SchedulerHarness::new(registry(vec![
        ("Bad", agent(StaticAgent::failing("compile error"))),
        ("Down", shared(&downstream)),
        ("Ok", agent(StaticAgent::succeeding())),
    ]));

    let report = harness
        .execute(vec![
            TaskSpec::new("A", "Bad", "breaks"),
            TaskSpec::new("B", "Down", "needs A").depends_on("A"),
            TaskSpec::new("C", "Down", "needs A").depends_on("A"),
            TaskSpec::new("D", "Ok", "independent"),
        ])
        .await;

    assert_eq!(state(&report, "A"), TaskState::Failed);
    assert_eq!(state(&report, "B"), upstream("A"));
    assert_eq!(state(&report, "C"), upstream("A"));
    assert_eq!(state(&report, "D"), TaskState::Succeeded);
    assert_eq!(downstream.calls(), 0);
    assert_eq!(report.task("A").unwrap().error.as_deref(), Some("compile error"));

    let counts = report.counts();
    assert_eq!((counts.succeeded, counts.failed, counts.skipped), (1, 1, 2));
    assert!(!started(&harness.events()).contains(&"B".to_string()));
}

/// Test: Transitive cascade through a skipped task
/// Given A -> B -> C with A failing
/// Then C names B (not A) as the upstream cause
#[tokio::test]
async fn test_cascade_is_transitive() {
    let harness = SchedulerHarness::new(registry(vec![
        ("Bad", agent(StaticAgent::failing("no"))),
        ("Ok", agent(StaticAgent::succeeding())),
    ]));

    let report = harness
        .execute(vec![
            TaskSpec::new("A", "Bad", "breaks"),
            TaskSpec::new("B", "Ok", "needs A").depends_on("A"),
            TaskSpec::new("C", "Ok", "needs B").depends_on("B"),
        ])
        .await;

    assert_eq!(state(&report, "B"), upstream("A"));
    assert_eq!(state(&report, "C"), upstream("B"));
    assert_eq!(report.task("C").unwrap().attempts, 0);
}

/// Test: Diamond promotion is idempotent
/// Given A -> B, A -> C, B -> D, C -> D where B and C finish together
/// Then D is promoted and started exactly once
#[tokio::test]
async fn test_diamond_promotes_join_once() {
    let barrier = Arc::new(Barrier::new(2));
    let mut harness = SchedulerHarness::new(registry(vec![
        ("Ok", agent(StaticAgent::succeeding())),
        (
            "Pair",
            agent(ScriptedAgent::new(AgentOutcome::completed()).with_barrier(barrier)),
        ),
    ]));

    let report = harness
        .execute(vec![
            TaskSpec::new("A", "Ok", "root"),
            TaskSpec::new("B", "Pair", "left").depends_on("A"),
            TaskSpec::new("C", "Pair", "right").depends_on("A"),
            TaskSpec::new("D", "Ok", "join").depends_on("B").depends_on("C"),
        ])
        .await;

    assert_eq!(state(&report, "D"), TaskState::Succeeded);
    assert_eq!(report.task("D").unwrap().attempts, 1);

    let events = harness.events();
    assert_eq!(promotions(&events, "D"), 1);
    assert_eq!(started(&events).iter().filter(|t| *t == "D").count(), 1);
}

/// Test: Concurrency
/// Given four independent tasks that each wait on a shared barrier
/// Then they must all be in flight at once for the run to finish
#[tokio::test]
async fn test_independent_tasks_run_concurrently() {
    let barrier = Arc::new(Barrier::new(4));
    let parallel = Arc::new(ScriptedAgent::new(AgentOutcome::completed()).with_barrier(barrier));
    let harness = SchedulerHarness::new(registry(vec![("Par", shared(&parallel))]));

    let report = harness
        .execute((1..=4).map(|i| TaskSpec::new(&format!("t{}", i), "Par", "work")).collect())
        .await;

    assert_eq!(report.counts().succeeded, 4);
    assert_eq!(parallel.max_in_flight(), 4);
}

/// Test: Errors and panics inside agents are failed attempts
#[tokio::test]
async fn test_agent_error_and_panic_are_retried() {
    let scripted = Arc::new(ScriptedAgent::new(AgentOutcome::completed()));
    scripted.push(Step::Error("model overloaded".to_string()));
    scripted.push(Step::Panic);
    let harness = SchedulerHarness::new(registry(vec![("Scripted", shared(&scripted))]));

    let report = harness
        .execute(vec![TaskSpec::new("A", "Scripted", "unstable").with_retries(2)])
        .await;

    assert_eq!(state(&report, "A"), TaskState::Succeeded);
    assert_eq!(report.task("A").unwrap().attempts, 3);
    assert_eq!(scripted.calls(), 3);
}

/// Test: Exponential backoff
/// Given a task failing twice under an exponential policy
/// Then the announced delays double
#[tokio::test(start_paused = true)]
async fn test_exponential_backoff_delays() {
    let config = SchedulerConfig {
        retry: RetryPolicy::exponential(Duration::from_millis(100), Duration::from_secs(1)),
        ..fast_config()
    };
    let mut harness = SchedulerHarness::with_config(
        registry(vec![("Flaky", agent(ScriptedAgent::failing_first(2)))]),
        config,
    );

    let started_at = tokio::time::Instant::now();
    let report = harness
        .execute(vec![TaskSpec::new("A", "Flaky", "backs off").with_retries(3)])
        .await;
    assert_eq!(state(&report, "A"), TaskState::Succeeded);
    assert!(started_at.elapsed() >= Duration::from_millis(300));

    let delays: Vec<Duration> = harness
        .events()
        .into_iter()
        .filter_map(|e| match e {
            SchedulerEvent::Retrying { delay, .. } => Some(delay),
            _ => None,
        })
        .collect();
    assert_eq!(delays, vec![Duration::from_millis(100), Duration::from_millis(200)]);
}

/// Test: Context retrieval
/// Given a task with a context query and a keyword retriever
/// Then the agent receives the matching documents only
#[tokio::test]
async fn test_context_query_feeds_agent() {
    let recorder = Arc::new(ScriptedAgent::new(AgentOutcome::completed()));
    let retriever = KeywordRetriever::with_documents([
        "flask routes and blueprints",
        "kubernetes deployment manifests",
        "flask testing with pytest",
    ]);
    let harness =
        SchedulerHarness::new(registry(vec![("Rec", shared(&recorder))])).with_retriever(Arc::new(retriever));

    harness
        .execute(vec![
            TaskSpec::new("with", "Rec", "uses context").with_context_query("flask testing"),
            TaskSpec::new("without", "Rec", "no query").depends_on("with"),
        ])
        .await;

    let contexts = recorder.contexts();
    assert_eq!(contexts.len(), 2);
    assert_eq!(
        contexts[0],
        vec!["flask testing with pytest".to_string(), "flask routes and blueprints".to_string()]
    );
    assert!(contexts[1].is_empty());
}

struct DownRetriever;

#[async_trait]
impl Retriever for DownRetriever {
    async fn retrieve_context(&self, _query: &str, _n: usize) -> Result<Vec<String>> {
        Err(Error::Unavailable("vector store offline".to_string()))
    }
}

/// Test: A retrieval failure fails the attempt
#[tokio::test]
async fn test_retrieval_failure_fails_attempt() {
    let recorder = Arc::new(ScriptedAgent::new(AgentOutcome::completed()));
    let harness =
        SchedulerHarness::new(registry(vec![("Rec", shared(&recorder))])).with_retriever(Arc::new(DownRetriever));

    let report = harness
        .execute(vec![TaskSpec::new("A", "Rec", "needs context")
            .with_context_query("anything")
            .with_retries(1)])
        .await;

    assert_eq!(state(&report, "A"), TaskState::Failed);
    assert_eq!(report.task("A").unwrap().attempts, 2);
    assert!(report.task("A").unwrap().error.as_deref().unwrap().contains("vector store offline"));
    assert_eq!(recorder.calls(), 0);
}

/// Test: Invalid manifests never execute
#[tokio::test]
async fn test_cycle_rejected_before_execution() {
    let recorder = Arc::new(ScriptedAgent::new(AgentOutcome::completed()));
    let harness = SchedulerHarness::new(registry(vec![("Rec", shared(&recorder))]));

    let result = harness
        .scheduler
        .execute(
            &manifest(vec![
                TaskSpec::new("A", "Rec", "a").depends_on("B"),
                TaskSpec::new("B", "Rec", "b").depends_on("A"),
            ]),
            tokio_util::sync::CancellationToken::new(),
        )
        .await;

    let err = tokio_test::assert_err!(result);
    assert!(matches!(err, Error::Validation(_)));
    assert_eq!(recorder.calls(), 0);
}
