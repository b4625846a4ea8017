//! Human review gating tests.
//!
//! These tests drive the review hold end to end: a task flags issues,
//! the scheduler opens a review, and a "human" decides it through the
//! store, either in process or through a second file-store instance.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use agentflow::agents::testing::{ScriptedAgent, StaticAgent};
use agentflow::agents::AgentOutcome;
use agentflow::core::{SkipReason, TaskSpec, TaskState};
use agentflow::orchestration::{ExecutionScheduler, ReviewGate, SchedulerConfig, SchedulerEvent};
use agentflow::review::{FileReviewStore, ReviewId, ReviewRecord, ReviewStatus, ReviewStore};
use agentflow::{Error, Result};

use crate::fixtures::{
    agent, approve_all, fast_config, manifest, registry, shared, state, SchedulerHarness, RUN_DEADLINE,
};

fn scan_pipeline() -> Vec<TaskSpec> {
    vec![
        TaskSpec::new("scan", "Scan", "scan the code").with_review(),
        TaskSpec::new("deploy", "Ok", "ship it").depends_on("scan"),
    ]
}

fn flagged() -> Vec<Value> {
    vec![json!({"test_id": "B602", "issue_severity": "HIGH"})]
}

/// Wait for the first `ReviewRequested` event and return its id.
async fn next_review(events: &mut mpsc::UnboundedReceiver<SchedulerEvent>) -> ReviewId {
    loop {
        match events.recv().await {
            Some(SchedulerEvent::ReviewRequested { review_id, .. }) => return review_id,
            Some(_) => continue,
            None => panic!("event channel closed before a review was requested"),
        }
    }
}

/// Test: Review approval
/// Given scan (requires review, flags an issue) -> deploy
/// When the review is approved
/// Then both tasks succeed and deploy ran only after the approval
#[tokio::test]
async fn test_approved_review_releases_dependent() {
    let deploy = Arc::new(ScriptedAgent::new(AgentOutcome::completed()));
    let mut harness = SchedulerHarness::new(registry(vec![
        ("Scan", agent(StaticAgent::flagging(flagged()))),
        ("Ok", shared(&deploy)),
    ]));

    let SchedulerHarness {
        scheduler,
        store,
        event_rx,
    } = &mut harness;
    let pipeline = manifest(scan_pipeline());
    let run = scheduler.execute(&pipeline, CancellationToken::new());
    let human = async {
        let id = next_review(event_rx).await;
        assert_eq!(deploy.calls(), 0, "dependent must wait for the decision");
        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, ReviewStatus::Pending);
        assert_eq!(record.task, "scan");
        assert_eq!(record.issues, flagged());
        store.approve(id).await.unwrap();
        id
    };
    let (report, id) = tokio::time::timeout(RUN_DEADLINE, async { tokio::join!(run, human) })
        .await
        .unwrap();
    let report = report.unwrap();

    assert_eq!(state(&report, "scan"), TaskState::Succeeded);
    assert_eq!(state(&report, "deploy"), TaskState::Succeeded);
    assert_eq!(report.task("scan").unwrap().review_id, Some(id));
    assert_eq!(report.task("scan").unwrap().attempts, 1);
    assert_eq!(deploy.calls(), 1);
}

/// Test: Review rejection
/// When the review is rejected
/// Then the gated task fails without retrying and the dependent is skipped
#[tokio::test]
async fn test_rejected_review_fails_task() {
    let scan = Arc::new(ScriptedAgent::new(
        AgentOutcome::completed().with("issues", Value::Array(flagged())),
    ));
    let mut harness = SchedulerHarness::new(registry(vec![
        ("Scan", shared(&scan)),
        ("Ok", agent(StaticAgent::succeeding())),
    ]));

    let mut tasks = scan_pipeline();
    tasks[0].retries = 3;
    let SchedulerHarness {
        scheduler,
        store,
        event_rx,
    } = &mut harness;
    let pipeline = manifest(tasks);
    let run = scheduler.execute(&pipeline, CancellationToken::new());
    let human = async {
        let id = next_review(event_rx).await;
        store
            .reject(id, Some("shell=True is not acceptable".to_string()))
            .await
            .unwrap();
    };
    let (report, ()) = tokio::time::timeout(RUN_DEADLINE, async { tokio::join!(run, human) })
        .await
        .unwrap();
    let report = report.unwrap();

    assert_eq!(state(&report, "scan"), TaskState::Failed);
    assert_eq!(
        state(&report, "deploy"),
        TaskState::Skipped(SkipReason::Upstream {
            dependency: "scan".to_string()
        })
    );
    assert_eq!(scan.calls(), 1, "rejection is final, no retry");
    let error = report.task("scan").unwrap().error.clone().unwrap();
    assert!(error.contains("rejected"));
    assert!(error.contains("shell=True is not acceptable"));
}

/// Test: Review timeout
/// Given a review deadline nobody meets
/// Then the gated task fails and the review stays pending in the store
#[tokio::test(start_paused = true)]
async fn test_review_timeout_fails_task() {
    let config = SchedulerConfig {
        review_poll_interval: Duration::from_secs(1),
        review_timeout: Some(Duration::from_secs(5)),
        ..SchedulerConfig::default()
    };
    let harness = SchedulerHarness::with_config(
        registry(vec![
            ("Scan", agent(StaticAgent::flagging(flagged()))),
            ("Ok", agent(StaticAgent::succeeding())),
        ]),
        config,
    );

    let report = harness.execute(scan_pipeline()).await;

    assert_eq!(state(&report, "scan"), TaskState::Failed);
    assert!(report.task("scan").unwrap().error.as_deref().unwrap().contains("timed out"));
    let reviews = harness.store.list().await.unwrap();
    assert_eq!(reviews.len(), 1);
    assert_eq!(reviews[0].status, ReviewStatus::Pending);
}

/// Test: No issues, no gate
#[tokio::test]
async fn test_clean_outcome_skips_review() {
    let harness = SchedulerHarness::new(registry(vec![
        ("Scan", agent(StaticAgent::succeeding())),
        ("Ok", agent(StaticAgent::succeeding())),
    ]));

    let report = harness.execute(scan_pipeline()).await;

    assert!(report.is_success());
    assert!(report.task("scan").unwrap().review_id.is_none());
    assert!(harness.store.list().await.unwrap().is_empty());
}

/// Test: Review across processes
/// Given a file-backed store polled by the scheduler
/// When a second store instance on the same file approves the review
/// Then the pipeline proceeds
#[tokio::test]
async fn test_file_store_decided_by_second_instance() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("reviews.json");
    let scheduler = ExecutionScheduler::new(registry(vec![
        ("Scan", agent(StaticAgent::flagging(flagged()))),
        ("Ok", agent(StaticAgent::succeeding())),
    ]))
    .with_review_gate(ReviewGate::new(Arc::new(FileReviewStore::new(&path))))
    .with_config(fast_config());

    let pipeline = manifest(scan_pipeline());
    let run = scheduler.execute(&pipeline, CancellationToken::new());
    let human = async {
        let other = FileReviewStore::new(&path);
        loop {
            if other.list().await.map(|r| !r.is_empty()).unwrap_or(false) {
                approve_all(&other).await;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    let (report, ()) = tokio::time::timeout(RUN_DEADLINE, async { tokio::join!(run, human) })
        .await
        .unwrap();
    let report = report.unwrap();

    assert!(report.is_success());
    let reopened = FileReviewStore::new(&path).list().await.unwrap();
    assert_eq!(reopened.len(), 1);
    assert_eq!(reopened[0].status, ReviewStatus::Approved);
    assert_eq!(reopened[0].project_name, "integration");
}

/// Store whose writes always fail.
struct BrokenStore;

#[async_trait]
impl ReviewStore for BrokenStore {
    async fn create(&self, _project: &str, _task: &str, _issues: Vec<Value>) -> Result<ReviewId> {
        Err(Error::Unavailable("review database offline".to_string()))
    }

    async fn get(&self, id: ReviewId) -> Result<Option<ReviewRecord>> {
        Err(Error::ReviewNotFound(id))
    }

    async fn list(&self) -> Result<Vec<ReviewRecord>> {
        Ok(Vec::new())
    }

    async fn approve(&self, id: ReviewId) -> Result<()> {
        Err(Error::ReviewNotFound(id))
    }

    async fn reject(&self, id: ReviewId, _feedback: Option<String>) -> Result<()> {
        Err(Error::ReviewNotFound(id))
    }
}

/// Test: A review store failure counts as a failed attempt
#[tokio::test]
async fn test_store_error_consumes_retry_budget() {
    let scan = Arc::new(ScriptedAgent::new(
        AgentOutcome::completed().with("issues", Value::Array(flagged())),
    ));
    let scheduler = ExecutionScheduler::new(registry(vec![
        ("Scan", shared(&scan)),
        ("Ok", agent(StaticAgent::succeeding())),
    ]))
    .with_review_gate(ReviewGate::new(Arc::new(BrokenStore)))
    .with_config(fast_config());

    let mut tasks = scan_pipeline();
    tasks[0].retries = 1;
    let report = scheduler.execute(&manifest(tasks), CancellationToken::new()).await.unwrap();

    assert_eq!(state(&report, "scan"), TaskState::Failed);
    assert_eq!(report.task("scan").unwrap().attempts, 2);
    assert_eq!(scan.calls(), 2);
    assert!(report
        .task("scan")
        .unwrap()
        .error
        .as_deref()
        .unwrap()
        .contains("review database offline"));
}
