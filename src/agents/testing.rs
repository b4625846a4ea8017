//! Deterministic agents for exercising the scheduler.
//!
//! Used by the unit tests and by `tests/integration`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Barrier;

use super::{Action, Agent, AgentOutcome, ISSUES_KEY};
use crate::error::{Error, Result};

/// Agent that returns the same outcome on every run.
#[derive(Debug, Clone)]
pub struct StaticAgent {
    outcome: AgentOutcome,
}

impl StaticAgent {
    pub fn new(outcome: AgentOutcome) -> Self {
        Self { outcome }
    }

    pub fn succeeding() -> Self {
        Self::new(AgentOutcome::completed())
    }

    pub fn failing(error: &str) -> Self {
        Self::new(AgentOutcome::failed(error))
    }

    /// Succeeds but flags the given issues for review.
    pub fn flagging(issues: Vec<Value>) -> Self {
        Self::new(AgentOutcome::completed().with(ISSUES_KEY, Value::Array(issues)))
    }
}

#[async_trait]
impl Agent for StaticAgent {
    async fn reason(&self, prompt: &str, context: &[String]) -> Result<Action> {
        Ok(Action::new("static", prompt, context))
    }

    async fn act(&self, _action: Action) -> Result<AgentOutcome> {
        Ok(self.outcome.clone())
    }
}

/// One scripted step of a `ScriptedAgent`.
#[derive(Debug, Clone)]
pub enum Step {
    /// Return this outcome.
    Outcome(AgentOutcome),
    /// Fail by returning an error from `act`.
    Error(String),
    /// Panic inside `act`.
    Panic,
}

/// Agent that plays back a script of outcomes, one per run, and records
/// how it was called.
///
/// Once the script is exhausted every further run returns the fallback.
pub struct ScriptedAgent {
    script: Mutex<VecDeque<Step>>,
    fallback: AgentOutcome,
    delay: Duration,
    barrier: Option<Arc<Barrier>>,
    calls: AtomicU32,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    contexts: Mutex<Vec<Vec<String>>>,
}

impl ScriptedAgent {
    pub fn new(fallback: AgentOutcome) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            delay: Duration::ZERO,
            barrier: None,
            calls: AtomicU32::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            contexts: Mutex::new(Vec::new()),
        }
    }

    /// Fail `n` times, then succeed.
    pub fn failing_first(n: u32) -> Self {
        let agent = Self::new(AgentOutcome::completed());
        for i in 0..n {
            agent.push(Step::Outcome(AgentOutcome::failed(format!("attempt {} failed", i + 1))));
        }
        agent
    }

    pub fn always_failing() -> Self {
        Self::new(AgentOutcome::failed("always fails"))
    }

    pub fn push(&self, step: Step) {
        self.lock_script().push_back(step);
    }

    /// Sleep this long inside every run.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Wait on a shared barrier inside every run.
    pub fn with_barrier(mut self, barrier: Arc<Barrier>) -> Self {
        self.barrier = Some(barrier);
        self
    }

    /// Number of runs started so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous runs observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Context received by each run, in call order.
    pub fn contexts(&self) -> Vec<Vec<String>> {
        self.contexts
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    fn lock_script(&self) -> std::sync::MutexGuard<'_, VecDeque<Step>> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    async fn reason(&self, prompt: &str, context: &[String]) -> Result<Action> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut contexts) = self.contexts.lock() {
            contexts.push(context.to_vec());
        }
        Ok(Action::new("scripted", prompt, context))
    }

    async fn act(&self, _action: Action) -> Result<AgentOutcome> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(barrier) = &self.barrier {
            barrier.wait().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let step = self.lock_script().pop_front();
        match step {
            Some(Step::Outcome(outcome)) => Ok(outcome),
            Some(Step::Error(msg)) => Err(Error::Unavailable(msg)),
            Some(Step::Panic) => panic!("scripted panic"),
            None => Ok(self.fallback.clone()),
        }
    }
}
