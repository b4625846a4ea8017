//! Agent capabilities.
//!
//! An agent turns a prompt plus retrieved context into an `Action`
//! (`reason`) and carries the action out (`act`), reporting an
//! `AgentOutcome`. Agents are looked up by kind through the
//! `AgentRegistry`; the scheduler only ever sees `Arc<dyn Agent>`.

mod builtin;
pub mod llm;
mod registry;
pub mod security;
pub mod testing;

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::git::RepoManager;
use crate::sandbox::SandboxRunner;

pub use builtin::{
    ArchitectAgent, CodeGenAgent, DeploymentAgent, FixerAgent, SecurityAgent, TesterAgent,
};
pub use llm::HeadlessCli;
pub use registry::AgentRegistry;

/// Payload key under which agents report issues that need human review.
pub const ISSUES_KEY: &str = "issues";

/// The closed set of built-in agent kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentKind {
    CodeGen,
    Security,
    Tester,
    Architect,
    Deployment,
    Fixer,
}

impl AgentKind {
    pub const ALL: [AgentKind; 6] = [
        AgentKind::CodeGen,
        AgentKind::Security,
        AgentKind::Tester,
        AgentKind::Architect,
        AgentKind::Deployment,
        AgentKind::Fixer,
    ];

    /// Name used for this kind in manifests.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::CodeGen => "CodeGenAgent",
            AgentKind::Security => "SecurityAgent",
            AgentKind::Tester => "TesterAgent",
            AgentKind::Architect => "ArchitectAgent",
            AgentKind::Deployment => "DeploymentAgent",
            AgentKind::Fixer => "FixerAgent",
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AgentKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        AgentKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| crate::Error::UnknownAgentKind(s.to_string()))
    }
}

/// What an agent decided to do for a prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Machine-readable action name, e.g. `generate_code`.
    pub name: String,
    /// The prompt the action was derived from.
    pub prompt: String,
    /// Context strings retrieved for the prompt.
    #[serde(default)]
    pub context: Vec<String>,
    /// Extra parameters chosen while reasoning.
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl Action {
    pub fn new(name: &str, prompt: &str, context: &[String]) -> Self {
        Self {
            name: name.to_string(),
            prompt: prompt.to_string(),
            context: context.to_vec(),
            params: Map::new(),
        }
    }
}

/// Reported status of an agent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Completed,
    Failed,
}

/// Result of one agent run, success or failure alike.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub status: OutcomeStatus,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentOutcome {
    pub fn completed() -> Self {
        Self {
            status: OutcomeStatus::Completed,
            payload: Map::new(),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Failed,
            payload: Map::new(),
            error: Some(error.into()),
        }
    }

    /// Add a payload entry.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Completed
    }

    /// Issues flagged for human review, empty if none.
    pub fn issues(&self) -> Vec<Value> {
        match self.payload.get(ISSUES_KEY) {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        }
    }
}

/// A capability that can execute tasks of one agent kind.
///
/// Both steps may fail; `run_agent` folds any error into a failed outcome.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Decide what to do for a prompt and its retrieved context.
    async fn reason(&self, prompt: &str, context: &[String]) -> Result<Action>;

    /// Carry out a previously reasoned action.
    async fn act(&self, action: Action) -> Result<AgentOutcome>;
}

/// Run the reason/act loop of an agent.
///
/// Errors and panics inside the agent never escape: they are returned as
/// a failed `AgentOutcome`.
pub async fn run_agent(agent: &dyn Agent, prompt: &str, context: &[String]) -> AgentOutcome {
    let attempt = async {
        let action = agent.reason(prompt, context).await?;
        tracing::trace!(action = %action.name, "agent reasoned");
        agent.act(action).await
    };

    match AssertUnwindSafe(attempt).catch_unwind().await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => AgentOutcome::failed(e.to_string()),
        Err(panic) => AgentOutcome::failed(format!("agent panicked: {}", panic_message(&*panic))),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Shared collaborators handed to the built-in agents.
#[derive(Clone)]
pub struct AgentContext {
    /// Directory generated files are written to.
    pub project_dir: PathBuf,
    /// Repository generated files are committed to, if any.
    pub repo: Option<Arc<RepoManager>>,
    /// Sandbox used to run generated tests.
    pub sandbox: Option<Arc<SandboxRunner>>,
    /// Headless LLM CLI used for code generation, if configured.
    pub llm: Option<HeadlessCli>,
}

impl AgentContext {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            repo: None,
            sandbox: None,
            llm: None,
        }
    }

    pub fn with_repo(mut self, repo: Arc<RepoManager>) -> Self {
        self.repo = Some(repo);
        self
    }

    pub fn with_sandbox(mut self, sandbox: Arc<SandboxRunner>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn with_llm(mut self, llm: HeadlessCli) -> Self {
        self.llm = Some(llm);
        self
    }
}
