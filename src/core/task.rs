//! Task data model for the execution DAG.
//!
//! A `ProjectManifest` declares the tasks of one run. Each `TaskSpec` binds
//! a prompt to an agent kind, with a retry budget and optional dependencies.
//! `TaskState` is the runtime lifecycle the scheduler drives each task through.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;

/// Declaration of a single task in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Unique name within the manifest.
    pub name: String,
    /// Agent kind that executes this task (e.g. `CodeGenAgent`).
    pub agent: String,
    /// Prompt handed to the agent.
    pub description: String,
    /// Names of tasks that must succeed first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    /// Extra attempts allowed after the first failure.
    #[serde(default)]
    pub retries: u32,
    /// Query for the retrieval collaborator, resolved before each attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_query: Option<String>,
    /// Hold the task for human review when its agent flags issues.
    #[serde(default)]
    pub requires_review: bool,
}

impl TaskSpec {
    /// Create a task with no dependencies, no retries and no context query.
    pub fn new(name: &str, agent: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            agent: agent.to_string(),
            description: description.to_string(),
            dependencies: Vec::new(),
            retries: 0,
            context_query: None,
            requires_review: false,
        }
    }

    pub fn depends_on(mut self, dependency: &str) -> Self {
        self.dependencies.push(dependency.to_string());
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_context_query(mut self, query: &str) -> Self {
        self.context_query = Some(query.to_string());
        self
    }

    pub fn with_review(mut self) -> Self {
        self.requires_review = true;
        self
    }

    /// Total number of attempts this task may consume.
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }
}

/// A named set of tasks making up one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectManifest {
    pub name: String,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

impl ProjectManifest {
    pub fn new(name: &str, tasks: Vec<TaskSpec>) -> Self {
        Self {
            name: name.to_string(),
            tasks,
        }
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Load a manifest, choosing the format from the file extension.
    ///
    /// `.toml` files are parsed as TOML; anything else as JSON.
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&content),
            _ => Self::from_json_str(&content),
        }
    }
}

/// Why a task was skipped without running to completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum SkipReason {
    /// A dependency ended failed or skipped.
    Upstream {
        /// The direct dependency that blocked this task.
        dependency: String,
    },
    /// The run was cancelled before the task could finish.
    Cancelled,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Upstream { dependency } => write!(f, "upstream {}", dependency),
            SkipReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Runtime state of a task within one run.
///
/// `Succeeded`, `Failed` and `Skipped` are terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskState {
    /// Waiting for dependencies.
    Pending,
    /// Dependencies satisfied, waiting for dispatch (or held).
    Ready,
    /// An attempt is in flight.
    Running,
    /// Agent reported success (and any review was approved).
    Succeeded,
    /// Retries exhausted, review rejected or timed out.
    Failed,
    /// Never ran to completion.
    Skipped(SkipReason),
}

impl Default for TaskState {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Skipped(_)
        )
    }

    /// Failed or skipped: dependents of such a task can never run.
    pub fn blocks_dependents(&self) -> bool {
        matches!(self, TaskState::Failed | TaskState::Skipped(_))
    }

    /// Short label used in logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Ready => "ready",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Skipped(_) => "skipped",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Skipped(reason) => write!(f, "skipped ({})", reason),
            other => write!(f, "{}", other.label()),
        }
    }
}
