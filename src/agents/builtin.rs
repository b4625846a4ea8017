//! The built-in agent kinds.
//!
//! All of them write into `AgentContext::project_dir`. Generated files are
//! reported in the outcome payload under `files`, relative to that
//! directory.

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};

use super::security::ScanReport;
use super::{Action, Agent, AgentContext, AgentOutcome, ISSUES_KEY};
use crate::core::{ProjectManifest, TaskSpec};
use crate::error::Result;
use crate::git::RepoManager;
use crate::util::blocking;

const STUB_SOURCE: &str = "print('Hello, World!')\n";

const TEST_SOURCE: &str = "import pytest\n\ndef test_hello_world():\n    assert True\n";

const TEST_DOCKERFILE: &str = "FROM python:3.9-slim
WORKDIR /app
COPY . .
RUN pip install pytest
CMD [\"pytest\"]
";

const APP_DOCKERFILE: &str = "FROM python:3.9-slim
WORKDIR /app
COPY . .
RUN pip install -r requirements.txt
CMD [\"python\", \"main.py\"]
";

const K8S_DEPLOYMENT: &str = "apiVersion: apps/v1
kind: Deployment
metadata:
  name: my-app
spec:
  replicas: 1
  selector:
    matchLabels:
      app: my-app
  template:
    metadata:
      labels:
        app: my-app
    spec:
      containers:
      - name: my-app
        image: my-app:latest
        ports:
        - containerPort: 80
";

const CI_WORKFLOW: &str = "name: CI
on: [push]
jobs:
  build:
    runs-on: ubuntu-latest
    steps:
    - uses: actions/checkout@v2
    - name: Set up Python 3.9
      uses: actions/setup-python@v2
      with:
        python-version: 3.9
    - name: Install dependencies
      run: pip install -r requirements.txt
    - name: Run tests
      run: pytest
";

static NON_SLUG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z0-9]+").unwrap());

/// File stem derived from a prompt: lowercase words joined by `_`.
fn slugify(prompt: &str) -> String {
    let lower = prompt.to_lowercase();
    let slug = NON_SLUG_RE.replace_all(&lower, "_");
    let slug: String = slug.trim_matches('_').chars().take(48).collect();
    let slug = slug.trim_end_matches('_').to_string();
    if slug.is_empty() {
        "main".to_string()
    } else {
        slug
    }
}

/// Write `files` (relative path, contents) under `root`.
async fn write_files(root: &Path, files: &[(&str, &str)]) -> Result<Vec<String>> {
    let mut written = Vec::with_capacity(files.len());
    for (rel, contents) in files {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, contents).await?;
        written.push(rel.to_string());
    }
    Ok(written)
}

async fn commit(repo: Option<&Arc<RepoManager>>, files: &[String], message: &str) -> Result<Option<String>> {
    let Some(repo) = repo else {
        return Ok(None);
    };
    let repo = Arc::clone(repo);
    let files: Vec<PathBuf> = files.iter().map(PathBuf::from).collect();
    let message = message.to_string();
    blocking(move || repo.commit_files(&files, &message)).await
}

fn files_value(files: &[String]) -> Value {
    Value::Array(files.iter().cloned().map(Value::String).collect())
}

/// Generates source files, optionally through a headless LLM CLI.
pub struct CodeGenAgent {
    ctx: AgentContext,
}

impl CodeGenAgent {
    pub fn new(ctx: AgentContext) -> Self {
        Self { ctx }
    }

    async fn generate(&self, action: &Action) -> Result<String> {
        let Some(llm) = &self.ctx.llm else {
            return Ok(format!("# {}\n{}", action.prompt.trim(), STUB_SOURCE));
        };
        let mut prompt = format!(
            "Write a single Python source file for the following task. \
             Reply with the code only.\n\nTask: {}\n",
            action.prompt
        );
        if !action.context.is_empty() {
            prompt.push_str("\nRelevant context:\n");
            for doc in &action.context {
                prompt.push_str("- ");
                prompt.push_str(doc);
                prompt.push('\n');
            }
        }
        let mut code = llm.complete(&prompt, &self.ctx.project_dir).await?;
        if !code.ends_with('\n') {
            code.push('\n');
        }
        Ok(code)
    }
}

#[async_trait]
impl Agent for CodeGenAgent {
    async fn reason(&self, prompt: &str, context: &[String]) -> Result<Action> {
        tracing::info!(prompt, context = context.len(), "reasoning about code generation");
        let mut action = Action::new("generate_code", prompt, context);
        action
            .params
            .insert("file".to_string(), json!(format!("{}.py", slugify(prompt))));
        Ok(action)
    }

    async fn act(&self, action: Action) -> Result<AgentOutcome> {
        let file = action
            .params
            .get("file")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| "main.py".to_string());
        tracing::info!(file = %file, "generating code");

        let code = self.generate(&action).await?;
        let files = write_files(&self.ctx.project_dir, &[(file.as_str(), code.as_str())]).await?;
        let commit_id = commit(self.ctx.repo.as_ref(), &files, &format!("Generate {}", file)).await?;

        Ok(AgentOutcome::completed()
            .with("files", files_value(&files))
            .with("commit", json!(commit_id)))
    }
}

/// Runs static analysis and flags high-severity findings for review.
pub struct SecurityAgent {
    ctx: AgentContext,
}

impl SecurityAgent {
    pub fn new(ctx: AgentContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Agent for SecurityAgent {
    async fn reason(&self, prompt: &str, context: &[String]) -> Result<Action> {
        tracing::info!(prompt, "reasoning about security");
        Ok(Action::new("run_security_scans", prompt, context))
    }

    async fn act(&self, _action: Action) -> Result<AgentOutcome> {
        tracing::info!(project = %self.ctx.project_dir.display(), "running security scans");
        tokio::fs::create_dir_all(&self.ctx.project_dir).await?;

        let report = ScanReport::collect(&self.ctx.project_dir).await;
        let issues = report.high_severity_issues();
        let unavailable = report.failed_scanners();
        if !unavailable.is_empty() {
            tracing::warn!(scanners = ?unavailable, "some scanners produced no report");
        }
        tracing::info!(issues = issues.len(), "security scan finished");

        Ok(AgentOutcome::completed()
            .with("report", serde_json::to_value(&report)?)
            .with(ISSUES_KEY, Value::Array(issues)))
    }
}

/// Writes a pytest suite and runs it in the sandbox.
pub struct TesterAgent {
    ctx: AgentContext,
}

impl TesterAgent {
    pub fn new(ctx: AgentContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Agent for TesterAgent {
    async fn reason(&self, prompt: &str, context: &[String]) -> Result<Action> {
        tracing::info!(prompt, "reasoning about testing");
        Ok(Action::new("run_tests", prompt, context))
    }

    async fn act(&self, _action: Action) -> Result<AgentOutcome> {
        let Some(sandbox) = &self.ctx.sandbox else {
            return Ok(AgentOutcome::failed("sandbox runner not configured"));
        };

        let files = write_files(
            &self.ctx.project_dir,
            &[("tests/test_main.py", TEST_SOURCE), ("Dockerfile", TEST_DOCKERFILE)],
        )
        .await?;

        tracing::info!("running tests in sandbox");
        let output = sandbox.run_in_sandbox(&self.ctx.project_dir, "pytest").await?;
        tracing::info!(exit_code = output.exit_code, "sandbox run finished");

        let outcome = if output.success() {
            AgentOutcome::completed()
        } else {
            AgentOutcome::failed(format!("tests exited with code {}", output.exit_code))
        };
        Ok(outcome
            .with("files", files_value(&files))
            .with("test_results", serde_json::to_value(&output)?))
    }
}

/// Produces a project manifest.
#[derive(Debug, Default)]
pub struct ArchitectAgent;

impl ArchitectAgent {
    pub fn new() -> Self {
        Self
    }

    fn plan() -> ProjectManifest {
        ProjectManifest::new(
            "ExampleProject",
            vec![
                TaskSpec::new("plan", "ArchitectAgent", "Create the project plan."),
                TaskSpec::new("generate", "CodeGenAgent", "Generate code based on the plan.")
                    .depends_on("plan"),
                TaskSpec::new("test", "TesterAgent", "Test the generated code.").depends_on("generate"),
            ],
        )
    }
}

#[async_trait]
impl Agent for ArchitectAgent {
    async fn reason(&self, prompt: &str, context: &[String]) -> Result<Action> {
        tracing::info!(prompt, context = context.len(), "reasoning about the architecture");
        Ok(Action::new("generate_manifest", prompt, context))
    }

    async fn act(&self, _action: Action) -> Result<AgentOutcome> {
        tracing::info!("generating project manifest");
        let manifest = serde_json::to_value(Self::plan())?;
        Ok(AgentOutcome::completed().with("manifest", manifest))
    }
}

/// Generates container, Kubernetes and CI files.
pub struct DeploymentAgent {
    ctx: AgentContext,
}

impl DeploymentAgent {
    pub fn new(ctx: AgentContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Agent for DeploymentAgent {
    async fn reason(&self, prompt: &str, context: &[String]) -> Result<Action> {
        tracing::info!(prompt, "reasoning about deployment");
        Ok(Action::new("generate_deployment_files", prompt, context))
    }

    async fn act(&self, _action: Action) -> Result<AgentOutcome> {
        tracing::info!("generating deployment files");
        let files = write_files(
            &self.ctx.project_dir,
            &[
                ("Dockerfile", APP_DOCKERFILE),
                ("deployment.yaml", K8S_DEPLOYMENT),
                (".github/workflows/ci.yaml", CI_WORKFLOW),
            ],
        )
        .await?;
        let commit_id = commit(self.ctx.repo.as_ref(), &files, "Add deployment files").await?;
        Ok(AgentOutcome::completed()
            .with("files", files_value(&files))
            .with("commit", json!(commit_id)))
    }
}

/// Acknowledges fix requests without changing anything.
#[derive(Debug, Default)]
pub struct FixerAgent;

impl FixerAgent {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Agent for FixerAgent {
    async fn reason(&self, prompt: &str, context: &[String]) -> Result<Action> {
        tracing::info!(prompt, "reasoning about fixing code");
        Ok(Action::new("fix_code", prompt, context))
    }

    async fn act(&self, _action: Action) -> Result<AgentOutcome> {
        tracing::info!("fixing code");
        Ok(AgentOutcome::completed().with("files", json!([])))
    }
}
