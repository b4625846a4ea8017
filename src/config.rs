use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::orchestration::{RetryPolicy, SchedulerConfig};
use crate::retrieval::DEFAULT_RESULTS;
use crate::sandbox::SandboxConfig;
use crate::{Error, Result};

/// Overrides the `~/.agentflow` state directory.
pub const HOME_ENV: &str = "AGENTFLOW_HOME";

/// Settings loaded from `agentflow.toml`. Every field has a default, so a
/// missing file or a partial one is fine.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Where agents write generated files. Defaults to the current directory.
    pub project_dir: Option<String>,
    pub scheduler: SchedulerSection,
    pub retry: RetryPolicy,
    pub review: ReviewSection,
    pub sandbox: SandboxConfig,
    pub retrieval: RetrievalSection,
    pub agents: AgentsSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulerSection {
    pub abort_in_flight_on_cancel: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReviewSection {
    /// Review store file. Defaults to `reviews.json` in the state directory.
    pub store: Option<String>,
    pub poll_interval_ms: u64,
    /// Unset means wait for a decision indefinitely.
    pub timeout_secs: Option<u64>,
}

impl Default for ReviewSection {
    fn default() -> Self {
        Self {
            store: None,
            poll_interval_ms: 1000,
            timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetrievalSection {
    pub max_results: usize,
    /// Files indexed into the keyword retriever before every run.
    pub documents: Vec<String>,
}

impl Default for RetrievalSection {
    fn default() -> Self {
        Self {
            max_results: DEFAULT_RESULTS,
            documents: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct AgentsSection {
    /// Headless LLM command line for code generation, e.g. `claude -p`.
    pub command: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl Config {
    pub fn agentflow_dir() -> Result<PathBuf> {
        if let Some(dir) = std::env::var_os(HOME_ENV) {
            return Ok(PathBuf::from(dir));
        }
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".agentflow"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::agentflow_dir()?.join("agentflow.toml"))
    }

    /// Review store file, honouring `[review] store`.
    pub fn reviews_path(&self) -> Result<PathBuf> {
        match &self.review.store {
            Some(path) => Ok(expand_tilde(path)),
            None => Ok(Self::agentflow_dir()?.join("reviews.json")),
        }
    }

    pub fn project_dir(&self) -> PathBuf {
        match &self.project_dir {
            Some(dir) => expand_tilde(dir),
            None => PathBuf::from("."),
        }
    }

    pub fn document_paths(&self) -> Vec<PathBuf> {
        self.retrieval.documents.iter().map(|d| expand_tilde(d)).collect()
    }

    /// Scheduler tunables derived from the `[scheduler]`, `[retry]`,
    /// `[review]` and `[retrieval]` sections.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            retry: self.retry,
            review_poll_interval: Duration::from_millis(self.review.poll_interval_ms.max(1)),
            review_timeout: self.review.timeout_secs.map(Duration::from_secs),
            max_context_results: self.retrieval.max_results,
            abort_in_flight_on_cancel: self.scheduler.abort_in_flight_on_cancel,
        }
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "loading config");
        if !path.exists() {
            tracing::debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents).map_err(|source| Error::Config {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(
            project_dir = ?config.project_dir,
            retry = ?config.retry,
            command = ?config.agents.command,
            "config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.exists() {
                tracing::debug!(dir = %dir.display(), "creating config directory");
                fs::create_dir_all(dir)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        tracing::debug!(path = %path.display(), "config saved");
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
