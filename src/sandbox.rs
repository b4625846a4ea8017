//! Sandboxed command execution in containers.
//!
//! `SandboxRunner` mounts a project directory into a resource-limited
//! container and runs one command there. The container engine is behind
//! the `ContainerEngine` trait; `DockerCli` drives the `docker` binary.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::{Error, Result};

/// Exit status docker uses for its own errors (as opposed to the command's).
const DOCKER_DAEMON_ERROR: i32 = 125;

/// Container limits and image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub image: String,
    /// Memory limit in docker notation, e.g. `128m`.
    pub memory: String,
    pub cpu_shares: u32,
    /// Mount point and working directory inside the container.
    pub workdir: String,
    /// Container engine binary.
    pub engine: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "python:3.9-slim".to_string(),
            memory: "128m".to_string(),
            cpu_shares: 128,
            workdir: "/app".to_string(),
            engine: "docker".to_string(),
        }
    }
}

/// Exit code and combined output of a sandboxed command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxOutput {
    pub exit_code: i32,
    pub logs: String,
}

impl SandboxOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// One container run.
#[derive(Debug, Clone)]
pub struct ContainerRun<'a> {
    pub config: &'a SandboxConfig,
    pub project_path: &'a Path,
    pub command: &'a str,
}

/// A container runtime.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Run a command to completion. Fails with `Error::ImageNotFound` when
    /// the image is not available locally.
    async fn run(&self, run: ContainerRun<'_>) -> Result<SandboxOutput>;

    /// Fetch an image.
    async fn pull(&self, image: &str) -> Result<()>;
}

/// `ContainerEngine` backed by the docker CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: PathBuf,
}

impl DockerCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn is_available(&self) -> bool {
        which::which(&self.binary).is_ok()
    }

    fn run_args(run: &ContainerRun<'_>) -> Vec<String> {
        let cfg = run.config;
        vec![
            "run".to_string(),
            "--rm".to_string(),
            "--pull".to_string(),
            "never".to_string(),
            "-v".to_string(),
            format!("{}:{}:rw", run.project_path.display(), cfg.workdir),
            "-w".to_string(),
            cfg.workdir.clone(),
            "--memory".to_string(),
            cfg.memory.clone(),
            "--cpu-shares".to_string(),
            cfg.cpu_shares.to_string(),
            cfg.image.clone(),
            "sh".to_string(),
            "-c".to_string(),
            run.command.to_string(),
        ]
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn run(&self, run: ContainerRun<'_>) -> Result<SandboxOutput> {
        let args = Self::run_args(&run);
        tracing::debug!(image = %run.config.image, command = run.command, "docker run");
        let output = Command::new(&self.binary)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Sandbox(format!("{}: {}", self.binary.display(), e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let exit_code = output.status.code().unwrap_or(-1);

        if exit_code == DOCKER_DAEMON_ERROR && is_missing_image(&stderr) {
            return Err(Error::ImageNotFound(run.config.image.clone()));
        }

        Ok(SandboxOutput {
            exit_code,
            logs: format!("{}{}", stdout, stderr),
        })
    }

    async fn pull(&self, image: &str) -> Result<()> {
        tracing::info!(image, "pulling image");
        let output = Command::new(&self.binary)
            .args(["pull", image])
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Sandbox(format!("{}: {}", self.binary.display(), e)))?;
        if !output.status.success() {
            return Err(Error::Sandbox(format!(
                "pull {} failed: {}",
                image,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

fn is_missing_image(stderr: &str) -> bool {
    stderr.contains("No such image") || stderr.contains("Unable to find image")
}

/// Runs commands against a project directory in a container.
#[derive(Clone)]
pub struct SandboxRunner {
    engine: Arc<dyn ContainerEngine>,
    config: SandboxConfig,
}

impl SandboxRunner {
    pub fn new(engine: Arc<dyn ContainerEngine>, config: SandboxConfig) -> Self {
        Self { engine, config }
    }

    /// Runner using the docker CLI named in `config.engine`.
    pub fn docker(config: SandboxConfig) -> Self {
        let engine = Arc::new(DockerCli::new(&config.engine));
        Self::new(engine, config)
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Run `command` with `project_path` mounted at the configured workdir.
    ///
    /// A missing image is pulled once and the run retried once; a second
    /// miss is a sandbox error.
    pub async fn run_in_sandbox(&self, project_path: &Path, command: &str) -> Result<SandboxOutput> {
        let project_path = project_path
            .canonicalize()
            .unwrap_or_else(|_| project_path.to_path_buf());
        let run = ContainerRun {
            config: &self.config,
            project_path: &project_path,
            command,
        };

        match self.engine.run(run.clone()).await {
            Err(Error::ImageNotFound(image)) => {
                tracing::info!(image = %image, "image missing, pulling once");
                self.engine.pull(&image).await?;
                match self.engine.run(run).await {
                    Err(Error::ImageNotFound(image)) => Err(Error::Sandbox(format!(
                        "image {} still missing after pull",
                        image
                    ))),
                    other => other,
                }
            }
            other => other,
        }
    }
}

impl std::fmt::Debug for SandboxRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxRunner")
            .field("config", &self.config)
            .finish()
    }
}
