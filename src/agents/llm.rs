//! Headless LLM command-line backend.
//!
//! `HeadlessCli` runs a non-interactive LLM CLI (for example
//! `claude -p --output-format json`) with the prompt appended as the last
//! argument, and extracts the generated text from its output. JSON output
//! in the `{"subtype": ..., "result": ..., "error": ...}` shape is
//! understood; anything else is taken as plain text.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;

use crate::error::{Error, Result};

/// Default timeout for one completion (10 minutes).
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Deserialize)]
struct RawResponse {
    subtype: Option<String>,
    result: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// A headless LLM CLI invocation template.
#[derive(Debug, Clone)]
pub struct HeadlessCli {
    /// Program followed by its fixed arguments.
    command: Vec<String>,
    timeout: Duration,
}

impl HeadlessCli {
    /// Build from a whitespace-separated command line.
    ///
    /// Returns `None` for a blank command.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let command: Vec<String> = line.split_whitespace().map(String::from).collect();
        if command.is_empty() {
            return None;
        }
        Some(Self {
            command,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn binary(&self) -> &str {
        &self.command[0]
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether the binary can be found on `PATH`.
    pub fn is_available(&self) -> bool {
        which::which(self.binary()).is_ok()
    }

    /// Run one completion in `cwd` and return the generated text.
    pub async fn complete(&self, prompt: &str, cwd: &Path) -> Result<String> {
        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.command[0])
                .args(&self.command[1..])
                .arg(prompt)
                .current_dir(cwd)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| Error::Timeout(self.timeout))?
        .map_err(|e| Error::Unavailable(format!("{}: {}", self.binary(), e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if let Some(parsed) = parse_json_response(&stdout) {
            return parsed;
        }

        if !output.status.success() {
            let message = if stderr.trim().is_empty() {
                format!(
                    "{} exited with code {}",
                    self.binary(),
                    output.status.code().unwrap_or(-1)
                )
            } else {
                stderr.trim().to_string()
            };
            return Err(Error::Unavailable(message));
        }

        Ok(stdout.trim().to_string())
    }
}

/// Interpret JSON CLI output; `None` when the output is not JSON.
fn parse_json_response(stdout: &str) -> Option<Result<String>> {
    let raw: RawResponse = serde_json::from_str(stdout.trim()).ok()?;
    let parsed = match raw.subtype.as_deref() {
        Some("error") => Err(Error::Unavailable(
            raw.error.or(raw.result).unwrap_or_default(),
        )),
        _ => match (raw.result, raw.error) {
            (Some(result), _) => Ok(result),
            (None, Some(error)) => Err(Error::Unavailable(error)),
            (None, None) => Err(Error::Unavailable("Unknown response format".to_string())),
        },
    };
    Some(parsed)
}
