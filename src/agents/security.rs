//! Static analysis scanners used by `SecurityAgent`.
//!
//! Each scanner is run only when its binary is on `PATH`. A scanner that is
//! missing, fails to start or prints something other than JSON is recorded
//! as `{"error": ...}` in the report; it never fails the scan as a whole.

use std::path::Path;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::process::Command;

/// Raw JSON reports of every scanner.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScanReport {
    pub bandit: Value,
    pub semgrep: Value,
    pub pip_audit: Value,
}

impl ScanReport {
    /// Run every scanner against `project`.
    pub async fn collect(project: &Path) -> Self {
        let target = project.display().to_string();
        let requirements = project.join("requirements.txt");
        if !requirements.exists() {
            // pip-audit needs a requirements file to audit
            if let Err(e) = tokio::fs::write(&requirements, "pytest\n").await {
                tracing::warn!(error = %e, "could not write requirements.txt");
            }
        }
        let requirements = requirements.display().to_string();

        let bandit_args = ["-r", target.as_str(), "-f", "json"];
        let semgrep_args = ["--config", "auto", "--json", target.as_str()];
        let pip_audit_args = ["-r", requirements.as_str(), "--format", "json"];

        let (bandit, semgrep, pip_audit) = tokio::join!(
            run_scanner("bandit", &bandit_args, project),
            run_scanner("semgrep", &semgrep_args, project),
            run_scanner("pip-audit", &pip_audit_args, project),
        );
        Self {
            bandit,
            semgrep,
            pip_audit,
        }
    }

    /// Findings severe enough to need a human: bandit `HIGH`, semgrep
    /// `ERROR`, and every known vulnerability reported by pip-audit.
    pub fn high_severity_issues(&self) -> Vec<Value> {
        let mut issues = Vec::new();

        for issue in results(&self.bandit) {
            if issue.get("issue_severity").and_then(Value::as_str) == Some("HIGH") {
                issues.push(issue.clone());
            }
        }

        for issue in results(&self.semgrep) {
            let severity = issue
                .get("extra")
                .and_then(|e| e.get("severity"))
                .and_then(Value::as_str);
            if severity == Some("ERROR") {
                issues.push(issue.clone());
            }
        }

        if let Some(deps) = self.pip_audit.get("dependencies").and_then(Value::as_array) {
            for dep in deps {
                if let Some(vulns) = dep.get("vulns").and_then(Value::as_array) {
                    issues.extend(vulns.iter().cloned());
                }
            }
        }

        issues
    }

    /// Names of scanners that did not produce a report.
    pub fn failed_scanners(&self) -> Vec<&'static str> {
        [
            ("bandit", &self.bandit),
            ("semgrep", &self.semgrep),
            ("pip-audit", &self.pip_audit),
        ]
        .into_iter()
        .filter(|(_, report)| report.get("error").is_some())
        .map(|(name, _)| name)
        .collect()
    }
}

fn results(report: &Value) -> &[Value] {
    report
        .get("results")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

async fn run_scanner(program: &str, args: &[&str], cwd: &Path) -> Value {
    if which::which(program).is_err() {
        tracing::warn!(scanner = program, "scanner not found on PATH");
        return json!({ "error": format!("{} not found on PATH", program) });
    }

    let output = match Command::new(program)
        .args(args)
        .current_dir(cwd)
        .kill_on_drop(true)
        .output()
        .await
    {
        Ok(output) => output,
        Err(e) => {
            tracing::error!(scanner = program, error = %e, "scanner failed to start");
            return json!({ "error": e.to_string() });
        }
    };

    // Scanners exit non-zero when they find something; only the JSON matters.
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(report) => report,
        Err(e) => {
            tracing::error!(scanner = program, error = %e, "scanner output is not JSON");
            json!({ "error": e.to_string() })
        }
    }
}
