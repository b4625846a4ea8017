//! Manifest validation.
//!
//! Turns a `ProjectManifest` into a `DependencyGraph`, rejecting duplicate
//! names, unregistered agent kinds, unknown dependencies and cycles before
//! any task is executed. Validation never runs agent code.

use std::collections::HashSet;

use thiserror::Error;

use crate::agents::AgentRegistry;
use crate::core::dag::DependencyGraph;
use crate::core::task::ProjectManifest;

/// Reasons a manifest is rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("duplicate task name: {0}")]
    DuplicateTaskName(String),

    #[error("task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: String, dependency: String },

    #[error("task {task} uses unknown agent kind {kind}")]
    UnknownAgentKind { task: String, kind: String },

    #[error("dependency cycle detected: {}", format_cycle(.0))]
    CycleDetected(Vec<String>),
}

fn format_cycle(members: &[String]) -> String {
    match members.first() {
        Some(first) => format!("{} -> {}", members.join(" -> "), first),
        None => String::new(),
    }
}

/// Validates manifests against the set of registered agent kinds.
pub struct ManifestValidator<'a> {
    registry: &'a AgentRegistry,
}

impl<'a> ManifestValidator<'a> {
    pub fn new(registry: &'a AgentRegistry) -> Self {
        Self { registry }
    }

    /// Validate a manifest and build its dependency graph.
    ///
    /// Checks run in a fixed order (names, agent kinds, dependencies,
    /// cycles) so the first problem reported is deterministic.
    pub fn validate(&self, manifest: &ProjectManifest) -> Result<DependencyGraph, ValidationError> {
        let mut names = HashSet::with_capacity(manifest.tasks.len());
        for task in &manifest.tasks {
            if !names.insert(task.name.as_str()) {
                return Err(ValidationError::DuplicateTaskName(task.name.clone()));
            }
        }

        for task in &manifest.tasks {
            if !self.registry.contains(&task.agent) {
                return Err(ValidationError::UnknownAgentKind {
                    task: task.name.clone(),
                    kind: task.agent.clone(),
                });
            }
        }

        for task in &manifest.tasks {
            if let Some(dep) = task
                .dependencies
                .iter()
                .find(|d| !names.contains(d.as_str()))
            {
                return Err(ValidationError::UnknownDependency {
                    task: task.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }

        let graph = DependencyGraph::build(&manifest.name, &manifest.tasks);
        if let Some(cycle) = graph.find_cycle() {
            return Err(ValidationError::CycleDetected(cycle));
        }

        Ok(graph)
    }
}
