//! Core domain models for pipeline execution.
//!
//! This module contains the manifest data model, the validated dependency
//! graph and the validator that connects them.

pub mod dag;
pub mod task;
pub mod validate;

pub use dag::DependencyGraph;
pub use task::{ProjectManifest, SkipReason, TaskSpec, TaskState};
pub use validate::{ManifestValidator, ValidationError};
