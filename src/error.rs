use thiserror::Error;

use crate::core::ValidationError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Invalid config {path}: {source}")]
    Config {
        path: std::path::PathBuf,
        source: toml::de::Error,
    },

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid manifest: {0}")]
    Validation(#[from] ValidationError),

    #[error("Unknown agent kind: {0}")]
    UnknownAgentKind(String),

    #[error("Review not found: {0}")]
    ReviewNotFound(crate::review::ReviewId),

    #[error("Collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("Sandbox error: {0}")]
    Sandbox(String),

    #[error("Image not found: {0}")]
    ImageNotFound(String),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

pub type Result<T> = std::result::Result<T, Error>;
