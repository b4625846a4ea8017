//! Human review records and their storage.
//!
//! A review is created when a gated task flags issues. Humans decide it
//! (approve or reject with feedback) through whatever front end shares the
//! store; the scheduler only polls. `FileReviewStore` lets a separate
//! `agentflow reviews` process decide reviews for a running pipeline.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::util::{blocking, write_atomic};
use crate::{Error, Result};

pub type ReviewId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
}

impl std::fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReviewStatus::Pending => "pending",
            ReviewStatus::Approved => "approved",
            ReviewStatus::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub id: ReviewId,
    pub project_name: String,
    pub task: String,
    pub issues: Vec<Value>,
    pub status: ReviewStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
}

/// Storage for review records.
#[async_trait]
pub trait ReviewStore: Send + Sync {
    /// Create a pending review and return its id.
    async fn create(&self, project_name: &str, task: &str, issues: Vec<Value>) -> Result<ReviewId>;

    async fn get(&self, id: ReviewId) -> Result<Option<ReviewRecord>>;

    /// All reviews in id order.
    async fn list(&self) -> Result<Vec<ReviewRecord>>;

    async fn approve(&self, id: ReviewId) -> Result<()>;

    async fn reject(&self, id: ReviewId, feedback: Option<String>) -> Result<()>;
}

/// Review records plus the next id to hand out.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ReviewBook {
    next_id: ReviewId,
    reviews: BTreeMap<ReviewId, ReviewRecord>,
}

impl ReviewBook {
    fn create(&mut self, project_name: &str, task: &str, issues: Vec<Value>) -> ReviewId {
        let id = self.next_id;
        self.next_id += 1;
        self.reviews.insert(
            id,
            ReviewRecord {
                id,
                project_name: project_name.to_string(),
                task: task.to_string(),
                issues,
                status: ReviewStatus::Pending,
                feedback: None,
                created_at: Utc::now(),
                decided_at: None,
            },
        );
        id
    }

    fn decide(&mut self, id: ReviewId, status: ReviewStatus, feedback: Option<String>) -> Result<()> {
        let record = self.reviews.get_mut(&id).ok_or(Error::ReviewNotFound(id))?;
        record.status = status;
        record.feedback = feedback;
        record.decided_at = Some(Utc::now());
        tracing::info!(review = id, task = %record.task, status = %status, "review decided");
        Ok(())
    }
}

/// Process-local review store.
#[derive(Debug, Default)]
pub struct InMemoryReviewStore {
    book: std::sync::Mutex<ReviewBook>,
}

impl InMemoryReviewStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ReviewBook> {
        self.book.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ReviewStore for InMemoryReviewStore {
    async fn create(&self, project_name: &str, task: &str, issues: Vec<Value>) -> Result<ReviewId> {
        Ok(self.lock().create(project_name, task, issues))
    }

    async fn get(&self, id: ReviewId) -> Result<Option<ReviewRecord>> {
        Ok(self.lock().reviews.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<ReviewRecord>> {
        Ok(self.lock().reviews.values().cloned().collect())
    }

    async fn approve(&self, id: ReviewId) -> Result<()> {
        self.lock().decide(id, ReviewStatus::Approved, None)
    }

    async fn reject(&self, id: ReviewId, feedback: Option<String>) -> Result<()> {
        self.lock().decide(id, ReviewStatus::Rejected, feedback)
    }
}

/// Review store persisted as one JSON file.
///
/// Every operation re-reads the file, so decisions written by another
/// process are visible to the next poll. Writes within this process are
/// serialized; concurrent writers in different processes are not.
#[derive(Debug, Clone)]
pub struct FileReviewStore {
    path: Arc<PathBuf>,
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

impl FileReviewStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Arc::new(path.into()),
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<ReviewBook> {
        let path = Arc::clone(&self.path);
        blocking(move || read_book(&path)).await
    }

    /// Load, apply `f`, and write back atomically.
    async fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut ReviewBook) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let _guard = self.write_lock.lock().await;
        let path = Arc::clone(&self.path);
        blocking(move || {
            let mut book = read_book(&path)?;
            let value = f(&mut book)?;
            write_atomic(&path, &serde_json::to_vec_pretty(&book)?)?;
            Ok(value)
        })
        .await
    }
}

fn read_book(path: &Path) -> Result<ReviewBook> {
    match std::fs::read(path) {
        Ok(bytes) if bytes.is_empty() => Ok(ReviewBook::default()),
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ReviewBook::default()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ReviewStore for FileReviewStore {
    async fn create(&self, project_name: &str, task: &str, issues: Vec<Value>) -> Result<ReviewId> {
        let project_name = project_name.to_string();
        let task = task.to_string();
        self.update(move |book| Ok(book.create(&project_name, &task, issues)))
            .await
    }

    async fn get(&self, id: ReviewId) -> Result<Option<ReviewRecord>> {
        Ok(self.load().await?.reviews.remove(&id))
    }

    async fn list(&self) -> Result<Vec<ReviewRecord>> {
        Ok(self.load().await?.reviews.into_values().collect())
    }

    async fn approve(&self, id: ReviewId) -> Result<()> {
        self.update(move |book| book.decide(id, ReviewStatus::Approved, None))
            .await
    }

    async fn reject(&self, id: ReviewId, feedback: Option<String>) -> Result<()> {
        self.update(move |book| book.decide(id, ReviewStatus::Rejected, feedback))
            .await
    }
}
