//! Human-approval checkpoint.
//!
//! The gate opens a review for a task's flagged issues and polls the
//! store until a human decides it or the optional deadline passes. It
//! never changes a review's status itself.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use crate::review::{ReviewId, ReviewStatus, ReviewStore};
use crate::{Error, Result};

/// Outcome of waiting on a review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewDecision {
    Approved,
    Rejected { feedback: Option<String> },
    TimedOut,
}

/// Creates reviews and waits for their decisions.
#[derive(Clone)]
pub struct ReviewGate {
    store: Arc<dyn ReviewStore>,
}

impl ReviewGate {
    pub fn new(store: Arc<dyn ReviewStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn ReviewStore> {
        &self.store
    }

    /// Open a pending review for `task`.
    pub async fn create_review(&self, project: &str, task: &str, issues: Vec<Value>) -> Result<ReviewId> {
        let id = self.store.create(project, task, issues).await?;
        tracing::info!(review = id, task, "review requested");
        Ok(id)
    }

    /// Poll review `id` every `poll_interval` until it is decided.
    ///
    /// With `timeout = None` this waits indefinitely. A review missing from
    /// the store is an error, as is any store failure.
    pub async fn await_decision(
        &self,
        id: ReviewId,
        poll_interval: Duration,
        timeout: Option<Duration>,
    ) -> Result<ReviewDecision> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let record = self.store.get(id).await?.ok_or(Error::ReviewNotFound(id))?;
            match record.status {
                ReviewStatus::Approved => return Ok(ReviewDecision::Approved),
                ReviewStatus::Rejected => {
                    return Ok(ReviewDecision::Rejected {
                        feedback: record.feedback,
                    })
                }
                ReviewStatus::Pending => {}
            }

            let sleep_for = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        tracing::warn!(review = id, "review timed out");
                        return Ok(ReviewDecision::TimedOut);
                    }
                    poll_interval.min(deadline - now)
                }
                None => poll_interval,
            };
            tokio::time::sleep(sleep_for).await;
        }
    }
}

impl std::fmt::Debug for ReviewGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReviewGate").finish_non_exhaustive()
    }
}
