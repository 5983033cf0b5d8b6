//! Distributed queue backend contract.
//!
//! Any store offering atomic list push/pop and set add/remove can implement
//! this. Four structures are expected: a pending list, a `processing` set, a
//! `failed` set and one status record per job that expires some time after
//! the job reaches a terminal state.
//!
//! `dequeue_next` pops a job and then marks it processing. The two steps are
//! not transactional: a crash between them loses the processing marker, never
//! the job (it was already handed to the caller). `reconcile_processing`
//! clears markers whose record is terminal or gone, and fails jobs that have
//! been processing for longer than any executor could still be running them
//! (the executor crashed or could not record the outcome).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use vjob_models::{Job, JobId};

use crate::error::QueueResult;

/// End of the pending list `dequeue_next` pops from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PopOrder {
    /// Oldest first
    #[default]
    Fifo,
    /// Newest first
    Lifo,
}

impl PopOrder {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fifo" => Some(PopOrder::Fifo),
            "lifo" => Some(PopOrder::Lifo),
            _ => None,
        }
    }
}

/// Queue sizes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: u64,
    pub processing: u64,
    pub failed: u64,
}

/// Outcome of a reconciliation sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Processing markers removed
    pub processing_cleared: usize,
    /// Processing jobs older than the stale bound, marked failed
    pub processing_expired: usize,
    /// Failed-set members whose record had expired
    pub failed_pruned: usize,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.processing_cleared == 0 && self.processing_expired == 0 && self.failed_pruned == 0
    }
}

/// Failure reason recorded for a processing job nobody finished.
pub(crate) fn abandoned_reason(stale_after: Duration) -> String {
    format!("abandoned: no outcome recorded within {:?} of starting", stale_after)
}

/// Shared queue store.
///
/// Every operation returns `QueueError::Unavailable` when the store cannot be
/// reached, so callers can fall back.
#[cfg_attr(any(test, feature = "mocks"), mockall::automock)]
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    /// Cheap reachability check.
    async fn ping(&self) -> QueueResult<()>;

    /// Push a job to the tail of the pending list.
    ///
    /// Returns `false` when a record for the job id already exists.
    async fn enqueue(&self, job: &Job) -> QueueResult<bool>;

    /// Pop the next job and mark it processing. The returned job has
    /// already been moved to `processing` with its attempt counted.
    async fn dequeue_next(&self) -> QueueResult<Option<Job>>;

    async fn mark_completed(&self, id: &JobId, result: &Value) -> QueueResult<()>;

    async fn mark_failed(&self, id: &JobId, reason: &str) -> QueueResult<()>;

    /// Current status record, if it has not expired.
    async fn status_of(&self, id: &JobId) -> QueueResult<Option<Job>>;

    async fn stats(&self) -> QueueResult<QueueStats>;

    /// Drop stale processing markers and expired failed-set members. Jobs
    /// processing for longer than `stale_after` are marked failed.
    async fn reconcile_processing(&self, stale_after: Duration) -> QueueResult<ReconcileReport>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pop_order_parse() {
        assert_eq!(PopOrder::parse("FIFO"), Some(PopOrder::Fifo));
        assert_eq!(PopOrder::parse("lifo"), Some(PopOrder::Lifo));
        assert_eq!(PopOrder::parse("random"), None);
    }
}
