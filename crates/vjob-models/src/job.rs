//! Job definitions for queue processing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::job_status::{JobStatus, JobStatusView};

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Type of job. Selects the handler that executes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Full pipeline for a new video: transcript, then analysis
    ProcessVideo,
    /// Run AI highlight analysis over a video's transcript
    AnalyzeVideo,
    /// Fetch (and cache) a video transcript
    FetchTranscript,
    /// Re-encode a source video
    Transcode,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        JobKind::ProcessVideo,
        JobKind::AnalyzeVideo,
        JobKind::FetchTranscript,
        JobKind::Transcode,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::ProcessVideo => "process_video",
            JobKind::AnalyzeVideo => "analyze_video",
            JobKind::FetchTranscript => "fetch_transcript",
            JobKind::Transcode => "transcode",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured data a handler needs.
///
/// The well-known identifiers are typed; anything else a producer attaches
/// travels in `extra` untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    /// Video identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_id: Option<String>,

    /// Source URL of the video
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,

    /// Custom prompt for AI analysis
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,

    /// Resource units (credits) the job consumes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credits: Option<u32>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl JobPayload {
    /// Payload for a single video.
    pub fn for_video(video_id: impl Into<String>) -> Self {
        Self {
            video_id: Some(video_id.into()),
            ..Default::default()
        }
    }

    /// Set the source URL.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.video_url = Some(url.into());
        self
    }

    /// Set the analysis prompt.
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    /// Identifier the job's caches are keyed by: the video id when present,
    /// otherwise the source URL.
    pub fn video_key(&self) -> Option<&str> {
        self.video_id.as_deref().or(self.video_url.as_deref())
    }
}

/// Rejected state change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("job {id} is already {status} and cannot change")]
    Terminal { id: JobId, status: JobStatus },

    #[error("job {id} cannot move from {from} to {to}")]
    Invalid {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
}

/// A unit of asynchronous work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID, stable for the job's lifetime
    pub id: JobId,

    /// Job type
    #[serde(rename = "type")]
    pub kind: JobKind,

    /// Handler input
    #[serde(default)]
    pub payload: JobPayload,

    /// Requester, used for listing and fairness only
    pub owner: String,

    /// Current status
    #[serde(default)]
    pub status: JobStatus,

    /// Higher is dispatched first
    #[serde(default)]
    pub priority: i32,

    /// Executions started so far
    #[serde(default)]
    pub attempts: u32,

    /// Attempt ceiling
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,

    /// Started at timestamp (latest attempt)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// Completed at timestamp (any terminal status)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Handler output (completed jobs only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Failure reason (failed jobs only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Backoff delays applied before each retry, in milliseconds
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retry_delays_ms: Vec<u64>,
}

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl Job {
    /// Create a new pending job.
    pub fn new(kind: JobKind, payload: JobPayload, owner: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            kind,
            payload,
            owner: owner.into(),
            status: JobStatus::Pending,
            priority: 0,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            retry_delays_ms: Vec::new(),
        }
    }

    /// Set priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the attempt ceiling (at least one attempt is always allowed).
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `to`, enforcing the state machine.
    pub fn transition(&mut self, to: JobStatus) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::Terminal {
                id: self.id.clone(),
                status: self.status,
            });
        }
        if !self.status.can_transition_to(to) {
            return Err(TransitionError::Invalid {
                id: self.id.clone(),
                from: self.status,
                to,
            });
        }

        let now = Utc::now();
        self.status = to;
        self.updated_at = now;
        if to.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    /// Begin an attempt. Counts the attempt.
    pub fn start(&mut self) -> Result<(), TransitionError> {
        self.transition(JobStatus::Processing)?;
        self.attempts += 1;
        self.started_at = Some(self.updated_at);
        Ok(())
    }

    /// Mark job as completed.
    pub fn complete(&mut self, result: Value) -> Result<(), TransitionError> {
        self.transition(JobStatus::Completed)?;
        self.result = Some(result);
        self.error = None;
        Ok(())
    }

    /// Mark job as permanently failed.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(JobStatus::Failed)?;
        self.error = Some(reason.into());
        self.result = None;
        Ok(())
    }

    /// Mark job as cancelled.
    pub fn cancel(&mut self) -> Result<(), TransitionError> {
        self.transition(JobStatus::Cancelled)
    }

    /// Record a failed attempt that will be retried after `delay_ms`.
    pub fn schedule_retry(
        &mut self,
        delay_ms: u64,
        reason: impl Into<String>,
    ) -> Result<(), TransitionError> {
        self.transition(JobStatus::Retrying)?;
        self.retry_delays_ms.push(delay_ms);
        // Last failure stays visible while retrying; cleared on completion.
        self.error = Some(reason.into());
        Ok(())
    }

    /// Return a retrying job to the pending pool.
    pub fn requeue(&mut self) -> Result<(), TransitionError> {
        self.transition(JobStatus::Pending)
    }

    /// Check if another attempt is allowed under `ceiling`.
    pub fn has_attempts_left(&self, ceiling: u32) -> bool {
        self.attempts < self.max_attempts.min(ceiling)
    }

    /// Snapshot for status polling.
    pub fn status_view(&self) -> JobStatusView {
        JobStatusView {
            id: self.id.clone(),
            kind: self.kind,
            status: self.status,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            result: self.result.clone(),
            error: self.error.clone(),
            updated_at: self.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job() -> Job {
        Job::new(JobKind::Transcode, JobPayload::for_video("abc"), "u1")
    }

    #[test]
    fn test_job_creation() {
        let job = job().with_priority(10).with_max_attempts(0);

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.priority, 10);
        assert_eq!(job.max_attempts, 1);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.payload.video_key(), Some("abc"));
    }

    #[test]
    fn test_job_state_transitions() {
        let mut job = job();

        job.start().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.attempts, 1);
        assert!(job.started_at.is_some());

        job.schedule_retry(250, "connection reset").unwrap();
        assert_eq!(job.status, JobStatus::Retrying);
        assert_eq!(job.retry_delays_ms, vec![250]);

        job.requeue().unwrap();
        job.start().unwrap();
        assert_eq!(job.attempts, 2);

        job.complete(json!({"ok": true})).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.is_some());
        assert!(job.error.is_none());
        assert_eq!(job.result, Some(json!({"ok": true})));
    }

    #[test]
    fn test_terminal_state_is_immutable() {
        let mut job = job();
        job.start().unwrap();
        job.fail("boom").unwrap();

        let err = job.complete(json!(1)).unwrap_err();
        assert!(matches!(err, TransitionError::Terminal { status: JobStatus::Failed, .. }));
        assert!(job.cancel().is_err());
        assert!(job.requeue().is_err());
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("boom"));
        assert!(job.result.is_none());
    }

    #[test]
    fn test_invalid_edges_rejected() {
        let mut job = job();
        assert!(matches!(
            job.complete(json!(null)),
            Err(TransitionError::Invalid { .. })
        ));
        assert!(job.requeue().is_err());
        assert_eq!(job.status, JobStatus::Pending);

        // cancellable straight from pending
        job.cancel().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
    }

    #[test]
    fn test_attempt_ceiling() {
        let mut job = job().with_max_attempts(3);
        job.start().unwrap();
        assert!(job.has_attempts_left(5));
        // policy ceiling lower than the job's own
        assert!(!job.has_attempts_left(1));
    }

    #[test]
    fn test_job_serializes_type_tag() {
        let job = job();
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["type"], "transcode");
        assert_eq!(value["status"], "pending");
        assert_eq!(value["payload"]["video_id"], "abc");

        let back: Job = serde_json::from_value(value).unwrap();
        assert_eq!(back.id, job.id);
    }

    #[test]
    fn test_payload_keeps_extra_fields() {
        let payload: JobPayload =
            serde_json::from_value(json!({"video_id": "v1", "language": "en"})).unwrap();
        assert_eq!(payload.video_id.as_deref(), Some("v1"));
        assert_eq!(payload.extra.get("language"), Some(&json!("en")));
    }
}
