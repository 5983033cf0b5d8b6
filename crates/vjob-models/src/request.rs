//! Job submission request.

use serde::{Deserialize, Serialize};

use crate::job::{Job, JobKind, JobPayload};

/// Structured job description accepted from producers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    #[serde(rename = "type")]
    pub kind: JobKind,

    #[serde(default)]
    pub payload: JobPayload,

    pub owner: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

impl JobRequest {
    pub fn new(kind: JobKind, payload: JobPayload, owner: impl Into<String>) -> Self {
        Self {
            kind,
            payload,
            owner: owner.into(),
            priority: None,
            max_attempts: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Validate the request.
    pub fn validate(&self) -> Result<(), String> {
        if self.owner.trim().is_empty() {
            return Err("Owner is required".to_string());
        }

        if self.max_attempts == Some(0) {
            return Err("max_attempts must be at least 1".to_string());
        }

        if self.payload.video_key().is_none() {
            return Err(format!(
                "{} jobs require a video_id or video_url in the payload",
                self.kind
            ));
        }

        Ok(())
    }

    /// Build the job this request describes. Generates the job id.
    pub fn into_job(self) -> Job {
        let mut job = Job::new(self.kind, self.payload, self.owner);
        if let Some(priority) = self.priority {
            job = job.with_priority(priority);
        }
        if let Some(max_attempts) = self.max_attempts {
            job = job.with_max_attempts(max_attempts);
        }
        job
    }
}
