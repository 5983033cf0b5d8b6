//! Shared data models for the video job pipeline.
//!
//! This crate provides Serde-serializable types for:
//! - Jobs, job kinds and their payloads
//! - The job status state machine
//! - Submission requests and status views exposed to callers

pub mod job;
pub mod job_status;
pub mod request;

pub use job::{Job, JobId, JobKind, JobPayload, TransitionError};
pub use job_status::{JobStatus, JobStatusView};
pub use request::JobRequest;
