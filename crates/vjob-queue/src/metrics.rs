//! Job lifecycle metrics.

use metrics::{counter, gauge};

/// Metric names as constants for consistency.
pub mod names {
    pub const JOBS_SUBMITTED_TOTAL: &str = "vjob_jobs_submitted_total";
    pub const JOBS_COMPLETED_TOTAL: &str = "vjob_jobs_completed_total";
    pub const JOBS_FAILED_TOTAL: &str = "vjob_jobs_failed_total";
    pub const JOBS_RETRIED_TOTAL: &str = "vjob_jobs_retried_total";
    pub const FALLBACK_IN_FLIGHT: &str = "vjob_fallback_in_flight";
}

/// Record a job accepted by `path` ("distributed" or "fallback").
pub fn record_job_submitted(path: &'static str) {
    counter!(names::JOBS_SUBMITTED_TOTAL, "path" => path).increment(1);
}

pub fn record_job_completed(kind: &'static str) {
    counter!(names::JOBS_COMPLETED_TOTAL, "kind" => kind).increment(1);
}

pub fn record_job_failed(kind: &'static str, error: &'static str) {
    counter!(names::JOBS_FAILED_TOTAL, "kind" => kind, "error" => error).increment(1);
}

pub fn record_job_retried(kind: &'static str, error: &'static str) {
    counter!(names::JOBS_RETRIED_TOTAL, "kind" => kind, "error" => error).increment(1);
}

pub fn set_fallback_in_flight(count: usize) {
    gauge!(names::FALLBACK_IN_FLIGHT).set(count as f64);
}
