//! Failure classification and retry policy.
//!
//! This crate provides:
//! - A closed set of error kinds and a deterministic classifier
//! - A per-kind retry policy table and backoff delay oracle
//! - A classified retry wrapper for upstream calls
//! - A failure tracker for suppressing repeated log lines

pub mod classify;
pub mod failure;
pub mod policy;
pub mod retry;

pub use classify::{classify, classify_error, ErrorKind};
pub use failure::JobFailure;
pub use policy::{compute_delay, RetryPolicies, RetryPolicy};
pub use retry::{retry_classified, FailureTracker, RetryResult};
