//! Retry utilities driven by the classification policy table.
//!
//! Provides reusable retry patterns for resilient calls against rate-limited
//! upstream services (transcript provider, LLM provider, Redis).

use std::future::Future;

use tracing::{debug, info, warn};

use crate::classify::ErrorKind;
use crate::failure::JobFailure;
use crate::policy::{compute_delay, RetryPolicies};

/// Result of a retry operation.
#[derive(Debug)]
pub enum RetryResult<T> {
    /// Operation succeeded.
    Success(T),
    /// Operation failed after all allowed attempts, or hit a fatal kind.
    Failed {
        error: JobFailure,
        kind: ErrorKind,
        attempts: u32,
    },
}

impl<T> RetryResult<T> {
    /// Returns true if the operation succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, RetryResult::Success(_))
    }

    /// Convert into a plain result. The failure keeps its resolved kind.
    pub fn into_result(self) -> Result<T, JobFailure> {
        match self {
            RetryResult::Success(value) => Ok(value),
            RetryResult::Failed { mut error, kind, .. } => {
                error.kind = Some(kind);
                Err(error)
            }
        }
    }
}

/// Execute an async operation, retrying per the policy of each failure's kind.
///
/// Fatal kinds (auth, validation) return after the attempt that produced them.
///
/// # Example
/// ```ignore
/// let transcript = retry_classified(&policies, "fetch_transcript", || async {
///     provider.fetch(&video_id).await
/// })
/// .await
/// .into_result()?;
/// ```
pub async fn retry_classified<F, Fut, T>(
    policies: &RetryPolicies,
    operation_name: &str,
    mut operation: F,
) -> RetryResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, JobFailure>>,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return RetryResult::Success(value),
            Err(error) => {
                let kind = error.kind();
                let policy = policies.policy_for(kind);

                if attempt >= policy.max_attempts {
                    if policy.is_retryable() {
                        warn!(
                            operation = operation_name,
                            kind = %kind,
                            attempts = attempt,
                            "Retries exhausted: {}", error
                        );
                    }
                    return RetryResult::Failed {
                        error,
                        kind,
                        attempts: attempt,
                    };
                }

                let delay = compute_delay(attempt, &policy);
                debug!(
                    "{} attempt {} failed ({}), retrying in {:?}: {}",
                    operation_name, attempt, kind, delay, error
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Log throttle for a loop that keeps running through failures.
///
/// The first `max_logged` consecutive failures are reported, then one
/// suppression line, then nothing until a success. Failures are counted
/// per error kind so the recovery line says what the outage looked like.
#[derive(Debug)]
pub struct FailureTracker {
    label: &'static str,
    max_logged: u32,
    streak: u32,
    last_kind: Option<ErrorKind>,
}

impl FailureTracker {
    pub fn new(label: &'static str, max_logged: u32) -> Self {
        Self {
            label,
            max_logged,
            streak: 0,
            last_kind: None,
        }
    }

    /// Reset the streak, noting a recovery if lines were suppressed.
    pub fn record_success(&mut self) {
        if self.streak > self.max_logged {
            info!(
                loop_name = self.label,
                failures = self.streak,
                last_error_kind = ?self.last_kind,
                "Recovered after repeated failures"
            );
        }
        self.streak = 0;
        self.last_kind = None;
    }

    /// Count a failure. Returns whether the caller should log it.
    pub fn record_failure(&mut self, kind: ErrorKind) -> bool {
        self.streak = self.streak.saturating_add(1);
        self.last_kind = Some(kind);

        if self.streak == self.max_logged + 1 {
            warn!(
                loop_name = self.label,
                error_kind = %kind,
                "{} consecutive failures, suppressing further logs until recovery",
                self.max_logged
            );
        }
        self.streak <= self.max_logged
    }

    /// Current consecutive failures.
    pub fn streak(&self) -> u32 {
        self.streak
    }
}
