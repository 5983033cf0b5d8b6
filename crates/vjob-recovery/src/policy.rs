//! Retry policy per error kind.
//!
//! The table is built once at start-up and never mutated afterwards. The
//! delay oracle is pure: it neither sleeps nor retries.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;

use crate::classify::ErrorKind;

/// Jittered delays never drop below this.
pub const MIN_JITTERED_DELAY: Duration = Duration::from_millis(100);

/// Maximum jitter applied to a delay, as a fraction of it (±25%).
pub const JITTER_FRACTION: f64 = 0.25;

/// Backoff configuration for one error kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Cap on the un-jittered delay.
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl RetryPolicy {
    pub const fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
        jitter: bool,
    ) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            backoff_multiplier,
            jitter,
        }
    }

    /// Single attempt, no backoff.
    pub const fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO, 1.0, false)
    }

    pub fn is_retryable(&self) -> bool {
        self.max_attempts > 1
    }

    /// Same policy without jitter.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }
}

/// Delay before retrying after failed attempt number `attempt` (1-based).
///
/// `min(base * multiplier^(attempt-1), max)`, then perturbed by up to ±25%
/// with a 100ms floor when jitter is enabled.
pub fn compute_delay(attempt: u32, policy: &RetryPolicy) -> Duration {
    let exponent = attempt.max(1) - 1;
    let base_ms = policy.base_delay.as_millis() as f64;
    let max_ms = policy.max_delay.as_millis() as f64;

    let raw = base_ms * policy.backoff_multiplier.powi(exponent.min(i32::MAX as u32) as i32);
    let capped = if raw.is_finite() { raw.min(max_ms) } else { max_ms };

    if !policy.jitter {
        return Duration::from_millis(capped.max(0.0) as u64);
    }

    let factor = rand::rng().random_range((1.0 - JITTER_FRACTION)..=(1.0 + JITTER_FRACTION));
    let jittered = Duration::from_millis((capped * factor).max(0.0) as u64);
    jittered.max(MIN_JITTERED_DELAY)
}

/// Immutable policy table keyed by error kind.
#[derive(Debug, Clone)]
pub struct RetryPolicies {
    policies: HashMap<ErrorKind, RetryPolicy>,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        let secs = Duration::from_secs;
        let mut policies = HashMap::new();
        policies.insert(
            ErrorKind::Network,
            RetryPolicy::new(5, secs(1), secs(30), 2.0, true),
        );
        policies.insert(
            ErrorKind::RateLimit,
            RetryPolicy::new(5, secs(5), secs(60), 2.0, true),
        );
        policies.insert(ErrorKind::Auth, RetryPolicy::no_retry());
        policies.insert(ErrorKind::Validation, RetryPolicy::no_retry());
        policies.insert(
            ErrorKind::ServerError,
            RetryPolicy::new(3, secs(2), secs(30), 2.0, true),
        );
        policies.insert(
            ErrorKind::Timeout,
            RetryPolicy::new(3, secs(2), secs(20), 1.5, true),
        );
        policies.insert(
            ErrorKind::QuotaExceeded,
            RetryPolicy::new(3, secs(30), secs(300), 2.0, true),
        );
        policies.insert(
            ErrorKind::Unknown,
            RetryPolicy::new(3, secs(1), secs(10), 2.0, true),
        );
        Self { policies }
    }
}

impl RetryPolicies {
    /// Same retry shape for every retryable kind. Auth and validation stay
    /// single-attempt.
    pub fn uniform(policy: RetryPolicy) -> Self {
        let mut table = Self::default();
        for kind in ErrorKind::ALL {
            table = table.with_policy(kind, policy);
        }
        table
    }

    /// Override one kind. Fatal kinds are clamped to a single attempt.
    pub fn with_policy(mut self, kind: ErrorKind, policy: RetryPolicy) -> Self {
        let policy = if kind.is_fatal() {
            RetryPolicy::no_retry()
        } else {
            policy
        };
        self.policies.insert(kind, policy);
        self
    }

    pub fn policy_for(&self, kind: ErrorKind) -> RetryPolicy {
        self.policies
            .get(&kind)
            .copied()
            .unwrap_or_else(RetryPolicy::no_retry)
    }

    /// Backoff before the retry that follows failed attempt `attempt`.
    pub fn delay_for(&self, kind: ErrorKind, attempt: u32) -> Duration {
        compute_delay(attempt, &self.policy_for(kind))
    }
}
