//! Worker configuration.

use std::time::Duration;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Wait between polls when the queue is empty or unreachable
    pub poll_interval: Duration,
    /// Consecutive empty polls between idle alerts
    pub idle_alert_polls: u32,
    /// Backend pings tried at start-up before running on the fallback only
    pub backend_init_attempts: u32,
    /// Bound on one job execution
    pub job_timeout: Duration,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
    /// How often stale processing markers are reconciled
    pub reconcile_interval: Duration,
    /// How often an unavailable backend is pinged again
    pub backend_recheck_interval: Duration,
    /// Concurrent executions per job kind on the fallback queue
    pub handler_concurrency: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            idle_alert_polls: 120, // ~1 minute at the default interval
            backend_init_attempts: 3,
            job_timeout: Duration::from_secs(600),
            shutdown_timeout: Duration::from_secs(30),
            reconcile_interval: Duration::from_secs(60),
            backend_recheck_interval: Duration::from_secs(30),
            handler_concurrency: 2,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            poll_interval: Duration::from_millis(
                std::env::var("WORKER_POLL_INTERVAL_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(500),
            ),
            idle_alert_polls: std::env::var("WORKER_IDLE_ALERT_POLLS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.idle_alert_polls),
            backend_init_attempts: std::env::var("WORKER_BACKEND_INIT_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.backend_init_attempts),
            job_timeout: Duration::from_secs(
                std::env::var("WORKER_JOB_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(600),
            ),
            shutdown_timeout: Duration::from_secs(
                std::env::var("WORKER_SHUTDOWN_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
            reconcile_interval: Duration::from_secs(
                std::env::var("WORKER_RECONCILE_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(60),
            ),
            backend_recheck_interval: Duration::from_secs(
                std::env::var("WORKER_BACKEND_RECHECK_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
            handler_concurrency: std::env::var("WORKER_HANDLER_CONCURRENCY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.handler_concurrency),
        }
    }
}

/// Upstream service endpoints.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Transcript service base URL
    pub transcript_url: String,
    /// LLM analysis service base URL
    pub llm_url: String,
    /// Bearer token for the LLM service
    pub llm_api_key: Option<String>,
    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            transcript_url: "http://localhost:8081".to_string(),
            llm_url: "http://localhost:8082".to_string(),
            llm_api_key: None,
            timeout: Duration::from_secs(30),
        }
    }
}

impl UpstreamConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            transcript_url: std::env::var("TRANSCRIPT_SERVICE_URL")
                .unwrap_or_else(|_| "http://localhost:8081".to_string()),
            llm_url: std::env::var("LLM_SERVICE_URL")
                .unwrap_or_else(|_| "http://localhost:8082".to_string()),
            llm_api_key: std::env::var("LLM_API_KEY").ok().filter(|k| !k.is_empty()),
            timeout: Duration::from_secs(
                std::env::var("UPSTREAM_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
        }
    }
}
