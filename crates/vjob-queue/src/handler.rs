//! Handler registry.
//!
//! Each `JobKind` maps to at most one handler plus its execution options.
//! Adding a kind means adding a `JobKind` variant and registering a handler
//! for it.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;

use vjob_models::{Job, JobKind};
use vjob_recovery::{ErrorKind, JobFailure};

/// Executes one job kind.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, job: &Job) -> Result<Value, JobFailure>;
}

/// Per-kind execution limits.
#[derive(Debug, Clone, Copy)]
pub struct HandlerOptions {
    /// Executions of this kind allowed at once
    pub concurrency: usize,
    /// Bound on a single execution; exceeding it counts as a failed attempt
    pub timeout: Duration,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            concurrency: 2,
            timeout: Duration::from_secs(600),
        }
    }
}

impl HandlerOptions {
    pub fn new(concurrency: usize, timeout: Duration) -> Self {
        Self {
            concurrency: concurrency.max(1),
            timeout,
        }
    }
}

#[derive(Clone)]
pub struct RegisteredHandler {
    pub handler: Arc<dyn JobHandler>,
    pub options: HandlerOptions,
}

impl RegisteredHandler {
    /// Run the handler under its timeout. Panics and timeouts come back as
    /// failures.
    pub async fn run(&self, job: &Job) -> Result<Value, JobFailure> {
        let execution = AssertUnwindSafe(self.handler.execute(job)).catch_unwind();
        match tokio::time::timeout(self.options.timeout, execution).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(panic)) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(JobFailure::new(format!("handler panicked: {}", detail)))
            }
            Err(_) => Err(JobFailure::timeout(self.options.timeout)),
        }
    }
}

/// Kind → handler table, shared between the fallback queue and the worker.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<RwLock<HashMap<JobKind, RegisteredHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `kind`.
    pub fn register<H>(&self, kind: JobKind, handler: H, options: HandlerOptions)
    where
        H: JobHandler + 'static,
    {
        self.register_arc(kind, Arc::new(handler), options);
    }

    pub fn register_arc(&self, kind: JobKind, handler: Arc<dyn JobHandler>, options: HandlerOptions) {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.insert(
            kind,
            RegisteredHandler {
                handler,
                options: HandlerOptions::new(options.concurrency, options.timeout),
            },
        );
    }

    pub fn get(&self, kind: JobKind) -> Option<RegisteredHandler> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.get(&kind).cloned()
    }

    pub fn contains(&self, kind: JobKind) -> bool {
        self.get(kind).is_some()
    }

    pub fn kinds(&self) -> Vec<JobKind> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.keys().copied().collect()
    }

    /// Execute `job` with its kind's handler.
    pub async fn execute(&self, job: &Job) -> Result<Value, JobFailure> {
        match self.get(job.kind) {
            Some(registered) => registered.run(job).await,
            None => Err(JobFailure::classified(
                ErrorKind::Validation,
                format!("no handler registered for job type {}", job.kind),
            )),
        }
    }
}

/// Adapter turning an async closure into a `JobHandler`.
pub struct FnHandler<F>(F);

/// Wrap `f` as a handler. The closure receives an owned copy of the job.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, JobFailure>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, JobFailure>> + Send,
{
    async fn execute(&self, job: &Job) -> Result<Value, JobFailure> {
        (self.0)(job.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vjob_models::JobPayload;

    fn job(kind: JobKind) -> Job {
        Job::new(kind, JobPayload::for_video("abc"), "u1")
    }

    #[tokio::test]
    async fn test_registry_dispatches_by_kind() {
        let registry = HandlerRegistry::new();
        registry.register(
            JobKind::FetchTranscript,
            handler_fn(|job: Job| async move { Ok(json!({ "video": job.payload.video_id })) }),
            HandlerOptions::default(),
        );

        let out = tokio_test::assert_ok!(registry.execute(&job(JobKind::FetchTranscript)).await);
        assert_eq!(out, json!({ "video": "abc" }));
        assert_eq!(registry.kinds(), vec![JobKind::FetchTranscript]);
    }

    #[tokio::test]
    async fn test_missing_handler_is_validation_failure() {
        let registry = HandlerRegistry::new();
        let err = tokio_test::assert_err!(registry.execute(&job(JobKind::Transcode)).await);
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_becomes_timeout_failure() {
        let registry = HandlerRegistry::new();
        registry.register(
            JobKind::Transcode,
            handler_fn(|_job: Job| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Value::Null)
            }),
            HandlerOptions::new(1, Duration::from_millis(100)),
        );

        let err = registry.execute(&job(JobKind::Transcode)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_panic_is_caught() {
        let registry = HandlerRegistry::new();
        registry.register(
            JobKind::Transcode,
            handler_fn(|_job: Job| async {
                if true {
                    panic!("decoder exploded");
                }
                Ok(Value::Null)
            }),
            HandlerOptions::default(),
        );

        let err = registry.execute(&job(JobKind::Transcode)).await.unwrap_err();
        assert!(err.message.contains("decoder exploded"));
    }

    #[test]
    fn test_concurrency_floor() {
        assert_eq!(HandlerOptions::new(0, Duration::from_secs(1)).concurrency, 1);
    }
}
