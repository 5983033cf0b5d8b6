//! Distributed-backend worker loop.
//!
//! One job at a time: pop, process, record the outcome, repeat. Jobs on this
//! path are not retried here. A failure is recorded with its classification
//! and redelivery is left to the caller (the push-delivery ingress maps the
//! classification to an HTTP status for its scheduler). The fallback queue
//! keeps its own internal retries.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

use vjob_cache::key::{owner_result_key, quota_key};
use vjob_cache::TtlCache;
use vjob_models::{Job, JobId};
use vjob_queue::metrics::{record_job_completed, record_job_failed};
use vjob_queue::HandlerRegistry;
use vjob_recovery::{classify_error, ErrorKind, FailureTracker, JobFailure};

use crate::config::WorkerConfig;
use crate::error::WorkerResult;
use crate::logging::JobLogger;
use crate::router::QueueRouter;

pub const WORKER_IDLE_POLLS_TOTAL: &str = "vjob_worker_idle_polls_total";

/// Drop owner-scoped entries made stale by a completed job. Shared entries
/// (transcripts, content-addressed analysis) stay.
pub fn invalidate_owner_entries(cache: &TtlCache<Value>, job: &Job) {
    if let Some(video) = job.payload.video_key() {
        cache.invalidate(&owner_result_key(&job.owner, video));
    }
    if job.payload.credits.is_some() {
        cache.invalidate(&quota_key(&job.owner));
    }
}

/// Executes a dequeued job.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, job: &Job) -> Result<Value, JobFailure>;
}

#[async_trait]
impl Processor for HandlerRegistry {
    async fn process(&self, job: &Job) -> Result<Value, JobFailure> {
        self.execute(job).await
    }
}

/// Result of one poll.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// A job was executed and its outcome recorded.
    Completed(JobId),
    Failed(JobId, ErrorKind),
    /// Nothing queued.
    Empty,
    /// Backend unreachable; the fallback queue carries the load.
    Unavailable,
}

pub struct Worker<P> {
    router: Arc<QueueRouter>,
    processor: P,
    cache: Option<Arc<TtlCache<Value>>>,
    config: WorkerConfig,
    idle_alerts: AtomicU64,
}

impl<P: Processor> Worker<P> {
    pub fn new(router: Arc<QueueRouter>, processor: P, config: WorkerConfig) -> Self {
        Self {
            router,
            processor,
            cache: None,
            config,
            idle_alerts: AtomicU64::new(0),
        }
    }

    /// Invalidate per-owner cache entries after each completed job.
    pub fn with_cache(mut self, cache: Arc<TtlCache<Value>>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Idle alerts raised since the worker was built.
    pub fn idle_alerts(&self) -> u64 {
        self.idle_alerts.load(Ordering::Relaxed)
    }

    /// How long a job may stay processing before reconciliation fails it.
    /// Past the job timeout plus one sweep, no executor is still on it.
    pub fn stale_after(&self) -> Duration {
        self.config.job_timeout + self.config.reconcile_interval
    }

    /// Poll until `shutdown` flips to true. Never exits on idleness or
    /// backend outages.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> WorkerResult<()> {
        info!("Starting worker loop");
        self.router
            .init_backend(self.config.backend_init_attempts, Duration::from_secs(1))
            .await;

        let mut idle_polls: u32 = 0;
        let mut failures = FailureTracker::new("worker poll", 3);
        let mut last_reconcile = Instant::now();

        loop {
            if *shutdown.borrow() {
                break;
            }

            if last_reconcile.elapsed() >= self.config.reconcile_interval {
                self.reconcile().await;
                last_reconcile = Instant::now();
            }

            match self.poll_once().await {
                Ok(PollOutcome::Completed(_)) | Ok(PollOutcome::Failed(..)) => {
                    idle_polls = 0;
                    failures.record_success();
                    continue;
                }
                Ok(PollOutcome::Empty) => {
                    failures.record_success();
                    idle_polls = idle_polls.saturating_add(1);
                    if self.config.idle_alert_polls > 0
                        && idle_polls % self.config.idle_alert_polls == 0
                    {
                        self.idle_alerts.fetch_add(1, Ordering::Relaxed);
                        counter!(WORKER_IDLE_POLLS_TOTAL).increment(u64::from(self.config.idle_alert_polls));
                        info!(
                            idle_polls,
                            "Queue idle for ~{:?}",
                            self.config.poll_interval * idle_polls
                        );
                    }
                }
                Ok(PollOutcome::Unavailable) => {}
                Err(e) => {
                    if failures.record_failure(classify_error(&e)) {
                        warn!("Worker poll failed: {}", e);
                    }
                }
            }

            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!("Worker loop stopped");
        Ok(())
    }

    /// Pop and execute at most one job.
    pub async fn poll_once(&self) -> WorkerResult<PollOutcome> {
        let Some(backend) = self.router.active_backend().await else {
            return Ok(PollOutcome::Unavailable);
        };

        let job = match backend.dequeue_next().await {
            Ok(Some(job)) => job,
            Ok(None) => return Ok(PollOutcome::Empty),
            Err(e) => {
                self.router.report_error(&e);
                if e.is_unavailable() {
                    return Ok(PollOutcome::Unavailable);
                }
                return Err(e.into());
            }
        };

        let logger = JobLogger::new(&job.id, job.kind.as_str());
        let started = Instant::now();
        logger.log_start(job.attempts);

        let outcome = match tokio::time::timeout(
            self.config.job_timeout,
            self.processor.process(&job).instrument(logger.create_span()),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(JobFailure::timeout(self.config.job_timeout)),
        };

        let record = match outcome {
            Ok(result) => backend
                .mark_completed(&job.id, &result)
                .await
                .map(|()| {
                    logger.log_completion(started.elapsed().as_millis());
                    record_job_completed(job.kind.as_str());
                    if let Some(cache) = &self.cache {
                        invalidate_owner_entries(cache, &job);
                    }
                    PollOutcome::Completed(job.id.clone())
                }),
            Err(failure) => {
                let kind = failure.kind();
                logger.log_error(kind, &failure.message);
                record_job_failed(job.kind.as_str(), kind.as_str());
                backend
                    .mark_failed(&job.id, &format!("{} ({})", failure, kind))
                    .await
                    .map(|()| PollOutcome::Failed(job.id.clone(), kind))
            }
        };

        record.map_err(|e| {
            self.router.report_error(&e);
            e.into()
        })
    }

    async fn reconcile(&self) {
        let Some(backend) = self.router.active_backend().await else {
            return;
        };
        match backend.reconcile_processing(self.stale_after()).await {
            Ok(report) => debug!(
                processing_cleared = report.processing_cleared,
                processing_expired = report.processing_expired,
                failed_pruned = report.failed_pruned,
                "Reconciliation pass done"
            ),
            Err(e) => {
                self.router.report_error(&e);
                warn!("Reconciliation failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use vjob_cache::key::transcript_key;
    use vjob_cache::CacheConfig;
    use vjob_models::{JobKind, JobPayload, JobStatus};
    use vjob_queue::{
        handler_fn, FallbackConfig, FallbackQueue, HandlerOptions, InMemoryBackend, QueueBackend,
    };
    use vjob_recovery::RetryPolicies;

    fn router(backend: Arc<InMemoryBackend>, registry: HandlerRegistry) -> Arc<QueueRouter> {
        let fallback = FallbackQueue::new(
            FallbackConfig::default(),
            registry,
            Arc::new(RetryPolicies::default()),
        );
        Arc::new(QueueRouter::new(
            Some(backend as Arc<dyn QueueBackend>),
            fallback,
            Duration::from_secs(30),
        ))
    }

    fn registry() -> HandlerRegistry {
        let registry = HandlerRegistry::new();
        registry.register(
            JobKind::ProcessVideo,
            handler_fn(|job: Job| async move { Ok(json!({ "video": job.payload.video_id })) }),
            HandlerOptions::default(),
        );
        registry.register(
            JobKind::AnalyzeVideo,
            handler_fn(|_job: Job| async { Err(JobFailure::http(429, "too many requests")) }),
            HandlerOptions::default(),
        );
        registry
    }

    fn config() -> WorkerConfig {
        WorkerConfig {
            poll_interval: Duration::from_millis(10),
            backend_init_attempts: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_completion_invalidates_owner_entries_only() {
        let backend = Arc::new(InMemoryBackend::default());
        let router = router(backend.clone(), registry());
        router.init_backend(1, Duration::ZERO).await;

        let cache = Arc::new(TtlCache::new(CacheConfig::default()));
        cache.set(transcript_key("abc"), json!({ "text": "hi" }), None);
        cache.set(owner_result_key("u1", "abc"), json!({ "stale": true }), None);
        cache.set(owner_result_key("u2", "abc"), json!({ "other": true }), None);

        let worker = Worker::new(router.clone(), registry(), config()).with_cache(cache.clone());

        let job = Job::new(JobKind::ProcessVideo, JobPayload::for_video("abc"), "u1");
        let id = router.submit(job).await.unwrap();

        assert_eq!(worker.poll_once().await.unwrap(), PollOutcome::Completed(id.clone()));
        assert_eq!(router.status(&id).await.unwrap().status, JobStatus::Completed);

        assert!(cache.get(&transcript_key("abc")).is_some());
        assert!(cache.get(&owner_result_key("u1", "abc")).is_none());
        assert!(cache.get(&owner_result_key("u2", "abc")).is_some());
    }

    #[tokio::test]
    async fn test_failure_is_recorded_not_retried() {
        // Unlike the fallback queue, this path leaves redelivery to the caller.
        let backend = Arc::new(InMemoryBackend::default());
        let router = router(backend.clone(), registry());
        router.init_backend(1, Duration::ZERO).await;
        let worker = Worker::new(router.clone(), registry(), config());

        let job = Job::new(JobKind::AnalyzeVideo, JobPayload::for_video("abc"), "u1")
            .with_max_attempts(5);
        let id = router.submit(job).await.unwrap();

        assert_eq!(
            worker.poll_once().await.unwrap(),
            PollOutcome::Failed(id.clone(), ErrorKind::RateLimit)
        );
        let record = router.status(&id).await.unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.attempts, 1);
        assert!(record.error.unwrap().contains("rateLimit"));

        assert_eq!(worker.poll_once().await.unwrap(), PollOutcome::Empty);
        assert_eq!(backend.stats().await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn test_unavailable_backend_does_not_fail_poll() {
        let backend = Arc::new(InMemoryBackend::default());
        let router = router(backend.clone(), registry());
        router.init_backend(1, Duration::ZERO).await;
        let worker = Worker::new(router.clone(), registry(), config());

        backend.set_available(false);
        assert_eq!(worker.poll_once().await.unwrap(), PollOutcome::Unavailable);
        assert!(!router.is_backend_up());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_drains_queue_and_stops_on_signal() {
        let backend = Arc::new(InMemoryBackend::default());
        let router = router(backend.clone(), registry());
        let worker = Arc::new(Worker::new(router.clone(), registry(), config()));

        router.init_backend(1, Duration::ZERO).await;
        let ids = vec![
            router
                .submit(Job::new(JobKind::ProcessVideo, JobPayload::for_video("a"), "u1"))
                .await
                .unwrap(),
            router
                .submit(Job::new(JobKind::ProcessVideo, JobPayload::for_video("b"), "u1"))
                .await
                .unwrap(),
        ];

        let (tx, rx) = watch::channel(false);
        let handle = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.run(rx).await })
        };

        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if backend.stats().await.unwrap().queued == 0 {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        for id in &ids {
            assert_eq!(router.status(id).await.unwrap().status, JobStatus::Completed);
        }

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_signal_fires_and_loop_keeps_running() {
        let backend = Arc::new(InMemoryBackend::default());
        let router = router(backend.clone(), registry());
        let config = WorkerConfig {
            idle_alert_polls: 3,
            ..config()
        };
        let worker = Arc::new(Worker::new(router, registry(), config));

        let (tx, rx) = watch::channel(false);
        let handle = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.run(rx).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(worker.idle_alerts() >= 2, "alerts: {}", worker.idle_alerts());
        assert!(!handle.is_finished());

        tx.send(true).unwrap();
        tokio_test::assert_ok!(handle.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_outcome_is_failed_by_reconciliation() {
        let backend = Arc::new(InMemoryBackend::default());
        // The backend drops out while the job runs, so the outcome cannot be
        // recorded and the record is left processing.
        let registry = HandlerRegistry::new();
        let outage = backend.clone();
        registry.register(
            JobKind::ProcessVideo,
            handler_fn(move |_job: Job| {
                let outage = outage.clone();
                async move {
                    outage.set_available(false);
                    Ok(json!({ "clips": 1 }))
                }
            }),
            HandlerOptions::default(),
        );
        let router = router(backend.clone(), registry.clone());
        router.init_backend(1, Duration::ZERO).await;
        let config = WorkerConfig {
            job_timeout: Duration::from_secs(1),
            reconcile_interval: Duration::from_secs(1),
            ..config()
        };
        let worker = Worker::new(router.clone(), registry, config);

        let job = Job::new(JobKind::ProcessVideo, JobPayload::for_video("abc"), "u1");
        let id = router.submit(job).await.unwrap();
        assert!(worker.poll_once().await.is_err());

        backend.set_available(true);
        assert_eq!(backend.status_of(&id).await.unwrap().unwrap().status, JobStatus::Processing);

        // Past the stale bound and the router's recheck interval.
        tokio::time::advance(Duration::from_secs(31)).await;
        worker.reconcile().await;

        let record = router.status(&id).await.unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert!(record.error.unwrap().starts_with("abandoned"));
        assert_eq!(backend.stats().await.unwrap().processing, 0);
    }
}
