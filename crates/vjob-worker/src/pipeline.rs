//! Service wiring.
//!
//! One `Pipeline` per process owns the cache, the handler registry, the
//! fallback queue and the router. Both binaries build it the same way.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tracing::{info, warn};

use vjob_cache::key::owner_result_key;
use vjob_cache::{CacheConfig, SweeperHandle, TtlCache};
use vjob_models::{Job, JobStatus};
use vjob_queue::{
    FallbackConfig, FallbackQueue, HandlerRegistry, InMemoryBackend, PopOrder, QueueBackend,
    RedisQueue,
};
use vjob_recovery::RetryPolicies;

use crate::config::{UpstreamConfig, WorkerConfig};
use crate::error::{WorkerError, WorkerResult};
use crate::handlers::{register_video_handlers, HandlerContext};
use crate::router::QueueRouter;
use crate::upstream::{HttpAnalysisClient, HttpTranscriptClient};
use crate::worker::{invalidate_owner_entries, Worker};

pub struct Pipeline {
    pub cache: Arc<TtlCache<Value>>,
    pub registry: HandlerRegistry,
    pub policies: Arc<RetryPolicies>,
    pub router: Arc<QueueRouter>,
    pub worker_config: WorkerConfig,
    sweeper: Mutex<Option<SweeperHandle>>,
}

impl Pipeline {
    pub fn new(
        backend: Option<Arc<dyn QueueBackend>>,
        cache_config: CacheConfig,
        fallback_config: FallbackConfig,
        worker_config: WorkerConfig,
        policies: RetryPolicies,
    ) -> Self {
        let cache = Arc::new(TtlCache::new(cache_config));
        let registry = HandlerRegistry::new();
        let policies = Arc::new(policies);
        let fallback = FallbackQueue::new(fallback_config, registry.clone(), Arc::clone(&policies));
        let hook_cache = Arc::clone(&cache);
        fallback.set_completion_hook(Arc::new(move |job: &Job| {
            invalidate_owner_entries(&hook_cache, job)
        }));
        let router = Arc::new(QueueRouter::new(
            backend,
            fallback,
            worker_config.backend_recheck_interval,
        ));

        Self {
            cache,
            registry,
            policies,
            router,
            worker_config,
            sweeper: Mutex::new(None),
        }
    }

    /// Build from environment variables.
    ///
    /// `QUEUE_BACKEND` selects the distributed store: `redis` (default),
    /// `memory` or `none`.
    pub fn from_env() -> WorkerResult<Self> {
        let backend: Option<Arc<dyn QueueBackend>> =
            match std::env::var("QUEUE_BACKEND").unwrap_or_else(|_| "redis".to_string()).as_str() {
                "redis" => Some(Arc::new(RedisQueue::from_env()?) as Arc<dyn QueueBackend>),
                "memory" => Some(Arc::new(InMemoryBackend::new(PopOrder::Fifo)) as Arc<dyn QueueBackend>),
                "none" => None,
                other => {
                    return Err(WorkerError::config_error(format!(
                        "unknown QUEUE_BACKEND: {}",
                        other
                    )))
                }
            };

        Ok(Self::new(
            backend,
            CacheConfig::from_env(),
            FallbackConfig::from_env(),
            WorkerConfig::from_env(),
            RetryPolicies::default(),
        ))
    }

    /// Register the video handlers against the HTTP upstream services.
    pub fn register_http_handlers(&self, upstream: &UpstreamConfig) -> WorkerResult<()> {
        let ctx = HandlerContext {
            cache: Arc::clone(&self.cache),
            policies: Arc::clone(&self.policies),
            transcripts: Arc::new(HttpTranscriptClient::new(upstream)?),
            analysis: Arc::new(HttpAnalysisClient::new(upstream)?),
        };
        register_video_handlers(
            &self.registry,
            ctx,
            self.worker_config.handler_concurrency,
            self.worker_config.job_timeout,
        );
        info!(kinds = ?self.registry.kinds(), "Registered video handlers");
        Ok(())
    }

    pub fn fallback(&self) -> &FallbackQueue {
        self.router.fallback()
    }

    /// Start the fallback dispatcher and the cache sweeper.
    pub fn start(&self) {
        self.fallback().start();
        let mut sweeper = self.sweeper.lock().unwrap_or_else(|e| e.into_inner());
        if sweeper.is_none() {
            *sweeper = Some(self.cache.start_sweeper());
        }
    }

    /// Worker polling the distributed backend with the registered handlers.
    pub fn worker(&self) -> Worker<HandlerRegistry> {
        Worker::new(
            Arc::clone(&self.router),
            self.registry.clone(),
            self.worker_config.clone(),
        )
        .with_cache(Arc::clone(&self.cache))
    }

    /// Latest completed result `owner` has for `video`, cached per owner.
    pub fn latest_result(&self, owner: &str, video: &str) -> Option<Value> {
        let key = owner_result_key(owner, video);
        if let Some(hit) = self.cache.get(&key) {
            return Some(hit);
        }

        let result = self
            .router
            .jobs_for(owner)
            .into_iter()
            .filter(|job| job.status == JobStatus::Completed && job.payload.video_key() == Some(video))
            .max_by_key(|job| job.updated_at)
            .and_then(|job: Job| job.result)?;

        self.cache.set(key, result.clone(), None);
        Some(result)
    }

    /// Stop background tasks, waiting (bounded) for in-flight fallback jobs.
    pub async fn shutdown(&self) {
        let fallback = self.fallback().clone();
        if tokio::time::timeout(
            self.worker_config.shutdown_timeout + Duration::from_secs(1),
            fallback.shutdown(),
        )
        .await
        .is_err()
        {
            warn!("Fallback queue did not stop in time");
        }

        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(sweeper) = sweeper {
            sweeper.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vjob_models::{JobKind, JobPayload};
    use vjob_queue::{handler_fn, HandlerOptions, JobOptions};

    fn pipeline() -> Pipeline {
        Pipeline::new(
            None,
            CacheConfig::default(),
            FallbackConfig::default().with_tick_interval(Duration::from_millis(10)),
            WorkerConfig::default(),
            RetryPolicies::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_latest_result_is_cached_per_owner() {
        let pipeline = pipeline();
        pipeline.registry.register(
            JobKind::ProcessVideo,
            handler_fn(|job: Job| async move { Ok(json!({ "owner": job.owner })) }),
            HandlerOptions::default(),
        );
        pipeline.start();

        let id = pipeline.fallback().add_job(
            JobKind::ProcessVideo,
            JobPayload::for_video("abc"),
            "u1",
            JobOptions::default(),
        );
        for _ in 0..100 {
            if pipeline.fallback().get_job(&id).is_some_and(|j| j.is_terminal()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(pipeline.latest_result("u1", "abc"), Some(json!({ "owner": "u1" })));
        assert!(pipeline.cache.get(&owner_result_key("u1", "abc")).is_some());
        assert_eq!(pipeline.latest_result("u2", "abc"), None);

        // A newer completion for the same owner and video drops the cached view.
        let id = pipeline.fallback().add_job(
            JobKind::ProcessVideo,
            JobPayload::for_video("abc"),
            "u1",
            JobOptions::default(),
        );
        for _ in 0..100 {
            if pipeline.fallback().get_job(&id).is_some_and(|j| j.is_terminal()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(pipeline.cache.get(&owner_result_key("u1", "abc")).is_none());

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_video_pipeline_refuses_kinds_it_cannot_run() {
        let pipeline = pipeline();
        pipeline
            .register_http_handlers(&UpstreamConfig::default())
            .unwrap();

        let transcode = Job::new(JobKind::Transcode, JobPayload::for_video("abc"), "u1");
        let err = pipeline.router.submit(transcode).await.unwrap_err();
        assert!(matches!(err, vjob_queue::QueueError::NoHandler(JobKind::Transcode)));
        assert!(pipeline.fallback().is_empty());

        let process = Job::new(JobKind::ProcessVideo, JobPayload::for_video("abc"), "u1");
        assert!(pipeline.router.submit(process).await.is_ok());
    }
}
