//! Queue router.
//!
//! Submissions go to the distributed backend while it is reachable and to
//! the fallback queue otherwise. Callers get a job id back, or a refusal
//! when no handler exists for the job's kind. An unreachable backend is pinged again after a recheck interval, so a
//! recovered store is picked up without a restart.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use vjob_models::{Job, JobId};
use vjob_queue::metrics::record_job_submitted;
use vjob_queue::{FallbackQueue, QueueBackend, QueueError, QueueResult};

/// Where a submission landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitPath {
    Distributed,
    Fallback,
}

impl SubmitPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmitPath::Distributed => "distributed",
            SubmitPath::Fallback => "fallback",
        }
    }
}

pub struct QueueRouter {
    backend: Option<Arc<dyn QueueBackend>>,
    fallback: FallbackQueue,
    backend_up: AtomicBool,
    last_check: Mutex<Option<Instant>>,
    recheck_interval: Duration,
}

impl QueueRouter {
    /// `backend` is `None` when no distributed store is configured.
    pub fn new(
        backend: Option<Arc<dyn QueueBackend>>,
        fallback: FallbackQueue,
        recheck_interval: Duration,
    ) -> Self {
        Self {
            backend,
            fallback,
            backend_up: AtomicBool::new(false),
            last_check: Mutex::new(None),
            recheck_interval,
        }
    }

    pub fn fallback(&self) -> &FallbackQueue {
        &self.fallback
    }

    pub fn backend(&self) -> Option<&Arc<dyn QueueBackend>> {
        self.backend.as_ref()
    }

    pub fn is_backend_up(&self) -> bool {
        self.backend_up.load(Ordering::SeqCst)
    }

    /// Ping the backend up to `attempts` times, `backoff` apart.
    ///
    /// Returns whether it is usable. Never fails: without a backend the
    /// process runs on the fallback queue alone.
    pub async fn init_backend(&self, attempts: u32, backoff: Duration) -> bool {
        let Some(backend) = &self.backend else {
            info!("No distributed backend configured, using the fallback queue only");
            return false;
        };

        for attempt in 1..=attempts.max(1) {
            self.note_check();
            match backend.ping().await {
                Ok(()) => {
                    self.backend_up.store(true, Ordering::SeqCst);
                    info!(backend = backend.name(), "Distributed queue backend available");
                    return true;
                }
                Err(e) => {
                    warn!(
                        backend = backend.name(),
                        attempt, "Distributed backend ping failed: {}", e
                    );
                    if attempt < attempts {
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        warn!(
            backend = backend.name(),
            "Distributed backend unreachable, running in degraded mode on the fallback queue"
        );
        false
    }

    /// The backend if it is currently usable, re-probing a down backend
    /// once the recheck interval has passed.
    pub async fn active_backend(&self) -> Option<Arc<dyn QueueBackend>> {
        let backend = self.backend.as_ref()?;
        if self.is_backend_up() {
            return Some(Arc::clone(backend));
        }
        if !self.check_due() {
            return None;
        }

        self.note_check();
        match backend.ping().await {
            Ok(()) => {
                self.backend_up.store(true, Ordering::SeqCst);
                info!(backend = backend.name(), "Distributed backend recovered");
                Some(Arc::clone(backend))
            }
            Err(e) => {
                debug!("Distributed backend still unavailable: {}", e);
                None
            }
        }
    }

    /// Record a backend error. Only unavailability switches routing.
    pub fn report_error(&self, err: &QueueError) {
        if err.is_unavailable() && self.backend_up.swap(false, Ordering::SeqCst) {
            self.note_check();
            warn!("Distributed backend unavailable, switching to the fallback queue: {}", err);
        }
    }

    /// Submit a job and return its id.
    pub async fn submit(&self, job: Job) -> QueueResult<JobId> {
        Ok(self.submit_with_path(job).await?.0)
    }

    /// Submit a job, also reporting which path took it.
    ///
    /// Kinds with no registered handler are refused: neither path could
    /// ever finish them.
    pub async fn submit_with_path(&self, job: Job) -> QueueResult<(JobId, SubmitPath)> {
        if !self.fallback.registry().contains(job.kind) {
            return Err(QueueError::NoHandler(job.kind));
        }

        if let Some(backend) = self.active_backend().await {
            match backend.enqueue(&job).await {
                Ok(accepted) => {
                    if accepted {
                        record_job_submitted(SubmitPath::Distributed.as_str());
                    }
                    return Ok((job.id, SubmitPath::Distributed));
                }
                Err(e) => {
                    self.report_error(&e);
                    if !e.is_unavailable() {
                        warn!(job_id = %job.id, "Distributed enqueue failed, using fallback: {}", e);
                    }
                }
            }
        }

        let id = self.fallback.submit(job);
        record_job_submitted(SubmitPath::Fallback.as_str());
        Ok((id, SubmitPath::Fallback))
    }

    /// Current record for `id`.
    ///
    /// The fallback table wins when it holds the id: a failed distributed
    /// enqueue can leave a record behind that never advances.
    pub async fn status(&self, id: &JobId) -> Option<Job> {
        if let Some(job) = self.fallback.get_job(id) {
            return Some(job);
        }
        let backend = self.active_backend().await?;
        match backend.status_of(id).await {
            Ok(job) => job,
            Err(e) => {
                self.report_error(&e);
                None
            }
        }
    }

    /// Cancel a fallback job. Distributed jobs cannot be cancelled.
    pub fn cancel(&self, id: &JobId) -> bool {
        self.fallback.cancel(id)
    }

    /// Fallback jobs submitted by `owner`.
    pub fn jobs_for(&self, owner: &str) -> Vec<Job> {
        self.fallback.jobs_for(owner)
    }

    fn check_due(&self) -> bool {
        let last = self.last_check.lock().unwrap_or_else(|e| e.into_inner());
        last.map_or(true, |at| at.elapsed() >= self.recheck_interval)
    }

    fn note_check(&self) {
        let mut last = self.last_check.lock().unwrap_or_else(|e| e.into_inner());
        *last = Some(Instant::now());
    }
}
