//! In-process fallback queue.
//!
//! A fully independent execution path used when the distributed backend is
//! down. Jobs live in a single table owned by the queue. A dispatcher runs on
//! a fixed tick and starts pending jobs, highest priority first and oldest
//! first within a priority. It respects a global in-flight ceiling and each
//! kind's own ceiling. Failures are classified and retried with the kind's
//! backoff until the attempt ceiling is reached.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};

use vjob_models::{Job, JobId, JobKind, JobPayload, JobStatus};
use vjob_recovery::{compute_delay, ErrorKind, JobFailure, RetryPolicies};

use crate::handler::{HandlerRegistry, RegisteredHandler};
use crate::metrics;

/// Fallback queue configuration.
#[derive(Debug, Clone)]
pub struct FallbackConfig {
    /// Dispatcher tick
    pub tick_interval: Duration,
    /// Jobs allowed in flight across all kinds
    pub max_concurrent: usize,
    /// How often finished jobs are purged
    pub purge_interval: Duration,
    /// Age after which completed/failed/cancelled jobs are purged
    pub retention: Duration,
    /// Bound on waiting for in-flight jobs at shutdown
    pub shutdown_timeout: Duration,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(250),
            max_concurrent: 4,
            purge_interval: Duration::from_secs(300),
            retention: Duration::from_secs(3600),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl FallbackConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            tick_interval: std::env::var("FALLBACK_TICK_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.tick_interval),
            max_concurrent: std::env::var("FALLBACK_MAX_CONCURRENT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_concurrent),
            purge_interval: std::env::var("FALLBACK_PURGE_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.purge_interval),
            retention: std::env::var("FALLBACK_RETENTION_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.retention),
            shutdown_timeout: std::env::var("WORKER_SHUTDOWN_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_timeout),
        }
    }

    pub fn with_tick_interval(mut self, tick: Duration) -> Self {
        self.tick_interval = tick;
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }
}

/// Submission options.
#[derive(Debug, Clone, Copy)]
pub struct JobOptions {
    pub priority: i32,
    pub max_attempts: u32,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            max_attempts: vjob_models::job::DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FallbackStats {
    pub pending: usize,
    pub processing: usize,
    pub retrying: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub in_flight: usize,
}

/// Called with each job the fallback queue completes.
pub type CompletionHook = Arc<dyn Fn(&Job) + Send + Sync>;

struct Entry {
    job: Job,
    /// Submission order, breaks priority ties
    seq: u64,
    /// When a retrying job returns to pending
    retry_at: Option<Instant>,
}

#[derive(Default)]
struct InFlight {
    total: usize,
    per_kind: HashMap<JobKind, usize>,
    running: HashSet<JobId>,
}

struct Inner {
    jobs: Mutex<HashMap<JobId, Entry>>,
    in_flight: Mutex<InFlight>,
    seq: AtomicU64,
    registry: HandlerRegistry,
    policies: Arc<RetryPolicies>,
    config: FallbackConfig,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    on_complete: OnceLock<CompletionHook>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Execution slot. Releases its in-flight accounting when dropped, whatever
/// way the execution ends.
struct SlotGuard {
    inner: Arc<Inner>,
    id: JobId,
    kind: JobKind,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut in_flight = lock(&self.inner.in_flight);
        in_flight.total = in_flight.total.saturating_sub(1);
        if let Some(count) = in_flight.per_kind.get_mut(&self.kind) {
            *count = count.saturating_sub(1);
        }
        in_flight.running.remove(&self.id);
        metrics::set_fallback_in_flight(in_flight.total);
    }
}

/// Fail a job whose kind has no handler. It can never run, so it ends as a
/// validation failure instead of waiting in pending.
fn fail_unroutable(job: &mut Job) {
    if job.start().is_err() {
        return;
    }
    let reason = format!(
        "no handler registered for job type {} ({}, {} attempts)",
        job.kind,
        ErrorKind::Validation,
        job.attempts
    );
    if job.fail(reason).is_ok() {
        warn!(job_id = %job.id, kind = %job.kind, "Fallback job has no handler, failed");
        metrics::record_job_failed(job.kind.as_str(), ErrorKind::Validation.as_str());
    }
}

/// In-process job queue and scheduler.
#[derive(Clone)]
pub struct FallbackQueue {
    inner: Arc<Inner>,
}

impl FallbackQueue {
    pub fn new(config: FallbackConfig, registry: HandlerRegistry, policies: Arc<RetryPolicies>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                jobs: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(InFlight::default()),
                seq: AtomicU64::new(0),
                registry,
                policies,
                config,
                shutdown_tx,
                tasks: Mutex::new(Vec::new()),
                on_complete: OnceLock::new(),
            }),
        }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.inner.registry
    }

    /// Install the completion hook. Only the first call takes effect.
    pub fn set_completion_hook(&self, hook: CompletionHook) -> bool {
        self.inner.on_complete.set(hook).is_ok()
    }

    /// Start the dispatcher and purge loops. Calling it again is a no-op.
    pub fn start(&self) {
        let mut tasks = lock(&self.inner.tasks);
        if !tasks.is_empty() {
            return;
        }

        let dispatcher = self.clone();
        let shutdown_rx = self.inner.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(dispatcher.run_dispatcher(shutdown_rx)));

        let purger = self.clone();
        let shutdown_rx = self.inner.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(purger.run_purger(shutdown_rx)));

        info!(
            max_concurrent = self.inner.config.max_concurrent,
            tick_ms = self.inner.config.tick_interval.as_millis() as u64,
            "Fallback queue started"
        );
    }

    /// Stop dispatching and wait (bounded) for in-flight executions.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        let tasks: Vec<JoinHandle<()>> = lock(&self.inner.tasks).drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Fallback queue task ended abnormally: {}", e);
            }
        }
        info!("Fallback queue stopped");
    }

    /// Submit a new job. Returns its id.
    pub fn add_job(
        &self,
        kind: JobKind,
        payload: JobPayload,
        owner: impl Into<String>,
        options: JobOptions,
    ) -> JobId {
        let job = Job::new(kind, payload, owner)
            .with_priority(options.priority)
            .with_max_attempts(options.max_attempts);
        self.submit(job)
    }

    /// Take ownership of an already-built job. It is (re)started from
    /// pending.
    pub fn submit(&self, mut job: Job) -> JobId {
        job.status = JobStatus::Pending;
        let id = job.id.clone();
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        debug!(job_id = %id, kind = %job.kind, priority = job.priority, "Fallback job queued");
        lock(&self.inner.jobs).insert(
            id.clone(),
            Entry {
                job,
                seq,
                retry_at: None,
            },
        );
        id
    }

    pub fn get_job(&self, id: &JobId) -> Option<Job> {
        lock(&self.inner.jobs).get(id).map(|entry| entry.job.clone())
    }

    /// Jobs submitted by `owner`, oldest first.
    pub fn jobs_for(&self, owner: &str) -> Vec<Job> {
        let jobs = lock(&self.inner.jobs);
        let mut owned: Vec<&Entry> = jobs.values().filter(|e| e.job.owner == owner).collect();
        owned.sort_by_key(|e| e.seq);
        owned.into_iter().map(|e| e.job.clone()).collect()
    }

    /// Cancel a pending, retrying or processing job.
    ///
    /// A processing job's handler keeps running; its outcome is discarded.
    pub fn cancel(&self, id: &JobId) -> bool {
        let mut jobs = lock(&self.inner.jobs);
        match jobs.get_mut(id) {
            Some(entry) => match entry.job.cancel() {
                Ok(()) => {
                    entry.retry_at = None;
                    info!(job_id = %id, "Fallback job cancelled");
                    true
                }
                Err(e) => {
                    debug!("Cancel refused: {}", e);
                    false
                }
            },
            None => false,
        }
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.inner.in_flight).total
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.jobs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> FallbackStats {
        let mut stats = FallbackStats {
            in_flight: self.in_flight(),
            ..Default::default()
        };
        for entry in lock(&self.inner.jobs).values() {
            match entry.job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Retrying => stats.retrying += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Drop finished jobs whose last update is older than `age`.
    pub fn purge_finished(&self, age: Duration) -> usize {
        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let mut jobs = lock(&self.inner.jobs);
        let before = jobs.len();
        jobs.retain(|_, entry| !(entry.job.is_terminal() && entry.job.updated_at <= cutoff));
        before - jobs.len()
    }

    async fn run_dispatcher(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut executions = JoinSet::new();
        let mut ticker = tokio::time::interval(self.inner.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    while let Some(done) = executions.try_join_next() {
                        if let Err(e) = done {
                            error!("Fallback execution task failed: {}", e);
                        }
                    }
                    self.dispatch(&mut executions);
                }
            }
        }

        if !executions.is_empty() {
            info!("Waiting for {} in-flight fallback jobs", executions.len());
        }
        let drained = tokio::time::timeout(self.inner.config.shutdown_timeout, async {
            while executions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "Shutdown timeout reached with {} fallback jobs still running, aborting",
                executions.len()
            );
            executions.shutdown().await;
            self.fail_interrupted();
        }
    }

    async fn run_purger(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.inner.config.purge_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; nothing is old enough yet.
        ticker.tick().await;

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let purged = self.purge_finished(self.inner.config.retention);
                    if purged > 0 {
                        debug!("Purged {} finished fallback jobs", purged);
                    }
                }
            }
        }
    }

    /// One dispatcher tick. Returns the number of executions started.
    fn dispatch(&self, executions: &mut JoinSet<()>) -> usize {
        let now = Instant::now();
        let mut launches = Vec::new();

        {
            let mut jobs = lock(&self.inner.jobs);

            for entry in jobs.values_mut() {
                if entry.job.status == JobStatus::Retrying
                    && entry.retry_at.map_or(true, |at| at <= now)
                    && entry.job.requeue().is_ok()
                {
                    entry.retry_at = None;
                }
            }

            let mut in_flight = lock(&self.inner.in_flight);
            let mut free = self.inner.config.max_concurrent.saturating_sub(in_flight.total);
            if free == 0 {
                return 0;
            }

            let mut pending: Vec<(i32, u64, JobId, JobKind)> = jobs
                .values()
                .filter(|e| e.job.status == JobStatus::Pending)
                .map(|e| (e.job.priority, e.seq, e.job.id.clone(), e.job.kind))
                .collect();
            pending.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

            for (_, _, id, kind) in pending {
                if free == 0 {
                    break;
                }
                let Some(registered) = self.inner.registry.get(kind) else {
                    if let Some(entry) = jobs.get_mut(&id) {
                        fail_unroutable(&mut entry.job);
                    }
                    continue;
                };
                let running = in_flight.per_kind.get(&kind).copied().unwrap_or(0);
                if running >= registered.options.concurrency {
                    continue;
                }
                let Some(entry) = jobs.get_mut(&id) else {
                    continue;
                };
                if entry.job.start().is_err() {
                    continue;
                }

                in_flight.total += 1;
                *in_flight.per_kind.entry(kind).or_insert(0) += 1;
                in_flight.running.insert(id.clone());
                free -= 1;

                launches.push((entry.job.clone(), registered));
            }
            metrics::set_fallback_in_flight(in_flight.total);
        }

        let started = launches.len();
        for (job, registered) in launches {
            let slot = SlotGuard {
                inner: Arc::clone(&self.inner),
                id: job.id.clone(),
                kind: job.kind,
            };
            let span = info_span!("job", job_id = %job.id, kind = %job.kind, attempt = job.attempts);
            let queue = self.clone();
            executions.spawn(
                async move {
                    let outcome = registered.run(&job).await;
                    if let Some(completed) = queue.finish(&job.id, outcome) {
                        if let Some(hook) = queue.inner.on_complete.get() {
                            hook(&completed);
                        }
                    }
                    drop(slot);
                }
                .instrument(span),
            );
        }
        started
    }

    /// Apply an execution outcome to the job table. Returns the job if it
    /// completed.
    fn finish(&self, id: &JobId, outcome: Result<Value, JobFailure>) -> Option<Job> {
        let mut jobs = lock(&self.inner.jobs);
        let entry = jobs.get_mut(id)?;
        if entry.job.status != JobStatus::Processing {
            debug!(status = %entry.job.status, "Discarding outcome of job no longer processing");
            return None;
        }

        let job = &mut entry.job;
        match outcome {
            Ok(result) => {
                if job.complete(result).is_ok() {
                    info!(attempts = job.attempts, "Fallback job completed");
                    metrics::record_job_completed(job.kind.as_str());
                    return Some(job.clone());
                }
            }
            Err(failure) => {
                let kind = failure.kind();
                let policy = self.inner.policies.policy_for(kind);

                if job.has_attempts_left(policy.max_attempts) {
                    let delay = compute_delay(job.attempts, &policy);
                    let delay_ms = delay.as_millis() as u64;
                    if job.schedule_retry(delay_ms, failure.to_string()).is_ok() {
                        entry.retry_at = Some(Instant::now() + delay);
                        warn!(
                            attempt = job.attempts,
                            max_attempts = job.max_attempts,
                            error_kind = %kind,
                            "Attempt failed, retrying in {}ms: {}",
                            delay_ms,
                            failure
                        );
                        metrics::record_job_retried(job.kind.as_str(), kind.as_str());
                    }
                } else {
                    let reason = format!("{} ({}, {} attempts)", failure, kind, job.attempts);
                    if job.fail(reason).is_ok() {
                        error!(
                            attempts = job.attempts,
                            error_kind = %kind,
                            "Fallback job failed: {}",
                            failure
                        );
                        metrics::record_job_failed(job.kind.as_str(), kind.as_str());
                    }
                }
            }
        }
        None
    }

    /// Fail jobs left processing after their executions were aborted.
    fn fail_interrupted(&self) {
        let running = lock(&self.inner.in_flight).running.clone();
        let mut jobs = lock(&self.inner.jobs);
        for entry in jobs.values_mut() {
            if entry.job.status == JobStatus::Processing && !running.contains(&entry.job.id) {
                let _ = entry.job.fail("interrupted by shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;
    use tokio::sync::Notify;
    use vjob_recovery::RetryPolicy;

    use crate::handler::{handler_fn, HandlerOptions};

    fn fast_policies() -> Arc<RetryPolicies> {
        Arc::new(RetryPolicies::uniform(RetryPolicy::new(
            10,
            Duration::from_millis(100),
            Duration::from_secs(1),
            2.0,
            false,
        )))
    }

    fn queue(registry: HandlerRegistry) -> FallbackQueue {
        let config = FallbackConfig::default().with_tick_interval(Duration::from_millis(10));
        FallbackQueue::new(config, registry, fast_policies())
    }

    fn options(max_attempts: u32) -> JobOptions {
        JobOptions {
            priority: 0,
            max_attempts,
        }
    }

    async fn wait_for(queue: &FallbackQueue, id: &JobId, done: impl Fn(&Job) -> bool) -> Job {
        for _ in 0..2000 {
            if let Some(job) = queue.get_job(id) {
                if done(&job) {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} never reached the expected state: {:?}", queue.get_job(id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_errors_then_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = HandlerRegistry::new();
        let counter = calls.clone();
        registry.register(
            JobKind::Transcode,
            handler_fn(move |_job: Job| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(JobFailure::new("ECONNRESET: connection reset by peer"))
                    } else {
                        Ok(json!({ "ok": true }))
                    }
                }
            }),
            HandlerOptions::default(),
        );

        let queue = queue(registry);
        queue.start();
        let id = queue.add_job(JobKind::Transcode, JobPayload::for_video("abc"), "u1", options(3));

        let job = wait_for(&queue, &id, Job::is_terminal).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 3);
        assert_eq!(job.result, Some(json!({ "ok": true })));
        assert!(job.error.is_none());

        // Two failed attempts, two backoff waits.
        assert_eq!(job.retry_delays_ms, vec![100, 200]);
        assert!(job.retry_delays_ms.windows(2).all(|w| w[0] < w[1]));
        assert!(job.retry_delays_ms.iter().all(|&d| d <= 1000));

        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_ceiling_respected() {
        let registry = HandlerRegistry::new();
        registry.register(
            JobKind::FetchTranscript,
            handler_fn(|_job: Job| async { Err(JobFailure::http(503, "upstream unavailable")) }),
            HandlerOptions::default(),
        );

        let queue = queue(registry);
        queue.start();
        let id = queue.add_job(JobKind::FetchTranscript, JobPayload::for_video("abc"), "u1", options(4));

        let job = wait_for(&queue, &id, Job::is_terminal).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 4);
        assert_eq!(job.retry_delays_ms.len(), 3);
        assert!(job.error.unwrap().contains("serverError"));
        assert_eq!(queue.in_flight(), 0);
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_is_not_retried() {
        let registry = HandlerRegistry::new();
        registry.register(
            JobKind::AnalyzeVideo,
            handler_fn(|_job: Job| async { Err(JobFailure::http(401, "invalid api key")) }),
            HandlerOptions::default(),
        );

        let queue = queue(registry);
        queue.start();
        let id = queue.add_job(JobKind::AnalyzeVideo, JobPayload::for_video("abc"), "u1", options(5));

        let job = wait_for(&queue, &id, Job::is_terminal).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
        assert!(job.retry_delays_ms.is_empty());
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_then_submission_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let registry = HandlerRegistry::new();
        let seen = order.clone();
        registry.register(
            JobKind::Transcode,
            handler_fn(move |job: Job| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(job.payload.video_id.unwrap_or_default());
                    Ok(Value::Null)
                }
            }),
            HandlerOptions::new(1, Duration::from_secs(10)),
        );

        let queue = queue(registry);
        let ids: Vec<JobId> = [("a", 1), ("b", 10), ("c", 1), ("d", 10)]
            .into_iter()
            .map(|(video, priority)| {
                queue.add_job(
                    JobKind::Transcode,
                    JobPayload::for_video(video),
                    "u1",
                    JobOptions { priority, max_attempts: 1 },
                )
            })
            .collect();
        queue.start();

        for id in &ids {
            wait_for(&queue, id, Job::is_terminal).await;
        }
        assert_eq!(*order.lock().unwrap(), vec!["b", "d", "a", "c"]);
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_kind_concurrency_ceiling() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let registry = HandlerRegistry::new();
        let (a, p) = (active.clone(), peak.clone());
        registry.register(
            JobKind::Transcode,
            handler_fn(move |_job: Job| {
                let (active, peak) = (a.clone(), p.clone());
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            }),
            HandlerOptions::new(2, Duration::from_secs(10)),
        );

        let queue = queue(registry);
        queue.start();
        let ids: Vec<JobId> = (0..6)
            .map(|i| {
                queue.add_job(JobKind::Transcode, JobPayload::for_video(format!("v{i}")), "u1", options(1))
            })
            .collect();

        for id in &ids {
            wait_for(&queue, id, Job::is_terminal).await;
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(queue.in_flight(), 0);
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_attempt() {
        let registry = HandlerRegistry::new();
        registry.register(
            JobKind::Transcode,
            handler_fn(|_job: Job| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Value::Null)
            }),
            HandlerOptions::new(1, Duration::from_millis(100)),
        );

        let queue = queue(registry);
        queue.start();
        let id = queue.add_job(JobKind::Transcode, JobPayload::for_video("abc"), "u1", options(2));

        let job = wait_for(&queue, &id, Job::is_terminal).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 2);
        assert!(job.error.unwrap().contains("timed out"));
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_pending_job() {
        // Dispatcher not started: the job stays pending.
        let queue = queue(HandlerRegistry::new());
        let id = queue.add_job(JobKind::Transcode, JobPayload::for_video("abc"), "u1", options(3));
        assert_eq!(queue.get_job(&id).unwrap().status, JobStatus::Pending);

        assert!(queue.cancel(&id));
        assert!(!queue.cancel(&id));
        assert!(!queue.cancel(&JobId::from_string("missing")));
        assert_eq!(queue.get_job(&id).unwrap().status, JobStatus::Cancelled);
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_processing_job_keeps_status() {
        let release = Arc::new(Notify::new());
        let registry = HandlerRegistry::new();
        let gate = release.clone();
        registry.register(
            JobKind::Transcode,
            handler_fn(move |_job: Job| {
                let gate = gate.clone();
                async move {
                    gate.notified().await;
                    Ok(json!("late result"))
                }
            }),
            HandlerOptions::new(1, Duration::from_secs(60)),
        );

        let queue = queue(registry);
        queue.start();
        let id = queue.add_job(JobKind::Transcode, JobPayload::for_video("abc"), "u1", options(3));
        wait_for(&queue, &id, |j| j.status == JobStatus::Processing).await;

        assert!(queue.cancel(&id));
        release.notify_one();

        for _ in 0..100 {
            if queue.in_flight() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(queue.in_flight(), 0);

        let job = queue.get_job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.result.is_none());
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_pending_retry() {
        let registry = HandlerRegistry::new();
        registry.register(
            JobKind::Transcode,
            handler_fn(|_job: Job| async { Err(JobFailure::classified(ErrorKind::RateLimit, "slow down")) }),
            HandlerOptions::default(),
        );

        let queue = queue(registry);
        queue.start();
        let id = queue.add_job(JobKind::Transcode, JobPayload::for_video("abc"), "u1", options(5));
        wait_for(&queue, &id, |j| j.status == JobStatus::Retrying).await;

        assert!(queue.cancel(&id));
        tokio::time::sleep(Duration::from_secs(5)).await;

        let job = queue.get_job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.attempts, 1);
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_jobs_for_owner_and_purge() {
        let registry = HandlerRegistry::new();
        registry.register(
            JobKind::FetchTranscript,
            handler_fn(|_job: Job| async { Ok(json!("done")) }),
            HandlerOptions::default(),
        );

        registry.register(
            JobKind::Transcode,
            handler_fn(|_job: Job| std::future::pending::<Result<Value, JobFailure>>()),
            HandlerOptions::default(),
        );

        let queue = queue(registry);
        queue.start();
        let done = queue.add_job(JobKind::FetchTranscript, JobPayload::for_video("a"), "u1", options(1));
        let waiting = queue.add_job(JobKind::Transcode, JobPayload::for_video("b"), "u1", options(1));
        queue.add_job(JobKind::Transcode, JobPayload::for_video("c"), "u2", options(1));

        wait_for(&queue, &done, Job::is_terminal).await;

        let mine: Vec<JobId> = queue.jobs_for("u1").into_iter().map(|j| j.id).collect();
        assert_eq!(mine, vec![done.clone(), waiting.clone()]);

        assert_eq!(queue.purge_finished(Duration::ZERO), 1);
        assert!(queue.get_job(&done).is_none());
        assert!(queue.get_job(&waiting).is_some());
        let stats = queue.stats();
        assert_eq!(stats.pending + stats.processing, 2);
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregistered_kind_fails_as_validation() {
        let queue = queue(HandlerRegistry::new());
        queue.start();
        let id = queue.add_job(JobKind::Transcode, JobPayload::for_video("abc"), "u1", options(3));

        let job = wait_for(&queue, &id, Job::is_terminal).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
        assert!(job.error.unwrap().contains("validation"));
        assert_eq!(queue.in_flight(), 0);
        queue.shutdown().await;
    }
}
