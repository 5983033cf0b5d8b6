//! In-memory queue backend.
//!
//! Same semantics as the Redis backend within one process: record expiry,
//! duplicate rejection and pop order. Can be toggled unavailable to exercise
//! fallback paths.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;

use vjob_models::{Job, JobId};

use crate::backend::{abandoned_reason, PopOrder, QueueBackend, QueueStats, ReconcileReport};
use crate::error::{QueueError, QueueResult};

struct Record {
    job: Job,
    expires_at: Option<Instant>,
}

impl Record {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Default)]
struct State {
    pending: VecDeque<Job>,
    /// Processing ids and when they were dequeued
    processing: HashMap<JobId, Instant>,
    failed: HashSet<JobId>,
    records: HashMap<JobId, Record>,
}

impl State {
    fn live_record(&mut self, id: &JobId, now: Instant) -> Option<&mut Record> {
        if self.records.get(id).is_some_and(|r| !r.is_live(now)) {
            self.records.remove(id);
        }
        self.records.get_mut(id)
    }
}

/// Process-local queue backend.
pub struct InMemoryBackend {
    state: Mutex<State>,
    available: AtomicBool,
    pop_order: PopOrder,
    completed_ttl: Duration,
    failed_ttl: Duration,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new(PopOrder::Fifo)
    }
}

impl InMemoryBackend {
    pub fn new(pop_order: PopOrder) -> Self {
        Self {
            state: Mutex::new(State::default()),
            available: AtomicBool::new(true),
            pop_order,
            completed_ttl: Duration::from_secs(3600),
            failed_ttl: Duration::from_secs(86400),
        }
    }

    pub fn with_ttls(mut self, completed: Duration, failed: Duration) -> Self {
        self.completed_ttl = completed;
        self.failed_ttl = failed;
        self
    }

    /// Simulate an outage: every call fails with `Unavailable` until reset.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn lock(&self) -> QueueResult<MutexGuard<'_, State>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(QueueError::unavailable("in-memory backend switched off"));
        }
        Ok(self.state.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

#[async_trait]
impl QueueBackend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> QueueResult<()> {
        self.lock().map(|_| ())
    }

    async fn enqueue(&self, job: &Job) -> QueueResult<bool> {
        let mut state = self.lock()?;
        let now = Instant::now();
        if state.live_record(&job.id, now).is_some() {
            return Ok(false);
        }
        state.records.insert(
            job.id.clone(),
            Record {
                job: job.clone(),
                expires_at: None,
            },
        );
        state.pending.push_back(job.clone());
        Ok(true)
    }

    async fn dequeue_next(&self) -> QueueResult<Option<Job>> {
        let mut state = self.lock()?;
        let popped = match self.pop_order {
            PopOrder::Fifo => state.pending.pop_front(),
            PopOrder::Lifo => state.pending.pop_back(),
        };
        let Some(mut job) = popped else {
            return Ok(None);
        };
        if job.start().is_err() {
            return Ok(None);
        }
        state.processing.insert(job.id.clone(), Instant::now());
        state.records.insert(
            job.id.clone(),
            Record {
                job: job.clone(),
                expires_at: None,
            },
        );
        Ok(Some(job))
    }

    async fn mark_completed(&self, id: &JobId, result: &Value) -> QueueResult<()> {
        let mut state = self.lock()?;
        let now = Instant::now();
        let ttl = self.completed_ttl;
        if let Some(record) = state.live_record(id, now) {
            let _ = record.job.complete(result.clone());
            record.expires_at = Some(now + ttl);
        }
        state.processing.remove(id);
        Ok(())
    }

    async fn mark_failed(&self, id: &JobId, reason: &str) -> QueueResult<()> {
        let mut state = self.lock()?;
        let now = Instant::now();
        let ttl = self.failed_ttl;
        if let Some(record) = state.live_record(id, now) {
            let _ = record.job.fail(reason);
            record.expires_at = Some(now + ttl);
        }
        state.processing.remove(id);
        state.failed.insert(id.clone());
        Ok(())
    }

    async fn status_of(&self, id: &JobId) -> QueueResult<Option<Job>> {
        let mut state = self.lock()?;
        Ok(state.live_record(id, Instant::now()).map(|r| r.job.clone()))
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let state = self.lock()?;
        Ok(QueueStats {
            queued: state.pending.len() as u64,
            processing: state.processing.len() as u64,
            failed: state.failed.len() as u64,
        })
    }

    async fn reconcile_processing(&self, stale_after: Duration) -> QueueResult<ReconcileReport> {
        let mut state = self.lock()?;
        let now = Instant::now();
        let failed_ttl = self.failed_ttl;
        let mut report = ReconcileReport::default();

        let processing: Vec<(JobId, Instant)> =
            state.processing.iter().map(|(id, at)| (id.clone(), *at)).collect();
        for (id, started) in processing {
            let expired = match state.live_record(&id, now) {
                None => false,
                Some(record) if record.job.is_terminal() => false,
                Some(record) => {
                    if now.duration_since(started) < stale_after {
                        continue;
                    }
                    let _ = record.job.fail(abandoned_reason(stale_after));
                    record.expires_at = Some(now + failed_ttl);
                    true
                }
            };
            state.processing.remove(&id);
            if expired {
                state.failed.insert(id);
                report.processing_expired += 1;
            } else {
                report.processing_cleared += 1;
            }
        }

        let failed: Vec<JobId> = state.failed.iter().cloned().collect();
        for id in failed {
            if state.live_record(&id, now).is_none() {
                state.failed.remove(&id);
                report.failed_pruned += 1;
            }
        }

        Ok(report)
    }
}
