//! Redis queue backend.
//!
//! Layout under `{prefix}`:
//! - `{prefix}:pending`: list of serialized jobs, pushed at the tail
//! - `{prefix}:processing`: set of job ids being executed
//! - `{prefix}:failed`: set of job ids that failed
//! - `{prefix}:job:{id}`: JSON status record, expiring once terminal
//!
//! Enqueue writes the record and the pending entry in one script, so a job is
//! either fully queued or not queued at all.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::{AsyncCommands, Script};
use serde_json::Value;
use tracing::{debug, info, warn};

use vjob_models::{Job, JobId};

use crate::backend::{abandoned_reason, PopOrder, QueueBackend, QueueStats, ReconcileReport};
use crate::error::{from_redis, QueueError, QueueResult};

/// Redis queue configuration.
#[derive(Debug, Clone)]
pub struct RedisQueueConfig {
    /// Redis URL
    pub redis_url: String,
    /// Namespace for every key
    pub key_prefix: String,
    /// End of the pending list to pop from
    pub pop_order: PopOrder,
    /// Bound on each operation, connection included
    pub op_timeout: Duration,
    /// Record lifetime after completion
    pub completed_ttl: Duration,
    /// Record lifetime after failure
    pub failed_ttl: Duration,
}

impl Default for RedisQueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "vjob".to_string(),
            pop_order: PopOrder::Fifo,
            op_timeout: Duration::from_millis(2000),
            completed_ttl: Duration::from_secs(3600),
            failed_ttl: Duration::from_secs(86400),
        }
    }
}

impl RedisQueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            key_prefix: std::env::var("QUEUE_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            pop_order: std::env::var("QUEUE_POP_ORDER")
                .ok()
                .and_then(|s| PopOrder::parse(&s))
                .unwrap_or(defaults.pop_order),
            op_timeout: std::env::var("QUEUE_OP_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.op_timeout),
            completed_ttl: std::env::var("QUEUE_COMPLETED_TTL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.completed_ttl),
            failed_ttl: std::env::var("QUEUE_FAILED_TTL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.failed_ttl),
        }
    }

    pub fn pending_key(&self) -> String {
        format!("{}:pending", self.key_prefix)
    }

    pub fn processing_key(&self) -> String {
        format!("{}:processing", self.key_prefix)
    }

    pub fn failed_key(&self) -> String {
        format!("{}:failed", self.key_prefix)
    }

    pub fn job_key(&self, id: &JobId) -> String {
        format!("{}:job:{}", self.key_prefix, id)
    }
}

/// KEYS: record, pending list. ARGV: serialized job. Returns 1 when queued,
/// 0 when a record already exists.
const ENQUEUE_SCRIPT: &str = r#"
if redis.call('SET', KEYS[1], ARGV[1], 'NX') then
    redis.call('RPUSH', KEYS[2], ARGV[1])
    return 1
end
return 0
"#;

/// KEYS: record, pending list. ARGV: serialized job. Returns 1 when the
/// job was removed, 2 when its record exists but the job has already left
/// the pending list, 0 when it was never queued.
const WITHDRAW_SCRIPT: &str = r#"
if redis.call('LREM', KEYS[2], 1, ARGV[1]) > 0 then
    redis.call('DEL', KEYS[1])
    return 1
end
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 2
end
return 0
"#;

enum Withdraw {
    Removed,
    AlreadyTaken,
    NotQueued,
}

/// Redis-backed queue.
pub struct RedisQueue {
    client: redis::Client,
    config: RedisQueueConfig,
}

impl RedisQueue {
    /// Create a new queue client. Does not connect.
    pub fn new(config: RedisQueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self { client, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> QueueResult<Self> {
        Self::new(RedisQueueConfig::from_env())
    }

    pub fn config(&self) -> &RedisQueueConfig {
        &self.config
    }

    async fn connection(&self) -> QueueResult<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    /// Run `op` under the operation timeout, mapping connectivity errors
    /// to `Unavailable`.
    async fn bounded<T>(
        &self,
        name: &'static str,
        op: impl Future<Output = QueueResult<T>>,
    ) -> QueueResult<T> {
        match tokio::time::timeout(self.config.op_timeout, op).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(QueueError::Redis(e))) => Err(from_redis(e)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(QueueError::unavailable(format!(
                "{} timed out after {:?}",
                name, self.config.op_timeout
            ))),
        }
    }

    /// Undo a possibly applied enqueue.
    async fn withdraw(&self, job: &Job, payload: &str) -> QueueResult<Withdraw> {
        self.bounded("withdraw", async {
            let mut conn = self.connection().await?;
            let outcome: i32 = Script::new(WITHDRAW_SCRIPT)
                .key(self.config.job_key(&job.id))
                .key(self.config.pending_key())
                .arg(payload)
                .invoke_async(&mut conn)
                .await?;
            Ok(match outcome {
                1 => Withdraw::Removed,
                2 => Withdraw::AlreadyTaken,
                _ => Withdraw::NotQueued,
            })
        })
        .await
    }

    async fn load_record(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        id: &JobId,
    ) -> QueueResult<Option<Job>> {
        let raw: Option<String> = conn.get(self.config.job_key(id)).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl QueueBackend for RedisQueue {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn ping(&self) -> QueueResult<()> {
        self.bounded("ping", async {
            let mut conn = self.connection().await?;
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }

    async fn enqueue(&self, job: &Job) -> QueueResult<bool> {
        let payload = serde_json::to_string(job)?;
        let result = self
            .bounded("enqueue", async {
                let mut conn = self.connection().await?;
                let created: i32 = Script::new(ENQUEUE_SCRIPT)
                    .key(self.config.job_key(&job.id))
                    .key(self.config.pending_key())
                    .arg(&payload)
                    .invoke_async(&mut conn)
                    .await?;
                Ok(created == 1)
            })
            .await;

        match result {
            Ok(true) => {
                info!(job_id = %job.id, kind = %job.kind, "Enqueued job");
                Ok(true)
            }
            Ok(false) => {
                warn!("Duplicate job rejected: {}", job.id);
                Ok(false)
            }
            // The script may still have run. Take the job back out so the
            // caller can hand it elsewhere without it running twice.
            Err(e) => match self.withdraw(job, &payload).await {
                Ok(Withdraw::AlreadyTaken) => {
                    info!(job_id = %job.id, "Enqueue reply lost but the job was already dequeued");
                    Ok(true)
                }
                Ok(_) => Err(e),
                Err(withdraw_err) => {
                    warn!(job_id = %job.id, "Could not withdraw job after failed enqueue: {}", withdraw_err);
                    Err(e)
                }
            },
        }
    }

    async fn dequeue_next(&self) -> QueueResult<Option<Job>> {
        self.bounded("dequeue", async {
            let mut conn = self.connection().await?;
            let pending = self.config.pending_key();

            let raw: Option<String> = match self.config.pop_order {
                PopOrder::Fifo => conn.lpop(&pending, None).await?,
                PopOrder::Lifo => conn.rpop(&pending, None).await?,
            };
            let Some(raw) = raw else {
                return Ok(None);
            };

            let mut job: Job = match serde_json::from_str(&raw) {
                Ok(job) => job,
                Err(e) => {
                    warn!("Dropping malformed queue entry: {}", e);
                    return Ok(None);
                }
            };

            if let Err(e) = job.start() {
                warn!(job_id = %job.id, "Skipping dequeued job: {}", e);
                return Ok(None);
            }

            // Not atomic with the pop; reconcile_processing repairs a lost marker.
            let _: () = conn.sadd(self.config.processing_key(), job.id.as_str()).await?;
            let _: () = conn
                .set(self.config.job_key(&job.id), serde_json::to_string(&job)?)
                .await?;

            debug!(job_id = %job.id, attempt = job.attempts, "Dequeued job");
            Ok(Some(job))
        })
        .await
    }

    async fn mark_completed(&self, id: &JobId, result: &Value) -> QueueResult<()> {
        self.bounded("mark_completed", async {
            let mut conn = self.connection().await?;

            if let Some(mut job) = self.load_record(&mut conn, id).await? {
                if let Err(e) = job.complete(result.clone()) {
                    debug!("Completion not applied: {}", e);
                }
                let _: () = conn
                    .set_ex(
                        self.config.job_key(id),
                        serde_json::to_string(&job)?,
                        self.config.completed_ttl.as_secs(),
                    )
                    .await?;
            }

            let _: () = conn.srem(self.config.processing_key(), id.as_str()).await?;
            Ok(())
        })
        .await
    }

    async fn mark_failed(&self, id: &JobId, reason: &str) -> QueueResult<()> {
        self.bounded("mark_failed", async {
            let mut conn = self.connection().await?;

            if let Some(mut job) = self.load_record(&mut conn, id).await? {
                if let Err(e) = job.fail(reason) {
                    debug!("Failure not applied: {}", e);
                }
                let _: () = conn
                    .set_ex(
                        self.config.job_key(id),
                        serde_json::to_string(&job)?,
                        self.config.failed_ttl.as_secs(),
                    )
                    .await?;
            }

            let _: () = conn.srem(self.config.processing_key(), id.as_str()).await?;
            let _: () = conn.sadd(self.config.failed_key(), id.as_str()).await?;

            warn!(job_id = %id, "Job marked failed: {}", reason);
            Ok(())
        })
        .await
    }

    async fn status_of(&self, id: &JobId) -> QueueResult<Option<Job>> {
        self.bounded("status", async {
            let mut conn = self.connection().await?;
            self.load_record(&mut conn, id).await
        })
        .await
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        self.bounded("stats", async {
            let mut conn = self.connection().await?;
            let queued: u64 = conn.llen(self.config.pending_key()).await?;
            let processing: u64 = conn.scard(self.config.processing_key()).await?;
            let failed: u64 = conn.scard(self.config.failed_key()).await?;
            Ok(QueueStats {
                queued,
                processing,
                failed,
            })
        })
        .await
    }

    async fn reconcile_processing(&self, stale_after: Duration) -> QueueResult<ReconcileReport> {
        self.bounded("reconcile", async {
            let mut conn = self.connection().await?;
            let mut report = ReconcileReport::default();
            let cutoff = chrono::Utc::now()
                - chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::days(36_500));

            let processing: Vec<String> = conn.smembers(self.config.processing_key()).await?;
            for id in processing {
                let job_id = JobId::from_string(id.clone());
                let mut job = match self.load_record(&mut conn, &job_id).await {
                    Ok(Some(job)) if !job.is_terminal() => job,
                    Ok(_) | Err(QueueError::Json(_)) => {
                        let _: () = conn.srem(self.config.processing_key(), &id).await?;
                        report.processing_cleared += 1;
                        continue;
                    }
                    Err(e) => return Err(e),
                };

                if job.started_at.map_or(true, |at| at > cutoff) {
                    continue;
                }
                if job.fail(abandoned_reason(stale_after)).is_ok() {
                    let _: () = conn
                        .set_ex(
                            self.config.job_key(&job_id),
                            serde_json::to_string(&job)?,
                            self.config.failed_ttl.as_secs(),
                        )
                        .await?;
                    let _: () = conn.srem(self.config.processing_key(), &id).await?;
                    let _: () = conn.sadd(self.config.failed_key(), &id).await?;
                    warn!(job_id = %job_id, "Abandoned processing job marked failed");
                    report.processing_expired += 1;
                }
            }

            let failed: Vec<String> = conn.smembers(self.config.failed_key()).await?;
            for id in failed {
                let exists: bool = conn.exists(self.config.job_key(&JobId::from_string(id.clone()))).await?;
                if !exists {
                    let _: () = conn.srem(self.config.failed_key(), &id).await?;
                    report.failed_pruned += 1;
                }
            }

            if !report.is_empty() {
                info!(
                    processing_cleared = report.processing_cleared,
                    processing_expired = report.processing_expired,
                    failed_pruned = report.failed_pruned,
                    "Reconciled queue markers"
                );
            }
            Ok(report)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let config = RedisQueueConfig::default();
        let id = JobId::from_string("abc");
        assert_eq!(config.pending_key(), "vjob:pending");
        assert_eq!(config.processing_key(), "vjob:processing");
        assert_eq!(config.failed_key(), "vjob:failed");
        assert_eq!(config.job_key(&id), "vjob:job:abc");
    }

    #[test]
    fn test_default_ttls() {
        let config = RedisQueueConfig::default();
        assert_eq!(config.completed_ttl, Duration::from_secs(3600));
        assert_eq!(config.failed_ttl, Duration::from_secs(86400));
        assert_eq!(config.pop_order, PopOrder::Fifo);
    }

    #[tokio::test]
    async fn test_unreachable_redis_is_unavailable() {
        let queue = RedisQueue::new(RedisQueueConfig {
            redis_url: "redis://127.0.0.1:1".to_string(),
            op_timeout: Duration::from_millis(500),
            ..Default::default()
        })
        .unwrap();

        let err = queue.ping().await.unwrap_err();
        assert!(err.is_unavailable(), "unexpected error: {err}");
    }
}
