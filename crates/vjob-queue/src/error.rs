//! Queue error types.

use thiserror::Error;

use vjob_models::JobKind;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    /// The backend could not be reached (refused, dropped, timed out).
    /// Callers fall back instead of failing.
    #[error("Queue backend unavailable: {0}")]
    Unavailable(String),

    /// Nothing could ever execute the job, so it is refused up front.
    #[error("No handler registered for job type {0}")]
    NoHandler(JobKind),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QueueError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, QueueError::Unavailable(_))
    }
}

/// Map a Redis error, treating connectivity failures as unavailability.
pub(crate) fn from_redis(err: redis::RedisError) -> QueueError {
    if err.is_io_error()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
        || err.is_timeout()
    {
        QueueError::Unavailable(err.to_string())
    } else {
        QueueError::Redis(err)
    }
}
