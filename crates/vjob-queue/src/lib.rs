//! Job queue with a distributed backend and an in-process fallback.
//!
//! This crate provides:
//! - The `QueueBackend` contract and its Redis implementation
//! - An in-memory backend for single-node runs and tests
//! - The handler registry mapping job kinds to handlers
//! - The fallback queue: priority dispatch, concurrency limits, timeouts and
//!   classified retries, independent of the distributed backend

pub mod backend;
pub mod error;
pub mod fallback;
pub mod handler;
pub mod memory;
pub mod metrics;
pub mod redis_backend;

pub use backend::{PopOrder, QueueBackend, QueueStats, ReconcileReport};
#[cfg(any(test, feature = "mocks"))]
pub use backend::MockQueueBackend;
pub use error::{QueueError, QueueResult};
pub use fallback::{CompletionHook, FallbackConfig, FallbackQueue, FallbackStats, JobOptions};
pub use handler::{handler_fn, FnHandler, HandlerOptions, HandlerRegistry, JobHandler, RegisteredHandler};
pub use memory::InMemoryBackend;
pub use redis_backend::{RedisQueue, RedisQueueConfig};
