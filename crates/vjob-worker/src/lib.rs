//! Video job worker.
//!
//! This crate provides:
//! - `QueueRouter`: distributed-first submission with transparent fallback
//! - `Worker`: the distributed-backend poll loop
//! - Video handlers and the upstream clients they call
//! - `Pipeline`: wiring shared by the worker and API binaries

pub mod config;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod pipeline;
pub mod router;
pub mod upstream;
pub mod worker;

pub use config::{UpstreamConfig, WorkerConfig};
pub use error::{WorkerError, WorkerResult};
pub use logging::{init_tracing, JobLogger};
pub use pipeline::Pipeline;
pub use router::{QueueRouter, SubmitPath};
pub use worker::{PollOutcome, Processor, Worker};
