//! Axum HTTP API server.
//!
//! This crate provides:
//! - Job submission, status polling, cancellation and per-owner results
//! - The push-delivery ingress (`POST /tasks/execute`)
//! - Health and readiness checks
//! - Prometheus metrics

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod state;

pub use config::ApiConfig;
pub use error::{status_for_kind, ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
