//! API routes.

use axum::http::StatusCode;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

use crate::handlers::{
    cancel_job, execute_task, get_job, get_latest_result, health, list_jobs, ready, submit_job,
};
use crate::metrics::metrics_middleware;
use crate::middleware::{request_id, request_logging};
use crate::state::AppState;

/// Create the API router.
pub fn create_router(state: AppState, metrics_handle: Option<PrometheusHandle>) -> Router {
    let api_routes = Router::new()
        .route("/jobs", post(submit_job).get(list_jobs))
        .route("/jobs/:id", get(get_job).delete(cancel_job))
        .route("/owners/:owner/videos/:video/result", get(get_latest_result))
        .layer(TimeoutLayer::new(state.config.request_timeout));

    // Push deliveries run the job inline and are bounded by the handler
    // timeout instead of the request timeout.
    let push_routes = Router::new().route("/tasks/execute", post(execute_task));

    let health_routes = Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready));

    let metrics_routes = if let Some(handle) = metrics_handle {
        Router::new().route("/metrics", get(move || async move { handle.render() }))
    } else {
        Router::new().route("/metrics", get(|| async { StatusCode::NOT_FOUND }))
    };

    Router::new()
        .nest("/api", api_routes)
        .merge(push_routes)
        .merge(health_routes)
        .merge(metrics_routes)
        .route_layer(middleware::from_fn(metrics_middleware))
        .layer(RequestBodyLimitLayer::new(state.config.max_body_size))
        .layer(middleware::from_fn(request_logging))
        .layer(middleware::from_fn(request_id))
        .with_state(state)
}
