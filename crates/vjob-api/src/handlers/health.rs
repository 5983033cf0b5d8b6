//! Health check handlers.

use std::time::Instant;

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde::Serialize;

use vjob_queue::FallbackStats;

use crate::state::AppState;

/// Health response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: String,
}

/// Health check endpoint (liveness check).
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
    })
}

/// Readiness check response.
#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub checks: ReadinessChecks,
    pub fallback: FallbackStats,
}

#[derive(Serialize)]
pub struct ReadinessChecks {
    pub queue_backend: CheckStatus,
}

#[derive(Serialize)]
pub struct CheckStatus {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

impl CheckStatus {
    fn ok(backend: &'static str, latency_ms: u64) -> Self {
        Self {
            status: "ok".to_string(),
            backend: Some(backend),
            error: None,
            latency_ms: Some(latency_ms),
        }
    }

    fn error(backend: &'static str, msg: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            backend: Some(backend),
            error: Some(msg.into()),
            latency_ms: None,
        }
    }

    fn disabled() -> Self {
        Self {
            status: "disabled".to_string(),
            backend: None,
            error: None,
            latency_ms: None,
        }
    }
}

/// Readiness check endpoint (readiness check).
///
/// Always 200: with the distributed backend down the fallback queue takes
/// submissions, so the service is degraded but serving.
pub async fn ready(State(state): State<AppState>) -> Json<ReadinessResponse> {
    let router = &state.pipeline.router;

    let backend_check = match router.backend() {
        None => CheckStatus::disabled(),
        Some(backend) => {
            let start = Instant::now();
            match backend.ping().await {
                Ok(()) => CheckStatus::ok(backend.name(), start.elapsed().as_millis() as u64),
                Err(e) => CheckStatus::error(backend.name(), e.to_string()),
            }
        }
    };

    let status = if backend_check.status == "error" {
        "degraded"
    } else {
        "ready"
    };

    Json(ReadinessResponse {
        status: status.to_string(),
        checks: ReadinessChecks {
            queue_backend: backend_check,
        },
        fallback: state.pipeline.fallback().stats(),
    })
}
