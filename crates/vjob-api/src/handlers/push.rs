//! Push-delivery ingress.
//!
//! An external scheduler posts one job per request and redelivers based on
//! the response status. The job runs inline through the handler registry;
//! nothing is queued and no retries happen here.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use vjob_models::{JobId, JobRequest};
use vjob_queue::metrics::{record_job_completed, record_job_failed};
use vjob_recovery::{ErrorKind, JobFailure};
use vjob_worker::worker::invalidate_owner_entries;
use vjob_worker::JobLogger;

use crate::error::{status_for_kind, ApiError, ApiResult};
use crate::metrics::record_push_delivery;
use crate::state::AppState;

/// Delivery attempt number as reported by the scheduler (0-based).
pub const RETRY_COUNT_HEADER: &str = "X-Task-Retry-Count";

#[derive(Debug, Deserialize)]
pub struct PushTask {
    /// Scheduler-assigned id, kept so logs line up across redeliveries.
    #[serde(default)]
    pub id: Option<String>,

    #[serde(flatten)]
    pub request: JobRequest,
}

#[derive(Debug, Serialize)]
pub struct PushTaskResponse {
    pub id: JobId,
    pub result: Value,
}

/// Run one delivered job: `200` on success, otherwise the status its
/// failure classification maps to.
pub async fn execute_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<PushTask>, JsonRejection>,
) -> ApiResult<Json<PushTaskResponse>> {
    let Json(task) = payload.map_err(|rejection| {
        record_push_delivery("unparsed", StatusCode::BAD_REQUEST.as_u16());
        ApiError::job(JobFailure::classified(ErrorKind::Validation, rejection.body_text()))
    })?;
    let kind = task.request.kind;
    if let Err(msg) = task.request.validate() {
        record_push_delivery(kind.as_str(), StatusCode::BAD_REQUEST.as_u16());
        return Err(ApiError::job(JobFailure::classified(ErrorKind::Validation, msg)));
    }

    let mut job = task.request.into_job();
    if let Some(id) = task.id.filter(|id| !id.trim().is_empty()) {
        job.id = JobId::from_string(id);
    }
    job.start().map_err(|e| ApiError::internal(e.to_string()))?;
    if let Some(retries) = headers
        .get(RETRY_COUNT_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u32>().ok())
    {
        job.attempts = retries.saturating_add(1);
    }

    let logger = JobLogger::new(&job.id, kind.as_str());
    logger.log_start(job.attempts);
    let started = Instant::now();

    match state.pipeline.registry.execute(&job).await {
        Ok(result) => {
            logger.log_completion(started.elapsed().as_millis());
            record_job_completed(kind.as_str());
            record_push_delivery(kind.as_str(), StatusCode::OK.as_u16());
            invalidate_owner_entries(&state.pipeline.cache, &job);
            Ok(Json(PushTaskResponse { id: job.id, result }))
        }
        Err(failure) => {
            let error_kind = failure.kind();
            logger.log_error(error_kind, &failure.message);
            record_job_failed(kind.as_str(), error_kind.as_str());
            record_push_delivery(kind.as_str(), status_for_kind(error_kind).as_u16());
            Err(ApiError::job(failure))
        }
    }
}
