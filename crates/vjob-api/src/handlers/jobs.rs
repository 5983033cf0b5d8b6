//! Job submission, status polling and cancellation.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use vjob_models::{JobId, JobRequest, JobStatusView};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct SubmitJobResponse {
    pub id: JobId,
    /// `distributed` or `fallback`
    pub queue: &'static str,
}

#[derive(Debug, Serialize)]
pub struct CancelJobResponse {
    pub cancelled: bool,
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub owner: String,
}

/// Accept a job and return its id without waiting for it to run.
pub async fn submit_job(
    State(state): State<AppState>,
    payload: Result<Json<JobRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<SubmitJobResponse>)> {
    let Json(request) = payload?;
    request.validate().map_err(ApiError::Validation)?;

    let job = request.into_job();
    let kind = job.kind;
    let (id, path) = state.pipeline.router.submit_with_path(job).await?;
    info!(job_id = %id, kind = %kind, queue = path.as_str(), "Job submitted");

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitJobResponse {
            id,
            queue: path.as_str(),
        }),
    ))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobStatusView>> {
    let id = JobId::from_string(id);
    state
        .pipeline
        .router
        .status(&id)
        .await
        .map(|job| Json(job.status_view()))
        .ok_or_else(|| ApiError::not_found(format!("job {}", id)))
}

/// Cancel a job that has not finished. Only fallback jobs are cancellable.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<CancelJobResponse> {
    let cancelled = state.pipeline.router.cancel(&JobId::from_string(id));
    Json(CancelJobResponse { cancelled })
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> ApiResult<Json<Vec<JobStatusView>>> {
    if query.owner.trim().is_empty() {
        return Err(ApiError::bad_request("owner is required"));
    }
    let mut jobs = state.pipeline.router.jobs_for(&query.owner);
    jobs.sort_by_key(|job| job.created_at);
    Ok(Json(jobs.iter().map(|job| job.status_view()).collect()))
}
