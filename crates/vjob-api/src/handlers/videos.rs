//! Per-owner video results.

use axum::extract::{Path, State};
use axum::Json;
use serde_json::Value;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Latest completed result `owner` has for `video`.
pub async fn get_latest_result(
    State(state): State<AppState>,
    Path((owner, video)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    state
        .pipeline
        .latest_result(&owner, &video)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("no result for video {}", video)))
}
