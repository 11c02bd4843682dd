use axum::{extract::State, http::StatusCode, Json};
use validator::Validate;

use crate::api::errors::ApiError;
use crate::api::guards::ServiceCaller;
use crate::core::state::AppState;
use crate::db::types::PrintUploadStatus;
use crate::schemas::print::{ProcessRequest, ProcessResponse};
use crate::services::dispatch::DispatchRequest;
use crate::tasks::processing::{self, ClaimError};

/// Internal trigger. Reports whether the run was claimed, not how grading ended.
pub(super) async fn process(
    _caller: ServiceCaller,
    State(state): State<AppState>,
    Json(payload): Json<ProcessRequest>,
) -> Result<(StatusCode, Json<ProcessResponse>), ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let request = DispatchRequest {
        upload_id: payload.upload_id,
        force_reprocess: payload.force_reprocess,
        rerun_detection: payload.rerun_detection,
    };

    let run = match processing::claim(&state, &request.upload_id, request.mode()).await {
        Ok(run) => run,
        Err(ClaimError::NotFound(_)) => {
            return Err(ApiError::NotFound("Upload not found".to_string()));
        }
        Err(ClaimError::AlreadyClaimed(_)) => {
            return Err(ApiError::Conflict("Upload already processed".to_string()));
        }
        Err(ClaimError::Store(err)) => {
            return Err(ApiError::internal(err, "Failed to claim upload"));
        }
    };

    let response = ProcessResponse {
        upload_id: run.upload_id.clone(),
        status: PrintUploadStatus::Processing,
        generation: run.generation,
    };
    processing::spawn_run(state, run);

    Ok((StatusCode::ACCEPTED, Json(response)))
}
