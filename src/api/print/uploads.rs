use axum::{
    extract::{Path, State},
    Json,
};

use crate::api::errors::ApiError;
use crate::api::guards::CurrentUser;
use crate::core::state::AppState;
use crate::schemas::print::PrintUploadResponse;

pub(super) async fn get_upload(
    Path(upload_id): Path<String>,
    CurrentUser(user): CurrentUser,
    State(state): State<AppState>,
) -> Result<Json<PrintUploadResponse>, ApiError> {
    let upload = super::fetch_upload(&state, &upload_id).await?;
    if upload.user_id != user.id && !user.is_admin {
        return Err(ApiError::Forbidden("Access denied"));
    }

    Ok(Json(PrintUploadResponse::from(&upload)))
}
