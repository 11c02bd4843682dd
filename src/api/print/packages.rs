use axum::{
    extract::{Path, State},
    Json,
};

use crate::api::errors::ApiError;
use crate::api::guards::CurrentUser;
use crate::core::state::AppState;
use crate::schemas::print::PrintPackageResponse;
use crate::services::print_packages::ensure_current_package;

pub(super) async fn get_package(
    Path(test_id): Path<String>,
    CurrentUser(user): CurrentUser,
    State(state): State<AppState>,
) -> Result<Json<PrintPackageResponse>, ApiError> {
    let test = super::fetch_test(&state, &test_id).await?;
    super::require_test_access(&user, &test)?;

    let package = ensure_current_package(state.store(), &test, &user.id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to prepare print package"))?;

    Ok(Json(PrintPackageResponse::from(package)))
}
