//! HTTP surface of the print pipeline: intake, the internal processing trigger,
//! status polling, admin review and print packages.

mod intake;
mod packages;
mod review;
mod trigger;
mod uploads;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;

use crate::api::errors::ApiError;
use crate::core::config::Settings;
use crate::core::state::AppState;
use crate::db::models::{PrintUpload, Test, User};

/// Multipart framing and text fields on top of the page bytes.
const FORM_OVERHEAD_BYTES: u64 = 1024 * 1024;

pub(crate) fn router(settings: &Settings) -> Router<AppState> {
    let intake = settings.intake();
    let body_limit = intake
        .max_upload_bytes()
        .saturating_mul(intake.max_pages_per_upload)
        .saturating_add(FORM_OVERHEAD_BYTES);
    let body_limit = usize::try_from(body_limit).unwrap_or(usize::MAX);

    Router::new()
        .route(
            "/uploads",
            post(intake::create_upload).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/uploads/:upload_id", get(uploads::get_upload))
        .route("/process", post(trigger::process))
        .route("/review", get(review::list_review))
        .route("/review/:upload_id", get(review::get_review).put(review::save_correction))
        .route("/review/:upload_id/reprocess", post(review::reprocess))
        .route("/tests/:test_id/package", get(packages::get_package))
}

pub(super) async fn fetch_upload(state: &AppState, upload_id: &str) -> Result<PrintUpload, ApiError> {
    state
        .store()
        .find_upload(upload_id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to load upload"))?
        .ok_or_else(|| ApiError::NotFound("Upload not found".to_string()))
}

pub(super) async fn fetch_test(state: &AppState, test_id: &str) -> Result<Test, ApiError> {
    state
        .store()
        .find_test(test_id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to load test"))?
        .ok_or_else(|| ApiError::NotFound("Test not found".to_string()))
}

pub(super) fn require_test_access(user: &User, test: &Test) -> Result<(), ApiError> {
    if user.is_admin || test.accepts_submission_from(user) {
        Ok(())
    } else {
        Err(ApiError::Forbidden("Not enough permissions for this test"))
    }
}
