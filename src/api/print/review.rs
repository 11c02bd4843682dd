use std::collections::HashSet;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use validator::Validate;

use crate::api::errors::ApiError;
use crate::api::guards::CurrentAdmin;
use crate::api::pagination::PaginatedResponse;
use crate::core::state::AppState;
use crate::core::time::{format_primitive, primitive_now_utc};
use crate::db::models::PrintUpload;
use crate::db::types::PrintUploadStatus;
use crate::schemas::print::{
    CorrectedAnswer, CorrectionRequest, DetectedAnswer, Detection, PrintUploadResponse,
    ProcessResponse, ReprocessRequest, ReviewDetailResponse, ReviewGridRow, ReviewListItem,
    ReviewListQuery,
};
use crate::services::dispatch::{dispatch_or_fail, DispatchRequest};
use crate::services::grading::ConfidencePolicy;

const TRIAGE_STATUSES: [PrintUploadStatus; 2] =
    [PrintUploadStatus::NeedsReview, PrintUploadStatus::Error];

pub(super) async fn list_review(
    CurrentAdmin(_admin): CurrentAdmin,
    State(state): State<AppState>,
    Query(query): Query<ReviewListQuery>,
) -> Result<Json<PaginatedResponse<ReviewListItem>>, ApiError> {
    query.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let statuses = match query.status {
        Some(status) => vec![status],
        None => TRIAGE_STATUSES.to_vec(),
    };
    let (uploads, total_count) = state
        .store()
        .list_uploads(&statuses, query.skip, query.limit)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to list uploads"))?;

    let policy = ConfidencePolicy::new(state.settings().pipeline().review_confidence_threshold);
    let items = uploads
        .iter()
        .map(|upload| ReviewListItem {
            id: upload.id.clone(),
            test_id: upload.test_id.clone(),
            user_id: upload.user_id.clone(),
            status: upload.status,
            error: upload.error.clone(),
            attempt_id: upload.attempt_id.clone(),
            pages: upload.page_paths().len(),
            low_confidence_answers: upload
                .detection()
                .map(|detection| {
                    detection.answers.iter().filter(|answer| policy.is_low(answer)).count()
                })
                .unwrap_or(0),
            created_at: format_primitive(upload.created_at),
            updated_at: format_primitive(upload.updated_at),
        })
        .collect();

    Ok(Json(PaginatedResponse { items, total_count, skip: query.skip, limit: query.limit }))
}

pub(super) async fn get_review(
    Path(upload_id): Path<String>,
    CurrentAdmin(_admin): CurrentAdmin,
    State(state): State<AppState>,
) -> Result<Json<ReviewDetailResponse>, ApiError> {
    let upload = super::fetch_upload(&state, &upload_id).await?;
    let test = super::fetch_test(&state, &upload.test_id).await?;
    let question_count = test.question_count();

    let (grid, anomalies) = review_grid(upload.detection(), question_count);

    let mut page_urls = Vec::new();
    if let Some(pages) = state.pages() {
        let expires =
            Duration::from_secs(state.settings().s3().presigned_url_expire_minutes * 60);
        for key in upload.page_paths() {
            let url = pages
                .presign_get(key, expires)
                .await
                .map_err(|e| ApiError::internal(e, "Failed to generate page view URL"))?;
            page_urls.push(url);
        }
    }

    Ok(Json(ReviewDetailResponse {
        upload: PrintUploadResponse::from(&upload),
        question_count,
        grid,
        anomalies,
        warnings: upload.detection().map(|detection| detection.warnings.clone()).unwrap_or_default(),
        page_urls,
    }))
}

pub(super) async fn save_correction(
    Path(upload_id): Path<String>,
    CurrentAdmin(admin): CurrentAdmin,
    State(state): State<AppState>,
    Json(payload): Json<CorrectionRequest>,
) -> Result<(StatusCode, Json<ProcessResponse>), ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let upload = super::fetch_upload(&state, &upload_id).await?;
    if upload.status.is_in_flight() {
        return Err(ApiError::Conflict("Upload is still being processed".to_string()));
    }
    let test = super::fetch_test(&state, &upload.test_id).await?;

    let pages = upload
        .detection()
        .map(|detection| detection.pages)
        .unwrap_or(upload.page_paths().len() as u32);
    let detected = corrected_detection(&payload.answers, test.question_count(), pages)
        .map_err(ApiError::BadRequest)?;

    let generation = state
        .store()
        .apply_correction(&upload.id, &detected, primitive_now_utc())
        .await
        .map_err(|e| ApiError::internal(e, "Failed to store corrected answers"))?
        .ok_or_else(|| ApiError::Conflict("Upload is still being processed".to_string()))?;

    tracing::info!(
        upload_id = %upload.id,
        admin_id = %admin.id,
        answers = detected.answers.len(),
        generation,
        "Stored manual correction"
    );

    forced_dispatch(&state, DispatchRequest::forced(&upload.id, false), generation).await
}

pub(super) async fn reprocess(
    Path(upload_id): Path<String>,
    CurrentAdmin(admin): CurrentAdmin,
    State(state): State<AppState>,
    payload: Option<Json<ReprocessRequest>>,
) -> Result<(StatusCode, Json<ProcessResponse>), ApiError> {
    let rerun_detection = payload.map(|Json(body)| body.rerun_detection).unwrap_or(false);
    let upload = super::fetch_upload(&state, &upload_id).await?;

    tracing::info!(
        upload_id = %upload.id,
        admin_id = %admin.id,
        rerun_detection,
        "Manual reprocess requested"
    );

    forced_dispatch(
        &state,
        DispatchRequest::forced(&upload.id, rerun_detection),
        upload.generation,
    )
    .await
}

async fn forced_dispatch(
    state: &AppState,
    request: DispatchRequest,
    generation: i64,
) -> Result<(StatusCode, Json<ProcessResponse>), ApiError> {
    let upload_id = request.upload_id.clone();
    if !dispatch_or_fail(state, request, generation).await {
        return Err(ApiError::ServiceUnavailable(
            "Processing trigger failed; an upload waiting to run was moved to error, \
             any other upload keeps its status"
                .to_string(),
        ));
    }

    let upload: PrintUpload = super::fetch_upload(state, &upload_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ProcessResponse {
            upload_id: upload.id,
            status: upload.status,
            generation: upload.generation,
        }),
    ))
}

/// One row per printed question, plus the detected answers that fall outside the sheet.
fn review_grid(
    detection: Option<&Detection>,
    question_count: usize,
) -> (Vec<ReviewGridRow>, Vec<DetectedAnswer>) {
    let answers = detection.map(|detection| detection.answers.as_slice()).unwrap_or_default();

    let grid = (1..=question_count as u32)
        .map(|q| {
            let found = answers.iter().find(|answer| answer.q == q);
            ReviewGridRow {
                q,
                sel: found.map(|answer| answer.sel),
                conf: found.map(|answer| answer.conf),
            }
        })
        .collect();
    let anomalies = answers
        .iter()
        .filter(|answer| answer.q == 0 || answer.q as usize > question_count)
        .cloned()
        .collect();

    (grid, anomalies)
}

fn corrected_detection(
    answers: &[CorrectedAnswer],
    question_count: usize,
    pages: u32,
) -> Result<Detection, String> {
    let mut seen = HashSet::with_capacity(answers.len());
    let mut corrected = Vec::with_capacity(answers.len());
    for answer in answers {
        if answer.q == 0 || answer.q as usize > question_count {
            return Err(format!("question {} is outside 1..={question_count}", answer.q));
        }
        if !seen.insert(answer.q) {
            return Err(format!("question {} appears more than once", answer.q));
        }
        corrected.push(DetectedAnswer { q: answer.q, sel: answer.sel, conf: 1.0 });
    }
    corrected.sort_by_key(|answer| answer.q);

    Ok(Detection { answers: corrected, warnings: Vec::new(), pages })
}
