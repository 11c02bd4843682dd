use axum::{
    extract::{multipart::Field, Multipart, State},
    http::StatusCode,
    Json,
};
use tracing::Instrument;
use uuid::Uuid;

use crate::api::errors::ApiError;
use crate::api::guards::CurrentUser;
use crate::core::redis::upload_rate_limit_key;
use crate::core::state::AppState;
use crate::core::time::primitive_now_utc;
use crate::db::models::{Test, User};
use crate::repositories::store::NewPrintUpload;
use crate::schemas::print::IntakeResponse;
use crate::services::dispatch::{dispatch_or_fail, DispatchRequest};
use crate::services::print_packages::{layout_hash, parse_qr_payload};
use crate::services::storage::page_key;

const RATE_WINDOW_SECONDS: u64 = 3600;

struct PageFile {
    media_type: String,
    bytes: Vec<u8>,
}

/// Fields read so far. `test` is set, and access checked, before any file part is buffered.
#[derive(Default)]
struct IntakeForm {
    test: Option<Test>,
    qr_payload: Option<String>,
    files: Vec<PageFile>,
}

pub(super) async fn create_upload(
    CurrentUser(user): CurrentUser,
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<IntakeResponse>), ApiError> {
    let limits = state.settings().intake();
    let allowed = match state
        .redis()
        .rate_limit(&upload_rate_limit_key(&user.id), limits.rate_limit_per_hour, RATE_WINDOW_SECONDS)
        .await
    {
        Ok(value) => value,
        Err(err) => {
            tracing::error!(error = %err, "Failed to check upload rate limit");
            true
        }
    };
    if !allowed {
        return Err(ApiError::TooManyRequests("Upload rate limit exceeded"));
    }

    let form = read_form(&state, &user, multipart).await?;
    let test = form.test.ok_or_else(|| ApiError::BadRequest("test_id is required".to_string()))?;
    if form.files.is_empty() {
        return Err(ApiError::BadRequest("At least one file is required".to_string()));
    }

    if let Some(text) = form.qr_payload.filter(|value| !value.trim().is_empty()) {
        let payload = parse_qr_payload(&text)
            .map_err(|err| ApiError::BadRequest(format!("Invalid QR payload: {err}")))?;
        if payload.test_id != test.id {
            return Err(ApiError::BadRequest("QR payload belongs to a different test".to_string()));
        }
        if !payload.layout_hash.is_empty() && payload.layout_hash != layout_hash(test.question_ids())
        {
            return Err(ApiError::Conflict(
                "Printed sheet no longer matches the test's question order".to_string(),
            ));
        }
    }

    let pages = state.pages().ok_or_else(|| {
        ApiError::ServiceUnavailable("Page storage is not configured".to_string())
    })?;

    let upload_id = Uuid::new_v4().to_string();
    let files_uploaded = form.files.len();
    let mut keys = Vec::with_capacity(files_uploaded);
    for (index, file) in form.files.into_iter().enumerate() {
        let key = page_key(&test.id, &user.id, &upload_id, index + 1, &file.media_type);
        pages
            .put_page(&key, &file.media_type, file.bytes)
            .await
            .map_err(|e| ApiError::internal(e, "Failed to store page file"))?;
        keys.push(key);
    }

    let upload = state
        .store()
        .insert_upload(NewPrintUpload {
            id: upload_id,
            test_id: test.id.clone(),
            user_id: user.id.clone(),
            upload_urls: keys,
            created_at: primitive_now_utc(),
        })
        .await
        .map_err(|e| ApiError::internal(e, "Failed to create upload"))?;

    metrics::counter!("print_uploads_received_total").increment(1);
    tracing::info!(
        upload_id = %upload.id,
        test_id = %upload.test_id,
        user_id = %upload.user_id,
        pages = files_uploaded,
        "Print upload received"
    );

    let span = tracing::info_span!("print_dispatch", upload_id = %upload.id);
    let dispatch_state = state.clone();
    let request = DispatchRequest::normal(&upload.id);
    let generation = upload.generation;
    tokio::spawn(
        async move {
            dispatch_or_fail(&dispatch_state, request, generation).await;
        }
        .instrument(span),
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(IntakeResponse {
            upload_id: upload.id,
            status: upload.status,
            files_uploaded,
            message: "Upload received; grading will continue in the background".to_string(),
        }),
    ))
}

async fn read_form(
    state: &AppState,
    user: &User,
    mut multipart: Multipart,
) -> Result<IntakeForm, ApiError> {
    let limits = state.settings().intake();
    let mut form = IntakeForm::default();

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "test_id" if form.test.is_none() => {
                let test_id = field.text().await.map_err(multipart_error)?.trim().to_string();
                if test_id.is_empty() {
                    return Err(ApiError::BadRequest("test_id is required".to_string()));
                }
                let test = super::fetch_test(state, &test_id).await?;
                super::require_test_access(user, &test)?;
                form.test = Some(test);
            }
            "qr_payload" => form.qr_payload = Some(field.text().await.map_err(multipart_error)?),
            "files" | "files[]" | "file" => {
                if form.test.is_none() {
                    return Err(ApiError::BadRequest(
                        "test_id must be sent before any file".to_string(),
                    ));
                }
                if form.files.len() as u64 >= limits.max_pages_per_upload {
                    return Err(ApiError::BadRequest(format!(
                        "At most {} files per upload",
                        limits.max_pages_per_upload
                    )));
                }
                let page = form.files.len() + 1;
                form.files.push(read_page(state, field, page).await?);
            }
            _ => {}
        }
    }

    Ok(form)
}

async fn read_page(state: &AppState, mut field: Field<'_>, page: usize) -> Result<PageFile, ApiError> {
    let limits = state.settings().intake();
    let filename = field.file_name().map(str::to_string).unwrap_or_else(|| format!("page-{page}"));
    let declared = field.content_type().unwrap_or("").trim().to_ascii_lowercase();

    if !limits.allowed_media_types.iter().any(|allowed| allowed == &declared) {
        let shown = if declared.is_empty() { "unknown" } else { declared.as_str() };
        return Err(ApiError::UnsupportedMediaType(format!(
            "File {filename} has unsupported type {shown}; allowed: PDF, JPEG, PNG"
        )));
    }

    let max_bytes = limits.max_upload_bytes();
    let mut bytes = Vec::new();
    while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
        if bytes.len() as u64 + chunk.len() as u64 > max_bytes {
            return Err(ApiError::PayloadTooLarge(format!(
                "File {filename} exceeds the {}MB limit",
                limits.max_upload_size_mb
            )));
        }
        bytes.extend_from_slice(&chunk);
    }

    if bytes.is_empty() {
        return Err(ApiError::BadRequest(format!("File {filename} is empty")));
    }

    let media_type = if declared == "image/jpg" { "image/jpeg".to_string() } else { declared };
    Ok(PageFile { media_type, bytes })
}

fn multipart_error(err: axum::extract::multipart::MultipartError) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge("Upload exceeds the request size limit".to_string())
    } else {
        ApiError::BadRequest(format!("Invalid multipart data: {}", err.body_text()))
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use tower::ServiceExt;

    use crate::db::types::PrintUploadStatus;
    use crate::services::dispatch::DispatchRequest;
    use crate::services::print_packages::{build_qr_payload, layout_hash};
    use crate::test_support::{
        multipart_request, read_json, FormPart, TestHarness, OTHER_ID, OWNER_ID, PNG_BYTES,
        TEST_ID,
    };

    const URI: &str = "/api/v1/print/uploads";

    fn png(filename: &str) -> FormPart<'_> {
        FormPart::File { name: "files", filename, content_type: "image/png", bytes: PNG_BYTES }
    }

    #[tokio::test]
    async fn accepted_upload_is_stored_in_page_order_and_dispatched() {
        let harness = TestHarness::builder().build().await;
        let token = harness.token(OWNER_ID);
        let pdf = FormPart::File {
            name: "files",
            filename: "p2.pdf",
            content_type: "application/pdf",
            bytes: b"%PDF-1.4",
        };

        let response = harness
            .app()
            .oneshot(multipart_request(
                URI,
                Some(&token),
                &[FormPart::Text { name: "test_id", value: TEST_ID }, png("p1.png"), pdf],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = read_json(response).await;
        assert_eq!(body["status"], "received");
        assert_eq!(body["files_uploaded"], 2);
        let upload_id = body["upload_id"].as_str().unwrap().to_string();

        let stored = harness.upload(&upload_id);
        assert_eq!(stored.status, PrintUploadStatus::Received);
        assert_eq!(
            stored.page_paths(),
            &[
                format!("{TEST_ID}/{OWNER_ID}/{upload_id}/page-1.png"),
                format!("{TEST_ID}/{OWNER_ID}/{upload_id}/page-2.pdf"),
            ]
        );
        let second = harness.pages.page(&stored.page_paths()[1]).unwrap();
        assert_eq!(second.media_type, "application/pdf");

        harness.wait_until(|| !harness.dispatcher.requests().is_empty()).await;
        assert_eq!(harness.dispatcher.requests(), vec![DispatchRequest::normal(&upload_id)]);
    }

    #[tokio::test]
    async fn dispatch_failure_parks_upload_in_error() {
        let harness = TestHarness::builder().failing_dispatch().build().await;
        let token = harness.token(OWNER_ID);

        let response = harness
            .app()
            .oneshot(multipart_request(
                URI,
                Some(&token),
                &[FormPart::Text { name: "test_id", value: TEST_ID }, png("p1.png")],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let upload_id = read_json(response).await["upload_id"].as_str().unwrap().to_string();
        harness.wait_for_status(&upload_id, PrintUploadStatus::Error).await;
        let error = harness.upload(&upload_id).error.unwrap();
        assert!(error.starts_with("processing trigger failed:"));
    }

    #[tokio::test]
    async fn disallowed_media_type_is_415_and_nothing_is_stored() {
        let harness = TestHarness::builder().build().await;
        let token = harness.token(OWNER_ID);
        let gif = FormPart::File {
            name: "files",
            filename: "sheet.gif",
            content_type: "image/gif",
            bytes: b"GIF89a",
        };

        let response = harness
            .app()
            .oneshot(multipart_request(
                URI,
                Some(&token),
                &[FormPart::Text { name: "test_id", value: TEST_ID }, gif],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert!(read_json(response).await["detail"].as_str().unwrap().contains("image/gif"));
        assert_eq!(harness.store.upload_count(), 0);
        assert!(harness.pages.keys().is_empty());
    }

    #[tokio::test]
    async fn oversize_file_is_413_naming_the_file() {
        let harness = TestHarness::builder().build().await;
        let token = harness.token(OWNER_ID);
        let big = vec![0u8; 10 * 1024 * 1024 + 1];
        let part = FormPart::File {
            name: "files",
            filename: "huge.jpg",
            content_type: "image/jpeg",
            bytes: &big,
        };

        let response = harness
            .app()
            .oneshot(multipart_request(
                URI,
                Some(&token),
                &[FormPart::Text { name: "test_id", value: TEST_ID }, part],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(read_json(response).await["detail"].as_str().unwrap().contains("huge.jpg"));
        assert_eq!(harness.store.upload_count(), 0);
    }

    #[tokio::test]
    async fn missing_files_or_test_id_is_400() {
        let harness = TestHarness::builder().build().await;
        let token = harness.token(OWNER_ID);

        let response = harness
            .app()
            .oneshot(multipart_request(
                URI,
                Some(&token),
                &[FormPart::Text { name: "test_id", value: TEST_ID }],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = harness
            .app()
            .oneshot(multipart_request(URI, Some(&token), &[png("p1.png")]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn files_before_test_id_are_rejected() {
        let harness = TestHarness::builder().build().await;
        let token = harness.token(OWNER_ID);

        let response = harness
            .app()
            .oneshot(multipart_request(
                URI,
                Some(&token),
                &[png("p1.png"), FormPart::Text { name: "test_id", value: TEST_ID }],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(read_json(response).await["detail"].as_str().unwrap().contains("before"));
        assert_eq!(harness.store.upload_count(), 0);
    }

    #[tokio::test]
    async fn access_is_refused_before_file_bodies_are_read() {
        let harness = TestHarness::builder().build().await;
        let token = harness.token(OTHER_ID);
        let big = vec![0u8; 10 * 1024 * 1024 + 1];
        let part = FormPart::File {
            name: "files",
            filename: "huge.jpg",
            content_type: "image/jpeg",
            bytes: &big,
        };

        let response = harness
            .app()
            .oneshot(multipart_request(
                URI,
                Some(&token),
                &[FormPart::Text { name: "test_id", value: TEST_ID }, part],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(harness.pages.keys().is_empty());
    }

    #[tokio::test]
    async fn unknown_test_is_404() {
        let harness = TestHarness::builder().build().await;
        let token = harness.token(OWNER_ID);

        let response = harness
            .app()
            .oneshot(multipart_request(
                URI,
                Some(&token),
                &[FormPart::Text { name: "test_id", value: "missing" }, png("p1.png")],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn private_test_of_another_owner_is_403() {
        let harness = TestHarness::builder().build().await;
        let token = harness.token(OTHER_ID);

        let response = harness
            .app()
            .oneshot(multipart_request(
                URI,
                Some(&token),
                &[FormPart::Text { name: "test_id", value: TEST_ID }, png("p1.png")],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(harness.store.upload_count(), 0);
    }

    #[tokio::test]
    async fn shared_test_accepts_other_users() {
        let harness = TestHarness::builder().build().await;
        harness.store.update_test(TEST_ID, |test| {
            test.visibility = crate::db::types::TestVisibility::Shared;
        });
        let token = harness.token(OTHER_ID);

        let response = harness
            .app()
            .oneshot(multipart_request(
                URI,
                Some(&token),
                &[FormPart::Text { name: "test_id", value: TEST_ID }, png("p1.png")],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn too_many_pages_is_400() {
        let harness = TestHarness::builder().build().await;
        let token = harness.token(OWNER_ID);
        let mut parts = vec![FormPart::Text { name: "test_id", value: TEST_ID }];
        for _ in 0..11 {
            parts.push(png("page.png"));
        }

        let response =
            harness.app().oneshot(multipart_request(URI, Some(&token), &parts)).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_storage_is_503() {
        let harness = TestHarness::builder().without_storage().build().await;
        let token = harness.token(OWNER_ID);

        let response = harness
            .app()
            .oneshot(multipart_request(
                URI,
                Some(&token),
                &[FormPart::Text { name: "test_id", value: TEST_ID }, png("p1.png")],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn stale_printed_layout_is_409() {
        let harness = TestHarness::builder().build().await;
        let token = harness.token(OWNER_ID);
        let test = harness.state.store().find_test(TEST_ID).await.unwrap().unwrap();
        let printed = build_qr_payload(&test, 1);
        harness.store.update_test(TEST_ID, |test| test.config.0.questions.reverse());
        let qr = serde_json::to_string(&printed).unwrap();

        let response = harness
            .app()
            .oneshot(multipart_request(
                URI,
                Some(&token),
                &[
                    FormPart::Text { name: "test_id", value: TEST_ID },
                    FormPart::Text { name: "qr_payload", value: &qr },
                    png("p1.png"),
                ],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(printed.layout_hash, layout_hash(&[101, 102, 103, 104, 105]));
        assert_eq!(harness.store.upload_count(), 0);
    }

    #[tokio::test]
    async fn matching_qr_payload_is_accepted_and_foreign_one_rejected() {
        let harness = TestHarness::builder().build().await;
        let token = harness.token(OWNER_ID);
        let test = harness.state.store().find_test(TEST_ID).await.unwrap().unwrap();
        let qr = serde_json::to_string(&build_qr_payload(&test, 1)).unwrap();

        let response = harness
            .app()
            .oneshot(multipart_request(
                URI,
                Some(&token),
                &[
                    FormPart::Text { name: "test_id", value: TEST_ID },
                    FormPart::Text { name: "qr_payload", value: &qr },
                    png("p1.png"),
                ],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let foreign = r#"{"test_id": "test-2", "version": 1}"#;
        let response = harness
            .app()
            .oneshot(multipart_request(
                URI,
                Some(&token),
                &[
                    FormPart::Text { name: "test_id", value: TEST_ID },
                    FormPart::Text { name: "qr_payload", value: foreign },
                    png("p1.png"),
                ],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
