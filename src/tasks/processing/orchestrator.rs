use std::time::Instant;

use thiserror::Error;

use crate::core::metrics;
use crate::core::state::AppState;
use crate::core::time::primitive_now_utc;
use crate::db::models::PrintUpload;
use crate::db::types::PrintUploadStatus;
use crate::repositories::store::{order_answer_key, CommitOutcome, GradingCommit, NewItemAttempted};
use crate::schemas::print::Detection;
use crate::services::grading::{self, ConfidencePolicy};
use crate::services::vision::{PageImage, SheetMeta, VisionError};

use super::{ClaimedRun, RunMode};

/// Failures that end a run in `error`. The `Display` text is what reviewers see on the upload.
#[derive(Debug, Error)]
pub(crate) enum PipelineError {
    #[error("upload {0} not found")]
    UploadNotFound(String),
    #[error("test {0} not found")]
    TestNotFound(String),
    #[error("answer key incomplete: question {0} not found")]
    MissingQuestion(i64),
    #[error("upload has no page files")]
    NoPages,
    #[error("page storage is not configured")]
    StorageUnavailable,
    #[error("failed to download page {page}: {reason}")]
    Download { page: usize, reason: String },
    #[error(transparent)]
    Vision(#[from] VisionError),
    #[error("stored detection is invalid: {0}")]
    StoredDetection(String),
    #[error("database error: {0}")]
    Database(String),
}

impl PipelineError {
    fn database(err: anyhow::Error) -> Self {
        Self::Database(format!("{err:#}"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RunOutcome {
    Completed { status: PrintUploadStatus, attempt_id: String },
    Failed { message: String },
    /// A newer claim owns the upload; nothing from this run was written.
    Superseded,
}

impl RunOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Completed { status: PrintUploadStatus::NeedsReview, .. } => "needs_review",
            Self::Completed { .. } => "graded",
            Self::Failed { .. } => "error",
            Self::Superseded => "superseded",
        }
    }
}

/// Runs one claimed upload to a terminal state. Never returns an error: failures are
/// recorded on the upload.
pub(crate) async fn execute(state: &AppState, run: &ClaimedRun) -> RunOutcome {
    let timer = Instant::now();

    let outcome = match prepare_commit(state, run).await {
        Ok(commit) => {
            let status = commit.status;
            match state.store().commit_grading(commit).await {
                Ok(CommitOutcome::Committed { attempt_id }) => {
                    RunOutcome::Completed { status, attempt_id }
                }
                Ok(CommitOutcome::Superseded) => RunOutcome::Superseded,
                Err(err) => record_failure(state, run, PipelineError::database(err)).await,
            }
        }
        Err(err) => record_failure(state, run, err).await,
    };

    metrics::record_run(outcome.label(), timer.elapsed());
    match &outcome {
        RunOutcome::Completed { status, attempt_id } => tracing::info!(
            upload_id = %run.upload_id,
            generation = run.generation,
            status = status.as_str(),
            attempt_id = %attempt_id,
            "Print upload graded"
        ),
        RunOutcome::Failed { message } => tracing::warn!(
            upload_id = %run.upload_id,
            generation = run.generation,
            error = %message,
            "Print upload failed"
        ),
        RunOutcome::Superseded => tracing::info!(
            upload_id = %run.upload_id,
            generation = run.generation,
            "Print run superseded by a newer claim"
        ),
    }

    outcome
}

async fn record_failure(state: &AppState, run: &ClaimedRun, err: PipelineError) -> RunOutcome {
    let message = err.to_string();
    match state
        .store()
        .fail_run(&run.upload_id, run.generation, &message, primitive_now_utc())
        .await
    {
        Ok(true) => RunOutcome::Failed { message },
        Ok(false) => RunOutcome::Superseded,
        Err(store_err) => {
            tracing::error!(
                upload_id = %run.upload_id,
                error = %store_err,
                "Failed to record processing failure"
            );
            RunOutcome::Failed { message }
        }
    }
}

async fn prepare_commit(state: &AppState, run: &ClaimedRun) -> Result<GradingCommit, PipelineError> {
    let store = state.store();
    let upload = store
        .find_upload(&run.upload_id)
        .await
        .map_err(PipelineError::database)?
        .ok_or_else(|| PipelineError::UploadNotFound(run.upload_id.clone()))?;
    let test = store
        .find_test(&upload.test_id)
        .await
        .map_err(PipelineError::database)?
        .ok_or_else(|| PipelineError::TestNotFound(upload.test_id.clone()))?;

    let question_ids = test.question_ids();
    let rows = store.answer_keys(question_ids).await.map_err(PipelineError::database)?;
    let key = order_answer_key(question_ids, rows).map_err(PipelineError::MissingQuestion)?;

    let mut detection = match (run.mode, upload.detection()) {
        (RunMode::Forced { rerun_detection: false }, Some(stored)) => {
            stored.check_bounds().map_err(PipelineError::StoredDetection)?;
            stored.clone()
        }
        _ => detect(state, &upload, key.len()).await?,
    };

    let report = grading::grade(&key, &detection.answers);
    for q in &report.skipped {
        let note = format!("question {q} is outside 1..={} and was not graded", key.len());
        if !detection.warnings.contains(&note) {
            detection.warnings.push(note);
        }
    }

    let policy = ConfidencePolicy::new(state.settings().pipeline().review_confidence_threshold);
    let status = policy.terminal_status(&detection.answers);

    Ok(GradingCommit {
        upload_id: upload.id.clone(),
        generation: run.generation,
        status,
        score: report.score,
        summary: report.summary(),
        items: report
            .items
            .iter()
            .map(|item| NewItemAttempted {
                question_id: item.question_id,
                selected_index: item.selected_index,
                correct: item.correct,
            })
            .collect(),
        detected: detection,
        completed_at: primitive_now_utc(),
    })
}

async fn detect(
    state: &AppState,
    upload: &PrintUpload,
    question_count: usize,
) -> Result<Detection, PipelineError> {
    let paths = upload.page_paths();
    if paths.is_empty() {
        return Err(PipelineError::NoPages);
    }
    let page_store = state.pages().ok_or(PipelineError::StorageUnavailable)?;

    let mut pages = Vec::with_capacity(paths.len());
    for (index, path) in paths.iter().enumerate() {
        let page = page_store.get_page(path).await.map_err(|err| PipelineError::Download {
            page: index + 1,
            reason: format!("{err:#}"),
        })?;
        pages.push(PageImage { bytes: page.bytes, media_type: page.media_type });
    }

    let detection =
        state.vision().detect(pages, SheetMeta { question_count, start_index: 1 }).await?;
    // Adapters other than the HTTP one are held to the same bounds.
    detection.check_bounds().map_err(VisionError::Malformed)?;
    Ok(detection)
}
