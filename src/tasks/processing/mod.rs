//! Processing orchestrator for print uploads.
//!
//! A run starts with a claim: one conditional write that moves the upload to `processing` and
//! bumps its `generation`. The run then owns that generation, and every later write it makes
//! is discarded if a newer claim (a forced reprocess, a correction) has happened since.

mod orchestrator;
pub(crate) mod reconcile;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::core::state::AppState;
use crate::core::time::primitive_now_utc;

pub(crate) use orchestrator::{execute, RunOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunMode {
    /// Automatic signal; only an upload still in `received` is taken.
    Normal,
    /// Human-initiated; takes the upload from any status. Stored detections are re-graded
    /// as written unless `rerun_detection` asks for a fresh read of the pages.
    Forced { rerun_detection: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ClaimedRun {
    pub(crate) upload_id: String,
    pub(crate) generation: i64,
    pub(crate) mode: RunMode,
}

#[derive(Debug, Error)]
pub(crate) enum ClaimError {
    #[error("upload {0} not found")]
    NotFound(String),
    #[error("upload {0} already processed")]
    AlreadyClaimed(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub(crate) async fn claim(
    state: &AppState,
    upload_id: &str,
    mode: RunMode,
) -> Result<ClaimedRun, ClaimError> {
    let store = state.store();
    let now = primitive_now_utc();

    let generation = match mode {
        RunMode::Normal => match store.claim_received(upload_id, now).await? {
            Some(generation) => generation,
            None if store.find_upload(upload_id).await?.is_some() => {
                return Err(ClaimError::AlreadyClaimed(upload_id.to_string()));
            }
            None => return Err(ClaimError::NotFound(upload_id.to_string())),
        },
        RunMode::Forced { .. } => store
            .claim_forced(upload_id, now)
            .await?
            .ok_or_else(|| ClaimError::NotFound(upload_id.to_string()))?,
    };

    tracing::info!(upload_id, generation, mode = ?mode, "Claimed print upload");
    Ok(ClaimedRun { upload_id: upload_id.to_string(), generation, mode })
}

pub(crate) fn spawn_run(state: AppState, run: ClaimedRun) -> JoinHandle<RunOutcome> {
    let span = tracing::info_span!(
        "print_run",
        upload_id = %run.upload_id,
        generation = run.generation
    );
    tokio::spawn(async move { execute(&state, &run).await }.instrument(span))
}
