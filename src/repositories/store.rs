use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use sqlx::PgPool;
use time::PrimitiveDateTime;

use crate::db::models::{AnswerKeyRow, PrintPackage, PrintUpload, Test, User};
use crate::db::types::PrintUploadStatus;
use crate::repositories;
use crate::schemas::print::Detection;

#[derive(Debug, Clone)]
pub(crate) struct NewPrintUpload {
    pub(crate) id: String,
    pub(crate) test_id: String,
    pub(crate) user_id: String,
    pub(crate) upload_urls: Vec<String>,
    pub(crate) created_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct NewItemAttempted {
    pub(crate) question_id: i64,
    pub(crate) selected_index: i32,
    pub(crate) correct: bool,
}

/// Everything a finished run writes, tagged with the generation it claimed.
#[derive(Debug, Clone)]
pub(crate) struct GradingCommit {
    pub(crate) upload_id: String,
    pub(crate) generation: i64,
    pub(crate) status: PrintUploadStatus,
    pub(crate) detected: Detection,
    pub(crate) score: f64,
    pub(crate) summary: serde_json::Value,
    pub(crate) items: Vec<NewItemAttempted>,
    pub(crate) completed_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CommitOutcome {
    Committed { attempt_id: String },
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StaleUpload {
    pub(crate) id: String,
    pub(crate) generation: i64,
}

/// Persistence seam for the print pipeline.
///
/// Every status transition a run can race on is a single conditional write here,
/// so callers never read-then-write a status.
#[async_trait]
pub(crate) trait PrintStore: Send + Sync {
    async fn health_check(&self) -> anyhow::Result<()>;

    async fn find_user(&self, id: &str) -> anyhow::Result<Option<User>>;

    async fn find_test(&self, id: &str) -> anyhow::Result<Option<Test>>;

    /// Answer key rows for the given question ids. Order is not guaranteed.
    async fn answer_keys(&self, question_ids: &[i64]) -> anyhow::Result<Vec<AnswerKeyRow>>;

    async fn insert_upload(&self, upload: NewPrintUpload) -> anyhow::Result<PrintUpload>;

    async fn find_upload(&self, id: &str) -> anyhow::Result<Option<PrintUpload>>;

    /// Newest first, with the total count for the filter.
    async fn list_uploads(
        &self,
        statuses: &[PrintUploadStatus],
        skip: i64,
        limit: i64,
    ) -> anyhow::Result<(Vec<PrintUpload>, i64)>;

    /// `received -> processing`; returns the new generation, `None` if the upload was not `received`.
    async fn claim_received(&self, id: &str, now: PrimitiveDateTime)
        -> anyhow::Result<Option<i64>>;

    /// Any status -> `processing`; `None` only when the upload does not exist.
    async fn claim_forced(&self, id: &str, now: PrimitiveDateTime) -> anyhow::Result<Option<i64>>;

    /// Stores a manual detection and moves the upload to `processing`.
    /// `None` when the upload is missing or already in flight.
    async fn apply_correction(
        &self,
        id: &str,
        detected: &Detection,
        now: PrimitiveDateTime,
    ) -> anyhow::Result<Option<i64>>;

    /// Moves a run's upload to `error`; no-op unless the generation still matches.
    async fn fail_run(
        &self,
        id: &str,
        generation: i64,
        message: &str,
        now: PrimitiveDateTime,
    ) -> anyhow::Result<bool>;

    async fn mark_dispatch_failed(
        &self,
        id: &str,
        generation: i64,
        message: &str,
        now: PrimitiveDateTime,
    ) -> anyhow::Result<bool>;

    async fn commit_grading(&self, commit: GradingCommit) -> anyhow::Result<CommitOutcome>;

    async fn list_stale(
        &self,
        status: PrintUploadStatus,
        updated_before: PrimitiveDateTime,
        limit: i64,
    ) -> anyhow::Result<Vec<StaleUpload>>;

    async fn latest_package(&self, test_id: &str) -> anyhow::Result<Option<PrintPackage>>;

    async fn insert_package(&self, package: PrintPackage) -> anyhow::Result<PrintPackage>;
}

/// Orders answer-key rows by the test's question list. Fails on the first id the bank lacks.
pub(crate) fn order_answer_key(
    question_ids: &[i64],
    rows: Vec<AnswerKeyRow>,
) -> Result<Vec<AnswerKeyRow>, i64> {
    let by_id: HashMap<i64, AnswerKeyRow> = rows.into_iter().map(|row| (row.id, row)).collect();
    question_ids.iter().map(|id| by_id.get(id).cloned().ok_or(*id)).collect()
}

#[derive(Clone)]
pub(crate) struct PgPrintStore {
    pool: PgPool,
}

impl PgPrintStore {
    pub(crate) fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PrintStore for PgPrintStore {
    async fn health_check(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn find_user(&self, id: &str) -> anyhow::Result<Option<User>> {
        repositories::users::find_by_id(&self.pool, id).await.context("Failed to load user")
    }

    async fn find_test(&self, id: &str) -> anyhow::Result<Option<Test>> {
        repositories::tests::find_by_id(&self.pool, id).await.context("Failed to load test")
    }

    async fn answer_keys(&self, question_ids: &[i64]) -> anyhow::Result<Vec<AnswerKeyRow>> {
        repositories::questions::list_answer_keys(&self.pool, question_ids)
            .await
            .context("Failed to load answer key")
    }

    async fn insert_upload(&self, upload: NewPrintUpload) -> anyhow::Result<PrintUpload> {
        repositories::print_uploads::insert(&self.pool, upload)
            .await
            .context("Failed to insert print upload")
    }

    async fn find_upload(&self, id: &str) -> anyhow::Result<Option<PrintUpload>> {
        repositories::print_uploads::find_by_id(&self.pool, id)
            .await
            .context("Failed to load print upload")
    }

    async fn list_uploads(
        &self,
        statuses: &[PrintUploadStatus],
        skip: i64,
        limit: i64,
    ) -> anyhow::Result<(Vec<PrintUpload>, i64)> {
        let items =
            repositories::print_uploads::list_by_statuses(&self.pool, statuses, skip, limit)
                .await
                .context("Failed to list print uploads")?;
        let total = repositories::print_uploads::count_by_statuses(&self.pool, statuses)
            .await
            .context("Failed to count print uploads")?;
        Ok((items, total))
    }

    async fn claim_received(
        &self,
        id: &str,
        now: PrimitiveDateTime,
    ) -> anyhow::Result<Option<i64>> {
        repositories::print_uploads::claim_received(&self.pool, id, now)
            .await
            .context("Failed to claim print upload")
    }

    async fn claim_forced(&self, id: &str, now: PrimitiveDateTime) -> anyhow::Result<Option<i64>> {
        repositories::print_uploads::claim_forced(&self.pool, id, now)
            .await
            .context("Failed to claim print upload for reprocessing")
    }

    async fn apply_correction(
        &self,
        id: &str,
        detected: &Detection,
        now: PrimitiveDateTime,
    ) -> anyhow::Result<Option<i64>> {
        repositories::print_uploads::apply_correction(&self.pool, id, detected, now)
            .await
            .context("Failed to store corrected answers")
    }

    async fn fail_run(
        &self,
        id: &str,
        generation: i64,
        message: &str,
        now: PrimitiveDateTime,
    ) -> anyhow::Result<bool> {
        repositories::print_uploads::fail_run(&self.pool, id, generation, message, now)
            .await
            .context("Failed to record processing failure")
    }

    async fn mark_dispatch_failed(
        &self,
        id: &str,
        generation: i64,
        message: &str,
        now: PrimitiveDateTime,
    ) -> anyhow::Result<bool> {
        repositories::print_uploads::mark_dispatch_failed(&self.pool, id, generation, message, now)
            .await
            .context("Failed to record dispatch failure")
    }

    async fn commit_grading(&self, commit: GradingCommit) -> anyhow::Result<CommitOutcome> {
        repositories::print_uploads::commit_grading(&self.pool, &commit)
            .await
            .context("Failed to commit grading result")
    }

    async fn list_stale(
        &self,
        status: PrintUploadStatus,
        updated_before: PrimitiveDateTime,
        limit: i64,
    ) -> anyhow::Result<Vec<StaleUpload>> {
        repositories::print_uploads::list_stale(&self.pool, status, updated_before, limit)
            .await
            .context("Failed to list stale print uploads")
    }

    async fn latest_package(&self, test_id: &str) -> anyhow::Result<Option<PrintPackage>> {
        repositories::print_packages::find_latest(&self.pool, test_id)
            .await
            .context("Failed to load print package")
    }

    async fn insert_package(&self, package: PrintPackage) -> anyhow::Result<PrintPackage> {
        repositories::print_packages::insert(&self.pool, &package)
            .await
            .context("Failed to insert print package")
    }
}
