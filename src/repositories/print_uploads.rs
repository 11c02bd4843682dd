use sqlx::types::Json;
use sqlx::PgPool;
use time::PrimitiveDateTime;
use uuid::Uuid;

use crate::db::models::PrintUpload;
use crate::db::types::PrintUploadStatus;
use crate::repositories::attempts;
use crate::repositories::store::{CommitOutcome, GradingCommit, NewPrintUpload, StaleUpload};
use crate::schemas::print::Detection;

const COLUMNS: &str = "\
    id, test_id, user_id, attempt_id, status, upload_urls, detected, error, \
    generation, created_at, updated_at";

pub(crate) async fn insert(
    pool: &PgPool,
    params: NewPrintUpload,
) -> Result<PrintUpload, sqlx::Error> {
    sqlx::query_as::<_, PrintUpload>(&format!(
        "INSERT INTO print_uploads (
            id, test_id, user_id, status, upload_urls, generation, created_at, updated_at
         ) VALUES ($1,$2,$3,$4,$5,0,$6,$6)
         RETURNING {COLUMNS}"
    ))
    .bind(&params.id)
    .bind(&params.test_id)
    .bind(&params.user_id)
    .bind(PrintUploadStatus::Received)
    .bind(Json(&params.upload_urls))
    .bind(params.created_at)
    .fetch_one(pool)
    .await
}

pub(crate) async fn find_by_id(
    pool: &PgPool,
    id: &str,
) -> Result<Option<PrintUpload>, sqlx::Error> {
    sqlx::query_as::<_, PrintUpload>(&format!("SELECT {COLUMNS} FROM print_uploads WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await
}

fn status_labels(statuses: &[PrintUploadStatus]) -> Vec<String> {
    statuses.iter().map(|status| status.as_str().to_string()).collect()
}

pub(crate) async fn list_by_statuses(
    pool: &PgPool,
    statuses: &[PrintUploadStatus],
    skip: i64,
    limit: i64,
) -> Result<Vec<PrintUpload>, sqlx::Error> {
    sqlx::query_as::<_, PrintUpload>(&format!(
        "SELECT {COLUMNS} FROM print_uploads
         WHERE status::text = ANY($1)
         ORDER BY created_at DESC, id
         OFFSET $2 LIMIT $3"
    ))
    .bind(status_labels(statuses))
    .bind(skip)
    .bind(limit)
    .fetch_all(pool)
    .await
}

pub(crate) async fn count_by_statuses(
    pool: &PgPool,
    statuses: &[PrintUploadStatus],
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM print_uploads WHERE status::text = ANY($1)")
        .bind(status_labels(statuses))
        .fetch_one(pool)
        .await
}

/// Atomic `received -> processing` transition. `None` means another caller won.
pub(crate) async fn claim_received(
    pool: &PgPool,
    id: &str,
    now: PrimitiveDateTime,
) -> Result<Option<i64>, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        "UPDATE print_uploads
         SET status = $1,
             generation = generation + 1,
             error = NULL,
             updated_at = $2
         WHERE id = $3 AND status = $4
         RETURNING generation",
    )
    .bind(PrintUploadStatus::Processing)
    .bind(now)
    .bind(id)
    .bind(PrintUploadStatus::Received)
    .fetch_optional(pool)
    .await
}

pub(crate) async fn claim_forced(
    pool: &PgPool,
    id: &str,
    now: PrimitiveDateTime,
) -> Result<Option<i64>, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        "UPDATE print_uploads
         SET status = $1,
             generation = generation + 1,
             error = NULL,
             updated_at = $2
         WHERE id = $3
         RETURNING generation",
    )
    .bind(PrintUploadStatus::Processing)
    .bind(now)
    .bind(id)
    .fetch_optional(pool)
    .await
}

pub(crate) async fn apply_correction(
    pool: &PgPool,
    id: &str,
    detected: &Detection,
    now: PrimitiveDateTime,
) -> Result<Option<i64>, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        "UPDATE print_uploads
         SET detected = $1,
             status = $2,
             generation = generation + 1,
             error = NULL,
             updated_at = $3
         WHERE id = $4 AND status NOT IN ($5, $2)
         RETURNING generation",
    )
    .bind(Json(detected))
    .bind(PrintUploadStatus::Processing)
    .bind(now)
    .bind(id)
    .bind(PrintUploadStatus::Received)
    .fetch_optional(pool)
    .await
}

pub(crate) async fn fail_run(
    pool: &PgPool,
    id: &str,
    generation: i64,
    message: &str,
    now: PrimitiveDateTime,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE print_uploads
         SET status = $1,
             error = $2,
             updated_at = $3
         WHERE id = $4 AND generation = $5 AND status = $6",
    )
    .bind(PrintUploadStatus::Error)
    .bind(message)
    .bind(now)
    .bind(id)
    .bind(generation)
    .bind(PrintUploadStatus::Processing)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub(crate) async fn mark_dispatch_failed(
    pool: &PgPool,
    id: &str,
    generation: i64,
    message: &str,
    now: PrimitiveDateTime,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE print_uploads
         SET status = $1,
             error = $2,
             updated_at = $3
         WHERE id = $4 AND generation = $5 AND status IN ($6, $7)",
    )
    .bind(PrintUploadStatus::Error)
    .bind(message)
    .bind(now)
    .bind(id)
    .bind(generation)
    .bind(PrintUploadStatus::Received)
    .bind(PrintUploadStatus::Processing)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub(crate) async fn list_stale(
    pool: &PgPool,
    status: PrintUploadStatus,
    updated_before: PrimitiveDateTime,
    limit: i64,
) -> Result<Vec<StaleUpload>, sqlx::Error> {
    let rows = sqlx::query_as::<_, (String, i64)>(
        "SELECT id, generation FROM print_uploads
         WHERE status = $1 AND updated_at < $2
         ORDER BY updated_at
         LIMIT $3",
    )
    .bind(status)
    .bind(updated_before)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|(id, generation)| StaleUpload { id, generation }).collect())
}

/// Writes the attempt, its items and the upload's terminal state in one transaction,
/// but only while the run still owns the upload's current generation.
pub(crate) async fn commit_grading(
    pool: &PgPool,
    commit: &GradingCommit,
) -> Result<CommitOutcome, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let current = sqlx::query_as::<_, PrintUpload>(&format!(
        "SELECT {COLUMNS} FROM print_uploads WHERE id = $1 FOR UPDATE"
    ))
    .bind(&commit.upload_id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(current) = current else {
        tx.rollback().await?;
        return Ok(CommitOutcome::Superseded);
    };

    if current.generation != commit.generation || current.status != PrintUploadStatus::Processing
    {
        tx.rollback().await?;
        return Ok(CommitOutcome::Superseded);
    }

    let attempt_id = match current.attempt_id.clone() {
        Some(existing) => existing,
        None => {
            let attempt_id = Uuid::new_v4().to_string();
            attempts::insert(
                &mut tx,
                &attempt_id,
                &current.test_id,
                &current.user_id,
                current.created_at,
            )
            .await?;
            attempt_id
        }
    };

    attempts::replace_items(&mut tx, &attempt_id, &commit.items).await?;
    attempts::finalize(&mut tx, &attempt_id, commit.score, &commit.summary, commit.completed_at)
        .await?;

    sqlx::query(
        "UPDATE print_uploads
         SET status = $1,
             detected = $2,
             error = NULL,
             attempt_id = $3,
             updated_at = $4
         WHERE id = $5",
    )
    .bind(commit.status)
    .bind(Json(&commit.detected))
    .bind(&attempt_id)
    .bind(commit.completed_at)
    .bind(&commit.upload_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(CommitOutcome::Committed { attempt_id })
}
