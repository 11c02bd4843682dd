use sqlx::PgPool;

use crate::db::models::AnswerKeyRow;

/// Rows come back in arbitrary order; callers re-sort by the test's own ordering.
pub(crate) async fn list_answer_keys(
    pool: &PgPool,
    ids: &[i64],
) -> Result<Vec<AnswerKeyRow>, sqlx::Error> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    sqlx::query_as::<_, AnswerKeyRow>(
        "SELECT id, subject, correct_index FROM questions WHERE id = ANY($1)",
    )
    .bind(ids)
    .fetch_all(pool)
    .await
}
