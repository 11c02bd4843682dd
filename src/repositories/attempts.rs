use sqlx::types::Json;
use sqlx::PgConnection;
use time::PrimitiveDateTime;

use crate::repositories::store::NewItemAttempted;

pub(crate) async fn insert(
    conn: &mut PgConnection,
    id: &str,
    test_id: &str,
    user_id: &str,
    started_at: PrimitiveDateTime,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO attempts (id, test_id, user_id, started_at)
         VALUES ($1,$2,$3,$4)",
    )
    .bind(id)
    .bind(test_id)
    .bind(user_id)
    .bind(started_at)
    .execute(conn)
    .await?;

    Ok(())
}

/// Drops every item row of the attempt and writes the new set.
pub(crate) async fn replace_items(
    conn: &mut PgConnection,
    attempt_id: &str,
    items: &[NewItemAttempted],
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM items_attempted WHERE attempt_id = $1")
        .bind(attempt_id)
        .execute(&mut *conn)
        .await?;

    for item in items {
        sqlx::query(
            "INSERT INTO items_attempted (attempt_id, question_id, selected_index, correct, time_ms)
             VALUES ($1,$2,$3,$4,0)",
        )
        .bind(attempt_id)
        .bind(item.question_id)
        .bind(item.selected_index)
        .bind(item.correct)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

pub(crate) async fn finalize(
    conn: &mut PgConnection,
    attempt_id: &str,
    score: f64,
    summary: &serde_json::Value,
    submitted_at: PrimitiveDateTime,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE attempts
         SET score = $1,
             summary = $2,
             submitted_at = $3
         WHERE id = $4",
    )
    .bind(score)
    .bind(Json(summary))
    .bind(submitted_at)
    .bind(attempt_id)
    .execute(conn)
    .await?;

    Ok(())
}
