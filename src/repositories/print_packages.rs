use sqlx::PgPool;

use crate::db::models::PrintPackage;

const COLUMNS: &str = "id, test_id, version, layout_hash, qr_payload, created_by, created_at";

pub(crate) async fn find_latest(
    pool: &PgPool,
    test_id: &str,
) -> Result<Option<PrintPackage>, sqlx::Error> {
    sqlx::query_as::<_, PrintPackage>(&format!(
        "SELECT {COLUMNS} FROM print_packages
         WHERE test_id = $1
         ORDER BY version DESC
         LIMIT 1"
    ))
    .bind(test_id)
    .fetch_optional(pool)
    .await
}

pub(crate) async fn insert(
    pool: &PgPool,
    package: &PrintPackage,
) -> Result<PrintPackage, sqlx::Error> {
    sqlx::query_as::<_, PrintPackage>(&format!(
        "INSERT INTO print_packages ({COLUMNS})
         VALUES ($1,$2,$3,$4,$5,$6,$7)
         RETURNING {COLUMNS}"
    ))
    .bind(&package.id)
    .bind(&package.test_id)
    .bind(package.version)
    .bind(&package.layout_hash)
    .bind(&package.qr_payload)
    .bind(&package.created_by)
    .bind(package.created_at)
    .fetch_one(pool)
    .await
}
