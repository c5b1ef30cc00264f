//! Database schema migrations (idempotent).

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create tables and indexes on an open pool.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    // Fields and line items live in JSON columns on the row itself, so a
    // versioned patch touches exactly one row and deleting a record deletes
    // its line items.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS extraction_records (
            id TEXT PRIMARY KEY,
            document_fingerprint TEXT NOT NULL,
            processing_state TEXT NOT NULL DEFAULT 'PENDING'
                CHECK (processing_state IN
                    ('PENDING', 'PROCESSING', 'EXTRACTED', 'VALIDATED', 'STAGED', 'ERROR')),
            review_version INTEGER NOT NULL DEFAULT 0 CHECK (review_version >= 0),
            fields_json TEXT NOT NULL DEFAULT '{}',
            line_items_json TEXT NOT NULL DEFAULT '[]',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_records_state ON extraction_records(processing_state)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_records_fingerprint ON extraction_records(document_fingerprint)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
