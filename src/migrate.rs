use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    ensure_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create the object table and its indexes. Idempotent.
pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    // One row per object; every bucket shares the table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS objects (
            bucket TEXT NOT NULL,
            path TEXT NOT NULL,
            body BLOB NOT NULL,
            content_type TEXT NOT NULL,
            content_encoding TEXT,
            content_language TEXT,
            custom_time INTEGER,
            updated_at INTEGER NOT NULL,
            size INTEGER NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            PRIMARY KEY (bucket, path)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_objects_custom_time ON objects(bucket, custom_time)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
