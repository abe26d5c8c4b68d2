use anyhow::Result;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    // Versions: one row per (key, valid_from); the open row carries the sentinel
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entity_versions (
            entity_key TEXT NOT NULL,
            valid_from INTEGER NOT NULL,
            valid_to INTEGER NOT NULL,
            snapshot_json TEXT NOT NULL,
            PRIMARY KEY (entity_key, valid_from),
            CHECK (valid_from < valid_to)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(&format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_entity_versions_open \
         ON entity_versions(entity_key) WHERE valid_to = {}",
        crate::sqlite_store::OPEN_SENTINEL_MICROS
    ))
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vocabulary_terms (
            term_id INTEGER PRIMARY KEY,
            term TEXT NOT NULL UNIQUE
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS harvest_checkpoints (
            job TEXT NOT NULL,
            entity_key TEXT NOT NULL,
            status TEXT NOT NULL,
            payload_json TEXT NOT NULL DEFAULT 'null',
            detail TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (job, entity_key)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_harvest_checkpoints_status ON harvest_checkpoints(job, status)",
    )
    .execute(&pool)
    .await?;

    pool.close().await;
    Ok(())
}
