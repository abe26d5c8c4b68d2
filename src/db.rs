use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use harvest_ledger_core::store::{CheckpointRepository, VersionRepository, VocabularyRepository};

use crate::config::Config;
use crate::file_store::{JsonFileCheckpoints, JsonFileVocabulary};
use crate::sqlite_store::{SqliteCheckpoints, SqliteVersions, SqliteVocabulary};

pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db_path = &config.db.path;

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(10));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// The three repositories a command works against, chosen from `[storage]`.
pub struct Repositories {
    pub versions: Arc<dyn VersionRepository>,
    pub vocabulary: Arc<dyn VocabularyRepository>,
    pub checkpoints: Arc<dyn CheckpointRepository>,
}

pub async fn open_repositories(config: &Config, pool: &SqlitePool) -> Result<Repositories> {
    let vocabulary: Arc<dyn VocabularyRepository> = match &config.storage.vocabulary_file {
        Some(path) => Arc::new(JsonFileVocabulary::open(path).await?),
        None => Arc::new(SqliteVocabulary::new(pool.clone())),
    };
    let checkpoints: Arc<dyn CheckpointRepository> = match &config.storage.checkpoint_file {
        Some(path) => Arc::new(JsonFileCheckpoints::new(path)),
        None => Arc::new(SqliteCheckpoints::new(pool.clone(), &config.harvest.job)),
    };
    Ok(Repositories {
        versions: Arc::new(SqliteVersions::new(pool.clone())),
        vocabulary,
        checkpoints,
    })
}
