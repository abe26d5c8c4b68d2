//! Version and checkpoint repositories against a real SQLite file.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tempfile::TempDir;

use harvest_ledger::config::Config;
use harvest_ledger::db;
use harvest_ledger::migrate;
use harvest_ledger_core::error::{PersistenceError, VersioningError};
use harvest_ledger_core::harvest::{HarvestController, HarvestOptions, KeyProcessor};
use harvest_ledger_core::models::{CheckpointStatus, Outcome, Snapshot};
use harvest_ledger_core::store::CheckpointRepository;
use harvest_ledger_core::versioning::{check_history, VersionStore};

async fn setup(tmp: &TempDir) -> Config {
    let content = format!(
        r#"[db]
path = "{}/data/hl.sqlite"

[harvest]
job = "catalog"
"#,
        tmp.path().display()
    );
    let cfg: Config = toml::from_str(&content).unwrap();
    migrate::run_migrations(&cfg).await.unwrap();
    cfg
}

async fn checkpoints(cfg: &Config) -> Arc<dyn CheckpointRepository> {
    let pool = db::connect(cfg).await.unwrap();
    db::open_repositories(cfg, &pool).await.unwrap().checkpoints
}

#[tokio::test]
async fn test_sub_microsecond_change_is_non_monotonic() {
    let tmp = TempDir::new().unwrap();
    let cfg = setup(&tmp).await;
    let pool = db::connect(&cfg).await.unwrap();
    let store = VersionStore::new(db::open_repositories(&cfg, &pool).await.unwrap().versions);

    let t0 = DateTime::<Utc>::from_timestamp(1_741_564_800, 0).unwrap();
    store
        .upsert("A", Snapshot::new().with("x", 1.0), t0)
        .await
        .unwrap();
    let err = store
        .upsert("A", Snapshot::new().with("x", 2.0), t0 + Duration::nanoseconds(500))
        .await
        .unwrap_err();
    assert!(matches!(err, VersioningError::NonMonotonic { .. }), "{:?}", err);

    let history = store.history("A").await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].is_open());

    store
        .upsert("A", Snapshot::new().with("x", 2.0), t0 + Duration::microseconds(1))
        .await
        .unwrap();
    let history = store.history("A").await.unwrap();
    assert_eq!(history.len(), 2);
    check_history(&history).unwrap();
}

/// Runs a second worker over `other` to completion while the first worker
/// still holds the checkpoint map it loaded at start.
struct InterleavedWorker {
    other: Arc<dyn CheckpointRepository>,
}

struct Succeed;

#[async_trait]
impl KeyProcessor for Succeed {
    async fn process(&self, key: &str) -> Result<Outcome, PersistenceError> {
        Ok(Outcome::Success(serde_json::json!({ "key": key })))
    }
}

#[async_trait]
impl KeyProcessor for InterleavedWorker {
    async fn process(&self, key: &str) -> Result<Outcome, PersistenceError> {
        let options = HarvestOptions {
            flush_every: 1,
            chunk_size: 10,
        };
        HarvestController::new(self.other.clone())
            .run(&["b".to_string()], &Succeed, &options)
            .await
            .map_err(|e| PersistenceError::backend("checkpoints", e))?;
        Ok(Outcome::Success(serde_json::json!({ "key": key })))
    }
}

#[tokio::test]
async fn test_workers_sharing_a_job_keep_each_others_checkpoints() {
    let tmp = TempDir::new().unwrap();
    let cfg = setup(&tmp).await;

    let worker_a = checkpoints(&cfg).await;
    let worker_b = checkpoints(&cfg).await;
    let options = HarvestOptions {
        flush_every: 1,
        chunk_size: 10,
    };
    HarvestController::new(worker_a)
        .run(
            &["a".to_string()],
            &InterleavedWorker { other: worker_b },
            &options,
        )
        .await
        .unwrap();

    let entries = checkpoints(&cfg).await.load().await.unwrap();
    let mut durable: Vec<String> = entries.keys().cloned().collect();
    durable.sort();
    assert_eq!(durable, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(entries["b"].status, CheckpointStatus::Success);
}

#[tokio::test]
async fn test_checkpoint_save_overwrites_only_named_keys() {
    let tmp = TempDir::new().unwrap();
    let cfg = setup(&tmp).await;
    let repo = checkpoints(&cfg).await;
    let controller = HarvestController::new(repo.clone());
    let options = HarvestOptions::default();

    controller
        .run(&["a".to_string(), "b".to_string()], &Succeed, &options)
        .await
        .unwrap();
    controller.reset(&["a".to_string()]).await.unwrap();
    let report = controller
        .run(&["a".to_string()], &Succeed, &options)
        .await
        .unwrap();
    assert_eq!(report.processed, 1);

    let entries = repo.load().await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries["a"].attempts, 1);
    assert_eq!(entries["b"].attempts, 1);
}
