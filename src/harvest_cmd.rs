//! `hl harvest`: fetch every candidate key, fold its records into a
//! snapshot, and record the snapshot in the version history.
//!
//! Each key is one unit of work for the [`HarvestController`]:
//!
//! ```text
//! fetch_all(key) ─► no records?      ─► permanent_skip
//!        │          fetch error      ─► transient_failure | permanent_skip
//!        ▼
//! SnapshotBuilder (interns tag fields)
//!        ▼
//! VersionStore::observe ─► inserted | updated | unchanged ─► success
//! ```
//!
//! Re-running a key is harmless: an identical snapshot is a no-op upsert.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;

use harvest_ledger_core::error::{PersistenceError, VersioningError};
use harvest_ledger_core::fetch::PageSource;
use harvest_ledger_core::harvest::{HarvestController, HarvestOptions, HarvestReport, KeyProcessor};
use harvest_ledger_core::models::{CheckpointStatus, Outcome};
use harvest_ledger_core::versioning::VersionStore;
use harvest_ledger_core::vocabulary::Vocabulary;

use crate::config::Config;
use crate::connector_http::HttpPageSource;
use crate::db;
use crate::fetch::{fetch_all, FetchPolicy};
use crate::progress::{HarvestProgressEvent, HarvestProgressReporter};
use crate::snapshot::SnapshotBuilder;

/// Command-line overrides for `[harvest]`.
#[derive(Debug, Clone, Default)]
pub struct HarvestOverrides {
    pub flush_every: Option<usize>,
    pub chunk_size: Option<usize>,
}

impl HarvestOverrides {
    pub fn apply(&self, config: &Config) -> HarvestOptions {
        HarvestOptions {
            flush_every: self.flush_every.unwrap_or(config.harvest.flush_every),
            chunk_size: self.chunk_size.unwrap_or(config.harvest.chunk_size),
        }
    }
}

pub struct CatalogProcessor<'a> {
    source: Arc<dyn PageSource>,
    policy: FetchPolicy,
    builder: SnapshotBuilder,
    vocab: &'a Vocabulary,
    store: &'a VersionStore,
    progress: &'a dyn HarvestProgressReporter,
    job: String,
    total: u64,
    done: AtomicU64,
}

#[async_trait]
impl KeyProcessor for CatalogProcessor<'_> {
    async fn process(&self, key: &str) -> Result<Outcome, PersistenceError> {
        let outcome = self.process_key(key).await?;
        let n = self.done.fetch_add(1, Ordering::SeqCst) + 1;
        self.progress.report(HarvestProgressEvent::Processed {
            job: self.job.clone(),
            key: key.to_string(),
            status: outcome.status().as_str(),
            n,
            total: self.total,
        });
        Ok(outcome)
    }
}

impl CatalogProcessor<'_> {
    async fn process_key(&self, key: &str) -> Result<Outcome, PersistenceError> {
        let fetched = match fetch_all(self.source.as_ref(), key, &self.policy).await {
            Ok(fetched) => fetched,
            Err(e) => return Ok(e.into_outcome()),
        };

        if fetched.records.is_empty() {
            return Ok(Outcome::PermanentSkip("no records".to_string()));
        }

        let snapshot = self.builder.build(&fetched.records, self.vocab).await?;

        match self.store.observe(key, snapshot).await {
            Ok(upsert) => Ok(Outcome::Success(json!({
                "version": upsert.as_str(),
                "records": fetched.records.len(),
                "pages": fetched.pages,
                "stop": fetched.stop.as_str(),
            }))),
            Err(VersioningError::Persistence(e)) => Err(e),
            Err(e @ VersioningError::NonMonotonic { .. })
            | Err(e @ VersioningError::Contention { .. }) => {
                Ok(Outcome::TransientFailure(e.to_string()))
            }
        }
    }
}

/// Read candidate keys from the command line and an optional keys file.
///
/// A `.json` file holds an array of strings or numbers; any other file
/// holds one key per line, with blank lines and `#` comments ignored.
pub fn load_keys(keys: &[String], keys_file: Option<&Path>) -> Result<Vec<String>> {
    let mut out: Vec<String> = keys.iter().map(|k| k.trim().to_string()).collect();

    if let Some(path) = keys_file {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read keys file: {}", path.display()))?;
        if path.extension().is_some_and(|ext| ext == "json") {
            let values: Vec<serde_json::Value> = serde_json::from_str(&content)
                .with_context(|| format!("Keys file is not a JSON array: {}", path.display()))?;
            for v in values {
                match v {
                    serde_json::Value::String(s) => out.push(s.trim().to_string()),
                    serde_json::Value::Number(n) => out.push(n.to_string()),
                    other => anyhow::bail!("Unsupported key in {}: {}", path.display(), other),
                }
            }
        } else {
            out.extend(
                content
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty() && !l.starts_with('#'))
                    .map(str::to_string),
            );
        }
    }

    out.retain(|k| !k.is_empty());
    Ok(out)
}

/// Run a harvest against the configured HTTP endpoint.
pub async fn run_harvest(
    config: &Config,
    keys: &[String],
    overrides: &HarvestOverrides,
    progress: &dyn HarvestProgressReporter,
    stop: Arc<AtomicBool>,
) -> Result<HarvestReport> {
    let source: Arc<dyn PageSource> = Arc::new(HttpPageSource::new(&config.fetch)?);
    run_harvest_with_source(config, source, keys, overrides, progress, stop).await
}

/// Run a harvest against any [`PageSource`].
pub async fn run_harvest_with_source(
    config: &Config,
    source: Arc<dyn PageSource>,
    keys: &[String],
    overrides: &HarvestOverrides,
    progress: &dyn HarvestProgressReporter,
    stop: Arc<AtomicBool>,
) -> Result<HarvestReport> {
    if keys.is_empty() {
        anyhow::bail!("No candidate keys given. Pass keys as arguments or use --keys-file.");
    }

    let options = overrides.apply(config);
    let pool = db::connect(config).await?;
    let repos = db::open_repositories(config, &pool).await?;

    let vocab = Vocabulary::load(repos.vocabulary.clone()).await?;
    let store = VersionStore::new(repos.versions.clone());
    let controller = HarvestController::new(repos.checkpoints.clone()).with_stop(stop);

    let existing = controller.entries().await?;
    let mut seen = std::collections::HashSet::new();
    let pending = keys
        .iter()
        .filter(|k| seen.insert(k.as_str()))
        .filter(|k| !existing.get(*k).is_some_and(|e| e.status.is_terminal()))
        .count() as u64;
    progress.report(HarvestProgressEvent::Starting {
        job: config.harvest.job.clone(),
        candidates: seen.len() as u64,
        pending,
    });

    let processor = CatalogProcessor {
        source,
        policy: FetchPolicy::from_config(&config.fetch),
        builder: SnapshotBuilder::from_config(&config.snapshot),
        vocab: &vocab,
        store: &store,
        progress,
        job: config.harvest.job.clone(),
        total: pending,
        done: AtomicU64::new(0),
    };

    let report = controller.run(keys, &processor, &options).await?;
    pool.close().await;
    Ok(report)
}

pub fn print_report(job: &str, report: &HarvestReport) {
    println!("harvest {}", job);
    println!("  processed: {}", report.processed);
    println!("  skipped (already done): {}", report.skipped_terminal);
    if report.not_started > 0 {
        println!("  not started (stopped): {}", report.not_started);
    }
    println!("  success: {}", report.count(CheckpointStatus::Success));
    println!(
        "  permanent_skip: {}",
        report.count(CheckpointStatus::PermanentSkip)
    );
    println!(
        "  transient_failure: {}",
        report.count(CheckpointStatus::TransientFailure)
    );
    println!("  checkpoint flushes: {}", report.flushes);
    if report.is_complete() {
        println!("ok");
    } else {
        println!("incomplete: {} keys still pending", report.pending.len());
    }
}
