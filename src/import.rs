//! `hl import`: backfill version history from recorded observations.
//!
//! Input is JSON Lines, one observation per line:
//!
//! ```json
//! {"key": "570", "observed_at": "2025-03-20 15:23:00", "fields": {"price": 0, "tags": ["MOBA"]}}
//! ```
//!
//! Observations are applied in `observed_at` order (stable for equal
//! timestamps), so a file does not need to be sorted. Tag fields are
//! interned exactly as during a harvest.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Deserialize;

use harvest_ledger_core::error::VersioningError;
use harvest_ledger_core::models::{RawRecord, UpsertOutcome};
use harvest_ledger_core::versioning::VersionStore;
use harvest_ledger_core::vocabulary::Vocabulary;

use crate::config::Config;
use crate::db;
use crate::snapshot::SnapshotBuilder;

#[derive(Debug, Deserialize)]
struct Observation {
    #[serde(deserialize_with = "key_as_string")]
    key: String,
    observed_at: String,
    #[serde(default)]
    fields: RawRecord,
}

fn key_as_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "key must be a string or number, got {}",
            other
        ))),
    }
}

/// Parse a timestamp given on the command line or in an import file.
///
/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.fff]` and `YYYY-MM-DD`; naive
/// forms are taken as UTC.
pub fn parse_instant(s: &str) -> Result<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(naive.and_utc());
        }
    }
    anyhow::bail!(
        "Invalid timestamp '{}'. Use RFC 3339, 'YYYY-MM-DD HH:MM:SS' or 'YYYY-MM-DD'.",
        s
    )
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImportStats {
    pub observations: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Observations not newer than the key's open version.
    pub rejected: usize,
}

fn read_observations(path: &Path) -> Result<Vec<(DateTime<Utc>, Observation)>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read import file: {}", path.display()))?;

    let mut out = Vec::new();
    for (i, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let obs: Observation = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: invalid observation", path.display(), i + 1))?;
        let at = parse_instant(&obs.observed_at)
            .with_context(|| format!("{}:{}: bad observed_at", path.display(), i + 1))?;
        out.push((at, obs));
    }
    out.sort_by_key(|(at, _)| *at);
    Ok(out)
}

pub async fn run_import(config: &Config, path: &Path) -> Result<ImportStats> {
    let observations = read_observations(path)?;

    let pool = db::connect(config).await?;
    let repos = db::open_repositories(config, &pool).await?;
    let vocab = Vocabulary::load(repos.vocabulary.clone()).await?;
    let store = VersionStore::new(repos.versions.clone());
    let builder = SnapshotBuilder::from_config(&config.snapshot);

    let mut stats = ImportStats {
        observations: observations.len(),
        ..ImportStats::default()
    };

    for (at, obs) in observations {
        let snapshot = builder.build(std::slice::from_ref(&obs.fields), &vocab).await?;
        match store.upsert(&obs.key, snapshot, at).await {
            Ok(UpsertOutcome::Inserted) => stats.inserted += 1,
            Ok(UpsertOutcome::Updated) => stats.updated += 1,
            Ok(UpsertOutcome::Unchanged) => stats.unchanged += 1,
            Err(e @ VersioningError::NonMonotonic { .. }) => {
                tracing::warn!(key = obs.key.as_str(), error = %e, "observation rejected");
                stats.rejected += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    pool.close().await;
    Ok(stats)
}

pub fn print_stats(path: &Path, stats: &ImportStats) {
    println!("import {}", path.display());
    println!("  observations: {}", stats.observations);
    println!("  inserted: {}", stats.inserted);
    println!("  updated: {}", stats.updated);
    println!("  unchanged: {}", stats.unchanged);
    println!("  rejected: {}", stats.rejected);
    println!("ok");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_instant_formats() {
        let expected = DateTime::parse_from_rfc3339("2025-03-20T15:23:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(parse_instant("2025-03-20T15:23:00Z").unwrap(), expected);
        assert_eq!(parse_instant("2025-03-20 15:23:00").unwrap(), expected);
        assert_eq!(parse_instant("2025-03-20T15:23:00").unwrap(), expected);
        assert_eq!(
            parse_instant("2025-03-20T17:23:00+02:00").unwrap(),
            expected
        );
        assert_eq!(
            parse_instant("2025-03-20").unwrap().to_rfc3339(),
            "2025-03-20T00:00:00+00:00"
        );
        assert!(parse_instant("yesterday").is_err());
    }

    #[test]
    fn test_observations_sorted_by_time() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("obs.jsonl");
        std::fs::write(
            &path,
            concat!(
                "{\"key\": 570, \"observed_at\": \"2025-03-02\", \"fields\": {\"p\": 2}}\n",
                "\n",
                "{\"key\": \"570\", \"observed_at\": \"2025-03-01\", \"fields\": {\"p\": 1}}\n",
            ),
        )
        .unwrap();
        let obs = read_observations(&path).unwrap();
        assert_eq!(obs.len(), 2);
        assert_eq!(obs[0].1.key, "570");
        assert_eq!(obs[0].1.fields.get("p"), Some(&serde_json::json!(1)));
    }
}
