//! Read-side commands: `history`, `as-of`, `vocab` and `checkpoint`.

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};

use harvest_ledger_core::harvest::HarvestController;
use harvest_ledger_core::models::{CheckpointStatus, FieldValue, Snapshot, VersionRecord};
use harvest_ledger_core::versioning::VersionStore;
use harvest_ledger_core::vocabulary::Vocabulary;

use crate::config::Config;
use crate::db;

fn fmt_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Render a field, resolving term ids back to their strings.
fn render_value(value: &FieldValue, vocab: &Vocabulary) -> String {
    match value {
        FieldValue::Terms(ids) => {
            let names: Vec<String> = ids
                .iter()
                .map(|id| vocab.lookup(*id).unwrap_or_else(|| format!("#{}", id)))
                .collect();
            format!("[{}]", names.join(", "))
        }
        other => other.to_string(),
    }
}

fn print_snapshot(snapshot: &Snapshot, vocab: &Vocabulary, indent: &str) {
    for (name, value) in snapshot.fields() {
        println!("{}{}: {}", indent, name, render_value(value, vocab));
    }
}

fn record_json(record: &VersionRecord, vocab: &Vocabulary) -> serde_json::Value {
    let fields: serde_json::Map<String, serde_json::Value> = record
        .snapshot
        .fields()
        .map(|(name, value)| {
            let v = match value {
                FieldValue::Terms(ids) => serde_json::Value::from(
                    ids.iter()
                        .map(|id| vocab.lookup(*id).unwrap_or_else(|| format!("#{}", id)))
                        .collect::<Vec<String>>(),
                ),
                other => serde_json::to_value(other).unwrap_or(serde_json::Value::Null),
            };
            (name.clone(), v)
        })
        .collect();
    serde_json::json!({
        "key": record.entity_key,
        "valid_from": fmt_ts(record.valid_from),
        "valid_to": record.valid_to.map(fmt_ts),
        "fields": fields,
    })
}

pub async fn run_history(config: &Config, key: &str, json: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    let repos = db::open_repositories(config, &pool).await?;
    let vocab = Vocabulary::load(repos.vocabulary).await?;
    let store = VersionStore::new(repos.versions);

    let versions = store.history(key).await?;
    if json {
        let out: Vec<serde_json::Value> = versions.iter().map(|v| record_json(v, &vocab)).collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if versions.is_empty() {
        println!("No history for '{}'.", key);
        return Ok(());
    }

    println!("history {}", key);
    for (i, v) in versions.iter().enumerate() {
        let to = v.valid_to.map(fmt_ts).unwrap_or_else(|| "open".to_string());
        println!("  [{}] {} .. {}", i + 1, fmt_ts(v.valid_from), to);
        print_snapshot(&v.snapshot, &vocab, "      ");
    }
    Ok(())
}

pub async fn run_as_of(config: &Config, key: &str, at: DateTime<Utc>, json: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    let repos = db::open_repositories(config, &pool).await?;
    let vocab = Vocabulary::load(repos.vocabulary).await?;
    let store = VersionStore::new(repos.versions);

    let Some(version) = store.as_of(key, at).await? else {
        anyhow::bail!("No version of '{}' valid at {}", key, fmt_ts(at));
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&record_json(&version, &vocab))?
        );
        return Ok(());
    }

    let to = version
        .valid_to
        .map(fmt_ts)
        .unwrap_or_else(|| "open".to_string());
    println!("{} at {}", key, fmt_ts(at));
    println!("  valid: {} .. {}", fmt_ts(version.valid_from), to);
    print_snapshot(&version.snapshot, &vocab, "  ");
    Ok(())
}

pub async fn run_vocab_list(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let repos = db::open_repositories(config, &pool).await?;
    let vocab = Vocabulary::load(repos.vocabulary).await?;

    let terms = vocab.terms();
    if terms.is_empty() {
        println!("Vocabulary is empty.");
        return Ok(());
    }
    println!("{:<8} TERM", "ID");
    for t in terms {
        println!("{:<8} {}", t.id, t.term);
    }
    Ok(())
}

pub async fn run_vocab_intern(config: &Config, terms: &[String]) -> Result<()> {
    let pool = db::connect(config).await?;
    let repos = db::open_repositories(config, &pool).await?;
    let vocab = Vocabulary::load(repos.vocabulary).await?;

    let ids = vocab.intern_many(terms).await?;
    for (term, id) in terms.iter().zip(ids) {
        println!("{}\t{}", id, term);
    }
    Ok(())
}

pub async fn run_checkpoint_status(config: &Config, list_pending: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    let repos = db::open_repositories(config, &pool).await?;
    let controller = HarvestController::new(repos.checkpoints);

    let entries = controller.entries().await?;
    let summary = harvest_ledger_core::harvest::CheckpointSummary::of(&entries);
    println!("checkpoint {}", config.harvest.job);
    println!("  entries: {}", summary.total());
    println!("  success: {}", summary.success);
    println!("  permanent_skip: {}", summary.permanent_skip);
    println!("  transient_failure: {}", summary.transient_failure);

    if list_pending {
        let mut failed: Vec<_> = entries
            .values()
            .filter(|e| e.status == CheckpointStatus::TransientFailure)
            .collect();
        failed.sort_by(|a, b| a.key.cmp(&b.key));
        for e in failed {
            println!(
                "  {}  attempts={}  {}",
                e.key,
                e.attempts,
                e.detail.as_deref().unwrap_or("")
            );
        }
    }
    Ok(())
}

pub async fn run_checkpoint_reset(config: &Config, keys: &[String], all: bool) -> Result<()> {
    if keys.is_empty() && !all {
        anyhow::bail!("Nothing to reset. Pass keys or --all.");
    }
    let pool = db::connect(config).await?;
    let repos = db::open_repositories(config, &pool).await?;
    let controller = HarvestController::new(repos.checkpoints);

    let removed = if all {
        controller.reset_all().await?
    } else {
        controller.reset(keys).await?
    };
    println!("checkpoint {}", config.harvest.job);
    println!("  reset entries: {}", removed);
    println!("ok");
    Ok(())
}
