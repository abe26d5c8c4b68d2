//! Turning raw records into snapshots.
//!
//! A resource's records are folded into one [`Snapshot`]:
//!
//! - scalar fields take the first set value in record order (page one is
//!   the freshest), restricted to `[snapshot] fields` when that list is
//!   non-empty;
//! - tag fields are collected across all records, interned, and stored as a
//!   sorted, de-duplicated id list so reordering alone is not a change.
//!
//! A tag field may hold a JSON array of strings, a string containing such
//! an array (`"[\"FPS\", \"Shooter\"]"`), or a single plain string.

use harvest_ledger_core::error::PersistenceError;
use harvest_ledger_core::models::{FieldValue, RawRecord, Snapshot};
use harvest_ledger_core::vocabulary::Vocabulary;
use serde_json::Value;

use crate::config::SnapshotConfig;

#[derive(Debug, Clone, Default)]
pub struct SnapshotBuilder {
    fields: Vec<String>,
    tag_fields: Vec<String>,
}

impl SnapshotBuilder {
    pub fn new(fields: Vec<String>, tag_fields: Vec<String>) -> Self {
        Self { fields, tag_fields }
    }

    pub fn from_config(config: &SnapshotConfig) -> Self {
        Self::new(config.fields.clone(), config.tag_fields.clone())
    }

    fn is_tag_field(&self, name: &str) -> bool {
        self.tag_fields.iter().any(|f| f == name)
    }

    fn keeps(&self, name: &str) -> bool {
        self.fields.is_empty() || self.fields.iter().any(|f| f == name)
    }

    pub async fn build(
        &self,
        records: &[RawRecord],
        vocab: &Vocabulary,
    ) -> Result<Snapshot, PersistenceError> {
        let mut snapshot = Snapshot::new();
        let mut tags: Vec<(String, Vec<String>)> = self
            .tag_fields
            .iter()
            .map(|f| (f.clone(), Vec::new()))
            .collect();

        for record in records {
            for (name, value) in record {
                if self.is_tag_field(name) {
                    if let Some((_, terms)) = tags.iter_mut().find(|(f, _)| f == name) {
                        for term in tag_terms(value) {
                            if !terms.contains(&term) {
                                terms.push(term);
                            }
                        }
                    }
                    continue;
                }
                if !self.keeps(name) {
                    continue;
                }
                let already_set = snapshot.get(name).is_some_and(|v| !v.is_unset());
                if !already_set {
                    snapshot.insert(name.clone(), FieldValue::from_json(value));
                }
            }
        }

        for name in &self.fields {
            if snapshot.get(name).is_none() {
                snapshot.insert(name.clone(), FieldValue::Null);
            }
        }

        for (field, terms) in tags {
            let present = records.iter().any(|r| r.contains_key(&field));
            if !present {
                continue;
            }
            let mut ids = vocab.intern_many(&terms).await?;
            ids.sort_unstable();
            ids.dedup();
            snapshot.insert(field, FieldValue::Terms(ids));
        }

        Ok(snapshot)
    }
}

/// Extract the terms held by one tag field value.
pub fn tag_terms(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .filter(|s| !s.is_empty())
            .collect(),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.starts_with('[') {
                if let Ok(parsed @ Value::Array(_)) = serde_json::from_str::<Value>(trimmed) {
                    return tag_terms(&parsed);
                }
            }
            if trimmed.is_empty() {
                Vec::new()
            } else {
                vec![trimmed.to_string()]
            }
        }
        _ => Vec::new(),
    }
}
