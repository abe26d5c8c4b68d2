//! In-memory repository implementations for tests and embedding.
//!
//! Uses `HashMap` and `Vec` behind `std::sync::Mutex`. Each conditional
//! write runs entirely under one lock acquisition, which is what makes the
//! read-compare-write sequences atomic.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::PersistenceError;
use crate::models::{Term, VersionRecord};

use super::{CheckpointMap, CheckpointRepository, VersionRepository, VocabularyRepository};

/// Version table keyed by entity key; each key's versions stay sorted by `valid_from`.
#[derive(Default)]
pub struct InMemoryVersions {
    rows: Mutex<HashMap<String, Vec<VersionRecord>>>,
}

impl InMemoryVersions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of version records across all keys.
    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl VersionRepository for InMemoryVersions {
    async fn find_open_version(
        &self,
        key: &str,
    ) -> Result<Option<VersionRecord>, PersistenceError> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .get(key)
            .and_then(|versions| versions.iter().find(|v| v.is_open()).cloned()))
    }

    async fn insert_version(&self, record: &VersionRecord) -> Result<bool, PersistenceError> {
        let mut rows = self.rows.lock().unwrap();
        let versions = rows.entry(record.entity_key.clone()).or_default();
        if versions.iter().any(|v| v.is_open()) {
            return Ok(false);
        }
        if versions.iter().any(|v| v.valid_from == record.valid_from) {
            return Err(PersistenceError::backend(
                "versions",
                format!(
                    "duplicate primary key ({}, {})",
                    record.entity_key, record.valid_from
                ),
            ));
        }
        versions.push(record.clone());
        versions.sort_by_key(|v| v.valid_from);
        Ok(true)
    }

    async fn close_version(
        &self,
        key: &str,
        open_from: DateTime<Utc>,
        valid_to: DateTime<Utc>,
        successor: &VersionRecord,
    ) -> Result<bool, PersistenceError> {
        let mut rows = self.rows.lock().unwrap();
        let Some(versions) = rows.get_mut(key) else {
            return Ok(false);
        };
        let Some(open) = versions
            .iter_mut()
            .find(|v| v.is_open() && v.valid_from == open_from)
        else {
            return Ok(false);
        };
        open.valid_to = Some(valid_to);
        versions.push(successor.clone());
        versions.sort_by_key(|v| v.valid_from);
        Ok(true)
    }

    async fn history(&self, key: &str) -> Result<Vec<VersionRecord>, PersistenceError> {
        let rows = self.rows.lock().unwrap();
        Ok(rows.get(key).cloned().unwrap_or_default())
    }

    async fn version_at(
        &self,
        key: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<VersionRecord>, PersistenceError> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .get(key)
            .and_then(|versions| versions.iter().find(|v| v.covers(at)).cloned()))
    }
}

/// Vocabulary held in a single map; the lock spans lookup and allocation.
#[derive(Default)]
pub struct InMemoryVocabulary {
    terms: Mutex<HashMap<String, i64>>,
}

impl InMemoryVocabulary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with previously persisted terms, e.g. to simulate a restart.
    pub fn with_terms(terms: impl IntoIterator<Item = Term>) -> Self {
        Self {
            terms: Mutex::new(terms.into_iter().map(|t| (t.term, t.id)).collect()),
        }
    }
}

#[async_trait]
impl VocabularyRepository for InMemoryVocabulary {
    async fn load(&self) -> Result<Vec<Term>, PersistenceError> {
        let terms = self.terms.lock().unwrap();
        let mut out: Vec<Term> = terms
            .iter()
            .map(|(term, id)| Term {
                term: term.clone(),
                id: *id,
            })
            .collect();
        out.sort_by_key(|t| t.id);
        Ok(out)
    }

    async fn get_or_create_many(&self, terms: &[String]) -> Result<Vec<i64>, PersistenceError> {
        let mut map = self.terms.lock().unwrap();
        let mut next = map.values().copied().max().unwrap_or(0) + 1;
        let mut ids = Vec::with_capacity(terms.len());
        for term in terms {
            let id = *map.entry(term.clone()).or_insert_with(|| {
                let id = next;
                next += 1;
                id
            });
            ids.push(id);
        }
        Ok(ids)
    }
}

/// Checkpoint map kept in memory; `save` merges entries by key.
#[derive(Default)]
pub struct InMemoryCheckpoints {
    entries: Mutex<CheckpointMap>,
    saves: Mutex<usize>,
}

impl InMemoryCheckpoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `save` calls so far.
    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap()
    }
}

#[async_trait]
impl CheckpointRepository for InMemoryCheckpoints {
    async fn load(&self) -> Result<CheckpointMap, PersistenceError> {
        Ok(self.entries.lock().unwrap().clone())
    }

    async fn save(&self, entries: &CheckpointMap) -> Result<(), PersistenceError> {
        self.entries
            .lock()
            .unwrap()
            .extend(entries.iter().map(|(k, v)| (k.clone(), v.clone())));
        *self.saves.lock().unwrap() += 1;
        Ok(())
    }

    async fn remove(&self, keys: &[String]) -> Result<usize, PersistenceError> {
        let mut entries = self.entries.lock().unwrap();
        Ok(keys.iter().filter(|k| entries.remove(*k).is_some()).count())
    }

    async fn clear(&self) -> Result<usize, PersistenceError> {
        let mut entries = self.entries.lock().unwrap();
        let n = entries.len();
        entries.clear();
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Snapshot;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[tokio::test]
    async fn test_insert_refuses_second_open_version() {
        let repo = InMemoryVersions::new();
        let first = VersionRecord::open("a", Snapshot::new().with("x", 1.0), ts(10));
        let second = VersionRecord::open("a", Snapshot::new().with("x", 2.0), ts(20));
        assert!(repo.insert_version(&first).await.unwrap());
        assert!(!repo.insert_version(&second).await.unwrap());
        assert_eq!(repo.len(), 1);
    }

    #[tokio::test]
    async fn test_close_requires_expected_open_version() {
        let repo = InMemoryVersions::new();
        let first = VersionRecord::open("a", Snapshot::new(), ts(10));
        repo.insert_version(&first).await.unwrap();

        let next = VersionRecord::open("a", Snapshot::new().with("x", 1.0), ts(20));
        assert!(!repo.close_version("a", ts(11), ts(20), &next).await.unwrap());
        assert!(repo.close_version("a", ts(10), ts(20), &next).await.unwrap());

        let history = repo.history("a").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].valid_to, Some(ts(20)));
        assert!(history[1].is_open());
    }

    #[tokio::test]
    async fn test_vocabulary_allocates_after_max() {
        let repo = InMemoryVocabulary::with_terms(vec![Term {
            term: "Indie".into(),
            id: 7,
        }]);
        let ids = repo
            .get_or_create_many(&["MOBA".into(), "Indie".into(), "MOBA".into()])
            .await
            .unwrap();
        assert_eq!(ids, vec![8, 7, 8]);
    }

    #[tokio::test]
    async fn test_checkpoint_remove_counts_existing() {
        let repo = InMemoryCheckpoints::new();
        let mut map = CheckpointMap::new();
        map.insert(
            "k1".into(),
            crate::models::CheckpointEntry::from_outcome(
                "k1",
                crate::models::Outcome::Success(serde_json::Value::Null),
                0,
                ts(1),
            ),
        );
        repo.save(&map).await.unwrap();
        let removed = repo.remove(&["k1".into(), "k2".into()]).await.unwrap();
        assert_eq!(removed, 1);
        assert!(repo.load().await.unwrap().is_empty());
    }
}
