//! JSON file repositories.
//!
//! Small deployments can keep checkpoints and the vocabulary in plain JSON
//! files next to the database. Every write goes to a uniquely named temp
//! file in the same directory and is then renamed over the target, so a
//! reader sees either the old or the new file, never a torn one.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;

use harvest_ledger_core::error::PersistenceError;
use harvest_ledger_core::models::{CheckpointEntry, Term};
use harvest_ledger_core::store::{CheckpointMap, CheckpointRepository, VocabularyRepository};

async fn write_atomically(
    store: &'static str,
    path: &Path,
    contents: &[u8],
) -> Result<(), PersistenceError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PersistenceError::backend(store, e))?;
        }
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| store.to_string());
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    tokio::fs::write(&tmp, contents)
        .await
        .map_err(|e| PersistenceError::backend(store, e))?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(PersistenceError::backend(store, e));
    }
    Ok(())
}

async fn read_if_exists(store: &'static str, path: &Path) -> Result<Option<String>, PersistenceError> {
    match tokio::fs::read_to_string(path).await {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(PersistenceError::backend(store, e)),
    }
}

/// Checkpoint map stored as one JSON object keyed by entity key.
pub struct JsonFileCheckpoints {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileCheckpoints {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    async fn read(&self) -> Result<CheckpointMap, PersistenceError> {
        let Some(raw) = read_if_exists("checkpoints", &self.path).await? else {
            return Ok(CheckpointMap::new());
        };
        if raw.trim().is_empty() {
            return Ok(CheckpointMap::new());
        }
        let entries: HashMap<String, CheckpointEntry> = serde_json::from_str(&raw)?;
        Ok(entries)
    }

    async fn write(&self, entries: &CheckpointMap) -> Result<(), PersistenceError> {
        let ordered: BTreeMap<&String, &CheckpointEntry> = entries.iter().collect();
        let body = serde_json::to_vec_pretty(&ordered)?;
        write_atomically("checkpoints", &self.path, &body).await
    }
}

#[async_trait]
impl CheckpointRepository for JsonFileCheckpoints {
    async fn load(&self) -> Result<CheckpointMap, PersistenceError> {
        let _guard = self.lock.lock().await;
        self.read().await
    }

    async fn save(&self, entries: &CheckpointMap) -> Result<(), PersistenceError> {
        let _guard = self.lock.lock().await;
        let mut merged = self.read().await?;
        merged.extend(entries.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.write(&merged).await
    }

    async fn remove(&self, keys: &[String]) -> Result<usize, PersistenceError> {
        let _guard = self.lock.lock().await;
        let mut entries = self.read().await?;
        let removed = keys.iter().filter(|k| entries.remove(*k).is_some()).count();
        if removed > 0 {
            self.write(&entries).await?;
        }
        Ok(removed)
    }

    async fn clear(&self) -> Result<usize, PersistenceError> {
        let _guard = self.lock.lock().await;
        let entries = self.read().await?;
        let n = entries.len();
        if n > 0 {
            self.write(&CheckpointMap::new()).await?;
        }
        Ok(n)
    }
}

/// Vocabulary stored as a `{ "term": id }` JSON object.
///
/// The in-memory copy is the source of truth for allocation and is only
/// updated after the file has been replaced. Allocation is atomic within
/// one process only; a second process writing the same file may reuse ids.
pub struct JsonFileVocabulary {
    path: PathBuf,
    terms: Mutex<BTreeMap<String, i64>>,
}

impl JsonFileVocabulary {
    pub async fn open(path: &Path) -> Result<Self, PersistenceError> {
        let terms: BTreeMap<String, i64> = match read_if_exists("vocabulary", path).await? {
            Some(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw)?,
            _ => BTreeMap::new(),
        };
        Ok(Self {
            path: path.to_path_buf(),
            terms: Mutex::new(terms),
        })
    }
}

#[async_trait]
impl VocabularyRepository for JsonFileVocabulary {
    async fn load(&self) -> Result<Vec<Term>, PersistenceError> {
        let terms = self.terms.lock().await;
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
        let mut current = self.terms.lock().await;
        let mut next = current.values().copied().max().unwrap_or(0) + 1;
        let mut staged = current.clone();
        let mut ids = Vec::with_capacity(terms.len());
        for term in terms {
            let id = *staged.entry(term.clone()).or_insert_with(|| {
                let id = next;
                next += 1;
                id
            });
            ids.push(id);
        }

        if staged.len() != current.len() {
            let body = serde_json::to_vec_pretty(&staged)?;
            write_atomically("vocabulary", &self.path, &body).await?;
            *current = staged;
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use harvest_ledger_core::models::Outcome;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_vocabulary_file_round_trips_tag_mapping_format() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("tag_mapping.json");
        std::fs::write(&path, r#"{"FPS": 1, "Shooter": 2}"#).unwrap();

        let repo = JsonFileVocabulary::open(&path).await.unwrap();
        let ids = repo
            .get_or_create_many(&["Shooter".into(), "MOBA".into()])
            .await
            .unwrap();
        assert_eq!(ids, vec![2, 3]);

        let on_disk: BTreeMap<String, i64> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk.get("MOBA"), Some(&3));

        let reopened = JsonFileVocabulary::open(&path).await.unwrap();
        let terms = reopened.load().await.unwrap();
        assert_eq!(terms.len(), 3);
        assert_eq!(terms[2].term, "MOBA");
    }

    #[tokio::test]
    async fn test_vocabulary_missing_file_starts_at_one() {
        let tmp = TempDir::new().unwrap();
        let repo = JsonFileVocabulary::open(&tmp.path().join("nested/vocab.json"))
            .await
            .unwrap();
        assert_eq!(repo.get_or_create_many(&["Indie".into()]).await.unwrap(), vec![1]);
        assert!(tmp.path().join("nested/vocab.json").exists());
    }

    #[tokio::test]
    async fn test_checkpoint_file_save_load_and_reset() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("checkpoints.json");
        let repo = JsonFileCheckpoints::new(&path);
        assert!(repo.load().await.unwrap().is_empty());

        let mut map = CheckpointMap::new();
        for key in ["570", "730"] {
            map.insert(
                key.to_string(),
                CheckpointEntry::from_outcome(
                    key,
                    Outcome::Success(serde_json::json!({"records": 3})),
                    0,
                    Utc::now(),
                ),
            );
        }
        repo.save(&map).await.unwrap();

        let loaded = JsonFileCheckpoints::new(&path).load().await.unwrap();
        assert_eq!(loaded, map);

        assert_eq!(repo.remove(&["570".into(), "999".into()]).await.unwrap(), 1);
        assert_eq!(repo.clear().await.unwrap(), 1);
        assert!(repo.load().await.unwrap().is_empty());

        let leftovers: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_checkpoint_save_keeps_other_keys() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("checkpoints.json");
        let entry = |key: &str, outcome: Outcome| {
            let mut map = CheckpointMap::new();
            map.insert(
                key.to_string(),
                CheckpointEntry::from_outcome(key, outcome, 0, Utc::now()),
            );
            map
        };

        let repo = JsonFileCheckpoints::new(&path);
        repo.save(&entry("a", Outcome::TransientFailure("503".into())))
            .await
            .unwrap();
        repo.save(&entry("b", Outcome::Success(serde_json::Value::Null)))
            .await
            .unwrap();
        repo.save(&entry("a", Outcome::Success(serde_json::Value::Null)))
            .await
            .unwrap();

        let loaded = JsonFileCheckpoints::new(&path).load().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded["a"].status.is_terminal());
        assert!(loaded["b"].status.is_terminal());
    }
}
