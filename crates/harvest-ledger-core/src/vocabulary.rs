//! Vocabulary interner.
//!
//! Maps free-form strings (user tags, genres, keywords) to small stable
//! integers. The mapping is append-only: once a term has an id it keeps it
//! forever, across runs and across workers.
//!
//! Allocation is delegated to the [`VocabularyRepository`], which assigns
//! `max(id) + 1` atomically and persists before answering. The interner only
//! adds a read-through cache, filled after the repository confirmed the
//! write, so a failed persist never leaves a non-durable id in memory.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::PersistenceError;
use crate::models::Term;
use crate::store::VocabularyRepository;

pub struct Vocabulary {
    repo: Arc<dyn VocabularyRepository>,
    by_term: RwLock<HashMap<String, i64>>,
    by_id: RwLock<HashMap<i64, String>>,
}

impl Vocabulary {
    /// Load the persisted terms and build the cache.
    pub async fn load(repo: Arc<dyn VocabularyRepository>) -> Result<Self, PersistenceError> {
        let terms = repo.load().await?;
        tracing::debug!(terms = terms.len(), "vocabulary loaded");
        let vocab = Self {
            repo,
            by_term: RwLock::new(HashMap::with_capacity(terms.len())),
            by_id: RwLock::new(HashMap::with_capacity(terms.len())),
        };
        vocab.remember(terms.into_iter().map(|t| (t.term, t.id)));
        Ok(vocab)
    }

    /// The id for `term`, allocating and persisting one if it is new.
    pub async fn intern(&self, term: &str) -> Result<i64, PersistenceError> {
        if let Some(id) = self.cached(term) {
            return Ok(id);
        }
        let ids = self.intern_many(&[term.to_string()]).await?;
        ids.into_iter()
            .next()
            .ok_or_else(|| PersistenceError::corrupt("vocabulary", "no id returned for term"))
    }

    /// Ids for `terms` in input order. All unseen terms are persisted in
    /// one repository write.
    pub async fn intern_many(&self, terms: &[String]) -> Result<Vec<i64>, PersistenceError> {
        let mut ids: Vec<Option<i64>> = terms.iter().map(|t| self.cached(t)).collect();

        let mut missing: Vec<String> = Vec::new();
        for (term, id) in terms.iter().zip(&ids) {
            if id.is_none() && !missing.contains(term) {
                missing.push(term.clone());
            }
        }

        if !missing.is_empty() {
            let allocated = self.repo.get_or_create_many(&missing).await?;
            if allocated.len() != missing.len() {
                return Err(PersistenceError::corrupt(
                    "vocabulary",
                    format!(
                        "asked for {} ids, repository returned {}",
                        missing.len(),
                        allocated.len()
                    ),
                ));
            }
            tracing::debug!(new_terms = missing.len(), "vocabulary terms persisted");
            let fresh: HashMap<String, i64> = missing.into_iter().zip(allocated).collect();
            for (slot, term) in ids.iter_mut().zip(terms) {
                if slot.is_none() {
                    *slot = fresh.get(term).copied();
                }
            }
            self.remember(fresh);
        }

        ids.into_iter()
            .zip(terms)
            .map(|(id, term)| {
                id.ok_or_else(|| {
                    PersistenceError::corrupt("vocabulary", format!("term '{}' has no id", term))
                })
            })
            .collect()
    }

    /// The term behind `id`, if one was ever assigned.
    pub fn lookup(&self, id: i64) -> Option<String> {
        self.by_id.read().unwrap().get(&id).cloned()
    }

    /// Every known term, ordered by id.
    pub fn terms(&self) -> Vec<Term> {
        let by_id = self.by_id.read().unwrap();
        let mut out: Vec<Term> = by_id
            .iter()
            .map(|(id, term)| Term {
                term: term.clone(),
                id: *id,
            })
            .collect();
        out.sort_by_key(|t| t.id);
        out
    }

    pub fn len(&self) -> usize {
        self.by_term.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cached(&self, term: &str) -> Option<i64> {
        self.by_term.read().unwrap().get(term).copied()
    }

    fn remember(&self, pairs: impl IntoIterator<Item = (String, i64)>) {
        let mut by_term = self.by_term.write().unwrap();
        let mut by_id = self.by_id.write().unwrap();
        for (term, id) in pairs {
            by_id.insert(id, term.clone());
            by_term.insert(term, id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryVocabulary;
    use async_trait::async_trait;

    #[tokio::test]
    async fn test_intern_is_idempotent() {
        let vocab = Vocabulary::load(Arc::new(InMemoryVocabulary::new()))
            .await
            .unwrap();
        let a = vocab.intern("Indie").await.unwrap();
        let b = vocab.intern("Indie").await.unwrap();
        assert_eq!(a, 1);
        assert_eq!(a, b);
        assert_eq!(vocab.lookup(1).as_deref(), Some("Indie"));
    }

    #[tokio::test]
    async fn test_ids_survive_restart() {
        let repo = Arc::new(InMemoryVocabulary::new());
        let first = Vocabulary::load(repo.clone()).await.unwrap();
        let ids = first
            .intern_many(&["FPS".into(), "Shooter".into()])
            .await
            .unwrap();
        drop(first);

        let second = Vocabulary::load(repo).await.unwrap();
        assert_eq!(second.intern("Shooter").await.unwrap(), ids[1]);
        assert_eq!(second.intern("FPS").await.unwrap(), ids[0]);
        assert_eq!(second.intern("MOBA").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_new_terms_get_consecutive_ids_above_max() {
        let repo = Arc::new(InMemoryVocabulary::with_terms(vec![
            Term {
                term: "old".into(),
                id: 41,
            },
            Term {
                term: "older".into(),
                id: 12,
            },
        ]));
        let vocab = Vocabulary::load(repo).await.unwrap();
        let terms: Vec<String> = (0..5).map(|i| format!("t{}", i)).collect();
        let ids = vocab.intern_many(&terms).await.unwrap();
        assert_eq!(ids, vec![42, 43, 44, 45, 46]);
    }

    #[tokio::test]
    async fn test_intern_many_preserves_order_and_duplicates() {
        let vocab = Vocabulary::load(Arc::new(InMemoryVocabulary::new()))
            .await
            .unwrap();
        vocab.intern("b").await.unwrap();
        let ids = vocab
            .intern_many(&["a".into(), "b".into(), "a".into(), "c".into()])
            .await
            .unwrap();
        assert_eq!(ids, vec![2, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_concurrent_interning_agrees() {
        let vocab = Arc::new(
            Vocabulary::load(Arc::new(InMemoryVocabulary::new()))
                .await
                .unwrap(),
        );
        let mut handles = Vec::new();
        for w in 0..8 {
            let vocab = vocab.clone();
            handles.push(tokio::spawn(async move {
                let mut terms: Vec<String> = (0..20).map(|i| format!("tag{}", i)).collect();
                terms.rotate_left(w);
                let ids = vocab.intern_many(&terms).await.unwrap();
                terms.into_iter().zip(ids).collect::<Vec<_>>()
            }));
        }
        let mut seen: HashMap<String, i64> = HashMap::new();
        for h in handles {
            for (term, id) in h.await.unwrap() {
                let prev = seen.insert(term.clone(), id);
                assert!(prev.is_none() || prev == Some(id), "{} got two ids", term);
            }
        }
        let mut ids: Vec<i64> = seen.values().copied().collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 20);
    }

    struct FailingVocabulary;

    #[async_trait]
    impl VocabularyRepository for FailingVocabulary {
        async fn load(&self) -> Result<Vec<Term>, PersistenceError> {
            Ok(vec![])
        }
        async fn get_or_create_many(
            &self,
            _terms: &[String],
        ) -> Result<Vec<i64>, PersistenceError> {
            Err(PersistenceError::backend("vocabulary", "disk full"))
        }
    }

    #[tokio::test]
    async fn test_persist_failure_is_not_cached() {
        let vocab = Vocabulary::load(Arc::new(FailingVocabulary)).await.unwrap();
        assert!(vocab.intern("Indie").await.is_err());
        assert!(vocab.is_empty());
        assert!(vocab.lookup(1).is_none());
    }
}
