//! Storage abstraction for Harvest Ledger.
//!
//! Three repositories back the three stateful components. Each is a trait so
//! the decision logic in [`versioning`](crate::versioning),
//! [`vocabulary`](crate::vocabulary) and [`harvest`](crate::harvest) stays
//! storage-agnostic and unit-testable without a live database.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//!
//! | Trait | Owner | Backends |
//! |-------|-------|----------|
//! | [`VersionRepository`] | [`VersionStore`](crate::versioning::VersionStore) | memory, SQLite |
//! | [`VocabularyRepository`] | [`Vocabulary`](crate::vocabulary::Vocabulary) | memory, SQLite, JSON file |
//! | [`CheckpointRepository`] | [`HarvestController`](crate::harvest::HarvestController) | memory, SQLite, JSON file |

pub mod memory;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::PersistenceError;
use crate::models::{CheckpointEntry, Term, VersionRecord};

pub type CheckpointMap = HashMap<String, CheckpointEntry>;

/// Durable table of [`VersionRecord`]s.
///
/// Writes are conditional so that concurrent upserts for the same key can
/// never leave two open versions behind: a write that lost a race reports
/// `false` and changes nothing.
#[async_trait]
pub trait VersionRepository: Send + Sync {
    /// The version of `key` whose `valid_to` is the open sentinel, if any.
    async fn find_open_version(&self, key: &str)
        -> Result<Option<VersionRecord>, PersistenceError>;

    /// Insert `record` as the first open version of its key.
    ///
    /// Returns `false` without writing when an open version already exists.
    async fn insert_version(&self, record: &VersionRecord) -> Result<bool, PersistenceError>;

    /// Close the open version of `key` at `valid_to` and open `successor`,
    /// as one atomic write.
    ///
    /// Only applies when the open version still starts at `open_from`;
    /// otherwise returns `false` without writing.
    async fn close_version(
        &self,
        key: &str,
        open_from: DateTime<Utc>,
        valid_to: DateTime<Utc>,
        successor: &VersionRecord,
    ) -> Result<bool, PersistenceError>;

    /// All versions of `key`, oldest first.
    async fn history(&self, key: &str) -> Result<Vec<VersionRecord>, PersistenceError>;

    /// The version of `key` covering instant `at`.
    async fn version_at(
        &self,
        key: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<VersionRecord>, PersistenceError>;
}

/// Durable, append-only string → id mapping.
#[async_trait]
pub trait VocabularyRepository: Send + Sync {
    /// Every persisted term.
    async fn load(&self) -> Result<Vec<Term>, PersistenceError>;

    /// Resolve each term to its id, allocating `max(id) + 1` for unseen
    /// terms, in input order.
    ///
    /// Allocation and persistence happen as one atomic step: concurrent
    /// callers never observe two ids for one term or one id for two terms,
    /// and ids are only returned once they are durable.
    async fn get_or_create_many(&self, terms: &[String]) -> Result<Vec<i64>, PersistenceError>;
}

/// Durable key → [`CheckpointEntry`] mapping for one harvest job.
#[async_trait]
pub trait CheckpointRepository: Send + Sync {
    async fn load(&self) -> Result<CheckpointMap, PersistenceError>;

    /// Write `entries`, replacing the persisted entry of each key they name.
    /// Entries for other keys are left untouched, so workers sharing a job
    /// never erase each other's outcomes.
    ///
    /// A crash during `save` leaves either the old or the new entry for
    /// every key, never a torn mix.
    async fn save(&self, entries: &CheckpointMap) -> Result<(), PersistenceError>;

    /// Remove the entries for `keys`; returns how many existed.
    async fn remove(&self, keys: &[String]) -> Result<usize, PersistenceError>;

    /// Remove every entry; returns how many existed.
    async fn clear(&self) -> Result<usize, PersistenceError>;
}
