//! SCD Type-2 versioning store.
//!
//! Given an entity key and a freshly observed [`Snapshot`], decide whether
//! a new version must be opened and, if so, close the previous one.
//!
//! # Boundary policy
//!
//! The closing boundary equals the new start: `old.valid_to ==
//! new.valid_from == as_of`. Combined with half-open intervals this leaves
//! neither gaps nor overlaps. `old.valid_from < as_of` is required before
//! anything is written; an observation at or before the open version's start
//! is rejected with [`VersioningError::NonMonotonic`].
//!
//! Observation times are truncated to whole microseconds, the resolution of
//! the SQLite store, before they are compared or written.
//!
//! # Concurrency
//!
//! The read-compare-write sequence is serialized per key through the
//! repository's conditional writes. When a write loses a race the store
//! re-reads the open version and decides again, up to
//! [`MAX_WRITE_ATTEMPTS`] times.

use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};

use crate::clock::{Clock, SystemClock};
use crate::error::VersioningError;
use crate::models::{Snapshot, UpsertOutcome, VersionRecord};
use crate::store::VersionRepository;

pub const MAX_WRITE_ATTEMPTS: u32 = 8;

pub struct VersionStore {
    repo: Arc<dyn VersionRepository>,
    clock: Arc<dyn Clock>,
}

impl VersionStore {
    pub fn new(repo: Arc<dyn VersionRepository>) -> Self {
        Self::with_clock(repo, Arc::new(SystemClock))
    }

    pub fn with_clock(repo: Arc<dyn VersionRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { repo, clock }
    }

    /// Record `snapshot` as the state of `key` observed at `as_of`.
    pub async fn upsert(
        &self,
        key: &str,
        snapshot: Snapshot,
        as_of: DateTime<Utc>,
    ) -> Result<UpsertOutcome, VersioningError> {
        let as_of = as_of.trunc_subsecs(6);
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let current = self.repo.find_open_version(key).await?;

            match current {
                None => {
                    let record = VersionRecord::open(key, snapshot.clone(), as_of);
                    if self.repo.insert_version(&record).await? {
                        tracing::debug!(key, %as_of, "opened first version");
                        return Ok(UpsertOutcome::Inserted);
                    }
                }
                Some(open) => {
                    if open.snapshot.same_as(&snapshot) {
                        return Ok(UpsertOutcome::Unchanged);
                    }
                    if open.valid_from >= as_of {
                        return Err(VersioningError::NonMonotonic {
                            key: key.to_string(),
                            open_from: open.valid_from,
                            as_of,
                        });
                    }
                    let successor = VersionRecord::open(key, snapshot.clone(), as_of);
                    if self
                        .repo
                        .close_version(key, open.valid_from, as_of, &successor)
                        .await?
                    {
                        tracing::debug!(
                            key,
                            closed_from = %open.valid_from,
                            %as_of,
                            "closed version and opened successor"
                        );
                        return Ok(UpsertOutcome::Updated);
                    }
                }
            }

            tracing::debug!(key, attempt, "conditional version write lost a race; retrying");
        }

        Err(VersioningError::Contention {
            key: key.to_string(),
            attempts: MAX_WRITE_ATTEMPTS,
        })
    }

    /// Upsert at the injected clock's current time.
    pub async fn observe(
        &self,
        key: &str,
        snapshot: Snapshot,
    ) -> Result<UpsertOutcome, VersioningError> {
        let now = self.clock.now();
        self.upsert(key, snapshot, now).await
    }

    /// The version of `key` valid at `at`.
    pub async fn as_of(
        &self,
        key: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<VersionRecord>, VersioningError> {
        Ok(self.repo.version_at(key, at).await?)
    }

    pub async fn current(&self, key: &str) -> Result<Option<VersionRecord>, VersioningError> {
        Ok(self.repo.find_open_version(key).await?)
    }

    pub async fn history(&self, key: &str) -> Result<Vec<VersionRecord>, VersioningError> {
        Ok(self.repo.history(key).await?)
    }
}

/// Check that a key's history is a chain of adjacent, non-empty intervals
/// with at most one open version, which must be the last.
///
/// Returns a description of the first violation found.
pub fn check_history(versions: &[VersionRecord]) -> Result<(), String> {
    for (i, v) in versions.iter().enumerate() {
        if let Some(end) = v.valid_to {
            if v.valid_from >= end {
                return Err(format!(
                    "version {} is empty or inverted: [{}, {})",
                    i, v.valid_from, end
                ));
            }
        } else if i + 1 != versions.len() {
            return Err(format!("version {} is open but not the latest", i));
        }
        if let Some(next) = versions.get(i + 1) {
            if v.valid_to != Some(next.valid_from) {
                return Err(format!(
                    "version {} ends at {:?} but version {} starts at {}",
                    i,
                    v.valid_to,
                    i + 1,
                    next.valid_from
                ));
            }
        }
    }
    Ok(())
}
