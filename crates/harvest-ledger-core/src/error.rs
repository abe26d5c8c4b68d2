//! Error taxonomy shared by every component.
//!
//! Fetch-level errors ([`FetchError`]) are recoverable: the harvest pipeline
//! turns them into per-key [`Outcome`](crate::models::Outcome)s. Persistence
//! errors ([`PersistenceError`]) are never recoverable at the per-key level
//! and abort whatever unit of work hit them.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::Outcome;

/// A durable write or read against a repository failed.
///
/// Raised by checkpoint, vocabulary and version repositories. Callers must
/// not treat any in-memory state produced alongside the failed write as
/// durable.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("{store}: {message}")]
    Backend {
        store: &'static str,
        message: String,
    },

    #[error("{store}: corrupt stored value: {message}")]
    Corrupt {
        store: &'static str,
        message: String,
    },

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl PersistenceError {
    /// Wrap any backend error (sqlx, io, ...) with the name of the store it came from.
    pub fn backend(store: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Backend {
            store,
            message: err.to_string(),
        }
    }

    pub fn corrupt(store: &'static str, message: impl Into<String>) -> Self {
        Self::Corrupt {
            store,
            message: message.into(),
        }
    }
}

/// Failure of a single page fetch, after the client's own retries.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Timeout, 5xx, connection reset.
    #[error("transient network error: {0}")]
    Transient(String),

    /// The remote service kept throttling after the single allowed retry.
    #[error("rate limited by remote service")]
    RateLimited { retry_after: Option<Duration> },

    /// The payload could not be understood; retrying will not help.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl FetchError {
    /// Classify a fetch failure into the checkpoint outcome it produces.
    ///
    /// Transient and rate-limit failures may succeed on a later run;
    /// malformed payloads are structural and are skipped permanently.
    pub fn into_outcome(self) -> Outcome {
        match self {
            FetchError::Transient(_) | FetchError::RateLimited { .. } => {
                Outcome::TransientFailure(self.to_string())
            }
            FetchError::Malformed(_) => Outcome::PermanentSkip(self.to_string()),
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, FetchError::Malformed(_))
    }
}

/// Errors from [`VersionStore::upsert`](crate::versioning::VersionStore::upsert).
#[derive(Debug, Error)]
pub enum VersioningError {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// Closing the open version at `as_of` would produce an empty or
    /// inverted interval.
    #[error(
        "observation for '{key}' at {as_of} does not follow the open version starting at {open_from}"
    )]
    NonMonotonic {
        key: String,
        open_from: DateTime<Utc>,
        as_of: DateTime<Utc>,
    },

    /// Conditional writes kept losing to concurrent writers for the same key.
    #[error("gave up on '{key}' after {attempts} conflicting writes")]
    Contention { key: String, attempts: u32 },
}

/// Errors that abort a harvest run.
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("persistence failure: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("processing '{key}' hit a persistence failure: {source}")]
    Processor {
        key: String,
        #[source]
        source: PersistenceError,
    },

    #[error("invalid harvest options: {0}")]
    InvalidOptions(String),
}
