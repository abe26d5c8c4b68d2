//! Checkpointed harvest controller.
//!
//! Drives a [`KeyProcessor`] over a large candidate key set so that a run
//! can be killed at any moment and resumed later without redoing completed
//! work.
//!
//! # Algorithm
//!
//! 1. Load the checkpoint map. Keys whose entry is terminal (`success`,
//!    `permanent_skip`) are dropped from the work list.
//! 2. Walk the remaining keys in input order, `chunk_size` at a time.
//! 3. Record each outcome in memory as soon as the processor returns.
//! 4. Every `flush_every` outcomes and at the end of every chunk, persist
//!    the entries recorded since the previous flush. Entries written by other
//!    workers on the same job are never overwritten with a stale copy.
//!
//! A crash between flushes loses at most `flush_every - 1` outcomes, which
//! are simply reprocessed next run; the processor must tolerate that.
//! Persistence errors are never swallowed: they abort the run.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::clock::{Clock, SystemClock};
use crate::error::{HarvestError, PersistenceError};
use crate::models::{CheckpointEntry, CheckpointStatus, Outcome};
use crate::store::{CheckpointMap, CheckpointRepository};

/// The caller-supplied unit of work.
///
/// Must be idempotent: a key may be processed again after a crash. Fetch
/// and annotation problems belong in the returned [`Outcome`]; only
/// persistence failures should come back as `Err`.
#[async_trait]
pub trait KeyProcessor: Send + Sync {
    async fn process(&self, key: &str) -> Result<Outcome, PersistenceError>;
}

#[derive(Debug, Clone)]
pub struct HarvestOptions {
    /// Persist the checkpoint map after this many recorded outcomes.
    pub flush_every: usize,
    /// Upper bound on keys held in one in-memory batch.
    pub chunk_size: usize,
}

impl Default for HarvestOptions {
    fn default() -> Self {
        Self {
            flush_every: 20,
            chunk_size: 500,
        }
    }
}

/// What a run did and where every key stands afterwards.
#[derive(Debug, Clone, Default)]
pub struct HarvestReport {
    /// Entries loaded at the start of the run plus every outcome recorded by it.
    pub checkpoints: CheckpointMap,
    /// Success payloads of every successful key, including earlier runs.
    pub results: BTreeMap<String, serde_json::Value>,
    /// Keys handed to the processor in this run.
    pub processed: usize,
    /// Candidate keys skipped because an earlier run finished them.
    pub skipped_terminal: usize,
    /// Candidate keys never reached because a stop was requested.
    pub not_started: usize,
    pub flushes: usize,
    /// Candidate keys that are not in a terminal state after this run.
    pub pending: Vec<String>,
}

impl HarvestReport {
    /// True when every candidate key reached a terminal state.
    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn count(&self, status: CheckpointStatus) -> usize {
        self.checkpoints
            .values()
            .filter(|e| e.status == status)
            .count()
    }
}

/// Per-status counts of a checkpoint map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckpointSummary {
    pub success: usize,
    pub permanent_skip: usize,
    pub transient_failure: usize,
}

impl CheckpointSummary {
    pub fn of(entries: &CheckpointMap) -> Self {
        let mut summary = Self::default();
        for entry in entries.values() {
            match entry.status {
                CheckpointStatus::Success => summary.success += 1,
                CheckpointStatus::PermanentSkip => summary.permanent_skip += 1,
                CheckpointStatus::TransientFailure => summary.transient_failure += 1,
            }
        }
        summary
    }

    pub fn total(&self) -> usize {
        self.success + self.permanent_skip + self.transient_failure
    }
}

pub struct HarvestController {
    repo: Arc<dyn CheckpointRepository>,
    clock: Arc<dyn Clock>,
    stop: Arc<AtomicBool>,
}

impl HarvestController {
    pub fn new(repo: Arc<dyn CheckpointRepository>) -> Self {
        Self {
            repo,
            clock: Arc::new(SystemClock),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Share an existing stop flag, e.g. one wired to a signal handler.
    pub fn with_stop(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    /// Flag that, once set, stops the run from accepting new keys.
    ///
    /// The key in flight finishes and the map is flushed before `run` returns.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub async fn run(
        &self,
        candidate_keys: &[String],
        processor: &dyn KeyProcessor,
        options: &HarvestOptions,
    ) -> Result<HarvestReport, HarvestError> {
        if options.flush_every == 0 {
            return Err(HarvestError::InvalidOptions(
                "flush_every must be >= 1".to_string(),
            ));
        }
        if options.chunk_size == 0 {
            return Err(HarvestError::InvalidOptions(
                "chunk_size must be >= 1".to_string(),
            ));
        }

        let mut checkpoints = self.repo.load().await?;
        let mut report = HarvestReport::default();

        let mut queued = HashSet::new();
        let mut work: Vec<&String> = Vec::new();
        for key in candidate_keys {
            if !queued.insert(key.as_str()) {
                continue;
            }
            match checkpoints.get(key) {
                Some(entry) if entry.status.is_terminal() => report.skipped_terminal += 1,
                _ => work.push(key),
            }
        }

        tracing::info!(
            candidates = candidate_keys.len(),
            remaining = work.len(),
            skipped_terminal = report.skipped_terminal,
            "harvest starting"
        );

        let mut dirty = CheckpointMap::new();
        'chunks: for chunk in work.chunks(options.chunk_size) {
            for key in chunk {
                if self.stop.load(Ordering::SeqCst) {
                    tracing::warn!(key = key.as_str(), "stop requested; not accepting new keys");
                    break 'chunks;
                }

                let outcome = processor
                    .process(key)
                    .await
                    .map_err(|source| HarvestError::Processor {
                        key: key.to_string(),
                        source,
                    })?;

                match &outcome {
                    Outcome::Success(_) => tracing::debug!(key = key.as_str(), "success"),
                    Outcome::PermanentSkip(reason) => {
                        tracing::info!(key = key.as_str(), %reason, "permanent skip")
                    }
                    Outcome::TransientFailure(reason) => {
                        tracing::warn!(key = key.as_str(), %reason, "transient failure")
                    }
                }

                let attempts = checkpoints.get(*key).map_or(0, |e| e.attempts);
                let entry = CheckpointEntry::from_outcome(key, outcome, attempts, self.clock.now());
                dirty.insert(key.to_string(), entry.clone());
                checkpoints.insert(key.to_string(), entry);
                report.processed += 1;

                if dirty.len() >= options.flush_every {
                    self.flush(&mut dirty, &mut report).await?;
                }
            }

            if !dirty.is_empty() {
                self.flush(&mut dirty, &mut report).await?;
            }
        }

        if !dirty.is_empty() {
            self.flush(&mut dirty, &mut report).await?;
        }

        report.not_started = work.len() - report.processed;
        report.pending = queued
            .iter()
            .filter(|key| {
                !checkpoints
                    .get(**key)
                    .map_or(false, |e| e.status.is_terminal())
            })
            .map(|key| key.to_string())
            .collect();
        report.pending.sort();
        report.results = checkpoints
            .values()
            .filter(|e| e.status == CheckpointStatus::Success)
            .map(|e| (e.key.clone(), e.payload.clone()))
            .collect();
        report.checkpoints = checkpoints;

        tracing::info!(
            processed = report.processed,
            flushes = report.flushes,
            pending = report.pending.len(),
            "harvest finished"
        );
        Ok(report)
    }

    /// Current checkpoint counts without running anything.
    pub async fn status(&self) -> Result<CheckpointSummary, PersistenceError> {
        Ok(CheckpointSummary::of(&self.repo.load().await?))
    }

    pub async fn entries(&self) -> Result<CheckpointMap, PersistenceError> {
        self.repo.load().await
    }

    /// Forget the outcome of `keys` so the next run processes them again.
    pub async fn reset(&self, keys: &[String]) -> Result<usize, PersistenceError> {
        let removed = self.repo.remove(keys).await?;
        tracing::info!(removed, "checkpoint entries reset");
        Ok(removed)
    }

    pub async fn reset_all(&self) -> Result<usize, PersistenceError> {
        let removed = self.repo.clear().await?;
        tracing::info!(removed, "checkpoint cleared");
        Ok(removed)
    }

    async fn flush(
        &self,
        dirty: &mut CheckpointMap,
        report: &mut HarvestReport,
    ) -> Result<(), PersistenceError> {
        self.repo.save(dirty).await?;
        report.flushes += 1;
        tracing::debug!(entries = dirty.len(), "checkpoint flushed");
        dirty.clear();
        Ok(())
    }
}
