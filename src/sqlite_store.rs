//! SQLite-backed repository implementations.
//!
//! Timestamps are stored as UTC microseconds. An open version carries
//! [`OPEN_SENTINEL_MICROS`] (9999-12-31T00:00:00Z) in `valid_to`, and a
//! unique partial index on that value guarantees at most one open version
//! per key even if two writers race past the conditional checks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use harvest_ledger_core::error::PersistenceError;
use harvest_ledger_core::models::{
    CheckpointEntry, CheckpointStatus, Snapshot, Term, VersionRecord,
};
use harvest_ledger_core::store::{
    CheckpointMap, CheckpointRepository, VersionRepository, VocabularyRepository,
};

/// `valid_to` of the open version.
pub const OPEN_SENTINEL_MICROS: i64 = 253_402_214_400_000_000;

fn db_err(store: &'static str) -> impl Fn(sqlx::Error) -> PersistenceError {
    move |e| PersistenceError::backend(store, e)
}

pub(crate) fn to_micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

pub(crate) fn from_micros(micros: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(
        micros.div_euclid(1_000_000),
        (micros.rem_euclid(1_000_000) * 1_000) as u32,
    )
}

pub struct SqliteVersions {
    pool: SqlitePool,
}

impl SqliteVersions {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn version_from_row(row: &SqliteRow) -> Result<VersionRecord, PersistenceError> {
    let key: String = row.get("entity_key");
    let from: i64 = row.get("valid_from");
    let to: i64 = row.get("valid_to");
    let json: String = row.get("snapshot_json");

    let valid_from = from_micros(from).ok_or_else(|| {
        PersistenceError::corrupt("versions", format!("bad valid_from {} for {}", from, key))
    })?;
    let valid_to = if to == OPEN_SENTINEL_MICROS {
        None
    } else {
        Some(from_micros(to).ok_or_else(|| {
            PersistenceError::corrupt("versions", format!("bad valid_to {} for {}", to, key))
        })?)
    };
    let snapshot: Snapshot = serde_json::from_str(&json)?;

    Ok(VersionRecord {
        entity_key: key,
        snapshot,
        valid_from,
        valid_to,
    })
}

#[async_trait]
impl VersionRepository for SqliteVersions {
    async fn find_open_version(
        &self,
        key: &str,
    ) -> Result<Option<VersionRecord>, PersistenceError> {
        let row = sqlx::query(
            "SELECT entity_key, valid_from, valid_to, snapshot_json FROM entity_versions \
             WHERE entity_key = ? AND valid_to = ?",
        )
        .bind(key)
        .bind(OPEN_SENTINEL_MICROS)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("versions"))?;

        row.as_ref().map(version_from_row).transpose()
    }

    async fn insert_version(&self, record: &VersionRecord) -> Result<bool, PersistenceError> {
        let json = serde_json::to_string(&record.snapshot)?;
        let result = sqlx::query(
            r#"
            INSERT INTO entity_versions (entity_key, valid_from, valid_to, snapshot_json)
            SELECT ?, ?, ?, ?
            WHERE NOT EXISTS (
                SELECT 1 FROM entity_versions WHERE entity_key = ? AND valid_to = ?
            )
            "#,
        )
        .bind(&record.entity_key)
        .bind(to_micros(record.valid_from))
        .bind(OPEN_SENTINEL_MICROS)
        .bind(&json)
        .bind(&record.entity_key)
        .bind(OPEN_SENTINEL_MICROS)
        .execute(&self.pool)
        .await
        .map_err(db_err("versions"))?;

        Ok(result.rows_affected() == 1)
    }

    async fn close_version(
        &self,
        key: &str,
        open_from: DateTime<Utc>,
        valid_to: DateTime<Utc>,
        successor: &VersionRecord,
    ) -> Result<bool, PersistenceError> {
        let json = serde_json::to_string(&successor.snapshot)?;
        let mut tx = self.pool.begin().await.map_err(db_err("versions"))?;

        let closed = sqlx::query(
            "UPDATE entity_versions SET valid_to = ? \
             WHERE entity_key = ? AND valid_from = ? AND valid_to = ?",
        )
        .bind(to_micros(valid_to))
        .bind(key)
        .bind(to_micros(open_from))
        .bind(OPEN_SENTINEL_MICROS)
        .execute(&mut *tx)
        .await
        .map_err(db_err("versions"))?;

        if closed.rows_affected() != 1 {
            tx.rollback().await.map_err(db_err("versions"))?;
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO entity_versions (entity_key, valid_from, valid_to, snapshot_json) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(&successor.entity_key)
        .bind(to_micros(successor.valid_from))
        .bind(OPEN_SENTINEL_MICROS)
        .bind(&json)
        .execute(&mut *tx)
        .await
        .map_err(db_err("versions"))?;

        tx.commit().await.map_err(db_err("versions"))?;
        Ok(true)
    }

    async fn history(&self, key: &str) -> Result<Vec<VersionRecord>, PersistenceError> {
        let rows = sqlx::query(
            "SELECT entity_key, valid_from, valid_to, snapshot_json FROM entity_versions \
             WHERE entity_key = ? ORDER BY valid_from ASC",
        )
        .bind(key)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("versions"))?;

        rows.iter().map(version_from_row).collect()
    }

    async fn version_at(
        &self,
        key: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<VersionRecord>, PersistenceError> {
        let t = to_micros(at);
        let row = sqlx::query(
            "SELECT entity_key, valid_from, valid_to, snapshot_json FROM entity_versions \
             WHERE entity_key = ? AND valid_from <= ? AND valid_to > ? \
             ORDER BY valid_from DESC LIMIT 1",
        )
        .bind(key)
        .bind(t)
        .bind(t)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("versions"))?;

        row.as_ref().map(version_from_row).transpose()
    }
}

/// `vocabulary_terms` table. Allocation runs inside one transaction whose
/// first statement is a write, so concurrent allocators serialize on
/// SQLite's writer lock.
pub struct SqliteVocabulary {
    pool: SqlitePool,
}

impl SqliteVocabulary {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VocabularyRepository for SqliteVocabulary {
    async fn load(&self) -> Result<Vec<Term>, PersistenceError> {
        let rows = sqlx::query("SELECT term_id, term FROM vocabulary_terms ORDER BY term_id ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("vocabulary"))?;

        Ok(rows
            .iter()
            .map(|row| Term {
                id: row.get("term_id"),
                term: row.get("term"),
            })
            .collect())
    }

    async fn get_or_create_many(&self, terms: &[String]) -> Result<Vec<i64>, PersistenceError> {
        let mut tx = self.pool.begin().await.map_err(db_err("vocabulary"))?;
        let mut ids = Vec::with_capacity(terms.len());

        for term in terms {
            sqlx::query(
                r#"
                INSERT INTO vocabulary_terms (term_id, term)
                SELECT (SELECT COALESCE(MAX(term_id), 0) + 1 FROM vocabulary_terms), ?
                WHERE NOT EXISTS (SELECT 1 FROM vocabulary_terms WHERE term = ?)
                "#,
            )
            .bind(term)
            .bind(term)
            .execute(&mut *tx)
            .await
            .map_err(db_err("vocabulary"))?;

            let id: i64 = sqlx::query_scalar("SELECT term_id FROM vocabulary_terms WHERE term = ?")
                .bind(term)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err("vocabulary"))?;
            ids.push(id);
        }

        tx.commit().await.map_err(db_err("vocabulary"))?;
        Ok(ids)
    }
}

/// `harvest_checkpoints` rows for one job.
pub struct SqliteCheckpoints {
    pool: SqlitePool,
    job: String,
}

impl SqliteCheckpoints {
    pub fn new(pool: SqlitePool, job: &str) -> Self {
        Self {
            pool,
            job: job.to_string(),
        }
    }
}

fn checkpoint_from_row(row: &SqliteRow) -> Result<CheckpointEntry, PersistenceError> {
    let key: String = row.get("entity_key");
    let status: String = row.get("status");
    let payload: String = row.get("payload_json");
    let attempts: i64 = row.get("attempts");
    let updated_at: i64 = row.get("updated_at");

    let status = CheckpointStatus::parse(&status).ok_or_else(|| {
        PersistenceError::corrupt(
            "checkpoints",
            format!("unknown status '{}' for {}", status, key),
        )
    })?;
    let updated_at = from_micros(updated_at).ok_or_else(|| {
        PersistenceError::corrupt("checkpoints", format!("bad updated_at for {}", key))
    })?;

    Ok(CheckpointEntry {
        key,
        status,
        payload: serde_json::from_str(&payload)?,
        detail: row.get("detail"),
        attempts: attempts.max(0) as u32,
        updated_at,
    })
}

#[async_trait]
impl CheckpointRepository for SqliteCheckpoints {
    async fn load(&self) -> Result<CheckpointMap, PersistenceError> {
        let rows = sqlx::query(
            "SELECT entity_key, status, payload_json, detail, attempts, updated_at \
             FROM harvest_checkpoints WHERE job = ?",
        )
        .bind(&self.job)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("checkpoints"))?;

        let mut map = CheckpointMap::with_capacity(rows.len());
        for row in &rows {
            let entry = checkpoint_from_row(row)?;
            map.insert(entry.key.clone(), entry);
        }
        Ok(map)
    }

    async fn save(&self, entries: &CheckpointMap) -> Result<(), PersistenceError> {
        let mut tx = self.pool.begin().await.map_err(db_err("checkpoints"))?;

        for entry in entries.values() {
            let payload = serde_json::to_string(&entry.payload)?;
            sqlx::query(
                r#"
                INSERT INTO harvest_checkpoints
                    (job, entity_key, status, payload_json, detail, attempts, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(job, entity_key) DO UPDATE SET
                    status = excluded.status,
                    payload_json = excluded.payload_json,
                    detail = excluded.detail,
                    attempts = excluded.attempts,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&self.job)
            .bind(&entry.key)
            .bind(entry.status.as_str())
            .bind(payload)
            .bind(&entry.detail)
            .bind(entry.attempts as i64)
            .bind(to_micros(entry.updated_at))
            .execute(&mut *tx)
            .await
            .map_err(db_err("checkpoints"))?;
        }

        tx.commit().await.map_err(db_err("checkpoints"))?;
        Ok(())
    }

    async fn remove(&self, keys: &[String]) -> Result<usize, PersistenceError> {
        let mut tx = self.pool.begin().await.map_err(db_err("checkpoints"))?;
        let mut removed = 0;
        for key in keys {
            let result =
                sqlx::query("DELETE FROM harvest_checkpoints WHERE job = ? AND entity_key = ?")
                    .bind(&self.job)
                    .bind(key)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err("checkpoints"))?;
            removed += result.rows_affected() as usize;
        }
        tx.commit().await.map_err(db_err("checkpoints"))?;
        Ok(removed)
    }

    async fn clear(&self) -> Result<usize, PersistenceError> {
        let result = sqlx::query("DELETE FROM harvest_checkpoints WHERE job = ?")
            .bind(&self.job)
            .execute(&self.pool)
            .await
            .map_err(db_err("checkpoints"))?;
        Ok(result.rows_affected() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_is_year_9999() {
        let at = from_micros(OPEN_SENTINEL_MICROS).unwrap();
        assert_eq!(at.to_rfc3339(), "9999-12-31T00:00:00+00:00");
    }

    #[test]
    fn test_micros_keep_subsecond_precision() {
        let at = DateTime::parse_from_rfc3339("2025-03-20T15:23:00.000123Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(from_micros(to_micros(at)), Some(at));
    }

    #[test]
    fn test_micros_before_epoch() {
        let at = DateTime::parse_from_rfc3339("1969-12-31T23:59:59.5Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(from_micros(to_micros(at)), Some(at));
    }
}
