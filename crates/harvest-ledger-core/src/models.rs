//! Core data models used throughout Harvest Ledger.
//!
//! These types represent the attribute snapshots, version records,
//! vocabulary terms and checkpoint entries that flow between the fetch
//! client, the harvest controller and the versioning store.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single attribute value inside a [`Snapshot`].
///
/// Serialized untagged, so a stored snapshot reads as plain JSON:
/// `null`, `"text"`, `570`, `12.5`, or `[3, 17, 42]` for interned term ids.
/// Whole numbers that fit an `i64` stay exact so large ids never collide.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Text(String),
    Integer(i64),
    Number(f64),
    Terms(Vec<i64>),
}

impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        use FieldValue::*;
        match (self, other) {
            (Null, Null) => true,
            (Text(a), Text(b)) => a == b,
            (Integer(a), Integer(b)) => a == b,
            (Number(a), Number(b)) => a == b,
            (Integer(i), Number(n)) | (Number(n), Integer(i)) => {
                n.fract() == 0.0 && *n as i64 == *i && *i as f64 == *n
            }
            (Terms(a), Terms(b)) => a == b,
            _ => false,
        }
    }
}

impl FieldValue {
    /// Absent, null and empty-string all mean "unset".
    pub fn is_unset(&self) -> bool {
        match self {
            FieldValue::Null => true,
            FieldValue::Text(s) => s.is_empty(),
            _ => false,
        }
    }

    /// Convert a raw JSON value into a field value.
    ///
    /// Booleans become `1`/`0`; objects and string arrays are kept as their
    /// JSON text because only the interner may produce [`FieldValue::Terms`].
    pub fn from_json(value: &serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => FieldValue::Null,
            Value::String(s) => FieldValue::Text(s.clone()),
            Value::Number(n) => match n.as_i64() {
                Some(i) => FieldValue::Integer(i),
                None => n.as_f64().map(FieldValue::Number).unwrap_or(FieldValue::Null),
            },
            Value::Bool(b) => FieldValue::Integer(i64::from(*b)),
            other => FieldValue::Text(other.to_string()),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => write!(f, "null"),
            FieldValue::Text(s) => write!(f, "{}", s),
            FieldValue::Integer(n) => write!(f, "{}", n),
            FieldValue::Number(n) => write!(f, "{}", n),
            FieldValue::Terms(ids) => {
                let parts: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<i64> for FieldValue {
    fn from(n: i64) -> Self {
        FieldValue::Integer(n)
    }
}

impl From<f64> for FieldValue {
    fn from(n: f64) -> Self {
        FieldValue::Number(n)
    }
}

impl From<Vec<i64>> for FieldValue {
    fn from(ids: Vec<i64>) -> Self {
        FieldValue::Terms(ids)
    }
}

/// Observed state of one entity at one point in time.
///
/// Fields are kept ordered by name so the stored JSON is stable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot {
    fields: BTreeMap<String, FieldValue>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, handy for literals in tests and importers.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Field-by-field comparison with null normalization.
    ///
    /// Every field name present in either snapshot is compared; a field
    /// missing on one side equals an unset value on the other.
    pub fn same_as(&self, other: &Snapshot) -> bool {
        let unset = FieldValue::Null;
        self.fields
            .keys()
            .chain(other.fields.keys())
            .all(|name| {
                let a = self.fields.get(name).unwrap_or(&unset);
                let b = other.fields.get(name).unwrap_or(&unset);
                match (a.is_unset(), b.is_unset()) {
                    (true, true) => true,
                    (false, false) => a == b,
                    _ => false,
                }
            })
    }
}

/// One validity interval of one entity's history.
///
/// Intervals are half-open: `valid_from` is inclusive, `valid_to` exclusive.
/// `valid_to == None` is the open sentinel, i.e. the current version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionRecord {
    pub entity_key: String,
    pub snapshot: Snapshot,
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
}

impl VersionRecord {
    pub fn open(entity_key: &str, snapshot: Snapshot, valid_from: DateTime<Utc>) -> Self {
        Self {
            entity_key: entity_key.to_string(),
            snapshot,
            valid_from,
            valid_to: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.valid_to.is_none()
    }

    pub fn covers(&self, at: DateTime<Utc>) -> bool {
        self.valid_from <= at && self.valid_to.map_or(true, |end| at < end)
    }
}

/// Result of a versioning upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

impl UpsertOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpsertOutcome::Inserted => "inserted",
            UpsertOutcome::Updated => "updated",
            UpsertOutcome::Unchanged => "unchanged",
        }
    }
}

/// An interned vocabulary term.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Term {
    pub term: String,
    pub id: i64,
}

/// Result of processing one candidate key.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(serde_json::Value),
    /// The key structurally does not qualify; never retried automatically.
    PermanentSkip(String),
    /// The key may succeed on a later run.
    TransientFailure(String),
}

impl Outcome {
    pub fn status(&self) -> CheckpointStatus {
        match self {
            Outcome::Success(_) => CheckpointStatus::Success,
            Outcome::PermanentSkip(_) => CheckpointStatus::PermanentSkip,
            Outcome::TransientFailure(_) => CheckpointStatus::TransientFailure,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Success,
    PermanentSkip,
    TransientFailure,
}

impl CheckpointStatus {
    /// Terminal keys are excluded from later runs until reset.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CheckpointStatus::TransientFailure)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::Success => "success",
            CheckpointStatus::PermanentSkip => "permanent_skip",
            CheckpointStatus::TransientFailure => "transient_failure",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(CheckpointStatus::Success),
            "permanent_skip" => Some(CheckpointStatus::PermanentSkip),
            "transient_failure" => Some(CheckpointStatus::TransientFailure),
            _ => None,
        }
    }
}

/// Durable per-key processing record owned by the harvest controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub key: String,
    pub status: CheckpointStatus,
    /// Last success payload, `null` for skips and failures.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Skip or failure reason.
    #[serde(default)]
    pub detail: Option<String>,
    /// Number of runs that processed this key.
    #[serde(default)]
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
}

impl CheckpointEntry {
    pub fn from_outcome(
        key: &str,
        outcome: Outcome,
        previous_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let status = outcome.status();
        let (payload, detail) = match outcome {
            Outcome::Success(payload) => (payload, None),
            Outcome::PermanentSkip(reason) | Outcome::TransientFailure(reason) => {
                (serde_json::Value::Null, Some(reason))
            }
        };
        Self {
            key: key.to_string(),
            status,
            payload,
            detail,
            attempts: previous_attempts + 1,
            updated_at: now,
        }
    }
}

/// A raw record as returned by the remote service.
pub type RawRecord = serde_json::Map<String, serde_json::Value>;

/// Opaque pagination token handed back by the remote service.
pub type Cursor = String;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_normalization() {
        let a = Snapshot::new().with("name", "Dota").with("publisher", "");
        let b = Snapshot::new()
            .with("name", "Dota")
            .with("developer", FieldValue::Null);
        assert!(a.same_as(&b));
        assert!(b.same_as(&a));
    }

    #[test]
    fn test_changed_value_detected() {
        let a = Snapshot::new().with("score", 5.0);
        let b = Snapshot::new().with("score", 7.0);
        assert!(!a.same_as(&b));
    }

    #[test]
    fn test_large_ids_stay_distinct() {
        let a = FieldValue::from_json(&serde_json::json!(9_007_199_254_740_993_i64));
        let b = FieldValue::from_json(&serde_json::json!(9_007_199_254_740_992_i64));
        assert_eq!(a, FieldValue::Integer(9_007_199_254_740_993));
        assert_ne!(a, b);
        assert!(!Snapshot::new().with("id", a).same_as(&Snapshot::new().with("id", b)));

        let snap = Snapshot::new().with("id", 9_007_199_254_740_993_i64);
        let stored = serde_json::to_string(&snap).unwrap();
        let back: Snapshot = serde_json::from_str(&stored).unwrap();
        assert_eq!(back.get("id"), Some(&FieldValue::Integer(9_007_199_254_740_993)));
    }

    #[test]
    fn test_whole_float_equals_integer() {
        assert_eq!(FieldValue::Integer(10), FieldValue::Number(10.0));
        assert_ne!(FieldValue::Integer(10), FieldValue::Number(10.5));
        assert_eq!(FieldValue::from_json(&serde_json::json!(true)), FieldValue::Integer(1));
    }

    #[test]
    fn test_unset_vs_value_differs() {
        let a = Snapshot::new().with("name", "");
        let b = Snapshot::new().with("name", "x");
        assert!(!a.same_as(&b));
        assert!(!Snapshot::new().same_as(&b));
    }

    #[test]
    fn test_empty_term_list_is_a_value() {
        let a = Snapshot::new().with("tags", Vec::<i64>::new());
        assert!(!a.same_as(&Snapshot::new()));
    }

    #[test]
    fn test_term_order_matters() {
        let a = Snapshot::new().with("tags", vec![1, 2]);
        let b = Snapshot::new().with("tags", vec![2, 1]);
        assert!(!a.same_as(&b));
    }

    #[test]
    fn test_snapshot_json_is_plain() {
        let snap = Snapshot::new()
            .with("name", "Smite")
            .with("price_us", 9.99)
            .with("tags", vec![3, 4])
            .with("dev", FieldValue::Null);
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"dev": null, "name": "Smite", "price_us": 9.99, "tags": [3, 4]})
        );
        let back: Snapshot = serde_json::from_value(json).unwrap();
        assert!(back.same_as(&snap));
        assert_eq!(back.get("tags"), Some(&FieldValue::Terms(vec![3, 4])));
    }

    #[test]
    fn test_covers_half_open() {
        let t1 = DateTime::from_timestamp(100, 0).unwrap();
        let t2 = DateTime::from_timestamp(200, 0).unwrap();
        let mut rec = VersionRecord::open("a", Snapshot::new(), t1);
        assert!(rec.covers(t2));
        rec.valid_to = Some(t2);
        assert!(rec.covers(t1));
        assert!(!rec.covers(t2));
    }

    #[test]
    fn test_entry_from_outcome_counts_attempts() {
        let now = Utc::now();
        let e = CheckpointEntry::from_outcome("k", Outcome::TransientFailure("503".into()), 2, now);
        assert_eq!(e.status, CheckpointStatus::TransientFailure);
        assert_eq!(e.attempts, 3);
        assert_eq!(e.detail.as_deref(), Some("503"));
        assert!(!e.status.is_terminal());
    }
}
