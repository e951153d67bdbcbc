//! Local records, queue entries and sync metadata.

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use super::entity::EntityKind;

/// Current time as unix milliseconds, the stamp format for `modified`
/// and queue timestamps.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// A locally stored record: the entity's fields plus sync metadata.
///
/// Fields are schemaless at this level; the per-kind column schema only
/// matters at the wire boundary (see [`crate::models::entity`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Locally unique key within the kind's table.
    pub key: String,
    /// Entity fields by name.
    pub fields: Map<String, Value>,
    /// True once the remote backend has accepted this version.
    pub synced: bool,
    /// Unix-millisecond stamp of the last local mutation.
    pub modified: i64,
    /// Tombstone: deleted locally, awaiting remote confirmation.
    pub deleted: bool,
    /// The backend's positional row identifier, absent until the first
    /// successful push or pull.
    pub row_index: Option<i64>,
}

impl Record {
    /// A fresh unsynced record stamped now.
    pub fn new(key: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            key: key.into(),
            fields,
            synced: false,
            modified: now_millis(),
            deleted: false,
            row_index: None,
        }
    }

    /// Natural-key tuple of this record for the given kind.
    pub fn natural_key(&self, kind: EntityKind) -> Vec<String> {
        natural_key_of(kind, &self.fields)
    }
}

/// Natural-key tuple for a field map: every key field rendered as a
/// string. Absent and null fields render as the empty string so that a
/// locally omitted field still matches a blank remote cell.
pub fn natural_key_of(kind: EntityKind, fields: &Map<String, Value>) -> Vec<String> {
    kind.natural_key()
        .iter()
        .map(|f| key_component(fields.get(*f)))
        .collect()
}

fn key_component(v: Option<&Value>) -> String {
    match v {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Read filter shared by local queries and backend pulls. `date` wins
/// over the range bounds when both are set; bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordQuery {
    pub date: Option<NaiveDate>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    /// Keep only the most recent `limit` records of the result.
    pub limit: Option<u32>,
}

impl RecordQuery {
    /// No filtering: every live record of the kind.
    pub fn all() -> Self {
        Self::default()
    }

    /// Records on exactly this date.
    pub fn on(date: NaiveDate) -> Self {
        Self {
            date: Some(date),
            ..Self::default()
        }
    }

    /// Records between the two dates, inclusive.
    pub fn range(from: NaiveDate, to: NaiveDate) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Stable key identifying this query shape, used to gate repeat
    /// background pulls for the same range.
    pub fn cache_key(&self) -> String {
        fn d(v: &Option<NaiveDate>) -> String {
            v.map(|d| d.to_string()).unwrap_or_default()
        }
        format!(
            "{}:{}:{}:{}",
            d(&self.date),
            d(&self.from),
            d(&self.to),
            self.limit.map(|l| l.to_string()).unwrap_or_default()
        )
    }
}

/// Remote operation a queue entry asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Append,
    Update,
    Delete,
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncAction::Append => f.pad("append"),
            SyncAction::Update => f.pad("update"),
            SyncAction::Delete => f.pad("delete"),
        }
    }
}

impl FromStr for SyncAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "append" => Ok(SyncAction::Append),
            "update" => Ok(SyncAction::Update),
            "delete" => Ok(SyncAction::Delete),
            _ => Err(format!("Unknown sync action '{}'", s)),
        }
    }
}

/// One pending mutation in the durable sync queue. `id` assigns FIFO
/// order; `fields` is the record snapshot taken at enqueue time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: i64,
    pub kind: EntityKind,
    pub action: SyncAction,
    pub key: String,
    pub fields: Map<String, Value>,
    pub row_index: Option<i64>,
    pub queued_at: i64,
    pub retries: i64,
}

/// A queue entry abandoned after exhausting its retries. The mutation
/// is permanently lost remotely; the local record stays unsynced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The abandoned entry's original queue id.
    pub queue_id: i64,
    pub kind: EntityKind,
    pub action: SyncAction,
    pub key: String,
    pub fields: Map<String, Value>,
    pub retries: i64,
    pub abandoned_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_new_record_is_unsynced() {
        let rec = Record::new("1", fields(&[("date", json!("2026-03-01"))]));
        assert_eq!(rec.key, "1");
        assert!(!rec.synced);
        assert!(!rec.deleted);
        assert!(rec.row_index.is_none());
        assert!(rec.modified > 0);
    }

    #[test]
    fn test_natural_key_tuple() {
        let rec = Record::new(
            "3",
            fields(&[
                ("date", json!("2026-03-01")),
                ("type", json!("run")),
                ("exercise", json!("5k")),
                ("duration_min", json!(31)),
            ]),
        );
        assert_eq!(
            rec.natural_key(EntityKind::Fitness),
            vec!["2026-03-01", "run", "5k"]
        );
    }

    #[test]
    fn test_natural_key_missing_field_matches_blank_cell() {
        let local = fields(&[("date", json!("2026-03-01")), ("name", json!("aspirin"))]);
        let remote = fields(&[
            ("date", json!("2026-03-01")),
            ("name", json!("aspirin")),
            ("time", Value::Null),
        ]);
        assert_eq!(
            natural_key_of(EntityKind::Medications, &local),
            natural_key_of(EntityKind::Medications, &remote)
        );
    }

    #[test]
    fn test_natural_key_renders_numbers_as_strings() {
        let f = fields(&[("date", json!("2026-03-01")), ("habit_id", json!(12))]);
        assert_eq!(
            natural_key_of(EntityKind::Habits, &f),
            vec!["2026-03-01", "12"]
        );
    }

    #[test]
    fn test_sync_action_roundtrip() {
        for action in [SyncAction::Append, SyncAction::Update, SyncAction::Delete] {
            let parsed: SyncAction = action.to_string().parse().unwrap();
            assert_eq!(parsed, action);
        }
        assert!("upsert".parse::<SyncAction>().is_err());
    }

    #[test]
    fn test_record_json_roundtrip() {
        let rec = Record::new("7", fields(&[("date", json!("2026-03-01"))]));
        let json = serde_json::to_string(&rec).unwrap();
        let parsed: Record = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, rec);
    }

    #[test]
    fn test_query_cache_key_distinguishes_shapes() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let exact = RecordQuery::on(date);
        let range = RecordQuery::range(date, date);
        let limited = RecordQuery::on(date).with_limit(10);
        assert_ne!(exact.cache_key(), range.cache_key());
        assert_ne!(exact.cache_key(), limited.cache_key());
        assert_eq!(exact.cache_key(), RecordQuery::on(date).cache_key());
    }
}
