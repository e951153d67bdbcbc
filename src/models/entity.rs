//! Entity kinds and their column schemas.
//!
//! Every category of tracked data is an [`EntityKind`]. The per-kind
//! column list, natural key, key mode and date-index flag are
//! configuration: the sheet backend stores positional row arrays, so
//! encoding and decoding always go through the column list here.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// How local keys are assigned for a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMode {
    /// Store-assigned auto-increment, never reused.
    Auto,
    /// Client-generated opaque id, carried in the named field.
    Generated(&'static str),
    /// The key is the value of the named field (key-value kinds).
    Semantic(&'static str),
}

/// One category of tracked data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Health,
    Medications,
    Appointments,
    Fitness,
    Nutrition,
    Water,
    Sleep,
    Mood,
    Meditation,
    Habits,
    HabitDefs,
    Goals,
    Profile,
}

impl EntityKind {
    pub const ALL: [EntityKind; 13] = [
        EntityKind::Health,
        EntityKind::Medications,
        EntityKind::Appointments,
        EntityKind::Fitness,
        EntityKind::Nutrition,
        EntityKind::Water,
        EntityKind::Sleep,
        EntityKind::Mood,
        EntityKind::Meditation,
        EntityKind::Habits,
        EntityKind::HabitDefs,
        EntityKind::Goals,
        EntityKind::Profile,
    ];

    /// Sheet name on the remote backend (also the CLI spelling).
    pub fn sheet_name(&self) -> &'static str {
        match self {
            EntityKind::Health => "health",
            EntityKind::Medications => "medications",
            EntityKind::Appointments => "appointments",
            EntityKind::Fitness => "fitness",
            EntityKind::Nutrition => "nutrition",
            EntityKind::Water => "water",
            EntityKind::Sleep => "sleep",
            EntityKind::Mood => "mood",
            EntityKind::Meditation => "meditation",
            EntityKind::Habits => "habits",
            EntityKind::HabitDefs => "habit_defs",
            EntityKind::Goals => "goals",
            EntityKind::Profile => "profile",
        }
    }

    /// Local SQLite table for this kind.
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Health => "records_health",
            EntityKind::Medications => "records_medications",
            EntityKind::Appointments => "records_appointments",
            EntityKind::Fitness => "records_fitness",
            EntityKind::Nutrition => "records_nutrition",
            EntityKind::Water => "records_water",
            EntityKind::Sleep => "records_sleep",
            EntityKind::Mood => "records_mood",
            EntityKind::Meditation => "records_meditation",
            EntityKind::Habits => "records_habits",
            EntityKind::HabitDefs => "records_habit_defs",
            EntityKind::Goals => "records_goals",
            EntityKind::Profile => "records_profile",
        }
    }

    /// Column order on the remote sheet. Rows are positional arrays in
    /// exactly this order; reads may carry one trailing element (the
    /// sheet row number) past the last column.
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            EntityKind::Health => &[
                "date",
                "weight_kg",
                "systolic",
                "diastolic",
                "heart_rate",
                "notes",
            ],
            EntityKind::Medications => &["date", "name", "dose", "time", "taken", "notes"],
            EntityKind::Appointments => &["date", "time", "doctor", "location", "reason", "notes"],
            EntityKind::Fitness => &[
                "date",
                "type",
                "exercise",
                "duration_min",
                "distance_km",
                "calories",
                "notes",
            ],
            EntityKind::Nutrition => &[
                "date",
                "meal",
                "food",
                "calories",
                "protein_g",
                "carbs_g",
                "fat_g",
                "notes",
            ],
            EntityKind::Water => &["date", "time", "amount_ml"],
            EntityKind::Sleep => &["date", "hours", "quality", "notes"],
            EntityKind::Mood => &["date", "time", "rating", "notes"],
            EntityKind::Meditation => &["date", "type", "duration_min", "notes"],
            EntityKind::Habits => &["date", "habit_id", "completed"],
            EntityKind::HabitDefs => &["id", "name", "description", "frequency", "created"],
            EntityKind::Goals => &[
                "id", "title", "category", "target", "progress", "deadline", "created",
            ],
            EntityKind::Profile => &["key", "value"],
        }
    }

    /// Field tuple used to match a local record against a pulled row.
    /// All components compare as strings and all must match.
    pub fn natural_key(&self) -> &'static [&'static str] {
        match self {
            EntityKind::Health => &["date"],
            EntityKind::Medications => &["date", "name", "time"],
            EntityKind::Appointments => &["date", "time", "doctor"],
            EntityKind::Fitness => &["date", "type", "exercise"],
            EntityKind::Nutrition => &["date", "meal", "food"],
            EntityKind::Water => &["date", "time"],
            EntityKind::Sleep => &["date"],
            EntityKind::Mood => &["date", "time"],
            EntityKind::Meditation => &["date", "type"],
            EntityKind::Habits => &["date", "habit_id"],
            EntityKind::HabitDefs => &["id"],
            EntityKind::Goals => &["id"],
            EntityKind::Profile => &["key"],
        }
    }

    pub fn key_mode(&self) -> KeyMode {
        match self {
            EntityKind::HabitDefs | EntityKind::Goals => KeyMode::Generated("id"),
            EntityKind::Profile => KeyMode::Semantic("key"),
            _ => KeyMode::Auto,
        }
    }

    /// Whether records of this kind carry a `date` field with a local
    /// secondary index, and take part in the per-cycle pull of today's
    /// rows.
    pub fn is_date_indexed(&self) -> bool {
        !matches!(
            self,
            EntityKind::HabitDefs | EntityKind::Goals | EntityKind::Profile
        )
    }

    /// The one kind whose remote sheet is replaced wholesale on update
    /// (key-value layout, no positional addressing).
    pub fn is_key_value(&self) -> bool {
        matches!(self, EntityKind::Profile)
    }

    pub fn parse(s: &str) -> Option<Self> {
        EntityKind::ALL
            .into_iter()
            .find(|k| k.sheet_name() == s.to_lowercase())
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.sheet_name())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::parse(s).ok_or_else(|| {
            format!(
                "Unknown entity kind '{}'. Valid kinds: {}",
                s,
                EntityKind::ALL
                    .iter()
                    .map(|k| k.sheet_name())
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        })
    }
}

/// Encodes a field map into a positional row in this kind's column
/// order. Absent fields encode to `null`.
pub fn encode_row(kind: EntityKind, fields: &Map<String, Value>) -> Vec<Value> {
    kind.columns()
        .iter()
        .map(|col| fields.get(*col).cloned().unwrap_or(Value::Null))
        .collect()
}

/// Decodes a positional row into a field map. Cells past the column
/// list are ignored except for the first, which is interpreted as the
/// sheet row number when numeric.
pub fn decode_row(kind: EntityKind, row: &[Value]) -> (Map<String, Value>, Option<i64>) {
    let columns = kind.columns();
    let mut fields = Map::new();
    for (i, col) in columns.iter().enumerate() {
        fields.insert(
            (*col).to_string(),
            row.get(i).cloned().unwrap_or(Value::Null),
        );
    }
    let row_index = row.get(columns.len()).and_then(cell_as_i64);
    (fields, row_index)
}

fn cell_as_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
