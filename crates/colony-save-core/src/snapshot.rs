use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::version::SaveVersion;

/// Complete serializable state of the simulation at a point in time.
///
/// Only the sections inspected by the validator are typed; everything else is
/// carried as JSON so the persistence layer never needs to know about the
/// simulation's internals. Unknown keys inside typed records land in `extra`
/// and are written back unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: SaveVersion,
    pub save_id: String,
    #[serde(default)]
    pub save_name: String,
    pub created_at: DateTime<Utc>,
    pub last_saved: DateTime<Utc>,
    pub colony: Colony,
    pub resources: BTreeMap<String, f64>,
    #[serde(default)]
    pub ants: Vec<Ant>,
    #[serde(default)]
    pub buildings: Vec<Building>,
    #[serde(default = "empty_object")]
    pub research: Value,
    #[serde(default)]
    pub evolution: Evolution,
    #[serde(default = "empty_object")]
    pub environment: Value,
    #[serde(default)]
    pub events: Vec<GameEventRecord>,
    #[serde(default = "empty_object")]
    pub statistics: Value,
    #[serde(default = "empty_object")]
    pub settings: Value,
    #[serde(default = "empty_object")]
    pub view_state: Value,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl Snapshot {
    /// Fresh snapshot for a new colony, stamped with the current version.
    pub fn new(save_name: impl Into<String>, colony_name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            version: SaveVersion::current(),
            save_id: uuid::Uuid::new_v4().to_string(),
            save_name: save_name.into(),
            created_at: now,
            last_saved: now,
            colony: Colony {
                name: colony_name.into(),
                population: 0,
                extra: Map::new(),
            },
            resources: default_resources(),
            ants: Vec::new(),
            buildings: Vec::new(),
            research: empty_object(),
            evolution: Evolution::default(),
            environment: empty_object(),
            events: Vec::new(),
            statistics: empty_object(),
            settings: empty_object(),
            view_state: empty_object(),
        }
    }
}

/// Starting stockpile used for new colonies and for repairing a lost resources section.
pub fn default_resources() -> BTreeMap<String, f64> {
    [("food", 100.0), ("wood", 50.0), ("stone", 25.0), ("water", 50.0)]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Colony {
    pub name: String,
    pub population: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ant {
    #[serde(default)]
    pub id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Building {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub occupancy: u32,
    #[serde(default)]
    pub capacity: u32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Evolution {
    #[serde(default)]
    pub points_earned: f64,
    #[serde(default)]
    pub points_spent: f64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Entry in the colony's event log. `occurred_at` is one of the schema-known
/// timestamp fields and round-trips as a typed timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameEventRecord {
    pub kind: String,
    pub occurred_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
