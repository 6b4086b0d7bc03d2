//! Best-effort repair of damaged payloads.
//!
//! Every rule only rewrites values that fail the corresponding validator
//! check, and the rewritten value always passes it, so running repair on its
//! own output changes nothing.

use serde_json::{json, Map, Value};
use tracing::debug;

use crate::snapshot::default_resources;
use crate::validator::{
    is_count, is_non_empty_string, is_text_or_absent, is_valid_event, is_valid_version,
    parse_timestamp,
};
use crate::version::CURRENT_VERSION;

const EPOCH: &str = "1970-01-01T00:00:00Z";

#[derive(Debug, Clone, PartialEq)]
pub struct RepairResult {
    pub repaired: Value,
    pub repair_log: Vec<String>,
    pub was_repaired: bool,
}

/// Repair a deep copy of `raw`. The input is never modified.
pub fn repair(raw: &Value) -> RepairResult {
    let mut log = Vec::new();

    let mut root = match raw {
        Value::Object(map) => map.clone(),
        _ => {
            log.push("replaced non-object snapshot root with an empty record".to_string());
            Map::new()
        }
    };

    repair_version(&mut root, &mut log);
    repair_save_id(&mut root, &mut log);
    repair_save_name(&mut root, &mut log);
    repair_colony(&mut root, &mut log);
    repair_resources(&mut root, &mut log);
    repair_ants(&mut root, &mut log);
    repair_buildings(&mut root, &mut log);
    repair_events(&mut root, &mut log);
    repair_objects(&mut root, &mut log);
    repair_evolution(&mut root, &mut log);
    repair_timestamps(&mut root, &mut log);
    derive_population(&mut root, &mut log);

    if !log.is_empty() {
        debug!("Repaired payload: {}", log.join("; "));
    }

    RepairResult {
        repaired: Value::Object(root),
        was_repaired: !log.is_empty(),
        repair_log: log,
    }
}

fn repair_version(root: &mut Map<String, Value>, log: &mut Vec<String>) {
    if !is_valid_version(root.get("version")) {
        root.insert(
            "version".to_string(),
            json!({
                "major": CURRENT_VERSION.major,
                "minor": CURRENT_VERSION.minor,
                "patch": CURRENT_VERSION.patch,
            }),
        );
        log.push(format!("regenerated version block as {}", CURRENT_VERSION));
    }
}

fn repair_save_id(root: &mut Map<String, Value>, log: &mut Vec<String>) {
    if !is_non_empty_string(root.get("save_id")) {
        let id = uuid::Uuid::new_v4().to_string();
        log.push(format!("generated missing save_id {}", id));
        root.insert("save_id".to_string(), Value::String(id));
    }
}

fn repair_save_name(root: &mut Map<String, Value>, log: &mut Vec<String>) {
    if let Some(text) = coerce_text(root.get("save_name")) {
        log.push(format!("coerced save_name to \"{}\"", text));
        root.insert("save_name".to_string(), Value::String(text));
    }
}

/// String replacement for a present, non-string text value. Numbers and
/// booleans keep their rendering; anything else becomes empty.
fn coerce_text(v: Option<&Value>) -> Option<String> {
    if is_text_or_absent(v) {
        return None;
    }
    Some(match v {
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    })
}

fn repair_text_fields(
    record: &mut Map<String, Value>,
    fields: &[&str],
    label: &str,
    log: &mut Vec<String>,
) {
    for field in fields {
        if let Some(text) = coerce_text(record.get(*field)) {
            log.push(format!("coerced {} {} to \"{}\"", label, field, text));
            record.insert(field.to_string(), Value::String(text));
        }
    }
}

fn repair_colony(root: &mut Map<String, Value>, log: &mut Vec<String>) {
    let Some(colony) = root.get_mut("colony").and_then(Value::as_object_mut) else {
        root.insert(
            "colony".to_string(),
            json!({ "name": "Colony", "population": 0 }),
        );
        log.push("restored default colony record".to_string());
        return;
    };
    if !colony.get("name").is_some_and(Value::is_string) {
        colony.insert("name".to_string(), Value::String("Colony".to_string()));
        log.push("restored default colony name".to_string());
    }
    if colony.get("population").and_then(Value::as_u64).is_none() {
        colony.insert("population".to_string(), json!(0));
        log.push("reset invalid colony population to 0".to_string());
    }
}

fn repair_resources(root: &mut Map<String, Value>, log: &mut Vec<String>) {
    let Some(resources) = root.get_mut("resources").and_then(Value::as_object_mut) else {
        let defaults: Map<String, Value> = default_resources()
            .into_iter()
            .map(|(k, v)| (k, json!(v)))
            .collect();
        root.insert("resources".to_string(), Value::Object(defaults));
        log.push("restored default resource set".to_string());
        return;
    };

    let non_numeric: Vec<String> = resources
        .iter()
        .filter(|(_, v)| v.as_f64().is_none())
        .map(|(k, _)| k.clone())
        .collect();
    for name in non_numeric {
        resources.remove(&name);
        log.push(format!("dropped non-numeric resource '{}'", name));
    }

    for (name, value) in resources.iter_mut() {
        if value.as_f64().is_some_and(|q| q < 0.0) {
            log.push(format!("clamped negative resource '{}' ({}) to 0", name, value));
            *value = json!(0.0);
        }
    }
}

/// Coerce `root[key]` into a list when present with another type.
/// Returns the list when there is one.
fn list_entry<'a>(
    root: &'a mut Map<String, Value>,
    key: &str,
    log: &mut Vec<String>,
) -> Option<&'a mut Vec<Value>> {
    if root.get(key).is_some_and(|v| !v.is_array()) {
        root.insert(key.to_string(), Value::Array(Vec::new()));
        log.push(format!("replaced non-list {} with an empty list", key));
    }
    root.get_mut(key).and_then(Value::as_array_mut)
}

fn repair_ants(root: &mut Map<String, Value>, log: &mut Vec<String>) {
    if let Some(ants) = list_entry(root, "ants", log) {
        let before = ants.len();
        ants.retain(Value::is_object);
        if ants.len() != before {
            log.push(format!("dropped {} malformed ant records", before - ants.len()));
        }
        for ant in ants.iter_mut().filter_map(Value::as_object_mut) {
            repair_text_fields(ant, &["id"], "ant", log);
        }
    }
}

fn repair_buildings(root: &mut Map<String, Value>, log: &mut Vec<String>) {
    let Some(buildings) = list_entry(root, "buildings", log) else {
        return;
    };
    let before = buildings.len();
    buildings.retain(Value::is_object);
    if buildings.len() != before {
        log.push(format!("dropped {} malformed building records", before - buildings.len()));
    }

    for building in buildings.iter_mut().filter_map(Value::as_object_mut) {
        repair_text_fields(building, &["id", "kind"], "building", log);
        for field in ["occupancy", "capacity"] {
            let Some(value) = building.get(field) else {
                continue;
            };
            if is_count(value) {
                continue;
            }
            let coerced = value
                .as_f64()
                .filter(|n| n.is_finite() && *n > 0.0)
                .map(|n| n.floor().min(u32::MAX as f64) as u64)
                .unwrap_or(0);
            log.push(format!("coerced building {} {} to {}", field, value, coerced));
            building.insert(field.to_string(), json!(coerced));
        }
    }
}

fn repair_events(root: &mut Map<String, Value>, log: &mut Vec<String>) {
    if let Some(events) = list_entry(root, "events", log) {
        let before = events.len();
        events.retain(is_valid_event);
        if events.len() != before {
            log.push(format!("dropped {} malformed events", before - events.len()));
        }
    }
}

fn repair_objects(root: &mut Map<String, Value>, log: &mut Vec<String>) {
    for key in [
        "research",
        "evolution",
        "environment",
        "statistics",
        "settings",
        "view_state",
    ] {
        if root.get(key).is_some_and(|v| !v.is_object()) {
            root.insert(key.to_string(), Value::Object(Map::new()));
            log.push(format!("replaced non-object {} with an empty record", key));
        }
    }
}

fn repair_evolution(root: &mut Map<String, Value>, log: &mut Vec<String>) {
    let Some(evolution) = root.get_mut("evolution").and_then(Value::as_object_mut) else {
        return;
    };
    for field in ["points_earned", "points_spent"] {
        if evolution.get(field).is_some_and(|v| v.as_f64().is_none()) {
            evolution.insert(field.to_string(), json!(0.0));
            log.push(format!("reset non-numeric evolution.{} to 0", field));
        }
    }
}

fn repair_timestamps(root: &mut Map<String, Value>, log: &mut Vec<String>) {
    let created_ok = parse_timestamp(root.get("created_at")).is_some();
    let saved_ok = parse_timestamp(root.get("last_saved")).is_some();

    match (created_ok, saved_ok) {
        (true, true) => {}
        (true, false) => {
            let created = root.get("created_at").cloned().unwrap_or(Value::Null);
            root.insert("last_saved".to_string(), created);
            log.push("filled last_saved from created_at".to_string());
        }
        (false, true) => {
            let saved = root.get("last_saved").cloned().unwrap_or(Value::Null);
            root.insert("created_at".to_string(), saved);
            log.push("filled created_at from last_saved".to_string());
        }
        (false, false) => {
            root.insert("created_at".to_string(), json!(EPOCH));
            root.insert("last_saved".to_string(), json!(EPOCH));
            log.push("reset missing timestamps to the Unix epoch".to_string());
        }
    }
}

fn derive_population(root: &mut Map<String, Value>, log: &mut Vec<String>) {
    let ant_count = match root.get("ants") {
        Some(Value::Array(ants)) => ants.len() as u64,
        Some(_) => return,
        None => 0,
    };
    let Some(colony) = root.get_mut("colony").and_then(Value::as_object_mut) else {
        return;
    };
    let population = colony.get("population").and_then(Value::as_u64);
    if population != Some(ant_count) {
        log.push(format!(
            "set colony population from {} to {} to match ant records",
            population.map(|p| p.to_string()).unwrap_or_else(|| "?".into()),
            ant_count
        ));
        colony.insert("population".to_string(), json!(ant_count));
    }
}
