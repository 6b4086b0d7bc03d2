//! Forward-only schema migration.
//!
//! Each step only fills fields introduced by a later minor version with their
//! defaults; existing values are never overwritten. That keeps migration
//! monotonic (nothing moves a payload to an older layout) and idempotent.

use serde_json::{json, Map, Value};
use tracing::debug;

use crate::version::{SaveVersion, CURRENT_VERSION};

/// Whether a payload written at `from` needs default-filling to reach the
/// current layout. Patch releases never change the layout.
pub fn needs_migration(from: SaveVersion) -> bool {
    from.major == CURRENT_VERSION.major && from.minor < CURRENT_VERSION.minor
}

/// Bring a payload written at `from` up to [`CURRENT_VERSION`].
///
/// Payloads that are already current, newer, from another major line, or not
/// JSON objects are returned unchanged.
pub fn migrate(mut payload: Value, from: SaveVersion) -> Value {
    if !needs_migration(from) {
        return payload;
    }
    let Some(root) = payload.as_object_mut() else {
        return payload;
    };

    if from.minor < 1 {
        fill(root, "evolution", || {
            json!({ "points_earned": 0.0, "points_spent": 0.0, "traits": [] })
        });
    }

    if from.minor < 2 {
        fill(root, "view_state", || {
            json!({ "camera_x": 0.0, "camera_y": 0.0, "zoom": 1.0 })
        });
        if let Some(settings) = object_entry(root, "settings") {
            fill(settings, "auto_save", || Value::Bool(true));
        }
        if let Some(statistics) = object_entry(root, "statistics") {
            fill(statistics, "play_time_secs", || json!(0));
        }
    }

    root.insert(
        "version".to_string(),
        json!({
            "major": CURRENT_VERSION.major,
            "minor": CURRENT_VERSION.minor,
            "patch": CURRENT_VERSION.patch,
        }),
    );

    debug!("Migrated payload from {} to {}", from, CURRENT_VERSION);
    payload
}

fn fill(obj: &mut Map<String, Value>, key: &str, default: impl FnOnce() -> Value) {
    if !obj.contains_key(key) {
        obj.insert(key.to_string(), default());
    }
}

/// Get `root[key]` as an object, creating it when missing. Present values of
/// another type are left for the validator to report.
fn object_entry<'a>(root: &'a mut Map<String, Value>, key: &str) -> Option<&'a mut Map<String, Value>> {
    root.entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
}
