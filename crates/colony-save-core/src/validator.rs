//! Structural and business-rule checks on decoded payloads.
//!
//! Validation runs on the untyped payload so that a damaged save can still be
//! inspected and repaired before it is converted into a [`Snapshot`].
//!
//! [`Snapshot`]: crate::snapshot::Snapshot

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Top-level payload sections known to the validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    Colony,
    Resources,
    Version,
    SaveId,
    SaveName,
    Ants,
    Buildings,
    Research,
    Evolution,
    Environment,
    Events,
    Statistics,
    Settings,
    ViewState,
    Timestamps,
}

impl Section {
    /// Sections whose structural failure makes a payload invalid.
    pub const CRITICAL: [Section; 4] = [
        Section::Colony,
        Section::Resources,
        Section::Version,
        Section::SaveId,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            Section::Colony => "colony",
            Section::Resources => "resources",
            Section::Version => "version",
            Section::SaveId => "save_id",
            Section::SaveName => "save_name",
            Section::Ants => "ants",
            Section::Buildings => "buildings",
            Section::Research => "research",
            Section::Evolution => "evolution",
            Section::Environment => "environment",
            Section::Events => "events",
            Section::Statistics => "statistics",
            Section::Settings => "settings",
            Section::ViewState => "view_state",
            Section::Timestamps => "created_at/last_saved",
        }
    }

    pub fn is_critical(&self) -> bool {
        Self::CRITICAL.contains(self)
    }
}

/// What a validation issue is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// Missing section, wrong type or malformed entry
    Structural,
    PopulationMismatch,
    OverCapacity,
    EvolutionOverspent,
    TimestampOrder,
    NegativeResource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub section: Section,
    pub kind: IssueKind,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
    pub corrupted_sections: Vec<Section>,
    pub recovery_possible: bool,
}

impl ValidationReport {
    /// True when any structural problem (fatal or not) was found, meaning the
    /// payload should go through [`repair`](crate::repair::repair) before typed conversion.
    pub fn has_structural_issues(&self) -> bool {
        !self.errors.is_empty()
            || self.warnings.iter().any(|w| w.kind == IssueKind::Structural)
    }

    /// Business-rule warnings only.
    pub fn business_warnings(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.warnings.iter().filter(|w| w.kind != IssueKind::Structural)
    }
}

#[derive(Default)]
struct Collector {
    errors: Vec<ValidationIssue>,
    warnings: Vec<ValidationIssue>,
    corrupted: Vec<Section>,
}

impl Collector {
    fn structural(&mut self, section: Section, message: impl Into<String>) {
        let issue = ValidationIssue {
            section,
            kind: IssueKind::Structural,
            message: message.into(),
        };
        if section.is_critical() {
            if !self.corrupted.contains(&section) {
                self.corrupted.push(section);
            }
            self.errors.push(issue);
        } else {
            self.warnings.push(issue);
        }
    }

    fn rule(&mut self, section: Section, kind: IssueKind, message: impl Into<String>) {
        self.warnings.push(ValidationIssue {
            section,
            kind,
            message: message.into(),
        });
    }

    fn finish(self) -> ValidationReport {
        let recovery_possible =
            self.corrupted.len() < 3 && !self.corrupted.contains(&Section::Colony);
        ValidationReport {
            is_valid: self.errors.is_empty(),
            errors: self.errors,
            warnings: self.warnings,
            corrupted_sections: self.corrupted,
            recovery_possible,
        }
    }
}

/// Check a raw payload. Never fails; every finding lands in the report.
pub fn validate(raw: &Value) -> ValidationReport {
    let mut c = Collector::default();

    let Some(root) = raw.as_object() else {
        for section in Section::CRITICAL {
            c.structural(section, "snapshot root is not an object");
        }
        return c.finish();
    };

    check_version(root, &mut c);
    check_save_id(root, &mut c);
    if !is_text_or_absent(root.get("save_name")) {
        c.structural(Section::SaveName, "save_name is not a string");
    }
    let population = check_colony(root, &mut c);
    check_resources(root, &mut c);
    let ant_count = check_ants(root, &mut c);
    check_buildings(root, &mut c);
    check_evolution(root, &mut c);
    check_events(root, &mut c);
    for section in [
        Section::Research,
        Section::Environment,
        Section::Statistics,
        Section::Settings,
        Section::ViewState,
    ] {
        if let Some(v) = root.get(section.key()) {
            if !v.is_object() {
                c.structural(section, format!("{} is not an object", section.key()));
            }
        }
    }
    check_timestamps(root, &mut c);

    if let (Some(population), Some(ants)) = (population, ant_count) {
        if population != ants as u64 {
            c.rule(
                Section::Colony,
                IssueKind::PopulationMismatch,
                format!(
                    "colony population is {} but there are {} ant records",
                    population, ants
                ),
            );
        }
    }

    c.finish()
}

pub(crate) fn is_valid_version(v: Option<&Value>) -> bool {
    let Some(obj) = v.and_then(Value::as_object) else {
        return false;
    };
    ["major", "minor", "patch"]
        .iter()
        .all(|k| obj.get(*k).and_then(Value::as_u64).is_some_and(|n| n <= u32::MAX as u64))
}

pub(crate) fn is_non_empty_string(v: Option<&Value>) -> bool {
    v.and_then(Value::as_str).is_some_and(|s| !s.trim().is_empty())
}

pub(crate) fn parse_timestamp(v: Option<&Value>) -> Option<DateTime<FixedOffset>> {
    v.and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
}

pub(crate) fn is_valid_event(v: &Value) -> bool {
    v.as_object().is_some_and(|e| {
        e.get("kind").is_some_and(Value::is_string) && parse_timestamp(e.get("occurred_at")).is_some()
    })
}

/// Optional text field: absent, or a string.
pub(crate) fn is_text_or_absent(v: Option<&Value>) -> bool {
    v.map_or(true, Value::is_string)
}

pub(crate) fn is_count(v: &Value) -> bool {
    v.as_u64().is_some_and(|n| n <= u32::MAX as u64)
}

fn check_version(root: &Map<String, Value>, c: &mut Collector) {
    if !is_valid_version(root.get("version")) {
        c.structural(
            Section::Version,
            "version must be an object with non-negative integer major/minor/patch",
        );
    }
}

fn check_save_id(root: &Map<String, Value>, c: &mut Collector) {
    if !is_non_empty_string(root.get("save_id")) {
        c.structural(Section::SaveId, "save_id must be a non-empty string");
    }
}

fn check_colony(root: &Map<String, Value>, c: &mut Collector) -> Option<u64> {
    let Some(colony) = root.get("colony").and_then(Value::as_object) else {
        c.structural(Section::Colony, "colony is missing or not an object");
        return None;
    };
    if !colony.get("name").is_some_and(Value::is_string) {
        c.structural(Section::Colony, "colony.name must be a string");
    }
    match colony.get("population").and_then(Value::as_u64) {
        Some(p) => Some(p),
        None => {
            c.structural(
                Section::Colony,
                "colony.population must be a non-negative integer",
            );
            None
        }
    }
}

fn check_resources(root: &Map<String, Value>, c: &mut Collector) {
    let Some(resources) = root.get("resources").and_then(Value::as_object) else {
        c.structural(Section::Resources, "resources is missing or not an object");
        return;
    };
    for (name, value) in resources {
        match value.as_f64() {
            Some(q) if q < 0.0 => c.rule(
                Section::Resources,
                IssueKind::NegativeResource,
                format!("resource '{}' is negative ({})", name, q),
            ),
            Some(_) => {}
            None => c.structural(
                Section::Resources,
                format!("resource '{}' is not a number", name),
            ),
        }
    }
}

fn check_ants(root: &Map<String, Value>, c: &mut Collector) -> Option<usize> {
    match root.get("ants") {
        None => Some(0),
        Some(Value::Array(ants)) => {
            let malformed = ants.iter().filter(|a| !a.is_object()).count();
            if malformed > 0 {
                c.structural(
                    Section::Ants,
                    format!("{} ant records are not objects", malformed),
                );
                return None;
            }
            let bad_ids = ants
                .iter()
                .filter(|a| !is_text_or_absent(a.get("id")))
                .count();
            if bad_ids > 0 {
                c.structural(
                    Section::Ants,
                    format!("{} ant records have a non-string id", bad_ids),
                );
            }
            Some(ants.len())
        }
        Some(_) => {
            c.structural(Section::Ants, "ants is not a list");
            None
        }
    }
}

fn check_buildings(root: &Map<String, Value>, c: &mut Collector) {
    let buildings = match root.get("buildings") {
        None => return,
        Some(Value::Array(b)) => b,
        Some(_) => {
            c.structural(Section::Buildings, "buildings is not a list");
            return;
        }
    };

    for (i, building) in buildings.iter().enumerate() {
        let Some(b) = building.as_object() else {
            c.structural(Section::Buildings, format!("building #{} is not an object", i));
            continue;
        };
        for field in ["id", "kind"] {
            if !is_text_or_absent(b.get(field)) {
                c.structural(
                    Section::Buildings,
                    format!("building #{} {} is not a string", i, field),
                );
            }
        }
        let mut counts_ok = true;
        for field in ["occupancy", "capacity"] {
            if let Some(v) = b.get(field) {
                if !is_count(v) {
                    counts_ok = false;
                    c.structural(
                        Section::Buildings,
                        format!("building #{} {} is not a non-negative integer", i, field),
                    );
                }
            }
        }
        if !counts_ok {
            continue;
        }
        let occupancy = b.get("occupancy").and_then(Value::as_u64).unwrap_or(0);
        let capacity = b.get("capacity").and_then(Value::as_u64).unwrap_or(0);
        if occupancy > capacity {
            let id = b.get("id").and_then(Value::as_str).unwrap_or("?");
            c.rule(
                Section::Buildings,
                IssueKind::OverCapacity,
                format!(
                    "building '{}' holds {} but capacity is {}",
                    id, occupancy, capacity
                ),
            );
        }
    }
}

fn check_evolution(root: &Map<String, Value>, c: &mut Collector) {
    let evolution = match root.get("evolution") {
        None => return,
        Some(Value::Object(e)) => e,
        Some(_) => {
            c.structural(Section::Evolution, "evolution is not an object");
            return;
        }
    };
    let mut points = [0.0f64; 2];
    for (slot, field) in ["points_earned", "points_spent"].iter().enumerate() {
        match evolution.get(*field) {
            None => {}
            Some(v) => match v.as_f64() {
                Some(n) => points[slot] = n,
                None => {
                    c.structural(Section::Evolution, format!("evolution.{} is not a number", field));
                    return;
                }
            },
        }
    }
    let [earned, spent] = points;
    if spent > earned {
        c.rule(
            Section::Evolution,
            IssueKind::EvolutionOverspent,
            format!("evolution points spent ({}) exceed points earned ({})", spent, earned),
        );
    }
}

fn check_events(root: &Map<String, Value>, c: &mut Collector) {
    match root.get("events") {
        None => {}
        Some(Value::Array(events)) => {
            let malformed = events.iter().filter(|e| !is_valid_event(e)).count();
            if malformed > 0 {
                c.structural(
                    Section::Events,
                    format!("{} events lack a kind or a valid occurred_at", malformed),
                );
            }
        }
        Some(_) => c.structural(Section::Events, "events is not a list"),
    }
}

fn check_timestamps(root: &Map<String, Value>, c: &mut Collector) {
    let created = parse_timestamp(root.get("created_at"));
    let saved = parse_timestamp(root.get("last_saved"));
    if created.is_none() {
        c.structural(Section::Timestamps, "created_at is missing or not RFC 3339");
    }
    if saved.is_none() {
        c.structural(Section::Timestamps, "last_saved is missing or not RFC 3339");
    }
    if let (Some(created), Some(saved)) = (created, saved) {
        if created > saved {
            c.rule(
                Section::Timestamps,
                IssueKind::TimestampOrder,
                format!("created_at {} is after last_saved {}", created, saved),
            );
        }
    }
}
