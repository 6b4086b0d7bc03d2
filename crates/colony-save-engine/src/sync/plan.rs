use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use colony_save_core::RemoteSlotMeta;
use serde::{Deserialize, Serialize};

/// What reconciliation does for one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Upload,
    Download,
    None,
}

impl std::fmt::Display for SyncAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncAction::Upload => write!(f, "upload"),
            SyncAction::Download => write!(f, "download"),
            SyncAction::None => write!(f, "none"),
        }
    }
}

/// Per-slot comparison of local and remote state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub slot_id: u32,
    pub local_last_saved: Option<DateTime<Utc>>,
    pub remote_updated_at: Option<DateTime<Utc>>,
    pub action: SyncAction,
}

/// Decide one action per slot present on either side, ordered by slot id.
///
/// Last write wins on wall-clock timestamps: the newer side overwrites the
/// other, and concurrent edits on two devices lose the older one.
pub fn plan(
    local: impl IntoIterator<Item = (u32, DateTime<Utc>)>,
    remote: &[RemoteSlotMeta],
) -> Vec<SyncRecord> {
    let mut sides: BTreeMap<u32, (Option<DateTime<Utc>>, Option<DateTime<Utc>>)> = BTreeMap::new();
    for (slot_id, last_saved) in local {
        sides.entry(slot_id).or_default().0 = Some(last_saved);
    }
    for meta in remote {
        sides.entry(meta.save_slot).or_default().1 = Some(meta.updated_at);
    }

    sides
        .into_iter()
        .map(|(slot_id, (local, remote))| {
            let action = match (local, remote) {
                (Some(_), None) => SyncAction::Upload,
                (None, Some(_)) => SyncAction::Download,
                (Some(l), Some(r)) if l > r => SyncAction::Upload,
                (Some(l), Some(r)) if r > l => SyncAction::Download,
                _ => SyncAction::None,
            };
            SyncRecord {
                slot_id,
                local_last_saved: local,
                remote_updated_at: remote,
                action,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn meta(slot: u32, at: DateTime<Utc>) -> RemoteSlotMeta {
        RemoteSlotMeta {
            save_slot: slot,
            save_name: String::new(),
            save_size: 0,
            updated_at: at,
        }
    }

    #[test]
    fn test_local_newer_uploads_only_that_slot() {
        let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap();
        let records = plan([(3, t0)], &[meta(3, t0 - Duration::minutes(5))]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].slot_id, 3);
        assert_eq!(records[0].action, SyncAction::Upload);
    }

    #[test]
    fn test_decision_table() {
        let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap();
        let later = t0 + Duration::seconds(1);
        let local = [(1, t0), (3, t0), (4, later), (5, t0)];
        let remote = [meta(2, t0), meta(3, later), meta(4, t0), meta(5, t0)];

        let actions: Vec<(u32, SyncAction)> = plan(local, &remote)
            .into_iter()
            .map(|r| (r.slot_id, r.action))
            .collect();
        assert_eq!(
            actions,
            vec![
                (1, SyncAction::Upload),
                (2, SyncAction::Download),
                (3, SyncAction::Download),
                (4, SyncAction::Upload),
                (5, SyncAction::None),
            ]
        );
    }

    #[test]
    fn test_nothing_anywhere() {
        assert!(plan(Vec::new(), &[]).is_empty());
    }
}
