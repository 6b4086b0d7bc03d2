use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SaveError;

/// Fixed classification of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotKind {
    Manual,
    Auto,
    Quick,
}

impl std::fmt::Display for SlotKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotKind::Manual => write!(f, "manual"),
            SlotKind::Auto => write!(f, "auto"),
            SlotKind::Quick => write!(f, "quick"),
        }
    }
}

/// Slot layout and quota, fixed when the store is opened.
///
/// Slot ids run from 1: manual slots first, then auto slots, then quick slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotLayout {
    #[serde(default = "default_manual_slots")]
    pub manual_slots: u32,
    #[serde(default = "default_auto_slots")]
    pub auto_slots: u32,
    #[serde(default = "default_quick_slots")]
    pub quick_slots: u32,
    /// Maximum bytes across all slot records
    #[serde(default = "default_quota_bytes")]
    pub quota_bytes: u64,
}

fn default_manual_slots() -> u32 {
    3
}

fn default_auto_slots() -> u32 {
    3
}

fn default_quick_slots() -> u32 {
    1
}

fn default_quota_bytes() -> u64 {
    5 * 1024 * 1024
}

pub const MAX_AUTO_SLOTS: u32 = 10;
pub const MAX_MANUAL_SLOTS: u32 = 99;
pub const MAX_QUICK_SLOTS: u32 = 10;

impl Default for SlotLayout {
    fn default() -> Self {
        Self {
            manual_slots: default_manual_slots(),
            auto_slots: default_auto_slots(),
            quick_slots: default_quick_slots(),
            quota_bytes: default_quota_bytes(),
        }
    }
}

impl SlotLayout {
    pub fn validate(&self) -> Result<(), SaveError> {
        for (kind, count, max) in [
            (SlotKind::Manual, self.manual_slots, MAX_MANUAL_SLOTS),
            (SlotKind::Auto, self.auto_slots, MAX_AUTO_SLOTS),
            (SlotKind::Quick, self.quick_slots, MAX_QUICK_SLOTS),
        ] {
            if count > max {
                return Err(SaveError::Config(format!(
                    "{} slot count {} exceeds the maximum of {}",
                    kind, count, max
                )));
            }
        }
        let total = self
            .manual_slots
            .checked_add(self.auto_slots)
            .and_then(|n| n.checked_add(self.quick_slots))
            .ok_or_else(|| SaveError::Config("slot counts overflow".into()))?;
        if total == 0 {
            return Err(SaveError::Config("layout must define at least one slot".into()));
        }
        if self.quota_bytes == 0 {
            return Err(SaveError::Config("quota must be greater than zero".into()));
        }
        Ok(())
    }

    pub fn total(&self) -> u32 {
        self.manual_slots
            .saturating_add(self.auto_slots)
            .saturating_add(self.quick_slots)
    }

    /// Classification of `slot_id`, or `None` when it is out of range.
    pub fn kind_of(&self, slot_id: u32) -> Option<SlotKind> {
        if slot_id == 0 || slot_id > self.total() {
            None
        } else if slot_id <= self.manual_slots {
            Some(SlotKind::Manual)
        } else if slot_id <= self.manual_slots.saturating_add(self.auto_slots) {
            Some(SlotKind::Auto)
        } else {
            Some(SlotKind::Quick)
        }
    }

    pub fn slot_ids(&self) -> impl Iterator<Item = u32> {
        1..=self.total()
    }

    pub fn auto_slot_ids(&self) -> impl Iterator<Item = u32> {
        let first = self.manual_slots.saturating_add(1);
        first..first.saturating_add(self.auto_slots)
    }
}

/// Persistent metadata for the occupied slots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlotIndex {
    #[serde(default = "default_index_version")]
    pub version: u32,
    #[serde(default)]
    pub slots: Vec<SlotIndexEntry>,
}

fn default_index_version() -> u32 {
    1
}

impl SlotIndex {
    pub fn get(&self, slot_id: u32) -> Option<&SlotIndexEntry> {
        self.slots.iter().find(|s| s.slot_id == slot_id)
    }

    pub fn get_mut(&mut self, slot_id: u32) -> Option<&mut SlotIndexEntry> {
        self.slots.iter_mut().find(|s| s.slot_id == slot_id)
    }

    /// Insert or update an entry, keeping entries ordered by slot id.
    pub fn upsert(&mut self, entry: SlotIndexEntry) {
        if let Some(existing) = self.get_mut(entry.slot_id) {
            *existing = entry;
        } else {
            self.slots.push(entry);
            self.slots.sort_by_key(|s| s.slot_id);
        }
    }

    pub fn remove(&mut self, slot_id: u32) -> Option<SlotIndexEntry> {
        let pos = self.slots.iter().position(|s| s.slot_id == slot_id)?;
        Some(self.slots.remove(pos))
    }

    pub fn contains(&self, slot_id: u32) -> bool {
        self.slots.iter().any(|s| s.slot_id == slot_id)
    }

    /// Bytes accounted across all entries.
    pub fn used_bytes(&self) -> u64 {
        self.slots.iter().map(|s| s.bytes).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotIndexEntry {
    pub slot_id: u32,
    pub save_id: String,
    #[serde(default)]
    pub save_name: String,
    /// Stored record size, used for quota accounting
    pub bytes: u64,
    #[serde(default)]
    pub compressed: bool,
    pub created_at: DateTime<Utc>,
    pub last_saved: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

/// Slot listing entry exposed to consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotInfo {
    pub slot_id: u32,
    pub kind: SlotKind,
    pub occupied: bool,
    pub last_accessed: Option<DateTime<Utc>>,
    pub save_name: Option<String>,
    pub last_saved: Option<DateTime<Utc>>,
    pub bytes: u64,
}

/// Aggregate quota usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageUsage {
    pub used: u64,
    pub limit: u64,
    pub percentage: f64,
    /// Number of occupied slots
    pub count: usize,
}

impl StorageUsage {
    pub fn new(used: u64, limit: u64, count: usize) -> Self {
        let percentage = if limit == 0 {
            0.0
        } else {
            (used as f64 / limit as f64) * 100.0
        };
        Self {
            used,
            limit,
            percentage,
            count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_classification() {
        let layout = SlotLayout {
            manual_slots: 2,
            auto_slots: 3,
            quick_slots: 1,
            quota_bytes: 1024,
        };
        assert_eq!(layout.kind_of(0), None);
        assert_eq!(layout.kind_of(1), Some(SlotKind::Manual));
        assert_eq!(layout.kind_of(2), Some(SlotKind::Manual));
        assert_eq!(layout.kind_of(3), Some(SlotKind::Auto));
        assert_eq!(layout.kind_of(5), Some(SlotKind::Auto));
        assert_eq!(layout.kind_of(6), Some(SlotKind::Quick));
        assert_eq!(layout.kind_of(7), None);
        assert_eq!(layout.auto_slot_ids().collect::<Vec<_>>(), vec![3, 4, 5]);
    }

    #[test]
    fn test_layout_validation() {
        assert!(SlotLayout::default().validate().is_ok());
        let too_many = SlotLayout {
            auto_slots: 11,
            ..Default::default()
        };
        assert!(matches!(too_many.validate(), Err(SaveError::Config(_))));
        let empty = SlotLayout {
            manual_slots: 0,
            auto_slots: 0,
            quick_slots: 0,
            quota_bytes: 1,
        };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_layout_rejects_oversized_counts() {
        for layout in [
            SlotLayout {
                manual_slots: u32::MAX,
                ..Default::default()
            },
            SlotLayout {
                quick_slots: u32::MAX,
                ..Default::default()
            },
            SlotLayout {
                manual_slots: MAX_MANUAL_SLOTS + 1,
                ..Default::default()
            },
        ] {
            assert!(matches!(layout.validate(), Err(SaveError::Config(_))));
            // accessors stay usable on an unvalidated layout
            assert_eq!(layout.kind_of(0), None);
        }
        let largest = SlotLayout {
            manual_slots: MAX_MANUAL_SLOTS,
            auto_slots: MAX_AUTO_SLOTS,
            quick_slots: MAX_QUICK_SLOTS,
            quota_bytes: 1,
        };
        assert!(largest.validate().is_ok());
        assert_eq!(largest.total(), 119);
    }

    #[test]
    fn test_usage_percentage() {
        let usage = StorageUsage::new(256, 1024, 2);
        assert_eq!(usage.percentage, 25.0);
        assert_eq!(StorageUsage::new(0, 0, 0).percentage, 0.0);
    }
}
