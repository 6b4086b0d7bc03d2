use std::sync::Arc;

use chrono::{DateTime, Utc};
use colony_save_core::codec::{self, RawDecoded};
use colony_save_core::{
    repair, validate, Clock, Envelope, IntegrityWarning, KvBackend, SaveError, SlotIndex,
    SlotIndexEntry, SlotInfo, SlotLayout, Snapshot, StorageError, StorageUsage,
};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Key of the persisted slot index.
pub const INDEX_KEY: &str = "saves/index.json";

const SLOT_PREFIX: &str = "saves/slot-";

fn slot_key(slot_id: u32) -> String {
    format!("{}{:02}.json", SLOT_PREFIX, slot_id)
}

fn slot_id_from_key(key: &str) -> Option<u32> {
    key.strip_prefix(SLOT_PREFIX)?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

/// Result of a successful save.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveReceipt {
    pub slot_id: u32,
    pub save_id: String,
    /// Stored record size, as charged against the quota
    pub bytes: u64,
    /// Canonical payload size before compression
    pub raw_size: u64,
    pub compressed: bool,
    pub last_saved: DateTime<Utc>,
}

/// Result of a successful load.
#[derive(Debug, Clone)]
pub struct LoadOutcome {
    pub snapshot: Snapshot,
    pub version_mismatch: bool,
    pub migration_applied: bool,
    /// The payload had structural damage and was repaired before conversion
    pub repaired: bool,
    pub repair_log: Vec<String>,
    pub warnings: Vec<IntegrityWarning>,
}

/// Run a decoded payload through validation (and repair when needed), then
/// convert it to a typed snapshot.
///
/// Shared by local loads, imports and remote downloads.
pub fn restore(raw: RawDecoded) -> Result<LoadOutcome, SaveError> {
    let RawDecoded {
        envelope,
        payload,
        report,
    } = raw;

    let mut validation = validate(&payload);
    let mut payload = payload;
    let mut repaired = false;
    let mut repair_log = Vec::new();

    if validation.has_structural_issues() {
        if !validation.is_valid && !validation.recovery_possible {
            return Err(SaveError::Structural {
                sections: validation.corrupted_sections,
                message: format!("save {} is damaged beyond repair", envelope.save_id),
            });
        }
        let result = repair(&payload);
        let revalidated = validate(&result.repaired);
        if !revalidated.is_valid {
            return Err(SaveError::Structural {
                sections: revalidated.corrupted_sections,
                message: format!("save {} could not be repaired", envelope.save_id),
            });
        }
        warn!(
            "Repaired save {}: {}",
            envelope.save_id,
            result.repair_log.join("; ")
        );
        payload = result.repaired;
        repaired = result.was_repaired;
        repair_log = result.repair_log;
        validation = revalidated;
    }

    let mut warnings = report.warnings;
    warnings.extend(
        validation
            .business_warnings()
            .map(|w| IntegrityWarning::BusinessRule(w.message.clone())),
    );

    let snapshot = codec::snapshot_from_value(payload)?;

    Ok(LoadOutcome {
        snapshot,
        version_mismatch: report.version_mismatch,
        migration_applied: report.migration_applied,
        repaired,
        repair_log,
        warnings,
    })
}

/// Local slot store.
///
/// Owns slot metadata (occupancy, classification, quota) on top of a
/// [`KvBackend`]. Operations on the same slot are serialized through a
/// per-slot mutex; different slots run concurrently. The shared index is
/// locked only for the quota check and the commit; record I/O happens
/// outside it, with in-flight writes holding a quota reservation. Writes run
/// on detached tasks, so a caller that stops waiting does not interrupt them.
///
/// Cloning is cheap and yields a handle to the same store.
#[derive(Clone)]
pub struct SlotStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    kv: Arc<dyn KvBackend>,
    layout: SlotLayout,
    clock: Arc<dyn Clock>,
    /// Cached index. Also serializes index read-modify-write cycles.
    index: Mutex<SlotIndex>,
    slot_locks: DashMap<u32, Arc<Mutex<()>>>,
    /// Bytes of slot writes between quota check and commit
    reserved: DashMap<u32, u64>,
}

/// Drops a slot's quota reservation when its write ends, however it ends.
struct Reservation<'a> {
    reserved: &'a DashMap<u32, u64>,
    slot_id: u32,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.reserved.remove(&self.slot_id);
    }
}

impl std::fmt::Debug for SlotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotStore")
            .field("backend", &self.inner.kv.backend_name())
            .field("layout", &self.inner.layout)
            .finish_non_exhaustive()
    }
}

impl SlotStore {
    /// Open the store and run the startup scan.
    ///
    /// Every stored slot is decoded once. Slots that fail to decode are
    /// marked empty and their records discarded; records written by a newer
    /// build are kept so that loading them reports the version error.
    #[instrument(skip(kv, clock), level = "debug")]
    pub async fn open(
        kv: Arc<dyn KvBackend>,
        layout: SlotLayout,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SaveError> {
        layout.validate()?;

        let stored = match kv.get(INDEX_KEY).await? {
            Some(bytes) => match serde_json::from_slice::<SlotIndex>(&bytes) {
                Ok(index) => Some(index),
                Err(e) => {
                    warn!("Slot index is unreadable, rebuilding from records: {}", e);
                    None
                }
            },
            None => None,
        };
        let rebuilt = stored.is_none();
        let stored = stored.unwrap_or_default();

        let mut index = SlotIndex::default();
        for key in kv.list_keys(SLOT_PREFIX).await? {
            let Some(slot_id) = slot_id_from_key(&key) else {
                continue;
            };
            if layout.kind_of(slot_id).is_none() {
                warn!("Ignoring record for slot {} outside the layout", slot_id);
                continue;
            }
            let Some(blob) = kv.get(&key).await? else {
                continue;
            };

            let envelope = match codec::decode_raw(&blob) {
                Ok(raw) => raw.envelope,
                Err(SaveError::Version { found, .. }) => match codec::parse_envelope(&blob) {
                    Ok(envelope) => {
                        debug!("Slot {} holds a version {} save", slot_id, found);
                        envelope
                    }
                    Err(e) => {
                        Self::discard(kv.as_ref(), slot_id, &key, &e).await;
                        continue;
                    }
                },
                Err(e) => {
                    Self::discard(kv.as_ref(), slot_id, &key, &e).await;
                    continue;
                }
            };

            let last_accessed = stored
                .get(slot_id)
                .map(|e| e.last_accessed)
                .unwrap_or(envelope.last_saved);
            index.upsert(SlotIndexEntry {
                slot_id,
                save_id: envelope.save_id,
                save_name: envelope.save_name,
                bytes: blob.len() as u64,
                compressed: envelope.compressed.unwrap_or(false),
                created_at: envelope.created_at,
                last_saved: envelope.last_saved,
                last_accessed,
            });
        }

        let changed = rebuilt || index.slots != stored.slots;
        if changed {
            Self::write_index(kv.as_ref(), &index).await?;
        }

        info!(
            "Opened slot store on {} backend: {} of {} slots occupied",
            kv.backend_name(),
            index.slots.len(),
            layout.total()
        );

        Ok(Self {
            inner: Arc::new(StoreInner {
                kv,
                layout,
                clock,
                index: Mutex::new(index),
                slot_locks: DashMap::new(),
                reserved: DashMap::new(),
            }),
        })
    }

    async fn discard(kv: &dyn KvBackend, slot_id: u32, key: &str, error: &SaveError) {
        warn!("Slot {} is corrupted, marking it empty: {}", slot_id, error);
        if let Err(e) = kv.delete(key).await {
            warn!("Failed to discard corrupted record {}: {}", key, e);
        }
    }

    async fn write_index(kv: &dyn KvBackend, index: &SlotIndex) -> Result<(), SaveError> {
        let bytes = serde_json::to_vec_pretty(index).map_err(|e| {
            StorageError::Serialization(format!("Failed to serialize slot index: {}", e))
        })?;
        kv.put(INDEX_KEY, &bytes).await?;
        Ok(())
    }

    pub fn layout(&self) -> &SlotLayout {
        &self.inner.layout
    }

    fn check_slot(&self, slot_id: u32) -> Result<(), SaveError> {
        match self.inner.layout.kind_of(slot_id) {
            Some(_) => Ok(()),
            None => Err(SaveError::InvalidSlot(slot_id)),
        }
    }

    /// Save `snapshot` into `slot_id`, stamped with the current time.
    pub async fn save(&self, snapshot: &Snapshot, slot_id: u32) -> Result<SaveReceipt, SaveError> {
        let now = self.inner.clock.now();
        self.save_at(snapshot, slot_id, now).await
    }

    /// Save with an explicit `last_saved` timestamp.
    ///
    /// Used when storing a downloaded save so that the local copy carries the
    /// remote timestamp and does not look newer than its source.
    pub async fn save_at(
        &self,
        snapshot: &Snapshot,
        slot_id: u32,
        saved_at: DateTime<Utc>,
    ) -> Result<SaveReceipt, SaveError> {
        self.check_slot(slot_id)?;
        let inner = self.inner.clone();
        let snapshot = snapshot.clone();
        tokio::spawn(async move { inner.write_slot(&snapshot, slot_id, saved_at).await })
            .await
            .map_err(|e| SaveError::Internal(format!("Save task for slot {} failed: {}", slot_id, e)))?
    }

    /// Load the snapshot stored in `slot_id`.
    #[instrument(skip(self), level = "debug")]
    pub async fn load(&self, slot_id: u32) -> Result<LoadOutcome, SaveError> {
        self.check_slot(slot_id)?;
        let inner = &self.inner;
        let lock = inner.slot_lock(slot_id);
        let _guard = lock.lock().await;

        if !inner.index.lock().await.contains(slot_id) {
            return Err(SaveError::SlotEmpty(slot_id));
        }

        let Some(blob) = inner.kv.get(&slot_key(slot_id)).await? else {
            warn!("Slot {} is indexed but has no record, marking it empty", slot_id);
            let mut index = inner.index.lock().await;
            let mut updated = index.clone();
            updated.remove(slot_id);
            Self::write_index(inner.kv.as_ref(), &updated).await?;
            *index = updated;
            return Err(SaveError::SlotEmpty(slot_id));
        };

        let outcome = restore(codec::decode_raw(&blob)?)?;

        let now = inner.clock.now();
        let mut index = inner.index.lock().await;
        let mut updated = index.clone();
        if let Some(entry) = updated.get_mut(slot_id) {
            entry.last_accessed = now;
        }
        match Self::write_index(inner.kv.as_ref(), &updated).await {
            Ok(()) => *index = updated,
            Err(e) => warn!("Failed to record access time for slot {}: {}", slot_id, e),
        }

        debug!(
            "Loaded slot {} (migrated: {}, repaired: {}, warnings: {})",
            slot_id,
            outcome.migration_applied,
            outcome.repaired,
            outcome.warnings.len()
        );
        Ok(outcome)
    }

    /// Clear a slot. Returns `false` when it was already empty.
    pub async fn delete(&self, slot_id: u32) -> Result<bool, SaveError> {
        self.check_slot(slot_id)?;
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.delete_slot(slot_id).await })
            .await
            .map_err(|e| {
                SaveError::Internal(format!("Delete task for slot {} failed: {}", slot_id, e))
            })?
    }

    /// Slot to use for the next auto-save across the whole auto rotation.
    pub async fn next_auto_save_slot(&self) -> Result<u32, SaveError> {
        self.next_auto_save_slot_within(self.inner.layout.auto_slots)
            .await
    }

    /// Slot to use for the next auto-save, rotating over the first `count`
    /// auto slots: the first empty one, otherwise the least recently
    /// accessed (lowest id on ties).
    pub async fn next_auto_save_slot_within(&self, count: u32) -> Result<u32, SaveError> {
        let count = count.min(self.inner.layout.auto_slots);
        if count == 0 {
            return Err(SaveError::Config("no auto-save slots configured".into()));
        }
        let index = self.inner.index.lock().await;
        let candidates: Vec<u32> = self
            .inner
            .layout
            .auto_slot_ids()
            .take(count as usize)
            .collect();

        if let Some(empty) = candidates.iter().copied().find(|id| !index.contains(*id)) {
            return Ok(empty);
        }

        candidates
            .iter()
            .filter_map(|id| index.get(*id))
            .min_by_key(|e| (e.last_accessed, e.slot_id))
            .map(|e| e.slot_id)
            .ok_or_else(|| SaveError::Internal("auto-save rotation is empty".into()))
    }

    /// Every slot in the layout with its occupancy and metadata.
    pub async fn list_slots(&self) -> Vec<SlotInfo> {
        let index = self.inner.index.lock().await;
        self.inner
            .layout
            .slot_ids()
            .filter_map(|id| self.describe(&index, id))
            .collect()
    }

    pub async fn slot_info(&self, slot_id: u32) -> Result<SlotInfo, SaveError> {
        let index = self.inner.index.lock().await;
        self.describe(&index, slot_id)
            .ok_or(SaveError::InvalidSlot(slot_id))
    }

    /// Index entry for an occupied slot.
    pub async fn entry(&self, slot_id: u32) -> Option<SlotIndexEntry> {
        self.inner.index.lock().await.get(slot_id).cloned()
    }

    fn describe(&self, index: &SlotIndex, slot_id: u32) -> Option<SlotInfo> {
        let kind = self.inner.layout.kind_of(slot_id)?;
        let entry = index.get(slot_id);
        Some(SlotInfo {
            slot_id,
            kind,
            occupied: entry.is_some(),
            last_accessed: entry.map(|e| e.last_accessed),
            save_name: entry.map(|e| e.save_name.clone()),
            last_saved: entry.map(|e| e.last_saved),
            bytes: entry.map(|e| e.bytes).unwrap_or(0),
        })
    }

    pub async fn storage_usage(&self) -> StorageUsage {
        let index = self.inner.index.lock().await;
        StorageUsage::new(
            index.used_bytes(),
            self.inner.layout.quota_bytes,
            index.slots.len(),
        )
    }

    /// Raw stored record of a slot, as written.
    pub async fn export_slot(&self, slot_id: u32) -> Result<Vec<u8>, SaveError> {
        self.check_slot(slot_id)?;
        let lock = self.inner.slot_lock(slot_id);
        let _guard = lock.lock().await;
        if !self.inner.index.lock().await.contains(slot_id) {
            return Err(SaveError::SlotEmpty(slot_id));
        }
        self.inner
            .kv
            .get(&slot_key(slot_id))
            .await?
            .ok_or(SaveError::SlotEmpty(slot_id))
    }

    /// Stored envelope of a slot, without decoding its payload.
    pub async fn read_envelope(&self, slot_id: u32) -> Result<Envelope, SaveError> {
        let blob = self.export_slot(slot_id).await?;
        codec::parse_envelope(&blob)
    }

    /// Import an exported record into `slot_id`.
    ///
    /// The record is fully decoded and validated first; it is then stored in
    /// the current format with its original `last_saved`.
    pub async fn import_slot(&self, slot_id: u32, blob: &[u8]) -> Result<SaveReceipt, SaveError> {
        self.check_slot(slot_id)?;
        let outcome = restore(codec::decode_raw(blob)?)?;
        let saved_at = outcome.snapshot.last_saved;
        self.save_at(&outcome.snapshot, slot_id, saved_at).await
    }
}

impl StoreInner {
    fn slot_lock(&self, slot_id: u32) -> Arc<Mutex<()>> {
        self.slot_locks.entry(slot_id).or_default().clone()
    }

    #[instrument(skip(self, snapshot), level = "debug")]
    async fn write_slot(
        &self,
        snapshot: &Snapshot,
        slot_id: u32,
        saved_at: DateTime<Utc>,
    ) -> Result<SaveReceipt, SaveError> {
        let (encoded, bytes) = codec::encode_to_bytes(snapshot, saved_at)?;
        let needed = bytes.len() as u64;

        let lock = self.slot_lock(slot_id);
        let _guard = lock.lock().await;

        let (occupied, _reservation) = {
            let index = self.index.lock().await;
            let used_elsewhere = self.charged_bytes(&index, slot_id);
            if used_elsewhere + needed > self.layout.quota_bytes {
                return Err(SaveError::Capacity {
                    needed,
                    available: self.layout.quota_bytes.saturating_sub(used_elsewhere),
                });
            }
            self.reserved.insert(slot_id, needed);
            let reservation = Reservation {
                reserved: &self.reserved,
                slot_id,
            };
            (index.contains(slot_id), reservation)
        };

        let key = slot_key(slot_id);
        let previous_blob = if occupied {
            self.kv.get(&key).await?
        } else {
            None
        };

        self.kv.put(&key, &bytes).await?;

        let envelope = &encoded.envelope;
        let mut index = self.index.lock().await;
        let mut updated = index.clone();
        updated.upsert(SlotIndexEntry {
            slot_id,
            save_id: envelope.save_id.clone(),
            save_name: envelope.save_name.clone(),
            bytes: needed,
            compressed: encoded.compressed,
            created_at: envelope.created_at,
            last_saved: envelope.last_saved,
            last_accessed: self.clock.now(),
        });

        if let Err(e) = SlotStore::write_index(self.kv.as_ref(), &updated).await {
            let rollback = match &previous_blob {
                Some(old) => self.kv.put(&key, old).await,
                None => self.kv.delete(&key).await.map(|_| ()),
            };
            if let Err(re) = rollback {
                warn!("Failed to roll back slot {} after index error: {}", slot_id, re);
            }
            return Err(e);
        }
        *index = updated;
        drop(index);

        debug!(
            "Saved slot {} ({} bytes, compressed: {})",
            slot_id, needed, encoded.compressed
        );

        Ok(SaveReceipt {
            slot_id,
            save_id: envelope.save_id.clone(),
            bytes: needed,
            raw_size: encoded.raw_size,
            compressed: encoded.compressed,
            last_saved: envelope.last_saved,
        })
    }

    /// Bytes charged against the quota by every slot other than `slot_id`.
    /// A slot with a write in flight counts the larger of its committed and
    /// reserved size, since either may be what remains.
    fn charged_bytes(&self, index: &SlotIndex, slot_id: u32) -> u64 {
        let committed: u64 = index
            .slots
            .iter()
            .filter(|e| e.slot_id != slot_id)
            .map(|e| {
                let reserved = self.reserved.get(&e.slot_id).map(|r| *r).unwrap_or(0);
                e.bytes.max(reserved)
            })
            .sum();
        let pending: u64 = self
            .reserved
            .iter()
            .filter(|r| *r.key() != slot_id && !index.contains(*r.key()))
            .map(|r| *r.value())
            .sum();
        committed + pending
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_slot(&self, slot_id: u32) -> Result<bool, SaveError> {
        let lock = self.slot_lock(slot_id);
        let _guard = lock.lock().await;
        if !self.index.lock().await.contains(slot_id) {
            return Ok(false);
        }

        self.kv.delete(&slot_key(slot_id)).await?;
        let mut index = self.index.lock().await;
        let mut updated = index.clone();
        updated.remove(slot_id);
        SlotStore::write_index(self.kv.as_ref(), &updated).await?;
        *index = updated;

        debug!("Deleted slot {}", slot_id);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use colony_save_core::codec::{canonical_text, digest};
    use colony_save_core::{Ant, ManualClock, MemoryKv, SaveVersion};
    use serde_json::{json, Map, Value};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn snapshot(name: &str) -> Snapshot {
        Snapshot::new(name, "Anthill", t0() - Duration::days(1))
    }

    async fn setup(layout: SlotLayout) -> (SlotStore, Arc<MemoryKv>, Arc<ManualClock>) {
        let kv = Arc::new(MemoryKv::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let store = SlotStore::open(kv.clone(), layout, clock.clone()).await.unwrap();
        (store, kv, clock)
    }

    fn envelope_for(payload: &Value, version: SaveVersion) -> Vec<u8> {
        let text = canonical_text(payload).unwrap();
        let envelope = Envelope {
            version,
            save_id: "legacy".into(),
            save_name: "Old".into(),
            created_at: t0(),
            last_saved: t0(),
            save_size: text.len() as u64,
            digest: Some(digest(text.as_bytes())),
            compressed: Some(false),
            payload: text,
        };
        envelope.to_bytes().unwrap()
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let (store, _kv, _clock) = setup(SlotLayout::default()).await;
        let s = snapshot("Alpha");

        let receipt = store.save(&s, 1).await.unwrap();
        assert_eq!(receipt.slot_id, 1);
        assert_eq!(receipt.last_saved, t0());
        assert!(!receipt.compressed);

        let loaded = store.load(1).await.unwrap();
        assert_eq!(loaded.snapshot.save_id, s.save_id);
        assert_eq!(loaded.snapshot.save_name, "Alpha");
        assert_eq!(loaded.snapshot.last_saved, t0());
        assert!(!loaded.version_mismatch);
        assert!(!loaded.migration_applied);
        assert!(!loaded.repaired);
        assert!(loaded.warnings.is_empty());

        let info = store.slot_info(1).await.unwrap();
        assert!(info.occupied);
        assert_eq!(info.save_name.as_deref(), Some("Alpha"));
    }

    #[tokio::test]
    async fn test_delete_then_load_is_empty() {
        let (store, _kv, _clock) = setup(SlotLayout::default()).await;
        store.save(&snapshot("Alpha"), 2).await.unwrap();

        assert!(store.delete(2).await.unwrap());
        assert_eq!(store.load(2).await.unwrap_err(), SaveError::SlotEmpty(2));
        assert!(!store.delete(2).await.unwrap());
        assert_eq!(store.storage_usage().await.used, 0);
    }

    #[tokio::test]
    async fn test_load_of_never_written_slot_is_empty() {
        let (store, _kv, _clock) = setup(SlotLayout::default()).await;
        for slot in store.layout().slot_ids() {
            assert_eq!(store.load(slot).await.unwrap_err(), SaveError::SlotEmpty(slot));
        }
    }

    #[tokio::test]
    async fn test_unknown_slot_rejected() {
        let (store, _kv, _clock) = setup(SlotLayout::default()).await;
        assert_eq!(
            store.save(&snapshot("x"), 0).await.unwrap_err(),
            SaveError::InvalidSlot(0)
        );
        assert_eq!(store.load(99).await.unwrap_err(), SaveError::InvalidSlot(99));
        assert!(store.slot_info(8).await.is_err());
    }

    #[tokio::test]
    async fn test_capacity_rejected_without_partial_write() {
        let layout = SlotLayout {
            quota_bytes: 2000,
            ..Default::default()
        };
        let (store, kv, _clock) = setup(layout).await;
        let first = store.save(&snapshot("Small"), 1).await.unwrap();
        assert!(first.bytes < 2000);

        let mut big = snapshot("Big");
        big.colony.population = 80;
        big.ants = (0..80)
            .map(|i| Ant {
                id: format!("ant-{}", i),
                extra: Map::new(),
            })
            .collect();

        let err = store.save(&big, 2).await.unwrap_err();
        assert!(matches!(err, SaveError::Capacity { .. }));
        assert!(!store.slot_info(2).await.unwrap().occupied);
        assert!(kv.get(&slot_key(2)).await.unwrap().is_none());

        let usage = store.storage_usage().await;
        assert_eq!(usage.used, first.bytes);
        assert_eq!(usage.count, 1);
    }

    #[tokio::test]
    async fn test_overwrite_replaces_accounting() {
        let (store, _kv, _clock) = setup(SlotLayout::default()).await;
        store.save(&snapshot("One"), 1).await.unwrap();
        let second = store.save(&snapshot("Two"), 1).await.unwrap();

        let usage = store.storage_usage().await;
        assert_eq!(usage.used, second.bytes);
        assert_eq!(usage.count, 1);
        assert_eq!(store.load(1).await.unwrap().snapshot.save_name, "Two");
    }

    #[tokio::test]
    async fn test_auto_rotation() {
        // auto slots are 4, 5, 6
        let (store, _kv, clock) = setup(SlotLayout::default()).await;
        assert_eq!(store.next_auto_save_slot().await.unwrap(), 4);

        store.save(&snapshot("a"), 4).await.unwrap();
        assert_eq!(store.next_auto_save_slot().await.unwrap(), 5);

        clock.advance(Duration::minutes(1));
        store.save(&snapshot("b"), 6).await.unwrap();
        clock.advance(Duration::minutes(1));
        store.save(&snapshot("c"), 5).await.unwrap();

        // all full: 4 is the oldest
        assert_eq!(store.next_auto_save_slot().await.unwrap(), 4);

        clock.advance(Duration::minutes(1));
        store.load(4).await.unwrap();
        assert_eq!(store.next_auto_save_slot().await.unwrap(), 6);

        // restricted rotation only considers slot 4
        assert_eq!(store.next_auto_save_slot_within(1).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_auto_rotation_tie_breaks_on_lowest_id() {
        let (store, _kv, _clock) = setup(SlotLayout::default()).await;
        store.save(&snapshot("c"), 6).await.unwrap();
        store.save(&snapshot("b"), 5).await.unwrap();
        store.save(&snapshot("a"), 4).await.unwrap();
        assert_eq!(store.next_auto_save_slot().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_startup_scan_heals_corrupted_slot() {
        let kv = Arc::new(MemoryKv::new());
        let clock = Arc::new(ManualClock::new(t0()));
        {
            let store = SlotStore::open(kv.clone(), SlotLayout::default(), clock.clone())
                .await
                .unwrap();
            store.save(&snapshot("Good"), 1).await.unwrap();
            store.save(&snapshot("Doomed"), 2).await.unwrap();
        }
        kv.put(&slot_key(2), b"{ not json").await.unwrap();

        let store = SlotStore::open(kv.clone(), SlotLayout::default(), clock)
            .await
            .unwrap();
        assert!(store.slot_info(1).await.unwrap().occupied);
        assert!(!store.slot_info(2).await.unwrap().occupied);
        assert!(kv.get(&slot_key(2)).await.unwrap().is_none());
        assert_eq!(store.load(2).await.unwrap_err(), SaveError::SlotEmpty(2));
        assert_eq!(store.load(1).await.unwrap().snapshot.save_name, "Good");
    }

    #[tokio::test]
    async fn test_startup_rebuilds_lost_index() {
        let kv = Arc::new(MemoryKv::new());
        let clock = Arc::new(ManualClock::new(t0()));
        {
            let store = SlotStore::open(kv.clone(), SlotLayout::default(), clock.clone())
                .await
                .unwrap();
            store.save(&snapshot("Kept"), 3).await.unwrap();
        }
        kv.put(INDEX_KEY, b"garbage").await.unwrap();

        let store = SlotStore::open(kv, SlotLayout::default(), clock).await.unwrap();
        let info = store.slot_info(3).await.unwrap();
        assert!(info.occupied);
        assert_eq!(info.save_name.as_deref(), Some("Kept"));
    }

    #[tokio::test]
    async fn test_load_repairs_recoverable_damage() {
        let (store, kv, _clock) = setup(SlotLayout::default()).await;
        let mut payload = serde_json::to_value(snapshot("Damaged")).unwrap();
        payload.as_object_mut().unwrap().remove("resources");
        payload["ants"] = json!("oops");
        kv.put(&slot_key(1), &envelope_for(&payload, SaveVersion::new(1, 2, 0)))
            .await
            .unwrap();
        let store = SlotStore::open(kv, store.layout().clone(), Arc::new(ManualClock::new(t0())))
            .await
            .unwrap();

        let loaded = store.load(1).await.unwrap();
        assert!(loaded.repaired);
        assert!(!loaded.repair_log.is_empty());
        assert_eq!(loaded.snapshot.resources.get("food"), Some(&100.0));
        assert!(loaded.snapshot.ants.is_empty());
    }

    #[tokio::test]
    async fn test_load_coerces_non_string_text_fields() {
        let (store, kv, _clock) = setup(SlotLayout::default()).await;
        let mut s = snapshot("Named");
        s.colony.population = 1;
        s.ants = vec![Ant {
            id: "a1".into(),
            extra: Map::new(),
        }];
        let mut payload = serde_json::to_value(&s).unwrap();
        payload["save_name"] = json!(42);
        payload["ants"][0]["id"] = json!(5);
        kv.put(&slot_key(1), &envelope_for(&payload, SaveVersion::new(1, 2, 0)))
            .await
            .unwrap();
        let store = SlotStore::open(kv, store.layout().clone(), Arc::new(ManualClock::new(t0())))
            .await
            .unwrap();

        let loaded = store.load(1).await.unwrap();
        assert!(loaded.repaired);
        assert_eq!(loaded.snapshot.save_name, "42");
        assert_eq!(loaded.snapshot.ants[0].id, "5");
        assert_eq!(loaded.snapshot.colony.population, 1);
    }

    #[tokio::test]
    async fn test_load_rejects_unrecoverable_damage() {
        let (store, kv, _clock) = setup(SlotLayout::default()).await;
        let mut payload = serde_json::to_value(snapshot("Broken")).unwrap();
        payload["colony"] = json!(7);
        kv.put(&slot_key(1), &envelope_for(&payload, SaveVersion::new(1, 2, 0)))
            .await
            .unwrap();
        let store = SlotStore::open(kv, store.layout().clone(), Arc::new(ManualClock::new(t0())))
            .await
            .unwrap();

        assert!(matches!(
            store.load(1).await.unwrap_err(),
            SaveError::Structural { .. }
        ));
    }

    #[tokio::test]
    async fn test_load_migrates_older_minor() {
        let (store, kv, _clock) = setup(SlotLayout::default()).await;
        let mut payload = serde_json::to_value(snapshot("Old")).unwrap();
        let root = payload.as_object_mut().unwrap();
        root.remove("evolution");
        root.remove("view_state");
        root.insert("version".into(), json!({"major": 1, "minor": 0, "patch": 0}));
        kv.put(&slot_key(2), &envelope_for(&payload, SaveVersion::new(1, 0, 0)))
            .await
            .unwrap();
        let store = SlotStore::open(kv, store.layout().clone(), Arc::new(ManualClock::new(t0())))
            .await
            .unwrap();

        let loaded = store.load(2).await.unwrap();
        assert!(loaded.version_mismatch);
        assert!(loaded.migration_applied);
        assert_eq!(loaded.snapshot.version, SaveVersion::current());
    }

    #[tokio::test]
    async fn test_newer_minor_kept_but_rejected_on_load() {
        let (store, kv, _clock) = setup(SlotLayout::default()).await;
        let payload = serde_json::to_value(snapshot("Future")).unwrap();
        kv.put(&slot_key(1), &envelope_for(&payload, SaveVersion::new(1, 9, 0)))
            .await
            .unwrap();
        let store = SlotStore::open(kv, store.layout().clone(), Arc::new(ManualClock::new(t0())))
            .await
            .unwrap();

        assert!(store.slot_info(1).await.unwrap().occupied);
        assert!(matches!(
            store.load(1).await.unwrap_err(),
            SaveError::Version { .. }
        ));
    }

    #[tokio::test]
    async fn test_population_mismatch_is_a_warning() {
        let (store, _kv, _clock) = setup(SlotLayout::default()).await;
        let mut s = snapshot("Counted");
        s.colony.population = 12;
        s.ants = (0..10)
            .map(|i| Ant {
                id: format!("ant-{}", i),
                extra: Map::new(),
            })
            .collect();
        store.save(&s, 1).await.unwrap();

        let loaded = store.load(1).await.unwrap();
        assert!(!loaded.repaired);
        assert_eq!(loaded.snapshot.colony.population, 12);
        assert!(loaded
            .warnings
            .iter()
            .any(|w| matches!(w, IntegrityWarning::BusinessRule(m) if m.contains("population"))));
    }

    #[tokio::test]
    async fn test_export_import() {
        let (store, _kv, _clock) = setup(SlotLayout::default()).await;
        let s = snapshot("Travelling");
        store.save(&s, 1).await.unwrap();

        let blob = store.export_slot(1).await.unwrap();
        let receipt = store.import_slot(7, &blob).await.unwrap();
        assert_eq!(receipt.last_saved, t0());

        let loaded = store.load(7).await.unwrap();
        assert_eq!(loaded.snapshot.save_id, s.save_id);
        assert!(store.import_slot(2, b"junk").await.is_err());
        assert!(!store.slot_info(2).await.unwrap().occupied);
        assert_eq!(store.export_slot(3).await.unwrap_err(), SaveError::SlotEmpty(3));
    }

    #[tokio::test]
    async fn test_concurrent_saves_to_different_slots() {
        let (store, _kv, _clock) = setup(SlotLayout::default()).await;
        let a = snapshot("A");
        let b = snapshot("B");
        let c = snapshot("C");
        let (ra, rb, rc) = tokio::join!(store.save(&a, 1), store.save(&b, 2), store.save(&c, 3));
        assert!(ra.is_ok() && rb.is_ok() && rc.is_ok());
        assert_eq!(store.storage_usage().await.count, 3);
    }

    /// Backend that holds writes to one key until a permit is released.
    struct GatedKv {
        inner: MemoryKv,
        gated_key: String,
        gate: tokio::sync::Semaphore,
    }

    #[async_trait]
    impl KvBackend for GatedKv {
        fn backend_name(&self) -> &'static str {
            "gated"
        }

        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
            if key == self.gated_key {
                let permit = self
                    .gate
                    .acquire()
                    .await
                    .map_err(|e| StorageError::Internal(e.to_string()))?;
                permit.forget();
            }
            self.inner.put(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<bool, StorageError> {
            self.inner.delete(key).await
        }

        async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
            self.inner.list_keys(prefix).await
        }
    }

    #[tokio::test]
    async fn test_slow_write_does_not_block_other_slots() {
        let one_save = codec::encode_to_bytes(&snapshot("Slow"), t0()).unwrap().1.len() as u64;
        let kv = Arc::new(GatedKv {
            inner: MemoryKv::new(),
            gated_key: slot_key(1),
            gate: tokio::sync::Semaphore::new(0),
        });
        let layout = SlotLayout {
            quota_bytes: one_save * 5 / 2,
            ..Default::default()
        };
        let store = SlotStore::open(kv.clone(), layout, Arc::new(ManualClock::new(t0())))
            .await
            .unwrap();

        let slow = {
            let store = store.clone();
            tokio::spawn(async move { store.save(&snapshot("Slow"), 1).await })
        };
        while store.inner.reserved.get(&1).is_none() {
            tokio::task::yield_now().await;
        }

        // slot 2 completes while slot 1 is still writing
        let fast = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            store.save(&snapshot("Fast"), 2),
        )
        .await
        .expect("save to another slot was blocked");
        assert!(fast.is_ok());

        // the pending write still counts against the quota
        assert!(matches!(
            store.save(&snapshot("Third"), 3).await,
            Err(SaveError::Capacity { .. })
        ));

        kv.gate.add_permits(1);
        slow.await.unwrap().unwrap();
        assert!(store.inner.reserved.is_empty());
        assert_eq!(store.storage_usage().await.count, 2);
        assert_eq!(store.load(1).await.unwrap().snapshot.save_name, "Slow");
    }

    /// Backend whose index writes can be made to fail.
    struct FlakyIndexKv {
        inner: MemoryKv,
        fail_index: AtomicBool,
    }

    #[async_trait]
    impl KvBackend for FlakyIndexKv {
        fn backend_name(&self) -> &'static str {
            "flaky"
        }

        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
            if key == INDEX_KEY && self.fail_index.load(Ordering::SeqCst) {
                return Err(StorageError::Io("disk full".into()));
            }
            self.inner.put(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<bool, StorageError> {
            self.inner.delete(key).await
        }

        async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
            self.inner.list_keys(prefix).await
        }
    }

    #[tokio::test]
    async fn test_failed_index_write_rolls_back_slot() {
        let kv = Arc::new(FlakyIndexKv {
            inner: MemoryKv::new(),
            fail_index: AtomicBool::new(false),
        });
        let clock = Arc::new(ManualClock::new(t0()));
        let store = SlotStore::open(kv.clone(), SlotLayout::default(), clock)
            .await
            .unwrap();
        store.save(&snapshot("Original"), 1).await.unwrap();

        kv.fail_index.store(true, Ordering::SeqCst);
        assert!(store.save(&snapshot("Replacement"), 1).await.is_err());
        assert!(store.save(&snapshot("New"), 2).await.is_err());
        kv.fail_index.store(false, Ordering::SeqCst);

        assert_eq!(store.load(1).await.unwrap().snapshot.save_name, "Original");
        assert!(kv.get(&slot_key(2)).await.unwrap().is_none());
        assert!(!store.slot_info(2).await.unwrap().occupied);
    }
}
