//! Persistence services for colony saves.
//!
//! - [`SlotStore`]: local slots, quota and the startup self-healing scan
//! - [`SyncEngine`]: upload/download, reconciliation and the offline queue
//! - [`AutoSaveScheduler`]: interval, event and lifecycle triggered saves
//!
//! Each service is an explicit value built by the host at startup and shared
//! by cloning its handle.

mod scheduler;
mod slot_store;
mod sync;

pub use scheduler::{
    AutoSaveConfig, AutoSaveScheduler, AutoSaveStatus, Trigger, TriggerOutcome, EVENT_DEBOUNCE,
    KNOWN_EVENTS,
};
pub use slot_store::{restore, LoadOutcome, SaveReceipt, SlotStore, INDEX_KEY};
pub use sync::{
    plan, Connectivity, QueueReport, SlotSyncOutcome, SyncAction, SyncEngine, SyncRecord,
    SyncReport, UploadStatus,
};
