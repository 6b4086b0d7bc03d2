//! Core types and traits for colony save persistence.
//!
//! This crate holds everything that does not depend on a particular runtime
//! or backend:
//! - the snapshot data model and the versioned `Envelope` it is stored in
//! - the codec (canonical encoding, digest, compression, migration)
//! - the validator and repair pass
//! - the backend seams: `KvBackend`, `RemoteBackend`, `AuthProvider`,
//!   `SnapshotProvider`, `LockManager` and `Clock`

mod clock;
pub mod codec;
mod envelope;
mod error;
mod lock;
pub mod migrate;
mod provider;
pub mod repair;
mod slot;
mod snapshot;
mod storage;
mod sync;
pub mod validator;
mod version;

pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{DecodeReport, Decoded, RawDecoded, COMPRESSION_THRESHOLD};
pub use envelope::{EncodedSave, Envelope};
pub use error::{IntegrityWarning, SaveError, StorageError};
pub use lock::{LockAcquireResult, LockManager};
pub use provider::SnapshotProvider;
pub use repair::{repair, RepairResult};
pub use slot::{
    SlotIndex, SlotIndexEntry, SlotInfo, SlotKind, SlotLayout, StorageUsage, MAX_AUTO_SLOTS,
    MAX_MANUAL_SLOTS, MAX_QUICK_SLOTS,
};
pub use snapshot::{default_resources, Ant, Building, Colony, Evolution, GameEventRecord, Snapshot};
pub use storage::{KvBackend, MemoryKv};
pub use sync::{AuthProvider, AuthSession, RemoteBackend, RemoteRecord, RemoteSlotMeta};
pub use validator::{validate, IssueKind, Section, ValidationIssue, ValidationReport};
pub use version::{SaveVersion, CURRENT_VERSION};
