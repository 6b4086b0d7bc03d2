use thiserror::Error;

use crate::validator::Section;
use crate::version::SaveVersion;

/// Errors raised by storage backends (local key-value store, remote store, locks).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error taxonomy shared by the codec, validator, slot store and sync engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SaveError {
    /// A critical section failed schema checks and could not be repaired.
    #[error("Structural error in {sections:?}: {message}")]
    Structural {
        sections: Vec<Section>,
        message: String,
    },

    #[error("Incompatible save version {found} (current {current})")]
    Version {
        found: SaveVersion,
        current: SaveVersion,
    },

    #[error("Storage quota exceeded: need {needed} bytes, {available} available")]
    Capacity { needed: u64, available: u64 },

    #[error("Slot {0} is empty")]
    SlotEmpty(u32),

    #[error("Slot {0} does not exist")]
    InvalidSlot(u32),

    #[error("Remote backend is offline")]
    Offline,

    #[error("Authentication required: {0}")]
    Auth(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SaveError {
    /// Build a structural error for a single section.
    pub fn structural(section: Section, message: impl Into<String>) -> Self {
        SaveError::Structural {
            sections: vec![section],
            message: message.into(),
        }
    }
}

/// Non-fatal findings attached to successful decode/load results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityWarning {
    /// Stored digest does not match the digest recomputed over the payload.
    DigestMismatch { stored: String, computed: String },
    /// A cross-field business rule does not hold.
    BusinessRule(String),
}

impl std::fmt::Display for IntegrityWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntegrityWarning::DigestMismatch { stored, computed } => {
                write!(f, "digest mismatch (stored {}, computed {})", stored, computed)
            }
            IntegrityWarning::BusinessRule(msg) => write!(f, "{}", msg),
        }
    }
}
