use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::version::SaveVersion;

/// Versioned wrapper persisted for every occupied slot.
///
/// `payload` holds the canonical JSON text of the snapshot, or the base64 of
/// its gzip stream when `compressed` is set. `digest` always covers the
/// uncompressed canonical text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: SaveVersion,
    pub save_id: String,
    #[serde(default)]
    pub save_name: String,
    pub created_at: DateTime<Utc>,
    pub last_saved: DateTime<Utc>,
    /// Size in bytes of the uncompressed canonical payload
    #[serde(default)]
    pub save_size: u64,
    /// Legacy records may lack a digest; they are read without an integrity check.
    #[serde(default)]
    pub digest: Option<String>,
    /// `None` only for legacy records written before the flag existed.
    #[serde(default)]
    pub compressed: Option<bool>,
    pub payload: String,
}

impl Envelope {
    /// Serialize the envelope into the bytes stored in a local slot.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Result of encoding a snapshot.
#[derive(Debug, Clone)]
pub struct EncodedSave {
    pub envelope: Envelope,
    /// Byte size of the canonical payload before compression
    pub raw_size: u64,
    pub compressed: bool,
}
