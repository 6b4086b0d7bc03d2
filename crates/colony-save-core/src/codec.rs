//! Snapshot <-> envelope encoding.
//!
//! The payload is canonicalized by routing it through `serde_json::Value`,
//! whose maps are ordered, so the same snapshot always produces the same text
//! and therefore the same digest. Payloads above [`COMPRESSION_THRESHOLD`] are
//! gzip-compressed and base64-wrapped; the envelope records which form it holds.

use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;
use tracing::{debug, warn};

use crate::envelope::{EncodedSave, Envelope};
use crate::error::{IntegrityWarning, SaveError, StorageError};
use crate::migrate::{migrate, needs_migration};
use crate::snapshot::Snapshot;
use crate::version::{SaveVersion, CURRENT_VERSION};

/// Canonical payloads strictly larger than this many bytes are stored compressed.
pub const COMPRESSION_THRESHOLD: usize = 100 * 1024;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Flags describing what happened while decoding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodeReport {
    /// Version found in the envelope
    pub found_version: Option<SaveVersion>,
    /// The stored version differs from [`CURRENT_VERSION`]
    pub version_mismatch: bool,
    /// Default-filling migration ran on the payload
    pub migration_applied: bool,
    pub warnings: Vec<IntegrityWarning>,
}

/// Envelope plus its untyped, migrated payload. Fed to the validator before
/// typed conversion.
#[derive(Debug, Clone)]
pub struct RawDecoded {
    pub envelope: Envelope,
    pub payload: Value,
    pub report: DecodeReport,
}

/// Fully decoded snapshot.
#[derive(Debug, Clone)]
pub struct Decoded {
    pub snapshot: Snapshot,
    pub report: DecodeReport,
}

/// Non-cryptographic integrity digest: CRC-32 as 8 lowercase hex digits.
pub fn digest(bytes: &[u8]) -> String {
    format!("{:08x}", crc32fast::hash(bytes))
}

/// Deterministic JSON text for a snapshot.
pub fn canonical_payload(snapshot: &Snapshot) -> Result<String, SaveError> {
    let value = serde_json::to_value(snapshot).map_err(|e| {
        StorageError::Serialization(format!("Failed to serialize snapshot: {}", e))
    })?;
    canonical_text(&value)
}

/// Deterministic JSON text for an arbitrary payload value.
pub fn canonical_text(value: &Value) -> Result<String, SaveError> {
    serde_json::to_string(value).map_err(|e| {
        SaveError::Storage(StorageError::Serialization(format!(
            "Failed to serialize payload: {}",
            e
        )))
    })
}

/// Encode a snapshot, stamping it with the current version and `saved_at`.
pub fn encode(snapshot: &Snapshot, saved_at: DateTime<Utc>) -> Result<EncodedSave, SaveError> {
    let mut stamped = snapshot.clone();
    stamped.version = CURRENT_VERSION;
    stamped.last_saved = saved_at;

    let text = canonical_payload(&stamped)?;
    let raw_size = text.len();
    let payload_digest = digest(text.as_bytes());

    let compressed = raw_size > COMPRESSION_THRESHOLD;
    let payload = if compressed {
        let gz = gzip(text.as_bytes()).map_err(|e| {
            StorageError::Internal(format!("Failed to compress payload: {}", e))
        })?;
        debug!("Compressed payload {} -> {} bytes", raw_size, gz.len());
        BASE64.encode(gz)
    } else {
        text
    };

    Ok(EncodedSave {
        envelope: Envelope {
            version: CURRENT_VERSION,
            save_id: stamped.save_id,
            save_name: stamped.save_name,
            created_at: stamped.created_at,
            last_saved: stamped.last_saved,
            save_size: raw_size as u64,
            digest: Some(payload_digest),
            compressed: Some(compressed),
            payload,
        },
        raw_size: raw_size as u64,
        compressed,
    })
}

/// Encode straight to the bytes stored in a slot.
pub fn encode_to_bytes(
    snapshot: &Snapshot,
    saved_at: DateTime<Utc>,
) -> Result<(EncodedSave, Vec<u8>), SaveError> {
    let encoded = encode(snapshot, saved_at)?;
    let bytes = encoded.envelope.to_bytes().map_err(|e| {
        StorageError::Serialization(format!("Failed to serialize envelope: {}", e))
    })?;
    Ok((encoded, bytes))
}

/// Parse the envelope out of a stored blob. Blobs that were gzip-compressed
/// as a whole (older layout) are inflated first; if inflation fails the bytes
/// are parsed as they are.
pub fn parse_envelope(blob: &[u8]) -> Result<Envelope, SaveError> {
    let inflated;
    let bytes = if blob.starts_with(&GZIP_MAGIC) {
        match gunzip(blob) {
            Ok(data) => {
                inflated = data;
                &inflated[..]
            }
            Err(e) => {
                debug!("Blob has gzip magic but failed to inflate ({}), parsing raw", e);
                blob
            }
        }
    } else {
        blob
    };

    serde_json::from_slice(bytes).map_err(|e| SaveError::Structural {
        sections: Vec::new(),
        message: format!("Unreadable envelope: {}", e),
    })
}

/// Reject versions this build cannot read.
pub fn check_version(found: SaveVersion) -> Result<(), SaveError> {
    if found.major != CURRENT_VERSION.major || found.minor > CURRENT_VERSION.minor {
        return Err(SaveError::Version {
            found,
            current: CURRENT_VERSION,
        });
    }
    Ok(())
}

/// Recover the canonical payload text from an envelope.
pub fn payload_text(envelope: &Envelope) -> Result<String, SaveError> {
    match envelope.compressed {
        Some(true) => inflate_payload(&envelope.payload).map_err(|e| SaveError::Structural {
            sections: Vec::new(),
            message: format!("Failed to decompress payload: {}", e),
        }),
        Some(false) => Ok(envelope.payload.clone()),
        // Legacy record: try decompression, fall back to the raw text.
        None => match inflate_payload(&envelope.payload) {
            Ok(text) => Ok(text),
            Err(_) => Ok(envelope.payload.clone()),
        },
    }
}

fn inflate_payload(payload: &str) -> Result<String, String> {
    let gz = BASE64
        .decode(payload.trim())
        .map_err(|e| format!("invalid base64: {}", e))?;
    let raw = gunzip(&gz).map_err(|e| format!("invalid gzip stream: {}", e))?;
    String::from_utf8(raw).map_err(|e| format!("payload is not UTF-8: {}", e))
}

/// Decode a stored blob into its envelope and untyped payload.
///
/// Digest mismatches are reported as warnings; the payload is still returned.
pub fn decode_raw(blob: &[u8]) -> Result<RawDecoded, SaveError> {
    let envelope = parse_envelope(blob)?;
    decode_envelope(envelope)
}

/// Same as [`decode_raw`] for an already-parsed envelope.
pub fn decode_envelope(envelope: Envelope) -> Result<RawDecoded, SaveError> {
    let found = envelope.version;
    check_version(found)?;

    let text = payload_text(&envelope)?;

    let mut report = DecodeReport {
        found_version: Some(found),
        version_mismatch: found != CURRENT_VERSION,
        ..Default::default()
    };

    if let Some(stored) = &envelope.digest {
        let computed = digest(text.as_bytes());
        if &computed != stored {
            warn!(
                "Digest mismatch for save {} (stored {}, computed {})",
                envelope.save_id, stored, computed
            );
            report.warnings.push(IntegrityWarning::DigestMismatch {
                stored: stored.clone(),
                computed,
            });
        }
    }

    let mut payload: Value = serde_json::from_str(&text).map_err(|e| SaveError::Structural {
        sections: Vec::new(),
        message: format!("Unreadable payload: {}", e),
    })?;

    if needs_migration(found) {
        payload = migrate(payload, found);
        report.migration_applied = true;
    }

    Ok(RawDecoded {
        envelope,
        payload,
        report,
    })
}

/// Convert a (validated) payload into a typed snapshot.
pub fn snapshot_from_value(payload: Value) -> Result<Snapshot, SaveError> {
    serde_json::from_value(payload).map_err(|e| SaveError::Structural {
        sections: Vec::new(),
        message: format!("Payload does not match the snapshot schema: {}", e),
    })
}

/// Decode a stored blob straight to a typed snapshot without validation.
pub fn decode(blob: &[u8]) -> Result<Decoded, SaveError> {
    let raw = decode_raw(blob)?;
    let snapshot = snapshot_from_value(raw.payload)?;
    Ok(Decoded {
        snapshot,
        report: raw.report,
    })
}

pub(crate) fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

pub(crate) fn gunzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
