use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::canonical_text;
use crate::envelope::Envelope;
use crate::error::{SaveError, StorageError};
use crate::validator::Section;
use crate::version::SaveVersion;

/// Authenticated session used for remote calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    pub user_id: String,
    #[serde(default)]
    pub email: Option<String>,
    pub access_token: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl AuthSession {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }
}

/// Authentication provider (current-user lookup, sign-in/out).
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// The signed-in session, if any and not expired.
    async fn current_session(&self) -> Option<AuthSession>;

    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthSession, SaveError>;

    async fn sign_out(&self) -> Result<(), SaveError>;
}

/// Remote row for one save, keyed by `(user_id, save_slot)`.
///
/// Small payloads travel inline as JSON in `save_data`; compressed payloads
/// travel as base64 in `compressed_data` with `is_compressed` set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub user_id: String,
    pub save_slot: u32,
    #[serde(default)]
    pub save_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed_data: Option<String>,
    #[serde(default)]
    pub is_compressed: bool,
    /// Dotted version string, e.g. "1.2.0"
    pub game_version: String,
    #[serde(default)]
    pub save_size: u64,
    #[serde(default)]
    pub digest: Option<String>,
    pub save_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

impl RemoteRecord {
    /// Build the remote row for an encoded envelope.
    ///
    /// `updated_at` carries the envelope's `last_saved`, so a copy that went
    /// through upload compares equal to its source during reconciliation.
    pub fn from_envelope(
        user_id: &str,
        save_slot: u32,
        envelope: &Envelope,
        accessed_at: DateTime<Utc>,
    ) -> Result<Self, SaveError> {
        let compressed = envelope.compressed.unwrap_or(false);
        let (save_data, compressed_data) = if compressed {
            (None, Some(envelope.payload.clone()))
        } else {
            let value: Value = serde_json::from_str(&envelope.payload).map_err(|e| {
                StorageError::Serialization(format!("Payload is not valid JSON: {}", e))
            })?;
            (Some(value), None)
        };

        Ok(Self {
            user_id: user_id.to_string(),
            save_slot,
            save_name: envelope.save_name.clone(),
            save_data,
            compressed_data,
            is_compressed: compressed,
            game_version: envelope.version.to_string(),
            save_size: envelope.save_size,
            digest: envelope.digest.clone(),
            save_id: envelope.save_id.clone(),
            created_at: envelope.created_at,
            updated_at: envelope.last_saved,
            last_accessed: accessed_at,
        })
    }

    /// Rebuild the envelope carried by this row.
    pub fn to_envelope(&self) -> Result<Envelope, SaveError> {
        let version = self
            .game_version
            .parse::<SaveVersion>()
            .map_err(|e| SaveError::structural(Section::Version, format!("Invalid remote game_version: {}", e)))?;

        let (payload, compressed) = match (&self.compressed_data, &self.save_data) {
            (Some(data), _) if self.is_compressed => (data.clone(), true),
            (_, Some(value)) => (canonical_text(value)?, false),
            (Some(data), None) => (data.clone(), true),
            (None, None) => {
                return Err(SaveError::Structural {
                    sections: Vec::new(),
                    message: format!("Remote slot {} has no payload", self.save_slot),
                })
            }
        };

        Ok(Envelope {
            version,
            save_id: self.save_id.clone(),
            save_name: self.save_name.clone(),
            created_at: self.created_at,
            last_saved: self.updated_at,
            save_size: self.save_size,
            digest: self.digest.clone(),
            compressed: Some(compressed),
            payload,
        })
    }

    pub fn meta(&self) -> RemoteSlotMeta {
        RemoteSlotMeta {
            save_slot: self.save_slot,
            save_name: self.save_name.clone(),
            save_size: self.save_size,
            updated_at: self.updated_at,
        }
    }
}

/// Listing row used by reconciliation (no payload).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSlotMeta {
    pub save_slot: u32,
    #[serde(default)]
    pub save_name: String,
    #[serde(default)]
    pub save_size: u64,
    pub updated_at: DateTime<Utc>,
}

/// Remote backend exposing authenticated upsert/select/delete over one collection.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Returns the backend identifier (e.g., "rest").
    fn backend_name(&self) -> &'static str;

    /// Insert or overwrite the row keyed by `(record.user_id, record.save_slot)`.
    async fn upsert(&self, session: &AuthSession, record: &RemoteRecord) -> Result<(), StorageError>;

    /// Fetch one row. A missing row is `Ok(None)`.
    async fn select(
        &self,
        session: &AuthSession,
        save_slot: u32,
    ) -> Result<Option<RemoteRecord>, StorageError>;

    /// List the signed-in user's rows without payloads.
    async fn list(&self, session: &AuthSession) -> Result<Vec<RemoteSlotMeta>, StorageError>;

    /// Delete one row. Returns whether it existed.
    async fn delete(&self, session: &AuthSession, save_slot: u32) -> Result<bool, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode;
    use crate::snapshot::Snapshot;
    use chrono::TimeZone;

    #[test]
    fn test_record_round_trip_inline() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let snapshot = Snapshot::new("Remote", "Hill", now);
        let envelope = encode(&snapshot, now).unwrap().envelope;

        let record = RemoteRecord::from_envelope("user-1", 2, &envelope, now).unwrap();
        assert!(!record.is_compressed);
        assert!(record.save_data.is_some());
        assert_eq!(record.game_version, "1.2.0");
        assert_eq!(record.updated_at, envelope.last_saved);

        let back = record.to_envelope().unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn test_record_without_payload_is_structural() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let snapshot = Snapshot::new("Remote", "Hill", now);
        let envelope = encode(&snapshot, now).unwrap().envelope;
        let mut record = RemoteRecord::from_envelope("user-1", 2, &envelope, now).unwrap();
        record.save_data = None;
        assert!(matches!(
            record.to_envelope(),
            Err(SaveError::Structural { .. })
        ));
    }

    #[test]
    fn test_session_expiry() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let mut session = AuthSession {
            user_id: "u".into(),
            email: None,
            access_token: "t".into(),
            expires_at: None,
        };
        assert!(!session.is_expired(now));
        session.expires_at = Some(now);
        assert!(session.is_expired(now));
    }
}
