use async_trait::async_trait;
use colony_save_core::{
    AuthSession, RemoteBackend, RemoteRecord, RemoteSlotMeta, SaveError, StorageError,
};
use reqwest::{Client as HttpClient, RequestBuilder, Response, StatusCode};
use tracing::{debug, instrument};

use crate::config::RestConfig;

const LIST_COLUMNS: &str = "save_slot,save_name,save_size,updated_at";

/// Remote backend over a PostgREST-style REST API.
///
/// Rows live in one table keyed by `(user_id, save_slot)`. Writes are upserts
/// (`on_conflict=user_id,save_slot` with `resolution=merge-duplicates`), so a
/// retried upload overwrites instead of appending.
pub struct RestRemoteBackend {
    http_client: HttpClient,
    config: RestConfig,
}

impl std::fmt::Debug for RestRemoteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestRemoteBackend")
            .field("base_url", &self.config.base_url)
            .field("table", &self.config.table)
            .finish_non_exhaustive()
    }
}

impl RestRemoteBackend {
    pub fn new(config: RestConfig) -> Result<Self, SaveError> {
        config.validate()?;
        Ok(Self {
            http_client: config.http_client()?,
            config,
        })
    }

    fn table_url(&self) -> String {
        format!("{}/rest/v1/{}", self.config.base(), self.config.table)
    }

    fn authorized(&self, request: RequestBuilder, session: &AuthSession) -> RequestBuilder {
        request
            .header("apikey", &self.config.api_key)
            .header("Authorization", format!("Bearer {}", session.access_token))
    }

    async fn send(&self, request: RequestBuilder, op: &str) -> Result<Response, StorageError> {
        let response = request
            .send()
            .await
            .map_err(|e| StorageError::Unavailable(format!("{} request failed: {}", op, e)))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let text = response.text().await.unwrap_or_default();
            return Err(StorageError::Unauthorized(format!(
                "{} rejected with status {}: {}",
                op, status, text
            )));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(StorageError::Io(format!(
                "{} failed with status {}: {}",
                op, status, text
            )));
        }
        Ok(response)
    }

    async fn rows<T: serde::de::DeserializeOwned>(
        response: Response,
        op: &str,
    ) -> Result<Vec<T>, StorageError> {
        response
            .json::<Vec<T>>()
            .await
            .map_err(|e| StorageError::Serialization(format!("Failed to parse {} response: {}", op, e)))
    }
}

#[async_trait]
impl RemoteBackend for RestRemoteBackend {
    fn backend_name(&self) -> &'static str {
        "rest"
    }

    #[instrument(skip(self, session, record), level = "debug", fields(slot = record.save_slot))]
    async fn upsert(&self, session: &AuthSession, record: &RemoteRecord) -> Result<(), StorageError> {
        let request = self
            .http_client
            .post(self.table_url())
            .query(&[("on_conflict", "user_id,save_slot")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&[record]);
        self.send(self.authorized(request, session), "Upsert").await?;

        debug!(
            "Upserted slot {} for user {} ({} bytes)",
            record.save_slot, record.user_id, record.save_size
        );
        Ok(())
    }

    #[instrument(skip(self, session), level = "debug")]
    async fn select(
        &self,
        session: &AuthSession,
        save_slot: u32,
    ) -> Result<Option<RemoteRecord>, StorageError> {
        let request = self.http_client.get(self.table_url()).query(&[
            ("user_id", format!("eq.{}", session.user_id)),
            ("save_slot", format!("eq.{}", save_slot)),
            ("select", "*".to_string()),
        ]);
        let response = self.send(self.authorized(request, session), "Select").await?;
        let rows: Vec<RemoteRecord> = Self::rows(response, "select").await?;

        if rows.is_empty() {
            debug!("No remote row for slot {}", save_slot);
        }
        Ok(rows.into_iter().next())
    }

    #[instrument(skip(self, session), level = "debug")]
    async fn list(&self, session: &AuthSession) -> Result<Vec<RemoteSlotMeta>, StorageError> {
        let request = self.http_client.get(self.table_url()).query(&[
            ("user_id", format!("eq.{}", session.user_id)),
            ("select", LIST_COLUMNS.to_string()),
            ("order", "save_slot.asc".to_string()),
        ]);
        let response = self.send(self.authorized(request, session), "List").await?;
        let rows: Vec<RemoteSlotMeta> = Self::rows(response, "list").await?;

        debug!("Listed {} remote slots", rows.len());
        Ok(rows)
    }

    #[instrument(skip(self, session), level = "debug")]
    async fn delete(&self, session: &AuthSession, save_slot: u32) -> Result<bool, StorageError> {
        let request = self
            .http_client
            .delete(self.table_url())
            .query(&[
                ("user_id", format!("eq.{}", session.user_id)),
                ("save_slot", format!("eq.{}", save_slot)),
            ])
            .header("Prefer", "return=representation");
        let response = self.send(self.authorized(request, session), "Delete").await?;
        let rows: Vec<serde_json::Value> = Self::rows(response, "delete").await?;

        debug!("Deleted {} remote rows for slot {}", rows.len(), save_slot);
        Ok(!rows.is_empty())
    }
}
