//! Cloud sync: upload, download, reconciliation and the offline upload queue.

mod connectivity;
mod plan;

pub use connectivity::Connectivity;
pub use plan::{plan, SyncAction, SyncRecord};

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use colony_save_core::codec;
use colony_save_core::{
    AuthProvider, AuthSession, Clock, RemoteBackend, RemoteRecord, SaveError, Snapshot,
    StorageError,
};
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::slot_store::{restore, LoadOutcome, SlotStore};

/// Result of an upload request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Uploaded,
    /// Offline: the upload waits in the queue until connectivity returns.
    Queued,
}

/// Outcome of one slot's reconciliation action.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotSyncOutcome {
    pub slot_id: u32,
    pub action: SyncAction,
    /// `None` when the action succeeded (or there was nothing to do)
    pub error: Option<SaveError>,
}

impl SlotSyncOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub outcomes: Vec<SlotSyncOutcome>,
}

impl SyncReport {
    pub fn failed(&self) -> impl Iterator<Item = &SlotSyncOutcome> {
        self.outcomes.iter().filter(|o| !o.is_ok())
    }

    pub fn uploaded(&self) -> usize {
        self.count(SyncAction::Upload)
    }

    pub fn downloaded(&self) -> usize {
        self.count(SyncAction::Download)
    }

    fn count(&self, action: SyncAction) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.action == action && o.is_ok())
            .count()
    }
}

/// Result of draining the offline queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueReport {
    pub retried: usize,
    pub succeeded: usize,
    pub requeued: usize,
}

#[derive(Debug, Clone)]
struct QueuedUpload {
    snapshot: Snapshot,
    slot_id: u32,
    queued_at: DateTime<Utc>,
}

/// Sync engine between the local [`SlotStore`] and a [`RemoteBackend`].
///
/// Cloning is cheap and yields a handle to the same engine and queue.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<SyncInner>,
}

struct SyncInner {
    store: SlotStore,
    remote: Arc<dyn RemoteBackend>,
    auth: Arc<dyn AuthProvider>,
    connectivity: Connectivity,
    clock: Arc<dyn Clock>,
    queue: Mutex<VecDeque<QueuedUpload>>,
    /// Serializes remote operations on the same slot
    slot_locks: DashMap<u32, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("remote", &self.inner.remote.backend_name())
            .field("online", &self.inner.connectivity.is_online())
            .finish_non_exhaustive()
    }
}

fn remote_error(e: StorageError) -> SaveError {
    match e {
        StorageError::Unauthorized(msg) => SaveError::Auth(msg),
        other => SaveError::Storage(other),
    }
}

impl SyncEngine {
    pub fn new(
        store: SlotStore,
        remote: Arc<dyn RemoteBackend>,
        auth: Arc<dyn AuthProvider>,
        connectivity: Connectivity,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(SyncInner {
                store,
                remote,
                auth,
                connectivity,
                clock,
                queue: Mutex::new(VecDeque::new()),
                slot_locks: DashMap::new(),
            }),
        }
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.inner.connectivity
    }

    /// Upload a snapshot into `slot_id`.
    ///
    /// The remote row is upserted, so repeating an upload is harmless. The
    /// row's `updated_at` is the snapshot's `last_saved`. While offline the
    /// upload is queued and `Queued` is returned.
    #[instrument(skip(self, snapshot), level = "debug")]
    pub async fn upload(&self, snapshot: &Snapshot, slot_id: u32) -> Result<UploadStatus, SaveError> {
        self.check_slot(slot_id)?;
        let session = self.inner.session().await?;

        if !self.inner.connectivity.is_online() {
            let mut queue = self.inner.queue.lock().await;
            queue.push_back(QueuedUpload {
                snapshot: snapshot.clone(),
                slot_id,
                queued_at: self.inner.clock.now(),
            });
            debug!("Offline: queued upload for slot {} ({} pending)", slot_id, queue.len());
            return Ok(UploadStatus::Queued);
        }

        self.inner.upload_snapshot(&session, snapshot, slot_id).await?;
        Ok(UploadStatus::Uploaded)
    }

    /// Fetch and decode the remote save for `slot_id`. A missing remote row
    /// is `Ok(None)`. Never queued: offline is an error.
    #[instrument(skip(self), level = "debug")]
    pub async fn download(&self, slot_id: u32) -> Result<Option<LoadOutcome>, SaveError> {
        self.check_slot(slot_id)?;
        let session = self.inner.session().await?;
        self.inner.require_online()?;

        let lock = self.inner.slot_lock(slot_id);
        let _guard = lock.lock().await;
        self.inner.fetch(&session, slot_id).await
    }

    /// Delete the remote row for `slot_id`.
    pub async fn delete_remote(&self, slot_id: u32) -> Result<bool, SaveError> {
        self.check_slot(slot_id)?;
        let session = self.inner.session().await?;
        self.inner.require_online()?;

        let lock = self.inner.slot_lock(slot_id);
        let _guard = lock.lock().await;
        self.inner
            .remote
            .delete(&session, slot_id)
            .await
            .map_err(remote_error)
    }

    /// Compare local and remote slots and bring both sides to the newest copy.
    ///
    /// Each slot's action runs independently; a failure is reported in that
    /// slot's outcome and does not stop the others.
    #[instrument(skip(self), level = "debug")]
    pub async fn reconcile(&self) -> Result<SyncReport, SaveError> {
        let session = self.inner.session().await?;
        self.inner.require_online()?;

        let local: Vec<(u32, DateTime<Utc>)> = self
            .inner
            .store
            .list_slots()
            .await
            .into_iter()
            .filter_map(|s| s.last_saved.map(|at| (s.slot_id, at)))
            .collect();
        let remote = self
            .inner
            .remote
            .list(&session)
            .await
            .map_err(remote_error)?;

        let records = plan(local, &remote);
        let outcomes = join_all(records.into_iter().map(|record| {
            let inner = self.inner.clone();
            let session = session.clone();
            async move {
                let result = match record.action {
                    SyncAction::Upload => inner.push_local(&session, record.slot_id).await,
                    SyncAction::Download => inner.pull_remote(&session, record.slot_id).await,
                    SyncAction::None => Ok(()),
                };
                if let Err(e) = &result {
                    warn!(
                        "Sync {} for slot {} failed: {}",
                        record.action, record.slot_id, e
                    );
                }
                SlotSyncOutcome {
                    slot_id: record.slot_id,
                    action: record.action,
                    error: result.err(),
                }
            }
        }))
        .await;

        let report = SyncReport { outcomes };
        info!(
            "Reconciled {} slots: {} uploaded, {} downloaded, {} failed",
            report.outcomes.len(),
            report.uploaded(),
            report.downloaded(),
            report.failed().count()
        );
        Ok(report)
    }

    /// Retry every queued upload once, in FIFO order. Failed retries go back
    /// to the front of the queue, ahead of uploads queued meanwhile.
    pub async fn process_queue(&self) -> QueueReport {
        if !self.inner.connectivity.is_online() {
            return QueueReport::default();
        }

        let pending: Vec<QueuedUpload> = self.inner.queue.lock().await.drain(..).collect();
        if pending.is_empty() {
            return QueueReport::default();
        }

        let mut report = QueueReport {
            retried: pending.len(),
            ..Default::default()
        };
        let session = self.inner.session().await;
        let mut failed = Vec::new();

        for entry in pending {
            let result = match &session {
                Ok(session) => {
                    self.inner
                        .upload_snapshot(session, &entry.snapshot, entry.slot_id)
                        .await
                }
                Err(e) => Err(e.clone()),
            };
            match result {
                Ok(()) => report.succeeded += 1,
                Err(e) => {
                    warn!(
                        "Queued upload for slot {} (queued at {}) failed, requeueing: {}",
                        entry.slot_id, entry.queued_at, e
                    );
                    failed.push(entry);
                }
            }
        }

        report.requeued = failed.len();
        if !failed.is_empty() {
            let mut queue = self.inner.queue.lock().await;
            for entry in failed.into_iter().rev() {
                queue.push_front(entry);
            }
        }

        info!(
            "Processed offline queue: {} retried, {} succeeded, {} requeued",
            report.retried, report.succeeded, report.requeued
        );
        report
    }

    pub async fn queue_len(&self) -> usize {
        self.inner.queue.lock().await.len()
    }

    /// Drain the offline queue each time connectivity comes back.
    pub fn spawn_reconnect_listener(&self) -> JoinHandle<()> {
        let engine = self.clone();
        let mut rx = self.inner.connectivity.subscribe();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let online = *rx.borrow_and_update();
                if online {
                    debug!("Connectivity restored, draining upload queue");
                    engine.process_queue().await;
                }
            }
        })
    }

    fn check_slot(&self, slot_id: u32) -> Result<(), SaveError> {
        match self.inner.store.layout().kind_of(slot_id) {
            Some(_) => Ok(()),
            None => Err(SaveError::InvalidSlot(slot_id)),
        }
    }
}

impl SyncInner {
    fn slot_lock(&self, slot_id: u32) -> Arc<Mutex<()>> {
        self.slot_locks.entry(slot_id).or_default().clone()
    }

    async fn session(&self) -> Result<AuthSession, SaveError> {
        match self.auth.current_session().await {
            Some(session) if !session.is_expired(self.clock.now()) => Ok(session),
            Some(_) => Err(SaveError::Auth("session expired".into())),
            None => Err(SaveError::Auth("not signed in".into())),
        }
    }

    fn require_online(&self) -> Result<(), SaveError> {
        if self.connectivity.is_online() {
            Ok(())
        } else {
            Err(SaveError::Offline)
        }
    }

    async fn upload_snapshot(
        &self,
        session: &AuthSession,
        snapshot: &Snapshot,
        slot_id: u32,
    ) -> Result<(), SaveError> {
        let encoded = codec::encode(snapshot, snapshot.last_saved)?;
        let lock = self.slot_lock(slot_id);
        let _guard = lock.lock().await;
        self.upsert(session, slot_id, &encoded.envelope).await
    }

    async fn upsert(
        &self,
        session: &AuthSession,
        slot_id: u32,
        envelope: &colony_save_core::Envelope,
    ) -> Result<(), SaveError> {
        let record =
            RemoteRecord::from_envelope(&session.user_id, slot_id, envelope, self.clock.now())?;
        self.remote
            .upsert(session, &record)
            .await
            .map_err(remote_error)?;
        debug!("Uploaded slot {} ({} bytes)", slot_id, record.save_size);
        Ok(())
    }

    async fn fetch(
        &self,
        session: &AuthSession,
        slot_id: u32,
    ) -> Result<Option<LoadOutcome>, SaveError> {
        let Some(record) = self
            .remote
            .select(session, slot_id)
            .await
            .map_err(remote_error)?
        else {
            debug!("No remote save for slot {}", slot_id);
            return Ok(None);
        };
        let envelope = record.to_envelope()?;
        let outcome = restore(codec::decode_envelope(envelope)?)?;
        Ok(Some(outcome))
    }

    /// Upload the stored local record as-is, keeping its `last_saved`.
    async fn push_local(&self, session: &AuthSession, slot_id: u32) -> Result<(), SaveError> {
        let lock = self.slot_lock(slot_id);
        let _guard = lock.lock().await;
        let envelope = self.store.read_envelope(slot_id).await?;
        self.upsert(session, slot_id, &envelope).await
    }

    /// Download the remote save and store it locally under the remote timestamp.
    async fn pull_remote(&self, session: &AuthSession, slot_id: u32) -> Result<(), SaveError> {
        let lock = self.slot_lock(slot_id);
        let _guard = lock.lock().await;
        let outcome = self
            .fetch(session, slot_id)
            .await?
            .ok_or_else(|| SaveError::Storage(StorageError::NotFound(format!(
                "remote slot {} disappeared during sync",
                slot_id
            ))))?;
        let saved_at = outcome.snapshot.last_saved;
        self.store.save_at(&outcome.snapshot, slot_id, saved_at).await?;
        debug!("Downloaded slot {}", slot_id);
        Ok(())
    }
}
