use async_trait::async_trait;

use crate::error::SaveError;
use crate::snapshot::Snapshot;

/// Supplies the live simulation state when an auto-save fires.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    /// Current state, or `None` when there is nothing to save yet
    /// (e.g. no colony has been started).
    async fn snapshot(&self) -> Result<Option<Snapshot>, SaveError>;
}
