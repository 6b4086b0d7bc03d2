use std::path::{Path, PathBuf};

use async_trait::async_trait;
use colony_save_core::{SaveError, Snapshot, SnapshotProvider, StorageError};
use tracing::debug;

/// Reads the live snapshot from a JSON file written by the game.
///
/// A missing file means no colony is running yet.
#[derive(Debug, Clone)]
pub struct FileSnapshotProvider {
    path: PathBuf,
}

impl FileSnapshotProvider {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

pub async fn read_snapshot(path: &Path) -> Result<Option<Snapshot>, SaveError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(StorageError::Io(format!("Failed to read {}: {}", path.display(), e)).into())
        }
    };
    let snapshot = serde_json::from_slice(&bytes).map_err(|e| {
        StorageError::Serialization(format!("Invalid snapshot in {}: {}", path.display(), e))
    })?;
    Ok(Some(snapshot))
}

#[async_trait]
impl SnapshotProvider for FileSnapshotProvider {
    async fn snapshot(&self) -> Result<Option<Snapshot>, SaveError> {
        let snapshot = read_snapshot(&self.path).await?;
        if snapshot.is_none() {
            debug!("No snapshot at {}", self.path.display());
        }
        Ok(snapshot)
    }
}
