use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use colony_save_core::{LockAcquireResult, LockManager, StorageError};
use fs2::FileExt;
use tracing::{debug, instrument};

type Handles = HashMap<(String, String), (String, File)>;

/// Lock manager using OS-level exclusive file locks.
///
/// The lock is held as long as the file handle stays open, so a crashed
/// process releases its locks automatically and `ttl` is ignored.
///
/// Lock files live at `{base_dir}/{namespace}/locks/{resource}.lock`.
#[derive(Debug)]
pub struct FileLock {
    base_dir: PathBuf,
    /// (namespace, resource) -> (holder, open lock file)
    handles: Mutex<Handles>,
}

impl FileLock {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            handles: Mutex::new(HashMap::new()),
        }
    }

    fn locks_dir(&self, namespace: &str) -> PathBuf {
        self.base_dir.join(namespace).join("locks")
    }

    fn lock_path(&self, namespace: &str, resource: &str) -> PathBuf {
        self.locks_dir(namespace).join(format!("{}.lock", resource))
    }

    fn handles(&self) -> Result<MutexGuard<'_, Handles>, StorageError> {
        self.handles
            .lock()
            .map_err(|_| StorageError::Lock("lock table poisoned".to_string()))
    }
}

#[async_trait]
impl LockManager for FileLock {
    #[instrument(skip(self), level = "debug")]
    async fn acquire(
        &self,
        namespace: &str,
        resource: &str,
        holder: &str,
        _ttl: Duration,
    ) -> Result<LockAcquireResult, StorageError> {
        let key = (namespace.to_string(), resource.to_string());

        if let Some((existing, _)) = self.handles()?.get(&key) {
            if existing == holder {
                debug!("Lock on {}/{} already held by {}", namespace, resource, holder);
                return Ok(LockAcquireResult::acquired());
            }
            debug!(
                "Lock on {}/{} held by {} (requested by {})",
                namespace, resource, existing, holder
            );
            return Ok(LockAcquireResult::not_acquired());
        }

        let dir = self.locks_dir(namespace);
        std::fs::create_dir_all(&dir).map_err(|e| {
            StorageError::Io(format!("Failed to create locks dir {}: {}", dir.display(), e))
        })?;

        let path = self.lock_path(namespace, resource);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| {
                StorageError::Io(format!("Failed to open lock file {}: {}", path.display(), e))
            })?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                self.handles()?.insert(key, (holder.to_string(), file));
                debug!("Acquired lock on {}/{} for {}", namespace, resource, holder);
                Ok(LockAcquireResult::acquired())
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                debug!(
                    "Lock on {}/{} held by another process (requested by {})",
                    namespace, resource, holder
                );
                Ok(LockAcquireResult::not_acquired())
            }
            Err(e) => Err(StorageError::Lock(format!(
                "Failed to lock {}: {}",
                path.display(),
                e
            ))),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn release(&self, namespace: &str, resource: &str, holder: &str) -> Result<(), StorageError> {
        let key = (namespace.to_string(), resource.to_string());
        let mut handles = self.handles()?;

        match handles.entry(key) {
            Entry::Occupied(entry) if entry.get().0 == holder => {
                let (_, file) = entry.remove();
                let _ = FileExt::unlock(&file);
                debug!("Released lock on {}/{} by {}", namespace, resource, holder);
            }
            Entry::Occupied(entry) => {
                debug!(
                    "Cannot release lock on {}/{}: held by {} not {}",
                    namespace,
                    resource,
                    entry.get().0,
                    holder
                );
            }
            Entry::Vacant(_) => {
                debug!("No lock on {}/{} to release", namespace, resource);
            }
        }
        Ok(())
    }
}
