use std::time::Duration;

use async_trait::async_trait;

use crate::error::StorageError;

/// Outcome of a lock attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockAcquireResult {
    pub acquired: bool,
}

impl LockAcquireResult {
    pub fn acquired() -> Self {
        Self { acquired: true }
    }

    pub fn not_acquired() -> Self {
        Self { acquired: false }
    }
}

/// Exclusive lock over a named resource, used to keep a single writer per
/// save profile across processes.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Try to take the lock without blocking.
    ///
    /// Re-acquiring a lock already held by the same holder succeeds.
    /// Backends that release on process exit may ignore `ttl`.
    async fn acquire(
        &self,
        namespace: &str,
        resource: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<LockAcquireResult, StorageError>;

    /// Release a lock. Releasing a lock held by someone else is a no-op.
    async fn release(&self, namespace: &str, resource: &str, holder: &str)
        -> Result<(), StorageError>;
}
