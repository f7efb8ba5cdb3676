//! State store trait definition.

use async_trait::async_trait;

use super::lock::LockInfo;
use super::types::AppliedState;
use crate::error::Result;

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the applied state.
    ///
    /// Returns `None` if no state exists yet and `Corrupted` if it cannot be read.
    async fn load(&self) -> Result<Option<AppliedState>>;

    /// Saves the applied state durably.
    async fn save(&self, state: &AppliedState) -> Result<()>;

    /// Deletes the applied state and any lock.
    async fn delete(&self) -> Result<()>;

    /// Checks if state exists.
    async fn exists(&self) -> Result<bool>;

    /// Acquires the lock, failing with `LockedByOther` if a live lock exists.
    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo>;

    /// Releases the lock if `lock_id` still owns it.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Extends the lock held as `lock_id`.
    ///
    /// Fails with `LockLost` if the lock is gone or now belongs to someone else.
    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Checks if the state is locked by a live lock.
    async fn is_locked(&self) -> Result<bool> {
        Ok(self.get_lock_info().await?.is_some_and(|lock| !lock.is_expired()))
    }

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}
