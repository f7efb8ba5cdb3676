//! Local file-based state storage backend.
//!
//! State lives in a single JSON document inside the state directory. Writes
//! go to a temporary file that is synced and renamed over the old one.

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ConvergeError, Result, StateError};

use super::lock::{LockInfo, LOCK_EXPIRY_SECS};
use super::store::StateStore;
use super::types::AppliedState;

/// Default state directory name.
pub const STATE_DIR: &str = ".converge";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Local file-based state store.
#[derive(Debug, Clone)]
pub struct LocalStateStore {
    base_dir: PathBuf,
    state_path: PathBuf,
    lock_path: PathBuf,
}

impl LocalStateStore {
    /// Creates a store rooted at `./.converge`.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| ConvergeError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let state_path = base_dir.join(STATE_FILE);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            state_path,
            lock_path,
        }
    }

    /// Path of the state document.
    #[must_use]
    pub fn state_path(&self) -> &std::path::Path {
        &self.state_path
    }

    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir)
                .await
                .map_err(|e| StateError::write_failed(format!("Failed to create state directory: {e}")))?;
        }
        Ok(())
    }

    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        let content = match fs::read_to_string(&self.lock_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StateError::corrupted(format!("Failed to read lock file: {e}")).into()),
        };

        let lock_info: LockInfo = serde_json::from_str(&content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse lock file: {e}")))?;

        Ok(Some(lock_info))
    }

    /// Creates the lock file, failing if one already exists.
    async fn create_lock_file(&self, lock_info: &LockInfo) -> Result<()> {
        self.ensure_dir().await?;

        let content = serde_json::to_string_pretty(lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    StateError::LockFailed {
                        message: String::from("lock file was created concurrently"),
                    }
                } else {
                    StateError::LockFailed {
                        message: format!("Failed to create lock file: {e}"),
                    }
                }
            })?;

        file.write_all(content.as_bytes()).await.map_err(|e| StateError::LockFailed {
            message: format!("Failed to write lock file: {e}"),
        })?;
        file.sync_all().await.map_err(|e| StateError::LockFailed {
            message: format!("Failed to sync lock file: {e}"),
        })?;

        Ok(())
    }

    /// Replaces the lock file atomically.
    async fn overwrite_lock_file(&self, lock_info: &LockInfo) -> Result<()> {
        let content = serde_json::to_string_pretty(lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;

        let temp_path = self
            .lock_path
            .with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        let lock_failed = |e: std::io::Error| StateError::LockFailed {
            message: format!("Failed to renew lock file: {e}"),
        };

        let mut file = fs::File::create(&temp_path).await.map_err(lock_failed)?;
        file.write_all(content.as_bytes()).await.map_err(lock_failed)?;
        file.sync_all().await.map_err(lock_failed)?;
        fs::rename(&temp_path, &self.lock_path).await.map_err(lock_failed)?;

        Ok(())
    }

    async fn delete_lock_file(&self) -> Result<()> {
        match fs::remove_file(&self.lock_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateError::LockFailed {
                message: format!("Failed to delete lock file: {e}"),
            }
            .into()),
        }
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<Option<AppliedState>> {
        let content = match fs::read_to_string(&self.state_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("State file does not exist: {}", self.state_path.display());
                return Ok(None);
            }
            Err(e) => return Err(StateError::corrupted(format!("Failed to read state file: {e}")).into()),
        };

        debug!("Loaded state from: {}", self.state_path.display());

        let state: AppliedState = serde_json::from_str(&content).map_err(|e| {
            StateError::corrupted(format!("Failed to parse {}: {e}", self.state_path.display()))
        })?;
        state.check_version()?;

        Ok(Some(state))
    }

    async fn save(&self, state: &AppliedState) -> Result<()> {
        self.ensure_dir().await?;

        let content = serde_json::to_string_pretty(state)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")))?;

        let temp_path = self.state_path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| StateError::write_failed(format!("Failed to create temp state file: {e}")))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| StateError::write_failed(format!("Failed to write state file: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| StateError::write_failed(format!("Failed to sync state file: {e}")))?;

        fs::rename(&temp_path, &self.state_path)
            .await
            .map_err(|e| StateError::write_failed(format!("Failed to rename state file: {e}")))?;

        debug!("State saved (serial {})", state.serial);
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        match fs::remove_file(&self.state_path).await {
            Ok(()) => info!("Deleted state file: {}", self.state_path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StateError::write_failed(format!("Failed to delete state file: {e}")).into()),
        }

        self.delete_lock_file().await
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state_path.exists())
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        if let Some(existing) = self.read_lock_file().await? {
            if !existing.is_expired() {
                return Err(StateError::LockedByOther {
                    holder: existing.holder,
                    since: existing.acquired_at.to_rfc3339(),
                }
                .into());
            }
            warn!("Taking over expired lock held by {}", existing.holder);
            self.delete_lock_file().await?;
        }

        let lock_info = LockInfo::new(holder);
        self.create_lock_file(&lock_info).await?;

        info!("Acquired state lock: {} (expires in {}s)", lock_info.lock_id, LOCK_EXPIRY_SECS);

        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file().await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!("Lock ID mismatch: expected {lock_id}, found {}", existing.lock_id);
            }
        }
        Ok(())
    }

    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo> {
        let mut lock_info = match self.read_lock_file().await? {
            Some(existing) if existing.lock_id == lock_id => existing,
            Some(existing) => {
                warn!("State lock {lock_id} was taken over by {}", existing.holder);
                return Err(StateError::LockLost {
                    lock_id: lock_id.to_string(),
                }
                .into());
            }
            None => {
                return Err(StateError::LockLost {
                    lock_id: lock_id.to_string(),
                }
                .into());
            }
        };

        lock_info.refresh();
        self.overwrite_lock_file(&lock_info).await?;
        debug!("Renewed state lock {lock_id} ({}s left)", lock_info.remaining_secs());

        Ok(lock_info)
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp_dir.path().join(STATE_DIR));
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (store, _temp) = create_test_store();

        let mut state = AppliedState::new("eks-sandbox", "dev");
        state.spec_hash = String::from("abc");
        store.save(&state).await.expect("Failed to save state");

        let loaded = store.load().await.expect("Failed to load state").expect("State should exist");
        assert_eq!(loaded, state);
        assert!(!store.state_path().with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let (store, _temp) = create_test_store();
        assert!(store.load().await.expect("Load should not fail").is_none());
        assert!(!store.exists().await.expect("exists check failed"));
    }

    #[tokio::test]
    async fn test_corrupted_state_is_fatal() {
        let (store, _temp) = create_test_store();
        store.ensure_dir().await.expect("dir");
        std::fs::write(store.state_path(), "{ not json").expect("write");

        let err = store.load().await.expect_err("corrupted state must fail");
        assert!(matches!(err, ConvergeError::State(StateError::Corrupted { .. })));
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _temp) = create_test_store();

        let lock = store.acquire_lock("test-holder").await.expect("Failed to acquire lock");
        assert!(store.is_locked().await.expect("is_locked failed"));

        store.release_lock("someone-else").await.expect("mismatched release is a no-op");
        assert!(store.is_locked().await.expect("is_locked failed"));

        store.release_lock(&lock.lock_id).await.expect("Failed to release lock");
        assert!(!store.is_locked().await.expect("is_locked failed"));
    }

    #[tokio::test]
    async fn test_lock_conflict() {
        let (store, _temp) = create_test_store();

        let _lock = store.acquire_lock("holder-1").await.expect("Failed to acquire first lock");
        let err = store.acquire_lock("holder-2").await.expect_err("second lock must fail");
        assert!(matches!(err, ConvergeError::State(StateError::LockedByOther { ref holder, .. }) if holder == "holder-1"));
    }

    #[tokio::test]
    async fn test_expired_lock_is_taken_over() {
        let (store, _temp) = create_test_store();

        let mut stale = LockInfo::new("crashed");
        stale.expires_at = chrono::Utc::now() - chrono::Duration::seconds(5);
        store.create_lock_file(&stale).await.expect("write stale lock");

        let lock = store.acquire_lock("fresh").await.expect("expired lock should be replaced");
        assert_eq!(lock.holder, "fresh");
    }

    #[tokio::test]
    async fn test_refresh_extends_only_the_owned_lock() {
        let (store, _temp) = create_test_store();

        let mut lock = store.acquire_lock("apply").await.expect("acquire");
        lock.expires_at = chrono::Utc::now() - chrono::Duration::seconds(5);
        store.overwrite_lock_file(&lock).await.expect("age lock");

        let renewed = store.refresh_lock(&lock.lock_id).await.expect("refresh");
        assert_eq!(renewed.lock_id, lock.lock_id);
        assert!(!renewed.is_expired());
        assert_eq!(store.get_lock_info().await.expect("info"), Some(renewed));

        let err = store.refresh_lock("stolen").await.expect_err("not ours");
        assert!(matches!(err, ConvergeError::State(StateError::LockLost { .. })));

        store.release_lock(&lock.lock_id).await.expect("release");
        let err = store.refresh_lock(&lock.lock_id).await.expect_err("released");
        assert!(matches!(err, ConvergeError::State(StateError::LockLost { .. })));
        assert!(!store.is_locked().await.expect("is_locked"));
    }
}
