//! Scoped state sessions.
//!
//! A [`StateSession`] holds the state lock for the duration of a plan-apply
//! cycle. A heartbeat task renews the lock while the session is open and
//! every commit re-checks ownership before writing. Closing the session
//! writes the state back and releases the lock; dropping it without closing
//! does the same on a background task.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::lock::{LockInfo, LOCK_HEARTBEAT_SECS};
use super::store::StateStore;
use super::types::AppliedState;
use crate::error::{ConvergeError, Result, StateError};

/// Shared handle to the state loaded by a session.
///
/// Every mutation goes through [`StateHandle::commit`], which persists the
/// new state before the mutex is released, so writes are serialized.
#[derive(Clone)]
pub struct StateHandle {
    state: Arc<Mutex<AppliedState>>,
    store: Arc<dyn StateStore>,
    lock_id: Option<String>,
}

impl StateHandle {
    /// Wraps a state value and the store it is persisted to, without a lock.
    #[must_use]
    pub fn new(state: AppliedState, store: Arc<dyn StateStore>) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
            store,
            lock_id: None,
        }
    }

    fn locked(state: AppliedState, store: Arc<dyn StateStore>, lock_id: &str) -> Self {
        Self {
            lock_id: Some(lock_id.to_string()),
            ..Self::new(state, store)
        }
    }

    /// Returns a copy of the current state.
    pub async fn snapshot(&self) -> AppliedState {
        self.state.lock().await.clone()
    }

    /// Reads from the current state without copying it.
    pub async fn read<R>(&self, f: impl FnOnce(&AppliedState) -> R) -> R {
        let guard = self.state.lock().await;
        f(&guard)
    }

    /// Mutates the state and saves it while still holding the mutex.
    ///
    /// # Errors
    ///
    /// Returns `LockLost` if the session lock is no longer ours, or an error
    /// if the store write fails. The in-memory mutation is kept either way.
    pub async fn commit<R>(&self, mutate: impl FnOnce(&mut AppliedState) -> R) -> Result<R> {
        let mut guard = self.state.lock().await;
        let result = mutate(&mut guard);
        self.renew_lock().await?;
        self.store.save(&guard).await?;
        Ok(result)
    }

    async fn flush(&self) -> Result<()> {
        let guard = self.state.lock().await;
        self.renew_lock().await?;
        self.store.save(&guard).await
    }

    async fn renew_lock(&self) -> Result<()> {
        match &self.lock_id {
            Some(lock_id) => self.store.refresh_lock(lock_id).await.map(|_| ()),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for StateHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateHandle")
            .field("backend", &self.store.backend_type())
            .field("lock_id", &self.lock_id)
            .finish_non_exhaustive()
    }
}

/// Background task that keeps a session lock from expiring.
#[derive(Debug)]
struct Heartbeat {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Heartbeat {
    fn spawn(store: Arc<dyn StateStore>, lock_id: String, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let stopped = cancel.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = stopped.cancelled() => break,
                    _ = ticker.tick() => match store.refresh_lock(&lock_id).await {
                        Ok(_) => {}
                        Err(ConvergeError::State(StateError::LockLost { .. })) => {
                            error!("State lock {lock_id} lost; further commits will fail");
                            break;
                        }
                        Err(e) => warn!("Failed to renew state lock {lock_id}: {e}"),
                    },
                }
            }
        });
        Self { cancel, task }
    }

    /// Stops renewing and waits for an in-progress renewal to finish.
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!("Lock heartbeat task failed: {e}");
        }
    }
}

/// Exclusive, scoped access to persisted state.
#[derive(Debug)]
pub struct StateSession {
    handle: StateHandle,
    lock: Option<LockInfo>,
    heartbeat: Option<Heartbeat>,
}

impl StateSession {
    /// Acquires the lock and loads the state, creating an empty one if none exists.
    ///
    /// # Errors
    ///
    /// Returns `LockedByOther` if another holder has the lock, or `Corrupted` if
    /// the stored state cannot be read. The lock is released on load failure.
    pub async fn open(store: Arc<dyn StateStore>, project: &str, environment: &str, holder: &str) -> Result<Self> {
        Self::open_with_heartbeat(store, project, environment, holder, Duration::from_secs(LOCK_HEARTBEAT_SECS)).await
    }

    /// Like [`StateSession::open`], renewing the lock every `heartbeat`.
    ///
    /// # Errors
    ///
    /// Same as [`StateSession::open`].
    pub async fn open_with_heartbeat(
        store: Arc<dyn StateStore>,
        project: &str,
        environment: &str,
        holder: &str,
        heartbeat: Duration,
    ) -> Result<Self> {
        let lock = store.acquire_lock(holder).await?;

        let state = match load_or_new(store.as_ref(), project, environment).await {
            Ok(state) => state,
            Err(e) => {
                if let Err(release_err) = store.release_lock(&lock.lock_id).await {
                    error!("Failed to release state lock {}: {release_err}", lock.lock_id);
                }
                return Err(e);
            }
        };

        debug!("Opened state session (lock {}, serial {})", lock.lock_id, state.serial);

        Ok(Self {
            heartbeat: Some(Heartbeat::spawn(Arc::clone(&store), lock.lock_id.clone(), heartbeat)),
            handle: StateHandle::locked(state, store, &lock.lock_id),
            lock: Some(lock),
        })
    }

    /// Returns a shared handle to the session state.
    #[must_use]
    pub fn handle(&self) -> StateHandle {
        self.handle.clone()
    }

    /// Lock held by this session.
    #[must_use]
    pub fn lock_info(&self) -> Option<&LockInfo> {
        self.lock.as_ref()
    }

    /// Writes the state back and releases the lock.
    ///
    /// The lock is released even when the write fails.
    ///
    /// # Errors
    ///
    /// Returns the write error first, then any release error.
    pub async fn close(mut self) -> Result<()> {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.stop().await;
        }
        let Some(lock) = self.lock.take() else {
            return Ok(());
        };

        let saved = self.handle.flush().await;
        let released = self.handle.store.release_lock(&lock.lock_id).await;
        debug!("Closed state session (lock {})", lock.lock_id);

        saved.and(released)
    }
}

impl Drop for StateSession {
    fn drop(&mut self) {
        let heartbeat = self.heartbeat.take();
        let Some(lock) = self.lock.take() else {
            return;
        };

        warn!("State session dropped without close; writing back on a background task");
        let handle = self.handle.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Some(heartbeat) = heartbeat {
                        heartbeat.stop().await;
                    }
                    if let Err(e) = handle.flush().await {
                        error!("Failed to write back state: {e}");
                    }
                    if let Err(e) = handle.store.release_lock(&lock.lock_id).await {
                        error!("Failed to release state lock {}: {e}", lock.lock_id);
                    }
                });
            }
            Err(_) => {
                if let Some(heartbeat) = heartbeat {
                    heartbeat.cancel.cancel();
                }
                error!("No runtime available; state lock {} left to expire", lock.lock_id);
            }
        }
    }
}

/// Loads the stored state, or an empty one for `project`/`environment`.
///
/// # Errors
///
/// Returns an error if the store cannot be read.
pub async fn load_or_new(store: &dyn StateStore, project: &str, environment: &str) -> Result<AppliedState> {
    match store.load().await? {
        Some(state) => {
            if state.project != project || state.environment != environment {
                warn!(
                    "State belongs to {}/{} but spec declares {project}/{environment}",
                    state.project, state.environment
                );
            }
            Ok(state)
        }
        None => Ok(AppliedState::new(project, environment)),
    }
}

/// Runs `f` inside a state session, closing it on every exit path.
///
/// # Errors
///
/// Returns the error from `f` if it failed, otherwise any session error.
pub async fn with_session<T, F, Fut>(
    store: Arc<dyn StateStore>,
    project: &str,
    environment: &str,
    holder: &str,
    f: F,
) -> Result<T>
where
    F: FnOnce(StateHandle) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let session = StateSession::open(store, project, environment, holder).await?;
    let result = f(session.handle()).await;
    let closed = session.close().await;

    match (result, closed) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(close_err)) => {
            error!("Failed to close state session: {close_err}");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::LocalStateStore;
    use tempfile::TempDir;

    fn store() -> (Arc<dyn StateStore>, TempDir) {
        let temp = TempDir::new().expect("temp dir");
        let store: Arc<dyn StateStore> = Arc::new(LocalStateStore::with_base_dir(temp.path()));
        (store, temp)
    }

    #[tokio::test]
    async fn test_session_saves_and_releases() {
        let (store, _temp) = store();

        with_session(Arc::clone(&store), "eks-sandbox", "dev", "test", |handle| async move {
            handle.commit(|state| state.spec_hash = String::from("abc")).await
        })
        .await
        .expect("session");

        assert!(!store.is_locked().await.expect("is_locked"));
        let loaded = store.load().await.expect("load").expect("state");
        assert_eq!(loaded.spec_hash, "abc");
    }

    #[tokio::test]
    async fn test_session_releases_on_failure() {
        let (store, _temp) = store();

        let result: Result<()> = with_session(Arc::clone(&store), "eks-sandbox", "dev", "test", |handle| async move {
            handle.commit(|state| state.spec_hash = String::from("partial")).await?;
            Err(ConvergeError::internal("boom"))
        })
        .await;

        assert!(result.is_err());
        assert!(!store.is_locked().await.expect("is_locked"));
        let loaded = store.load().await.expect("load").expect("state");
        assert_eq!(loaded.spec_hash, "partial");
    }

    #[tokio::test]
    async fn test_second_session_is_refused() {
        let (store, _temp) = store();

        let first = StateSession::open(Arc::clone(&store), "eks-sandbox", "dev", "first").await.expect("open");
        let err = StateSession::open(Arc::clone(&store), "eks-sandbox", "dev", "second")
            .await
            .expect_err("lock is held");
        assert!(matches!(err, ConvergeError::State(StateError::LockedByOther { .. })));

        first.close().await.expect("close");
        assert!(!store.is_locked().await.expect("is_locked"));
    }

    #[tokio::test]
    async fn test_corrupted_state_releases_lock() {
        let (store, temp) = store();
        std::fs::write(temp.path().join("state.json"), "garbage").expect("write");

        let err = StateSession::open(Arc::clone(&store), "eks-sandbox", "dev", "test")
            .await
            .expect_err("corrupted");
        assert!(matches!(err, ConvergeError::State(StateError::Corrupted { .. })));
        assert!(!store.is_locked().await.expect("is_locked"));
    }

    fn write_lock(temp: &TempDir, lock: &LockInfo) {
        let json = serde_json::to_string(lock).expect("serialize lock");
        std::fs::write(temp.path().join("state.lock"), json).expect("write lock");
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_long_session_locked() {
        let (store, temp) = store();

        let first = StateSession::open_with_heartbeat(
            Arc::clone(&store),
            "eks-sandbox",
            "dev",
            "first",
            Duration::from_millis(20),
        )
        .await
        .expect("open");
        let mut aged = first.lock_info().cloned().expect("lock");
        aged.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
        write_lock(&temp, &aged);

        tokio::time::sleep(Duration::from_millis(100)).await;

        let err = StateSession::open(Arc::clone(&store), "eks-sandbox", "dev", "second")
            .await
            .expect_err("renewed lock is still held");
        assert!(matches!(err, ConvergeError::State(StateError::LockedByOther { ref holder, .. }) if holder == "first"));

        first.close().await.expect("close");
        assert!(!store.is_locked().await.expect("is_locked"));
    }

    #[tokio::test]
    async fn test_commit_fails_once_lock_is_taken_over() {
        let (store, temp) = store();

        let session = StateSession::open(Arc::clone(&store), "eks-sandbox", "dev", "first").await.expect("open");
        let usurper = LockInfo::new("second");
        write_lock(&temp, &usurper);

        let err = session
            .handle()
            .commit(|state| state.spec_hash = String::from("stale"))
            .await
            .expect_err("lock lost");
        assert!(matches!(err, ConvergeError::State(StateError::LockLost { .. })));
        assert!(store.load().await.expect("load").is_none());

        let err = session.close().await.expect_err("close cannot write back");
        assert!(matches!(err, ConvergeError::State(StateError::LockLost { .. })));
        assert_eq!(store.get_lock_info().await.expect("lock info"), Some(usurper));
    }
}
