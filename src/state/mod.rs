//! State management module for converge.
//!
//! This module persists the last-applied resource graph: physical ids,
//! property snapshots and provider outputs, guarded by a lock for the
//! duration of each apply.

mod local;
mod lock;
mod s3;
mod session;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{generate_holder_id, LockInfo, LOCK_EXPIRY_SECS, LOCK_HEARTBEAT_SECS};
pub use s3::S3StateStore;
pub use session::{load_or_new, with_session, StateHandle, StateSession};
pub use store::StateStore;
pub use types::{AppliedResource, AppliedState, HistoryEntry, Operation, STATE_VERSION};
