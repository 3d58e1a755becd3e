//! Durable dispatch state: the snapshot data model, the advisory file lock,
//! and the lock-guarded store that mediates every mutation.

pub mod lock;
pub mod store;
pub mod types;

pub use lock::{LockSettings, StateLock};
pub use store::StateStore;
pub use types::{
    CompletedDispatch, Dispatch, DispatchStatus, RunPhase, SessionMapping, Snapshot,
};
