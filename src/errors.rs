//! Typed error hierarchy for the Overseer core.
//!
//! Three top-level enums cover the three subsystems:
//! - `StoreError` — state-file and lock failures
//! - `TransitionError` — CAS and transition-table violations
//! - `PipelineError` — orchestration failures wrapping the above
//!
//! A CAS conflict is the one error callers are expected to swallow: it means
//! a concurrent operation already resolved the dispatch, not that anything is
//! broken.

use crate::state::types::DispatchStatus;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors from the file-backed state store and its advisory lock.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Timed out acquiring state lock at {path} after {waited:?}")]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("Failed to create lock sentinel at {path}: {source}")]
    LockIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read state file at {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write state file at {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("State file at {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the transition engine.
#[derive(Debug, Error)]
pub enum TransitionError {
    /// The dispatch was not in the expected state. A concurrent operation won
    /// the race; nothing was changed.
    #[error(
        "CAS conflict on dispatch {id}: expected {expected}, requested {requested}, actual {actual}"
    )]
    CasConflict {
        id: String,
        expected: DispatchStatus,
        requested: DispatchStatus,
        actual: DispatchStatus,
    },

    /// The requested edge is not in the transition table. This is a caller
    /// bug, never a race, and must not be swallowed.
    #[error("Invalid transition {from} -> {to} for dispatch {id}")]
    InvalidTransition {
        id: String,
        from: DispatchStatus,
        to: DispatchStatus,
    },

    #[error("Dispatch {id} not found in active set")]
    DispatchNotFound { id: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TransitionError {
    /// True for the expected-state mismatch that phase handlers drop silently.
    pub fn is_cas_conflict(&self) -> bool {
        matches!(self, Self::CasConflict { .. })
    }
}

/// Errors from the pipeline orchestrator.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Run executor failed for {run_key}: {source}")]
    ExecutorFailed {
        run_key: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
