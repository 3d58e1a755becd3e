//! Compare-and-swap transition engine over the state store.
//!
//! A fixed directed graph governs dispatch statuses; `done`, `failed` and
//! `stuck` are terminal. A transition applies only when the dispatch is
//! currently in the state the caller expected. A mismatch is a CAS conflict —
//! the mechanism that stops two racing completion events from both succeeding
//! — and leaves the snapshot untouched. An edge missing from the graph is a
//! caller bug and propagates.

use crate::errors::TransitionError;
use crate::state::store::StateStore;
use crate::state::types::{Dispatch, DispatchStatus};
use std::sync::Arc;
use tracing::debug;

/// Whether the transition graph contains the edge `from -> to`.
///
/// `auditing -> working` is the rework edge; it is distinguished from the
/// first-run `dispatched -> working` only by the dispatch's attempt counter.
pub fn is_allowed(from: DispatchStatus, to: DispatchStatus) -> bool {
    use DispatchStatus::*;
    matches!(
        (from, to),
        (Dispatched, Working)
            | (Dispatched, Failed)
            | (Dispatched, Stuck)
            | (Working, Auditing)
            | (Working, Failed)
            | (Working, Stuck)
            | (Auditing, Done)
            | (Auditing, Working)
            | (Auditing, Stuck)
    )
}

/// Field changes applied together with a status change, so the CAS write is
/// the single point where a dispatch mutates.
#[derive(Debug, Clone, Default)]
pub struct FieldUpdates {
    pub attempt: Option<u32>,
    pub worker_run_key: Option<String>,
    pub audit_run_key: Option<String>,
    pub stuck_reason: Option<String>,
    pub clear_run_keys: bool,
}

impl FieldUpdates {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_worker_run_key(mut self, key: impl Into<String>) -> Self {
        self.worker_run_key = Some(key.into());
        self
    }

    pub fn with_audit_run_key(mut self, key: impl Into<String>) -> Self {
        self.audit_run_key = Some(key.into());
        self
    }

    pub fn with_stuck_reason(mut self, reason: impl Into<String>) -> Self {
        self.stuck_reason = Some(reason.into());
        self
    }

    pub fn clearing_run_keys(mut self) -> Self {
        self.clear_run_keys = true;
        self
    }
}

/// Applies CAS transitions against the store.
pub struct TransitionEngine {
    store: Arc<StateStore>,
}

impl TransitionEngine {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    /// Move a dispatch from `from_expected` to `to`, applying `updates`
    /// atomically with the status change. Returns the updated dispatch.
    ///
    /// # Errors
    ///
    /// - [`TransitionError::CasConflict`] when the dispatch is no longer in
    ///   `from_expected`; nothing is written.
    /// - [`TransitionError::InvalidTransition`] when the edge is not in the
    ///   graph.
    /// - [`TransitionError::DispatchNotFound`] when the id is not active.
    pub async fn transition(
        &self,
        id: &str,
        from_expected: DispatchStatus,
        to: DispatchStatus,
        updates: FieldUpdates,
    ) -> Result<Dispatch, TransitionError> {
        let id_owned = id.to_string();
        self.store
            .try_mutate(move |snap| {
                let dispatch = snap
                    .dispatches
                    .active
                    .get_mut(&id_owned)
                    .ok_or(TransitionError::DispatchNotFound {
                        id: id_owned.clone(),
                    })?;

                if dispatch.status != from_expected {
                    return Err(TransitionError::CasConflict {
                        id: id_owned.clone(),
                        expected: from_expected,
                        requested: to,
                        actual: dispatch.status,
                    });
                }
                if !is_allowed(from_expected, to) {
                    return Err(TransitionError::InvalidTransition {
                        id: id_owned.clone(),
                        from: from_expected,
                        to,
                    });
                }

                debug!(id = %id_owned, from = %from_expected, to = %to, "Applying transition");
                dispatch.status = to;
                if let Some(attempt) = updates.attempt {
                    // Attempt is monotonic; rework only ever sets attempt + 1.
                    debug_assert!(attempt >= dispatch.attempt);
                    dispatch.attempt = attempt;
                }
                if updates.clear_run_keys {
                    dispatch.worker_run_key = None;
                    dispatch.audit_run_key = None;
                }
                if let Some(key) = updates.worker_run_key {
                    dispatch.worker_run_key = Some(key);
                }
                if let Some(key) = updates.audit_run_key {
                    dispatch.audit_run_key = Some(key);
                }
                // stuck_reason is present iff the dispatch is stuck.
                dispatch.stuck_reason = if to == DispatchStatus::Stuck {
                    updates.stuck_reason
                } else {
                    None
                };

                Ok(dispatch.clone())
            })
            .await?
    }
}
