//! Session registry: routes an ephemeral run key back to the dispatch, phase
//! and attempt that started it.
//!
//! A mapping is registered just before a run starts and looked up when its
//! completion arrives, possibly much later and possibly more than once. The
//! mapping's attempt is compared against the dispatch's current attempt: a
//! lower value means the completion belongs to a superseded retry and is
//! dropped.

use crate::errors::StoreError;
use crate::state::store::StateStore;
use crate::state::types::{Dispatch, RunPhase, SessionMapping, Snapshot};
use tracing::debug;

/// Pure lookup against an already-loaded snapshot; no I/O.
pub fn lookup_mapping<'a>(snapshot: &'a Snapshot, run_key: &str) -> Option<&'a SessionMapping> {
    snapshot.session_map.get(run_key)
}

/// Whether a completion event carried by `mapping` is stale relative to the
/// dispatch's current attempt. Stale events are harmless leftovers of rework.
pub fn is_stale(mapping: &SessionMapping, dispatch: &Dispatch) -> bool {
    mapping.attempt < dispatch.attempt
}

/// Register a run-key mapping ahead of starting the run.
pub async fn register_mapping(
    store: &StateStore,
    run_key: &str,
    dispatch_id: &str,
    phase: RunPhase,
    attempt: u32,
) -> Result<(), StoreError> {
    debug!(run_key, dispatch_id, ?phase, attempt, "Registering session mapping");
    store
        .register_session(
            run_key,
            SessionMapping {
                dispatch_id: dispatch_id.to_string(),
                phase,
                attempt,
            },
        )
        .await
}

/// Remove a single mapping once its run has been fully processed.
pub async fn remove_mapping(store: &StateStore, run_key: &str) -> Result<(), StoreError> {
    store.remove_session(run_key).await
}
