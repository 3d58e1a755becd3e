//! Persisted data model for the dispatch state file.
//!
//! Everything in this module lives inside one [`Snapshot`] that is read,
//! mutated in memory, and written back as a single unit. On-disk field names
//! are camelCase; older snapshots missing `sessionMap`, `processedEvents` or
//! per-dispatch `attempt` fields are migrated at read time via serde defaults.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How many processed-event keys the idempotency ledger retains.
pub const PROCESSED_EVENT_CAP: usize = 200;

/// Lifecycle state of a dispatch.
///
/// `Done`, `Failed` and `Stuck` are terminal. The retired on-disk name
/// `reviewing` maps to `Auditing` when an old snapshot is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchStatus {
    Dispatched,
    Working,
    #[serde(alias = "reviewing")]
    Auditing,
    Done,
    Failed,
    Stuck,
}

impl DispatchStatus {
    /// Whether no further transition can leave this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Stuck)
    }
}

impl std::fmt::Display for DispatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Dispatched => "dispatched",
            Self::Working => "working",
            Self::Auditing => "auditing",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Stuck => "stuck",
        };
        write!(f, "{}", s)
    }
}

/// Which half of the pipeline a run belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    Worker,
    Audit,
}

/// The tracked unit of work for one issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dispatch {
    /// Opaque issue id from the tracker; also the key in the active map.
    pub id: String,
    /// Human-readable issue identifier (e.g. `ENG-42`).
    pub identifier: String,
    pub title: String,
    pub workspace: String,
    pub branch: String,
    /// Complexity tier assigned by the trigger (e.g. `simple`, `standard`).
    pub tier: String,
    /// Execution profile the run executor should use.
    pub profile: String,
    pub status: DispatchStatus,
    pub created_at: DateTime<Utc>,
    /// Zero-based worker/audit cycle counter; increments only on rework.
    #[serde(default)]
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_run_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_run_key: Option<String>,
    /// Present iff `status == Stuck`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stuck_reason: Option<String>,
    /// Group reference for multi-dispatch projects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
}

impl Dispatch {
    /// Create a fresh dispatch in the `Dispatched` state.
    pub fn new(
        id: impl Into<String>,
        identifier: impl Into<String>,
        title: impl Into<String>,
        workspace: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            identifier: identifier.into(),
            title: title.into(),
            workspace: workspace.into(),
            branch: branch.into(),
            tier: "standard".to_string(),
            profile: "default".to_string(),
            status: DispatchStatus::Dispatched,
            created_at: Utc::now(),
            attempt: 0,
            worker_run_key: None,
            audit_run_key: None,
            stuck_reason: None,
            project: None,
        }
    }

    /// Run key for this dispatch's current worker attempt.
    pub fn worker_key(&self) -> String {
        format!("worker-{}-{}", self.identifier, self.attempt)
    }

    /// Run key for this dispatch's current audit attempt.
    pub fn audit_key(&self) -> String {
        format!("audit-{}-{}", self.identifier, self.attempt)
    }
}

/// Historical record of a dispatch that left the active set.
///
/// Drops the in-flight fields (phase, run keys) and records when it finished
/// and how many worker/audit cycles it took.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedDispatch {
    pub id: String,
    pub identifier: String,
    pub title: String,
    pub workspace: String,
    pub branch: String,
    pub status: DispatchStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub total_attempts: u32,
}

impl CompletedDispatch {
    /// Build the completion record for a finished dispatch.
    pub fn from_dispatch(d: &Dispatch, status: DispatchStatus) -> Self {
        Self {
            id: d.id.clone(),
            identifier: d.identifier.clone(),
            title: d.title.clone(),
            workspace: d.workspace.clone(),
            branch: d.branch.clone(),
            status,
            created_at: d.created_at,
            completed_at: Utc::now(),
            total_attempts: d.attempt + 1,
        }
    }
}

/// Ties an ephemeral run key back to the dispatch/phase/attempt that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMapping {
    pub dispatch_id: String,
    pub phase: RunPhase,
    pub attempt: u32,
}

/// Active and completed dispatches, split so completion can drop in-flight
/// fields without losing history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchSets {
    #[serde(default)]
    pub active: HashMap<String, Dispatch>,
    #[serde(default)]
    pub completed: HashMap<String, CompletedDispatch>,
}

/// The entire persisted state, read and written as one unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(default)]
    pub dispatches: DispatchSets,
    #[serde(default)]
    pub session_map: HashMap<String, SessionMapping>,
    /// Bounded append-only ledger of processed event keys, newest last.
    #[serde(default)]
    pub processed_events: Vec<String>,
}

impl Snapshot {
    /// Record an event key if unseen; returns true on first sighting.
    ///
    /// Trims the ledger to [`PROCESSED_EVENT_CAP`] entries, oldest first.
    pub fn mark_event(&mut self, key: &str) -> bool {
        if self.processed_events.iter().any(|k| k == key) {
            return false;
        }
        self.processed_events.push(key.to_string());
        if self.processed_events.len() > PROCESSED_EVENT_CAP {
            let excess = self.processed_events.len() - PROCESSED_EVENT_CAP;
            self.processed_events.drain(..excess);
        }
        true
    }
}
