//! Run-executor collaborator contract.
//!
//! The orchestrator is agnostic to how a run actually executes (subprocess,
//! remote call, in-process invocation); it only needs this synchronous
//! request/outcome contract. Cancellation and timeouts live entirely on the
//! executor side — the inactivity watchdog and hard ceiling are its job, and
//! the orchestrator just reacts to `watchdog_killed` in the outcome.

use crate::state::types::RunPhase;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A single worker or audit run to execute.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub role: RunPhase,
    pub prompt: String,
    pub timeout: Duration,
    /// Execution profile selector, passed through from the dispatch.
    pub profile: String,
}

/// One turn of a structured transcript, for executors that return the full
/// conversation rather than a flat result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnMessage {
    pub role: TurnRole,
    pub text: String,
}

/// What came back from a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub success: bool,
    /// Flat output text; may be empty when only `messages` is populated.
    #[serde(default)]
    pub output: String,
    /// Turn-structured transcript, newest last; may be empty.
    #[serde(default)]
    pub messages: Vec<TurnMessage>,
    /// True when the executor's inactivity watchdog killed the run.
    #[serde(default)]
    pub watchdog_killed: bool,
}

impl RunOutcome {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            messages: Vec::new(),
            watchdog_killed: false,
        }
    }

    pub fn failure(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            messages: Vec::new(),
            watchdog_killed: false,
        }
    }

    pub fn watchdog_killed() -> Self {
        Self {
            success: false,
            output: String::new(),
            messages: Vec::new(),
            watchdog_killed: true,
        }
    }
}

/// Executes worker and audit runs on behalf of the orchestrator.
#[async_trait]
pub trait RunExecutor: Send + Sync {
    async fn execute(&self, request: RunRequest) -> anyhow::Result<RunOutcome>;
}
