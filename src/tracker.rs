//! Issue-tracker collaborator contract.
//!
//! Fetches fresh issue context ahead of each run and posts human-visible
//! comments at pipeline milestones. Failures are non-fatal at every call
//! site: a missed fetch falls back to the stored dispatch fields, and a
//! failed comment is logged without rolling back an already-committed
//! transition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What the tracker knows about an issue right now.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueContext {
    pub id: String,
    /// Human identifier (e.g. `ENG-42`).
    pub identifier: String,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
}

impl IssueContext {
    /// Minimal context assembled from stored dispatch fields, used when the
    /// tracker is unreachable.
    pub fn fallback(id: &str, identifier: &str, title: &str) -> Self {
        Self {
            id: id.to_string(),
            identifier: identifier.to_string(),
            title: title.to_string(),
            body: String::new(),
            acceptance_criteria: Vec::new(),
        }
    }
}

#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn fetch_issue(&self, id: &str) -> anyhow::Result<IssueContext>;
    async fn post_comment(&self, id: &str, body: &str) -> anyhow::Result<()>;
}
