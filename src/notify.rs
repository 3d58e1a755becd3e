//! Notification-sink collaborator contract.
//!
//! Fire-and-forget events at phase boundaries. The `notify` signature is
//! infallible on purpose: implementations own their transport errors and
//! swallow them, so a broken sink can never interrupt the state machine.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchEventKind {
    Working,
    Auditing,
    AuditPass,
    AuditFail,
    Escalation,
    WatchdogKill,
}

impl DispatchEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Working => "working",
            Self::Auditing => "auditing",
            Self::AuditPass => "audit_pass",
            Self::AuditFail => "audit_fail",
            Self::Escalation => "escalation",
            Self::WatchdogKill => "watchdog_kill",
        }
    }

    /// Events that require a human to look at the dispatch.
    pub fn is_escalation(&self) -> bool {
        matches!(self, Self::Escalation | Self::WatchdogKill)
    }
}

/// A phase-boundary notification for one dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchEvent {
    pub kind: DispatchEventKind,
    pub dispatch_id: String,
    pub identifier: String,
    pub title: String,
    pub attempt: u32,
    /// Gaps on `audit_fail`, reason on `escalation`/`watchdog_kill`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl DispatchEvent {
    pub fn new(
        kind: DispatchEventKind,
        dispatch_id: impl Into<String>,
        identifier: impl Into<String>,
        title: impl Into<String>,
        attempt: u32,
    ) -> Self {
        Self {
            kind,
            dispatch_id: dispatch_id.into(),
            identifier: identifier.into(),
            title: title.into(),
            attempt,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: DispatchEvent);
}
