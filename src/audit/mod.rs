//! Append-only record of what the engine did and why.
//!
//! Every dispatch, completion, review transition and health fix emits one
//! [`AuditEvent`]. Sinks never fail the operation that emits to them.

pub mod logger;

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use logger::JsonlAuditLog;

/// Event kinds.
pub const DISPATCH: &str = "dispatch";
/// The queue-to-active label move of a dispatch, recorded as soon as it lands.
pub const LABEL_COMMIT: &str = "label_commit";
pub const DELIVERY_FAILED: &str = "delivery_failed";
pub const LEVEL_SELECTION: &str = "level_selection";
pub const COMPLETION: &str = "completion";
pub const REVIEW_TRANSITION: &str = "review_transition";
pub const HEALTH_FIX: &str = "health_fix";
pub const MIGRATION: &str = "migration";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub project: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

impl AuditEvent {
    pub fn new(kind: &str, project: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind: kind.to_string(),
            project: project.to_string(),
            issue_id: None,
            role: None,
            level: None,
            data: serde_json::Value::Null,
        }
    }

    pub fn issue(mut self, issue_id: u64) -> Self {
        self.issue_id = Some(issue_id);
        self
    }

    pub fn worker(mut self, role: &str, level: &str) -> Self {
        self.role = Some(role.to_string());
        self.level = Some(level.to_string());
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn matches(&self, project: &str, issue_id: u64, kind: &str) -> bool {
        self.kind == kind && self.project == project && self.issue_id == Some(issue_id)
    }
}

/// Destination for audit events. Implementations swallow their own errors.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);

    /// Newest recorded event of `kind` for one issue, if the sink keeps
    /// history.
    fn last_for_issue(&self, _project: &str, _issue_id: u64, _kind: &str) -> Option<AuditEvent> {
        None
    }
}

/// Keeps events in memory; used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryAudit {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAudit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn kinds(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.kind).collect()
    }
}

impl AuditSink for MemoryAudit {
    fn record(&self, event: AuditEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }

    fn last_for_issue(&self, project: &str, issue_id: u64, kind: &str) -> Option<AuditEvent> {
        self.events()
            .into_iter()
            .rev()
            .find(|e| e.matches(project, issue_id, kind))
    }
}
