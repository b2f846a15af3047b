//! Durable worker state: which slot is running what.
//!
//! One JSON document per workspace holds every project and, per project, a
//! slot array for each (role, level):
//!
//! ```json
//! { "projects": { "demo": { "slug": "demo", "repo": "...", "baseBranch": "main",
//!     "workers": { "developer": { "levels": { "medior": [
//!         { "active": true, "issueId": "42", "sessionKey": "agent:main:subagent:demo-developer-medior",
//!           "startTime": "2026-01-01T10:00:00Z", "previousLabel": "To Do", "taskCount": 3 } ] } } } } } }
//! ```
//!
//! Older shapes are migrated on read (see [`migration`]); callers only ever
//! see the current one. All mutation goes through [`store::WorkerStateStore`],
//! which serializes writers with a lock file.

pub mod lock;
pub mod migration;
pub mod slots;
pub mod store;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub use lock::LockOptions;
pub use slots::{RoleUpdate, SlotPatch, SlotRef};
pub use store::{Activation, StoreHandle, WorkerStateStore};

/// One unit of capacity for a (role, level) pair.
///
/// `session_key` survives deactivation: a slot remembers its worker session
/// across tasks so the next dispatch can reuse the context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slot {
    #[serde(default)]
    pub active: bool,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub issue_id: Option<String>,
    #[serde(default)]
    pub session_key: Option<String>,
    #[serde(default, deserialize_with = "de_opt_time")]
    pub start_time: Option<DateTime<Utc>>,
    /// Queue label the issue had right before this slot took it.
    #[serde(default)]
    pub previous_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_count: Option<u32>,
}

impl Slot {
    pub fn holds(&self, issue_id: &str) -> bool {
        self.active && self.issue_id.as_deref() == Some(issue_id)
    }
}

/// Slot arrays for one role, keyed by level.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleWorkerState {
    #[serde(default)]
    pub levels: BTreeMap<String, Vec<Slot>>,
}

fn default_base_branch() -> String {
    "main".to_string()
}

/// A registered project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub slug: String,
    #[serde(default)]
    pub name: String,
    /// Local clone of the repository.
    pub repo: String,
    /// Tracker-side repository, e.g. `owner/name` on GitHub.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    /// Notification channel ids; delivery is handled elsewhere.
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub workers: BTreeMap<String, RoleWorkerState>,
}

impl Project {
    pub fn new(slug: &str, repo: &str, base_branch: &str) -> Self {
        Self {
            slug: slug.to_string(),
            name: slug.to_string(),
            repo: repo.to_string(),
            remote: None,
            base_branch: base_branch.to_string(),
            channels: Vec::new(),
            workers: BTreeMap::new(),
        }
    }

    pub fn role(&self, role: &str) -> Option<&RoleWorkerState> {
        self.workers.get(role)
    }

    /// Find the slot holding `issue_id` anywhere in the project.
    pub fn find_issue(&self, issue_id: &str) -> Option<SlotRef> {
        self.workers.iter().find_map(|(role, state)| {
            state
                .find_slot_by_issue(issue_id)
                .map(|(level, index)| SlotRef {
                    role: role.clone(),
                    level,
                    index,
                })
        })
    }

    /// Every active slot across all roles.
    pub fn active_slots(&self) -> Vec<(SlotRef, &Slot)> {
        self.workers
            .iter()
            .flat_map(|(role, state)| {
                state.levels.iter().flat_map(move |(level, slots)| {
                    slots
                        .iter()
                        .enumerate()
                        .filter(|(_, s)| s.active)
                        .map(move |(index, slot)| {
                            (
                                SlotRef {
                                    role: role.clone(),
                                    level: level.clone(),
                                    index,
                                },
                                slot,
                            )
                        })
                })
            })
            .collect()
    }

    /// Roles with at least one active slot.
    pub fn busy_roles(&self) -> Vec<&str> {
        self.workers
            .iter()
            .filter(|(_, s)| s.levels.values().flatten().any(|slot| slot.active))
            .map(|(role, _)| role.as_str())
            .collect()
    }
}

/// The whole persisted document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectsData {
    #[serde(default)]
    pub projects: BTreeMap<String, Project>,
}

impl ProjectsData {
    pub fn project(&self, slug: &str) -> Option<&Project> {
        self.projects.get(slug)
    }
}

/// Issue ids were numbers in some historical documents; keep them as the
/// exact decimal string either way.
pub(crate) fn de_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Accept RFC 3339 strings or epoch milliseconds; anything else reads as unset.
pub(crate) fn de_opt_time<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Some(serde_json::Value::Number(n)) => n
            .as_i64()
            .and_then(DateTime::<Utc>::from_timestamp_millis),
        _ => None,
    })
}
