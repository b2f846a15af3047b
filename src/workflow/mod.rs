//! Workflow statechart: the immutable description of the pipeline.
//!
//! A workflow is a set of states, each carrying a display label that is
//! mirrored onto issues in the external tracker. States of kind `queue` and
//! `active` belong to a role; transitions are keyed by event name and carry an
//! ordered list of side-effecting [`Action`]s.
//!
//! ```text
//! Planning ─APPROVE─> To Do ─PICKUP─> Doing ─COMPLETE─> To Test ─PICKUP─> Testing ─PASS─> Done
//!                       ^               │                  ^                 │
//!                       │               └─REVIEW─> To Review ─APPROVED──┘    │
//!                       │                              │ (MERGE_FAILED,     │
//!                       │                              v  CHANGES_REQUESTED)│
//!                       └──────── Refining <──── To Improve <───FAIL────────┘
//! ```
//!
//! The config is loaded once and passed around by reference (`Arc`);
//! nothing mutates it after [`WorkflowConfig::new`] has validated it.

pub mod defaults;
pub mod queries;
pub mod validation;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

pub use queries::{CompletionRule, PriorityWeight, priority_weight};

/// Generic event a worker's "done" maps to.
pub const EVENT_COMPLETE: &str = "COMPLETE";
/// Event taken when a worker picks an issue up from a queue.
pub const EVENT_PICKUP: &str = "PICKUP";
/// Review poller: pull request approved.
pub const EVENT_APPROVED: &str = "APPROVED";
/// Review poller: pull request merged outside of the engine.
pub const EVENT_MERGED: &str = "MERGED";
/// Review poller: reviewers asked for changes, or the PR was closed unmerged.
pub const EVENT_CHANGES_REQUESTED: &str = "CHANGES_REQUESTED";
/// Taken instead of the original transition when a merge action fails.
pub const EVENT_MERGE_FAILED: &str = "MERGE_FAILED";

/// Kind of a workflow state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateType {
    /// Waiting for a worker of `role` to pick it up.
    Queue,
    /// A worker of `role` is on it.
    Active,
    /// Waiting for a human.
    Hold,
    /// Finished; no outgoing transitions.
    Terminal,
    /// Waiting for an external review verdict.
    Review,
}

impl std::fmt::Display for StateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StateType::Queue => "queue",
            StateType::Active => "active",
            StateType::Hold => "hold",
            StateType::Terminal => "terminal",
            StateType::Review => "review",
        };
        write!(f, "{}", s)
    }
}

/// Side effect executed as part of a transition, in declared order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Sync the project's local clone with the base branch.
    GitPull,
    /// Look up the pull request linked to the issue.
    DetectPr,
    /// Merge the linked pull request (best-effort; failure reroutes).
    MergePr,
    CloseIssue,
    ReopenIssue,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Action::GitPull => "git_pull",
            Action::DetectPr => "detect_pr",
            Action::MergePr => "merge_pr",
            Action::CloseIssue => "close_issue",
            Action::ReopenIssue => "reopen_issue",
        };
        write!(f, "{}", s)
    }
}

/// What a review state waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewCheck {
    PrApproved,
    PrMerged,
}

/// Target state plus the actions run on the way there.
///
/// In TOML a transition is either a bare target id (`PICKUP = "doing"`) or a
/// table (`PASS = { target = "done", actions = ["close_issue"] }`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "TransitionSpec")]
pub struct Transition {
    pub target: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Action>,
}

impl Transition {
    pub fn to(target: &str) -> Self {
        Self {
            target: target.to_string(),
            actions: Vec::new(),
        }
    }

    pub fn with_actions(target: &str, actions: &[Action]) -> Self {
        Self {
            target: target.to_string(),
            actions: actions.to_vec(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TransitionSpec {
    Target(String),
    Full {
        target: String,
        #[serde(default)]
        actions: Vec<Action>,
    },
}

impl From<TransitionSpec> for Transition {
    fn from(spec: TransitionSpec) -> Self {
        match spec {
            TransitionSpec::Target(target) => Self {
                target,
                actions: Vec::new(),
            },
            TransitionSpec::Full { target, actions } => Self { target, actions },
        }
    }
}

fn default_color() -> String {
    "#cccccc".to_string()
}

/// A single state of the statechart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    #[serde(rename = "type")]
    pub kind: StateType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub label: String,
    #[serde(default = "default_color")]
    pub color: String,
    /// Queue ordering; higher is picked first.
    #[serde(default)]
    pub priority: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<ReviewCheck>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub on: BTreeMap<String, Transition>,
}

/// Deserialization shape; converted through validation into [`WorkflowConfig`].
#[derive(Debug, Clone, Deserialize)]
struct RawWorkflow {
    initial: String,
    states: BTreeMap<String, WorkflowState>,
}

/// Validated, immutable statechart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawWorkflow")]
pub struct WorkflowConfig {
    initial: String,
    states: BTreeMap<String, WorkflowState>,
}

impl TryFrom<RawWorkflow> for WorkflowConfig {
    type Error = ConfigError;

    fn try_from(raw: RawWorkflow) -> Result<Self, Self::Error> {
        Self::new(raw.initial, raw.states)
    }
}

impl WorkflowConfig {
    /// Build and validate a workflow. An invalid statechart never exists as a value.
    pub fn new(
        initial: impl Into<String>,
        states: BTreeMap<String, WorkflowState>,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            initial: initial.into(),
            states,
        };
        config.validate()?;
        Ok(config)
    }

    /// For built-in tables whose validity is covered by tests.
    pub(crate) fn new_unchecked(
        initial: impl Into<String>,
        states: BTreeMap<String, WorkflowState>,
    ) -> Self {
        Self {
            initial: initial.into(),
            states,
        }
    }

    pub fn initial(&self) -> &str {
        &self.initial
    }

    pub fn states(&self) -> &BTreeMap<String, WorkflowState> {
        &self.states
    }

    pub fn state(&self, id: &str) -> Option<&WorkflowState> {
        self.states.get(id)
    }
}

/// Map a worker-reported result to its event name.
///
/// `done` is the one special case (`COMPLETE`); every other result is its
/// own uppercase event (`pass` → `PASS`).
pub fn result_to_event(result: &str) -> String {
    let result = result.trim();
    if result.eq_ignore_ascii_case("done") {
        EVENT_COMPLETE.to_string()
    } else {
        result.to_uppercase()
    }
}

/// Inverse of [`result_to_event`], used to list valid results for a role.
pub fn event_to_result(event: &str) -> String {
    if event == EVENT_COMPLETE {
        "done".to_string()
    } else {
        event.to_lowercase()
    }
}
