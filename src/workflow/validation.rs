//! Load-time invariants of the statechart.
//!
//! Every problem is collected rather than stopping at the first, so a broken
//! `foreman.toml` is fixed in one pass.

use std::collections::{BTreeMap, BTreeSet};

use super::{Action, EVENT_MERGE_FAILED, EVENT_PICKUP, StateType, WorkflowConfig};
use crate::errors::ConfigError;

impl WorkflowConfig {
    /// Check the statechart invariants.
    ///
    /// - the initial state exists
    /// - labels are unique
    /// - every transition target exists
    /// - terminal states have no transitions
    /// - queue and active states declare a role
    /// - review states declare a check
    /// - exactly one active state per role
    /// - a transition that merges has a sibling `MERGE_FAILED` route
    /// - a `PICKUP` out of a role's queue lands on that role's active state
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();
        let states = self.states();

        if !states.contains_key(self.initial()) {
            problems.push(format!("initial state '{}' does not exist", self.initial()));
        }

        let mut seen_labels: BTreeMap<&str, &str> = BTreeMap::new();
        for (id, state) in states {
            if state.label.trim().is_empty() {
                problems.push(format!("state '{}' has an empty label", id));
            }
            if let Some(other) = seen_labels.insert(state.label.as_str(), id.as_str()) {
                problems.push(format!(
                    "label '{}' is used by both '{}' and '{}'",
                    state.label, other, id
                ));
            }
        }

        let mut active_per_role: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        let mut roles: BTreeSet<&str> = BTreeSet::new();

        for (id, state) in states {
            for (event, transition) in &state.on {
                if !states.contains_key(&transition.target) {
                    problems.push(format!(
                        "transition {}.{} targets unknown state '{}'",
                        id, event, transition.target
                    ));
                }
            }

            match state.kind {
                StateType::Terminal if !state.on.is_empty() => {
                    problems.push(format!("terminal state '{}' has transitions", id));
                }
                StateType::Queue | StateType::Active if state.role.is_none() => {
                    problems.push(format!("{} state '{}' has no role", state.kind, id));
                }
                StateType::Review if state.check.is_none() => {
                    problems.push(format!("review state '{}' has no check", id));
                }
                _ => {}
            }

            if let Some(role) = state.role.as_deref() {
                roles.insert(role);
                if state.kind == StateType::Active {
                    active_per_role.entry(role).or_default().push(id.as_str());
                }
            }

            let merges = state
                .on
                .iter()
                .any(|(event, t)| event != EVENT_MERGE_FAILED && t.actions.contains(&Action::MergePr));
            if merges && !state.on.contains_key(EVENT_MERGE_FAILED) {
                problems.push(format!(
                    "state '{}' merges but has no {} transition",
                    id, EVENT_MERGE_FAILED
                ));
            }
        }

        for role in &roles {
            match active_per_role.get(role).map(Vec::as_slice) {
                None | Some([]) => {
                    problems.push(format!("role '{}' has no active state", role));
                }
                Some([_]) => {}
                Some(many) => problems.push(format!(
                    "role '{}' has {} active states: {}",
                    role,
                    many.len(),
                    many.join(", ")
                )),
            }
        }

        for (id, state) in states {
            let (Some(role), Some(pickup)) = (state.role.as_deref(), state.on.get(EVENT_PICKUP))
            else {
                continue;
            };
            let lands_on_active = states
                .get(&pickup.target)
                .is_some_and(|t| t.kind == StateType::Active && t.role.as_deref() == Some(role));
            if !lands_on_active {
                problems.push(format!(
                    "{}.{} must target the active state of role '{}'",
                    id, EVENT_PICKUP, role
                ));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::InvalidWorkflow(problems))
        }
    }
}
