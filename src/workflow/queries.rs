//! Read-only queries over a validated [`WorkflowConfig`].

use std::cmp::Reverse;
use std::collections::BTreeSet;

use super::{
    Action, EVENT_MERGE_FAILED, StateType, Transition, WorkflowConfig, WorkflowState,
    event_to_result, result_to_event,
};

/// Ranking weight of a queue candidate, larger first. Compared
/// lexicographically, so priority dominates for any id and no scale factor
/// can overflow.
pub type PriorityWeight = (u32, Reverse<u64>);

/// Higher priority always wins; within equal priority the numerically
/// smallest (oldest) issue id wins.
pub fn priority_weight(priority: u32, issue_id: u64) -> PriorityWeight {
    (priority, Reverse(issue_id))
}

/// The resolved transition for a (role, result) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRule {
    pub event: String,
    pub from_state: String,
    pub from_label: String,
    pub to_state: String,
    pub to_label: String,
    pub actions: Vec<Action>,
}

impl WorkflowConfig {
    /// Look up a state by its display label.
    pub fn state_by_label(&self, label: &str) -> Option<(&str, &WorkflowState)> {
        self.states()
            .iter()
            .find(|(_, s)| s.label == label)
            .map(|(id, s)| (id.as_str(), s))
    }

    /// The first workflow state whose label appears in `labels`.
    pub fn state_for_labels<'a>(
        &'a self,
        labels: &[String],
    ) -> Option<(&'a str, &'a WorkflowState)> {
        labels.iter().find_map(|l| self.state_by_label(l))
    }

    /// The single active state for a role.
    pub fn active_state(&self, role: &str) -> Option<(&str, &WorkflowState)> {
        self.states()
            .iter()
            .find(|(_, s)| s.kind == StateType::Active && s.role.as_deref() == Some(role))
            .map(|(id, s)| (id.as_str(), s))
    }

    pub fn active_label(&self, role: &str) -> Option<&str> {
        self.active_state(role).map(|(_, s)| s.label.as_str())
    }

    fn states_of(&self, role: &str, kinds: &[StateType]) -> Vec<&WorkflowState> {
        let mut states: Vec<&WorkflowState> = self
            .states()
            .values()
            .filter(|s| kinds.contains(&s.kind) && s.role.as_deref() == Some(role))
            .collect();
        // Stable sort keeps BTreeMap (state id) order among equal priorities.
        states.sort_by(|a, b| b.priority.cmp(&a.priority));
        states
    }

    /// Queue labels for a role, highest priority first.
    pub fn queue_labels(&self, role: &str) -> Vec<&str> {
        self.states_of(role, &[StateType::Queue])
            .into_iter()
            .map(|s| s.label.as_str())
            .collect()
    }

    /// Every label a worker of `role` may pick an issue up from: its queues
    /// plus any review state bound to the role. Highest priority first.
    pub fn pickup_labels(&self, role: &str) -> Vec<&str> {
        self.states_of(role, &[StateType::Queue, StateType::Review])
            .into_iter()
            .map(|s| s.label.as_str())
            .collect()
    }

    /// Priority of the queue (or review) state carrying `label`.
    pub fn queue_priority(&self, label: &str) -> Option<u32> {
        self.state_by_label(label)
            .filter(|(_, s)| matches!(s.kind, StateType::Queue | StateType::Review))
            .map(|(_, s)| s.priority)
    }

    /// All states of kind `review`.
    pub fn review_states(&self) -> Vec<(&str, &WorkflowState)> {
        self.states()
            .iter()
            .filter(|(_, s)| s.kind == StateType::Review)
            .map(|(id, s)| (id.as_str(), s))
            .collect()
    }

    /// Roles referenced by any state.
    pub fn roles(&self) -> BTreeSet<&str> {
        self.states()
            .values()
            .filter_map(|s| s.role.as_deref())
            .collect()
    }

    /// Every label the workflow puts on issues.
    pub fn labels(&self) -> Vec<(&str, &str)> {
        self.states()
            .values()
            .map(|s| (s.label.as_str(), s.color.as_str()))
            .collect()
    }

    pub fn transition(&self, state_id: &str, event: &str) -> Option<&Transition> {
        self.state(state_id).and_then(|s| s.on.get(event))
    }

    /// Where an issue goes when a merge in a transition out of `state_id` fails.
    pub fn merge_failed_target(&self, state_id: &str) -> Option<(&str, &WorkflowState)> {
        let transition = self.transition(state_id, EVENT_MERGE_FAILED)?;
        self.state(&transition.target)
            .map(|s| (transition.target.as_str(), s))
    }

    /// Resolve what happens when a worker of `role` reports `result`.
    ///
    /// Returns `None` for any pair the workflow does not define; callers must
    /// reject the request before mutating anything. `MERGE_FAILED` is taken by
    /// the engine itself and never resolves from a reported result.
    pub fn completion_rule(&self, role: &str, result: &str) -> Option<CompletionRule> {
        let (from_id, from) = self.active_state(role)?;
        let event = result_to_event(result);
        if event == EVENT_MERGE_FAILED {
            return None;
        }
        let transition = from.on.get(&event)?;
        let to = self.state(&transition.target)?;
        Some(CompletionRule {
            event,
            from_state: from_id.to_string(),
            from_label: from.label.clone(),
            to_state: transition.target.clone(),
            to_label: to.label.clone(),
            actions: transition.actions.clone(),
        })
    }

    /// Results a worker of `role` may report, derived from its active state's
    /// transitions. `MERGE_FAILED` is internal and never offered.
    pub fn valid_results(&self, role: &str) -> Vec<String> {
        let Some((_, active)) = self.active_state(role) else {
            return Vec::new();
        };
        let mut results: Vec<String> = active
            .on
            .keys()
            .filter(|event| event.as_str() != EVENT_MERGE_FAILED)
            .map(|event| event_to_result(event))
            .collect();
        // "done" first reads better in the completion contract.
        results.sort_by_key(|r| (r != "done", r.clone()));
        results
    }
}
