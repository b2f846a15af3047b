//! The canonical pipeline used when `foreman.toml` has no `[workflow]` section.

use std::collections::BTreeMap;

use super::{Action, ReviewCheck, StateType, Transition, WorkflowConfig, WorkflowState};

fn state(
    kind: StateType,
    role: Option<&str>,
    label: &str,
    color: &str,
    priority: u32,
    on: &[(&str, Transition)],
) -> WorkflowState {
    WorkflowState {
        kind,
        role: role.map(str::to_string),
        label: label.to_string(),
        color: color.to_string(),
        priority,
        check: None,
        on: on
            .iter()
            .map(|(event, t)| (event.to_string(), t.clone()))
            .collect(),
    }
}

/// Raw states of the canonical workflow, before validation.
pub fn default_states() -> BTreeMap<String, WorkflowState> {
    use Action::*;
    use StateType::*;

    let mut states = BTreeMap::new();
    let mut add = |id: &str, s: WorkflowState| {
        states.insert(id.to_string(), s);
    };

    add(
        "planning",
        state(Hold, None, "Planning", "#95a5a6", 0, &[("APPROVE", Transition::to("todo"))]),
    );
    add(
        "todo",
        state(
            Queue,
            Some("developer"),
            "To Do",
            "#428bca",
            1,
            &[("PICKUP", Transition::to("doing"))],
        ),
    );
    add(
        "doing",
        state(
            Active,
            Some("developer"),
            "Doing",
            "#f0ad4e",
            0,
            &[
                ("COMPLETE", Transition::with_actions("toTest", &[DetectPr])),
                ("REVIEW", Transition::with_actions("toReview", &[DetectPr])),
                ("BLOCKED", Transition::to("refining")),
            ],
        ),
    );

    let mut to_review = state(
        Review,
        Some("reviewer"),
        "To Review",
        "#7057ff",
        2,
        &[
            ("PICKUP", Transition::to("reviewing")),
            ("APPROVED", Transition::with_actions("toTest", &[MergePr, GitPull])),
            ("MERGED", Transition::with_actions("toTest", &[GitPull])),
            ("MERGE_FAILED", Transition::to("toImprove")),
            ("CHANGES_REQUESTED", Transition::to("toImprove")),
            ("BLOCKED", Transition::to("refining")),
        ],
    );
    to_review.check = Some(ReviewCheck::PrApproved);
    add("toReview", to_review);

    add(
        "reviewing",
        state(
            Active,
            Some("reviewer"),
            "Reviewing",
            "#c5def5",
            0,
            &[
                ("APPROVE", Transition::with_actions("toTest", &[MergePr, GitPull])),
                ("MERGE_FAILED", Transition::to("toImprove")),
                ("REJECT", Transition::to("toImprove")),
                ("BLOCKED", Transition::to("refining")),
            ],
        ),
    );
    add(
        "toTest",
        state(
            Queue,
            Some("tester"),
            "To Test",
            "#5bc0de",
            2,
            &[("PICKUP", Transition::to("testing"))],
        ),
    );
    add(
        "testing",
        state(
            Active,
            Some("tester"),
            "Testing",
            "#9b59b6",
            0,
            &[
                ("PASS", Transition::with_actions("done", &[CloseIssue])),
                ("FAIL", Transition::with_actions("toImprove", &[ReopenIssue])),
                ("REFINE", Transition::to("refining")),
                ("BLOCKED", Transition::to("refining")),
            ],
        ),
    );
    add(
        "toImprove",
        state(
            Queue,
            Some("developer"),
            "To Improve",
            "#d9534f",
            3,
            &[("PICKUP", Transition::to("doing"))],
        ),
    );
    add(
        "refining",
        state(Hold, None, "Refining", "#d4c5f9", 0, &[("APPROVE", Transition::to("todo"))]),
    );
    add("done", state(Terminal, None, "Done", "#5cb85c", 0, &[]));
    add(
        "toDesign",
        state(
            Queue,
            Some("architect"),
            "To Design",
            "#0075ca",
            1,
            &[("PICKUP", Transition::to("designing"))],
        ),
    );
    add(
        "designing",
        state(
            Active,
            Some("architect"),
            "Designing",
            "#d93f0b",
            0,
            &[
                ("COMPLETE", Transition::to("planning")),
                ("BLOCKED", Transition::to("refining")),
            ],
        ),
    );

    states
}

/// The canonical workflow. The table above is checked by
/// `test_default_workflow_is_valid` rather than at every construction.
pub fn default_workflow() -> WorkflowConfig {
    WorkflowConfig::new_unchecked("planning", default_states())
}
