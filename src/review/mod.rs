//! ReviewPoller: advance issues waiting in review states from PR status.
//!
//! Agent-routed issues in a state that a role picks up are left to the
//! reviewer worker; everything else (human-routed or unrouted) is decided
//! here by the linked pull request.
//!
//! | PR state | event |
//! |---|---|
//! | merged | `MERGED` |
//! | approved | `APPROVED`, when the state checks for approval |
//! | changes requested, closed | `CHANGES_REQUESTED` |
//! | open, none | pending, no-op |

use serde_json::json;
use tracing::{debug, info, warn};

use crate::actions::{ActionContext, run_actions};
use crate::audit::{AuditEvent, REVIEW_TRANSITION};
use crate::errors::CompletionError;
use crate::providers::{Issue, IssueState, IssueTracker, PrState, PrStatus};
use crate::roles::REVIEW_AGENT_LABEL;
use crate::services::Services;
use crate::state::Project;
use crate::workflow::{
    EVENT_APPROVED, EVENT_CHANGES_REQUESTED, EVENT_MERGED, ReviewCheck, WorkflowState,
};

/// Event a PR status raises for a review state, or `None` while pending.
pub fn review_event(check: Option<ReviewCheck>, pr: Option<&PrStatus>) -> Option<&'static str> {
    match pr?.state {
        PrState::Merged => Some(EVENT_MERGED),
        PrState::Approved if check == Some(ReviewCheck::PrApproved) => Some(EVENT_APPROVED),
        PrState::Approved | PrState::Open => None,
        PrState::ChangesRequested | PrState::Closed => Some(EVENT_CHANGES_REQUESTED),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewMove {
    pub issue_id: u64,
    pub event: String,
    pub from_label: String,
    pub to_label: String,
    pub merged: bool,
    pub merge_failed: bool,
}

#[derive(Debug, Default)]
pub struct ReviewReport {
    pub moves: Vec<ReviewMove>,
    pub warnings: Vec<String>,
}

impl ReviewReport {
    /// Number of issues that changed state this pass.
    pub fn transitions(&self) -> usize {
        self.moves.len()
    }

    fn warn(&mut self, message: String) {
        warn!("{}", message);
        self.warnings.push(message);
    }
}

pub struct ReviewPoller {
    services: Services,
}

impl ReviewPoller {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    pub async fn poll(&self, slug: &str) -> Result<ReviewReport, CompletionError> {
        let project = self.services.store.project(slug).await?;
        let tracker = self.services.tracker(&project)?;
        let mut report = ReviewReport::default();

        for (state_id, state) in self.services.workflow.review_states() {
            let issues = match tracker.list_issues_by_label(&state.label).await {
                Ok(issues) => issues,
                Err(e) => {
                    report.warn(format!("listing '{}' in {} failed: {}", state.label, slug, e));
                    continue;
                }
            };
            for issue in issues {
                if issue.state != IssueState::Open {
                    continue;
                }
                if state.role.is_some() && issue.has_label(REVIEW_AGENT_LABEL) {
                    continue;
                }
                self.poll_issue(&project, tracker.as_ref(), state_id, state, &issue, &mut report)
                    .await;
            }
        }

        if !report.moves.is_empty() {
            info!(project = slug, transitions = report.transitions(), "review poll moved issues");
        }
        Ok(report)
    }

    async fn poll_issue(
        &self,
        project: &Project,
        tracker: &dyn IssueTracker,
        state_id: &str,
        state: &WorkflowState,
        issue: &Issue,
        report: &mut ReviewReport,
    ) {
        let workflow = &self.services.workflow;
        let pr = match tracker.get_review_status(issue.id).await {
            Ok(pr) => pr,
            Err(e) => {
                report.warn(format!("review status of #{} unavailable: {}", issue.id, e));
                return;
            }
        };
        let Some(event) = review_event(state.check, pr.as_ref()) else {
            debug!(project = %project.slug, issue = issue.id, "review pending");
            return;
        };
        let Some(transition) = workflow.transition(state_id, event) else {
            debug!(project = %project.slug, issue = issue.id, event, "no transition for review event");
            return;
        };

        let ctx = ActionContext {
            tracker,
            git: self.services.git.as_ref(),
            project,
            issue_id: issue.id,
        };
        let actions = run_actions(&ctx, &transition.actions).await;
        report.warnings.extend(actions.warnings.iter().cloned());

        let target = if actions.merge_failed {
            workflow
                .merge_failed_target(state_id)
                .map(|(_, s)| s)
                .or_else(|| workflow.state(&transition.target))
        } else {
            workflow.state(&transition.target)
        };
        let Some(target) = target else {
            report.warn(format!("review target for #{} does not exist", issue.id));
            return;
        };

        if let Err(e) = tracker
            .transition_label(issue.id, &state.label, &target.label)
            .await
        {
            report.warn(format!(
                "moving #{} from '{}' to '{}' failed: {}",
                issue.id, state.label, target.label, e
            ));
            return;
        }
        info!(
            project = %project.slug,
            issue = issue.id,
            event,
            from = %state.label,
            to = %target.label,
            "review transition"
        );

        self.services.audit.record(
            AuditEvent::new(REVIEW_TRANSITION, &project.slug)
                .issue(issue.id)
                .data(json!({
                    "event": event,
                    "from": state.label,
                    "to": target.label,
                    "pr": pr,
                    "merged": actions.merged,
                    "mergeFailed": actions.merge_failed,
                })),
        );
        report.moves.push(ReviewMove {
            issue_id: issue.id,
            event: event.to_string(),
            from_label: state.label.clone(),
            to_label: target.label.clone(),
            merged: actions.merged,
            merge_failed: actions.merge_failed,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::harness;

    fn pr(state: PrState) -> PrStatus {
        PrStatus {
            number: 7,
            state,
            url: String::new(),
        }
    }

    #[test]
    fn test_review_event_mapping() {
        let approved = Some(ReviewCheck::PrApproved);
        assert_eq!(review_event(approved, None), None);
        assert_eq!(review_event(approved, Some(&pr(PrState::Open))), None);
        assert_eq!(
            review_event(approved, Some(&pr(PrState::Approved))),
            Some(EVENT_APPROVED)
        );
        assert_eq!(
            review_event(Some(ReviewCheck::PrMerged), Some(&pr(PrState::Approved))),
            None
        );
        assert_eq!(
            review_event(approved, Some(&pr(PrState::Merged))),
            Some(EVENT_MERGED)
        );
        assert_eq!(
            review_event(approved, Some(&pr(PrState::Closed))),
            Some(EVENT_CHANGES_REQUESTED)
        );
    }

    #[tokio::test]
    async fn test_approved_pr_is_merged_and_moved_to_test() {
        let h = harness();
        h.tracker.add_issue(42, "Fix login", &["To Review", "review:human"]);
        h.tracker.set_pr(42, PrState::Approved);

        let report = ReviewPoller::new(h.services.clone()).poll("demo").await.unwrap();
        assert_eq!(report.transitions(), 1);
        assert!(report.moves[0].merged);
        assert_eq!(report.moves[0].to_label, "To Test");
        assert!(h.tracker.labels_of(42).contains(&"To Test".to_string()));
        assert_eq!(h.git.pulls().len(), 1);
        assert!(h.audit.kinds().contains(&"review_transition".to_string()));
    }

    #[tokio::test]
    async fn test_failed_merge_goes_to_rework() {
        let h = harness();
        h.tracker.add_issue(42, "Fix login", &["To Review"]);
        h.tracker.set_pr(42, PrState::Approved);
        h.tracker.fail_merge(42);

        let report = ReviewPoller::new(h.services.clone()).poll("demo").await.unwrap();
        assert_eq!(report.transitions(), 1);
        assert!(report.moves[0].merge_failed);
        assert_eq!(report.moves[0].to_label, "To Improve");
        assert!(h.git.pulls().is_empty());
    }

    #[tokio::test]
    async fn test_pending_review_is_untouched() {
        let h = harness();
        h.tracker.add_issue(42, "Fix login", &["To Review", "review:human"]);
        h.tracker.set_pr(42, PrState::Open);
        h.tracker.add_issue(43, "No PR yet", &["To Review", "review:human"]);

        let report = ReviewPoller::new(h.services.clone()).poll("demo").await.unwrap();
        assert_eq!(report.transitions(), 0);
        assert!(h.tracker.calls().is_empty());
    }

    #[tokio::test]
    async fn test_changes_requested_goes_to_rework_without_merge() {
        let h = harness();
        h.tracker.add_issue(42, "Fix login", &["To Review", "review:human"]);
        h.tracker.set_pr(42, PrState::ChangesRequested);

        let report = ReviewPoller::new(h.services.clone()).poll("demo").await.unwrap();
        assert_eq!(report.moves[0].event, EVENT_CHANGES_REQUESTED);
        assert_eq!(report.moves[0].to_label, "To Improve");
        assert!(!h.tracker.calls().iter().any(|c| c.starts_with("merge")));
    }

    #[tokio::test]
    async fn test_agent_routed_issues_are_left_to_reviewer() {
        let h = harness();
        h.tracker.add_issue(42, "Fix login", &["To Review", "review:agent"]);
        h.tracker.set_pr(42, PrState::Approved);

        let report = ReviewPoller::new(h.services.clone()).poll("demo").await.unwrap();
        assert_eq!(report.transitions(), 0);
        assert!(h.tracker.labels_of(42).contains(&"To Review".to_string()));
    }
}
