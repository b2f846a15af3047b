//! Opportunistic queue fill: find queued issues and hand them to free slots.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::dispatch::{DispatchEngine, Dispatched};
use crate::errors::DispatchError;
use crate::foreman_config::ExecutionMode;
use crate::providers::{Issue, IssueState};
use crate::roles::REVIEW_AGENT_LABEL;
use crate::services::Services;
use crate::workflow::{PriorityWeight, StateType, priority_weight};

/// Order candidates by queue priority, oldest issue first within a priority.
/// Duplicates (an issue under two queue labels) keep their best position.
pub fn rank_candidates(candidates: Vec<(u32, Issue)>) -> Vec<Issue> {
    let mut weighted: Vec<(PriorityWeight, Issue)> = candidates
        .into_iter()
        .map(|(priority, issue)| (priority_weight(priority, issue.id), issue))
        .collect();
    weighted.sort_by(|a, b| b.0.cmp(&a.0));
    let mut seen = HashSet::new();
    weighted
        .into_iter()
        .filter(|(_, issue)| seen.insert(issue.id))
        .map(|(_, issue)| issue)
        .collect()
}

#[derive(Debug, Default)]
pub struct ScanReport {
    pub dispatched: Vec<Dispatched>,
    pub warnings: Vec<String>,
}

pub struct QueueScanner {
    services: Services,
    engine: DispatchEngine,
}

impl QueueScanner {
    pub fn new(services: Services) -> Self {
        Self {
            engine: DispatchEngine::new(services.clone()),
            services,
        }
    }

    /// Fill free slots in one project, dispatching at most `budget` issues.
    pub async fn scan(&self, slug: &str, budget: usize) -> Result<ScanReport, DispatchError> {
        let mut report = ScanReport::default();
        let mut project = self.services.store.project(slug).await?;
        let tracker = self.services.tracker(&project)?;
        let workflow = &self.services.workflow;
        let sequential = self.services.settings.scheduling.execution == ExecutionMode::Sequential;

        for role in workflow.roles() {
            if report.dispatched.len() >= budget {
                break;
            }
            if sequential {
                let busy = project.busy_roles();
                if busy.iter().any(|r| *r != role) {
                    debug!(project = slug, role, ?busy, "sequential mode: another role is busy");
                    continue;
                }
            }

            let mut candidates = Vec::new();
            for label in workflow.pickup_labels(role) {
                let Some((_, state)) = workflow.state_by_label(label) else {
                    continue;
                };
                // Review states feed a role only when routed to an agent.
                let agent_only = state.kind == StateType::Review;
                match tracker.list_issues_by_label(label).await {
                    Ok(issues) => candidates.extend(
                        issues
                            .into_iter()
                            .filter(|i| i.state == IssueState::Open)
                            .filter(|i| !agent_only || i.has_label(REVIEW_AGENT_LABEL))
                            .filter(|i| project.find_issue(&i.id.to_string()).is_none())
                            .map(|i| (state.priority, i)),
                    ),
                    Err(e) => {
                        let message = format!("listing '{}' in {} failed: {}", label, slug, e);
                        warn!("{}", message);
                        report.warnings.push(message);
                    }
                }
            }

            for issue in rank_candidates(candidates) {
                if report.dispatched.len() >= budget {
                    break;
                }
                let result = self
                    .engine
                    .dispatch_issue(&project, tracker.as_ref(), &issue, role, None)
                    .await;
                match result {
                    Ok(dispatched) => {
                        info!(project = slug, "{}", dispatched.outcome.announcement);
                        report.dispatched.push(dispatched);
                        project = self.services.store.project(slug).await?;
                    }
                    Err(DispatchError::NoCapacity { level, .. }) => {
                        debug!(project = slug, issue = issue.id, role, %level, "no free slot");
                    }
                    Err(e) => {
                        let message = format!("dispatch of #{} to {} failed: {}", issue.id, role, e);
                        warn!("{}", message);
                        report.warnings.push(message);
                    }
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foreman_config::ForemanToml;
    use crate::testing::{harness, harness_with};

    fn issue(id: u64) -> Issue {
        Issue {
            id,
            title: format!("Issue {}", id),
            body: String::new(),
            labels: Vec::new(),
            state: IssueState::Open,
            url: String::new(),
        }
    }

    #[test]
    fn test_rank_by_priority_then_oldest() {
        let ranked = rank_candidates(vec![(3, issue(10)), (3, issue(5)), (2, issue(99))]);
        let ids: Vec<u64> = ranked.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![5, 10, 99]);
    }

    #[test]
    fn test_rank_with_large_priorities_and_ids() {
        let ranked = rank_candidates(vec![
            (1, issue(2)),
            (10_000_000, issue(5_000_000_000_000)),
            (10_000_000, issue(3)),
        ]);
        let ids: Vec<u64> = ranked.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![3, 5_000_000_000_000, 2]);
    }

    #[test]
    fn test_rank_keeps_best_position_of_duplicates() {
        let ranked = rank_candidates(vec![(1, issue(7)), (3, issue(7)), (2, issue(8))]);
        let ids: Vec<u64> = ranked.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![7, 8]);
    }

    #[tokio::test]
    async fn test_scan_prefers_rework_queue_and_respects_capacity() {
        let h = harness();
        h.tracker.add_issue(3, "New feature", &["To Do"]);
        h.tracker.add_issue(8, "Rework", &["To Improve"]);
        h.tracker.add_issue(4, "Another feature", &["To Do"]);

        let report = QueueScanner::new(h.services.clone())
            .scan("demo", 10)
            .await
            .unwrap();
        let ids: Vec<u64> = report.dispatched.iter().map(|d| d.outcome.issue_id).collect();
        // One medior developer slot: the rework issue wins it.
        assert_eq!(ids, vec![8]);
        assert!(h.tracker.labels_of(3).contains(&"To Do".to_string()));
    }

    #[tokio::test]
    async fn test_scan_fills_every_role() {
        let h = harness();
        h.tracker.add_issue(1, "Feature", &["To Do"]);
        h.tracker.add_issue(2, "Check it", &["To Test"]);
        h.tracker.add_issue(3, "Design it", &["To Design"]);

        let report = QueueScanner::new(h.services.clone())
            .scan("demo", 10)
            .await
            .unwrap();
        let mut roles: Vec<String> = report
            .dispatched
            .iter()
            .map(|d| d.outcome.role.clone())
            .collect();
        roles.sort();
        assert_eq!(roles, vec!["architect", "developer", "tester"]);
    }

    #[tokio::test]
    async fn test_scan_stops_at_budget() {
        let h = harness();
        h.tracker.add_issue(1, "Feature", &["To Do"]);
        h.tracker.add_issue(2, "Check it", &["To Test"]);

        let report = QueueScanner::new(h.services.clone())
            .scan("demo", 1)
            .await
            .unwrap();
        assert_eq!(report.dispatched.len(), 1);
    }

    #[tokio::test]
    async fn test_review_queue_only_takes_agent_routed_issues() {
        let h = harness();
        h.tracker.add_issue(1, "Human review", &["To Review", "review:human"]);
        h.tracker.add_issue(2, "Agent review", &["To Review", "review:agent"]);

        let report = QueueScanner::new(h.services.clone())
            .scan("demo", 10)
            .await
            .unwrap();
        let ids: Vec<u64> = report.dispatched.iter().map(|d| d.outcome.issue_id).collect();
        assert_eq!(ids, vec![2]);
        assert!(h.tracker.labels_of(1).contains(&"To Review".to_string()));
    }

    #[tokio::test]
    async fn test_sequential_mode_waits_for_busy_role() {
        let mut settings = ForemanToml::default();
        settings.scheduling.execution = ExecutionMode::Sequential;
        let h = harness_with(settings);
        h.tracker.add_issue(1, "Check it", &["To Test"]);
        h.tracker.add_issue(2, "Feature", &["To Do"]);

        let report = QueueScanner::new(h.services.clone())
            .scan("demo", 10)
            .await
            .unwrap();
        // Roles are visited alphabetically; developer goes first and holds the project.
        let roles: Vec<&str> = report
            .dispatched
            .iter()
            .map(|d| d.outcome.role.as_str())
            .collect();
        assert_eq!(roles, vec!["developer"]);
    }

    #[tokio::test]
    async fn test_already_held_issue_is_skipped() {
        let h = harness();
        h.tracker.add_issue(1, "Feature", &["To Do"]);
        let scanner = QueueScanner::new(h.services.clone());
        assert_eq!(scanner.scan("demo", 10).await.unwrap().dispatched.len(), 1);
        // Put the label back as if someone re-queued it by hand.
        h.tracker.add_issue(1, "Feature", &["To Do"]);
        let report = scanner.scan("demo", 10).await.unwrap();
        assert!(report.dispatched.is_empty());
        assert!(report.warnings.is_empty());
    }
}
