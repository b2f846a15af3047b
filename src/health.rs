//! HealthReconciler: find slots whose worker is gone and give the issue back.
//!
//! A slot is a zombie when its session is missing from the runtime's alive
//! set and it has been active longer than `health.stale_after_secs`. Fixing a
//! zombie moves the issue from the role's active label back to the label it
//! was picked up from (`previous_label`) and frees the slot. If the alive set
//! cannot be fetched the zombie check is skipped for that pass.
//!
//! The pass also sweeps the other direction: an issue carrying a role's
//! active label that no slot holds is an orphan. That happens when a
//! dispatch moved the label but could not record the slot. Once its last
//! `label_commit` audit event is older than the staleness threshold, the
//! issue goes back to the label recorded there.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, HEALTH_FIX, LABEL_COMMIT};
use crate::errors::StoreError;
use crate::providers::{Issue, IssueTracker};
use crate::services::Services;
use crate::state::{Project, Slot, SlotRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    /// Active with no issue recorded.
    Corrupt,
    /// Session gone and past the staleness threshold.
    Zombie,
    /// Issue in an active state with no slot holding it.
    Orphan,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthFinding {
    pub kind: FindingKind,
    pub role: String,
    /// `None` for orphans.
    #[serde(serialize_with = "display")]
    pub slot: Option<SlotRef>,
    pub issue_id: Option<String>,
    pub session_key: Option<String>,
    pub age_secs: Option<i64>,
    /// Label the issue goes back to.
    pub revert_to: Option<String>,
    pub fixed: bool,
}

impl HealthFinding {
    /// Where the finding was made: the slot, or the role for orphans.
    pub fn location(&self) -> String {
        match &self.slot {
            Some(slot) => slot.to_string(),
            None => format!("{} (no slot)", self.role),
        }
    }
}

fn display<S: Serializer>(slot: &Option<SlotRef>, s: S) -> Result<S::Ok, S::Error> {
    match slot {
        Some(slot) => s.collect_str(slot),
        None => s.serialize_none(),
    }
}

#[derive(Debug, Default)]
pub struct HealthReport {
    pub findings: Vec<HealthFinding>,
    pub warnings: Vec<String>,
    /// Set when the zombie check did not run.
    pub skipped: Option<String>,
}

impl HealthReport {
    pub fn fixed(&self) -> usize {
        self.findings.iter().filter(|f| f.fixed).count()
    }

    fn warn(&mut self, message: String) {
        warn!("{}", message);
        self.warnings.push(message);
    }
}

/// Whether a slot started at `start_time` has outlived `stale_after`.
/// A slot with no start time has no proof of freshness.
pub fn is_stale(start_time: Option<DateTime<Utc>>, now: DateTime<Utc>, stale_after: Duration) -> bool {
    let Some(start) = start_time else {
        return true;
    };
    let limit = i64::try_from(stale_after.as_secs()).unwrap_or(i64::MAX);
    now.signed_duration_since(start).num_seconds() > limit
}

pub struct HealthReconciler {
    services: Services,
}

impl HealthReconciler {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    /// Run one pass over `slug`. With `fix = false` nothing is mutated.
    pub async fn check(&self, slug: &str, fix: bool) -> Result<HealthReport, StoreError> {
        self.check_at(slug, fix, Utc::now()).await
    }

    pub(crate) async fn check_at(
        &self,
        slug: &str,
        fix: bool,
        now: DateTime<Utc>,
    ) -> Result<HealthReport, StoreError> {
        let project = self.services.store.project(slug).await?;
        let mut report = HealthReport::default();
        let stale_after = self.services.settings.stale_after();

        let tracker = match self.services.tracker(&project) {
            Ok(tracker) => Some(tracker),
            Err(e) => {
                report.warn(format!("tracker for {} unavailable: {}", slug, e));
                None
            }
        };

        let active = project.active_slots();
        for (slot_ref, slot) in active.iter().filter(|(_, s)| s.issue_id.is_none()) {
            let mut finding = finding(FindingKind::Corrupt, slot_ref, slot, now);
            if fix {
                finding.fixed = self.release(&project, slot_ref, &mut report).await;
            }
            self.record(&project, &finding, fix);
            report.findings.push(finding);
        }

        if let Some(tracker) = &tracker {
            self.sweep_orphans(&project, tracker.as_ref(), fix, now, &mut report)
                .await;
        }

        let alive: HashSet<String> = match self.services.runtime.list_alive_sessions().await {
            Ok(alive) => alive,
            Err(e) => {
                let reason = format!("session list unavailable: {}", e);
                warn!(project = slug, "health check skipped: {}", reason);
                report.skipped = Some(reason);
                return Ok(report);
            }
        };

        for (slot_ref, slot) in active.iter().filter(|(_, s)| s.issue_id.is_some()) {
            let session_alive = slot
                .session_key
                .as_ref()
                .is_some_and(|key| alive.contains(key));
            if session_alive || !is_stale(slot.start_time, now, stale_after) {
                continue;
            }

            let mut finding = finding(FindingKind::Zombie, slot_ref, slot, now);
            finding.revert_to = slot
                .previous_label
                .clone()
                .or_else(|| self.fallback_label(&slot_ref.role, &slot_ref.to_string(), &mut report));
            debug!(project = slug, slot = %slot_ref, issue = ?slot.issue_id, "zombie slot");
            if fix {
                match &tracker {
                    Some(tracker) => {
                        finding.fixed = self
                            .fix_zombie(&project, tracker.as_ref(), slot_ref, &finding, &mut report)
                            .await;
                    }
                    None => report.warn(format!("zombie {} left in place: no tracker", slot_ref)),
                }
            }
            self.record(&project, &finding, fix);
            report.findings.push(finding);
        }

        if report.fixed() > 0 {
            info!(project = slug, fixed = report.fixed(), "health fixes applied");
        }
        Ok(report)
    }

    /// First queue label of the role, for issues with no recorded origin.
    fn fallback_label(&self, role: &str, what: &str, report: &mut HealthReport) -> Option<String> {
        let fallback = self
            .services
            .workflow
            .queue_labels(role)
            .first()
            .map(|l| l.to_string());
        report.warn(format!(
            "{} has no recorded previous label; falling back to {:?}",
            what, fallback
        ));
        fallback
    }

    async fn sweep_orphans(
        &self,
        project: &Project,
        tracker: &dyn IssueTracker,
        fix: bool,
        now: DateTime<Utc>,
        report: &mut HealthReport,
    ) {
        let workflow = &self.services.workflow;
        let stale_after = self.services.settings.stale_after();

        for role in workflow.roles() {
            let Some(active_label) = workflow.active_label(role) else {
                continue;
            };
            let issues = match tracker.list_issues_by_label(active_label).await {
                Ok(issues) => issues,
                Err(e) => {
                    report.warn(format!("listing '{}' in {} failed: {}", active_label, project.slug, e));
                    continue;
                }
            };

            for issue in issues {
                if project.find_issue(&issue.id.to_string()).is_some() {
                    continue;
                }
                // Only the commit that moved the issue into this label counts.
                let commit = self
                    .services
                    .audit
                    .last_for_issue(&project.slug, issue.id, LABEL_COMMIT)
                    .filter(|e| e.data.get("to").and_then(|v| v.as_str()) == Some(active_label));
                let committed_at = commit.as_ref().map(|e| e.timestamp);
                if !is_stale(committed_at, now, stale_after) {
                    debug!(project = %project.slug, issue = issue.id, "unrecorded dispatch still fresh");
                    continue;
                }

                let recorded_from = commit
                    .as_ref()
                    .and_then(|e| e.data.get("from"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                let revert_to = recorded_from.or_else(|| {
                    self.fallback_label(role, &format!("orphaned #{}", issue.id), report)
                });
                let mut finding = HealthFinding {
                    kind: FindingKind::Orphan,
                    role: role.to_string(),
                    slot: None,
                    issue_id: Some(issue.id.to_string()),
                    session_key: commit
                        .as_ref()
                        .and_then(|e| e.data.get("sessionKey"))
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                    age_secs: committed_at.map(|t| now.signed_duration_since(t).num_seconds()),
                    revert_to,
                    fixed: false,
                };
                debug!(project = %project.slug, issue = issue.id, role, "orphaned active label");
                if fix {
                    finding.fixed = self
                        .fix_orphan(project, tracker, &issue, active_label, &finding, report)
                        .await;
                }
                self.record(project, &finding, fix);
                report.findings.push(finding);
            }
        }
    }

    async fn fix_orphan(
        &self,
        project: &Project,
        tracker: &dyn IssueTracker,
        issue: &Issue,
        active_label: &str,
        finding: &HealthFinding,
        report: &mut HealthReport,
    ) -> bool {
        // A dispatch may have recorded the slot since the snapshot was read.
        match self.services.store.project(&project.slug).await {
            Ok(current) if current.find_issue(&issue.id.to_string()).is_some() => return false,
            Ok(_) => {}
            Err(e) => {
                report.warn(format!("orphan #{} left in place: {}", issue.id, e));
                return false;
            }
        }
        let Some(target) = &finding.revert_to else {
            report.warn(format!("orphan #{} left in place: nowhere to revert to", issue.id));
            return false;
        };
        if let Err(e) = tracker.transition_label(issue.id, active_label, target).await {
            report.warn(format!(
                "reverting #{} from '{}' to '{}' failed: {}",
                issue.id, active_label, target, e
            ));
            return false;
        }
        info!(project = %project.slug, issue = issue.id, from = active_label, to = %target, "orphan reverted");
        true
    }

    async fn fix_zombie(
        &self,
        project: &Project,
        tracker: &dyn IssueTracker,
        slot_ref: &SlotRef,
        finding: &HealthFinding,
        report: &mut HealthReport,
    ) -> bool {
        let Some(issue_id) = finding.issue_id.as_deref().and_then(|id| id.parse::<u64>().ok()) else {
            report.warn(format!("slot {} holds unparseable issue id {:?}", slot_ref, finding.issue_id));
            return self.release(project, slot_ref, report).await;
        };
        let issue = match tracker.get_issue(issue_id).await {
            Ok(issue) => issue,
            Err(e) => {
                report.warn(format!("zombie #{} left in place: {}", issue_id, e));
                return false;
            }
        };

        let active_label = self.services.workflow.active_label(&slot_ref.role);
        if let Some(active_label) = active_label.filter(|l| issue.has_label(l)) {
            let Some(target) = &finding.revert_to else {
                report.warn(format!("zombie #{} left in place: nowhere to revert to", issue_id));
                return false;
            };
            if let Err(e) = tracker.transition_label(issue_id, active_label, target).await {
                report.warn(format!(
                    "reverting #{} from '{}' to '{}' failed: {}",
                    issue_id, active_label, target, e
                ));
                return false;
            }
            info!(project = %project.slug, issue = issue_id, from = active_label, to = %target, "zombie reverted");
        } else {
            debug!(project = %project.slug, issue = issue_id, "issue already moved on; releasing slot only");
        }

        self.release(project, slot_ref, report).await
    }

    async fn release(&self, project: &Project, slot_ref: &SlotRef, report: &mut HealthReport) -> bool {
        match self
            .services
            .store
            .deactivate(&project.slug, &slot_ref.role, &slot_ref.level, slot_ref.index)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                report.warn(format!("releasing slot {} failed: {}", slot_ref, e));
                false
            }
        }
    }

    fn record(&self, project: &Project, finding: &HealthFinding, fix: bool) {
        if !fix {
            return;
        }
        let mut event = AuditEvent::new(HEALTH_FIX, &project.slug).data(json!(finding));
        event = match &finding.slot {
            Some(slot) => event.worker(&slot.role, &slot.level),
            None => {
                event.role = Some(finding.role.clone());
                event
            }
        };
        if let Some(id) = finding.issue_id.as_deref().and_then(|id| id.parse().ok()) {
            event = event.issue(id);
        }
        self.services.audit.record(event);
    }
}

fn finding(kind: FindingKind, slot_ref: &SlotRef, slot: &Slot, now: DateTime<Utc>) -> HealthFinding {
    HealthFinding {
        kind,
        role: slot_ref.role.clone(),
        slot: Some(slot_ref.clone()),
        issue_id: slot.issue_id.clone(),
        session_key: slot.session_key.clone(),
        age_secs: slot
            .start_time
            .map(|start| now.signed_duration_since(start).num_seconds()),
        revert_to: None,
        fixed: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{DispatchEngine, DispatchRequest};
    use crate::foreman_config::ForemanToml;
    use crate::queue::QueueScanner;
    use crate::state::{Activation, RoleUpdate, SlotPatch};
    use crate::testing::{Harness, harness, harness_with};

    fn occupy(h: &Harness, issue: u64, from: &str, hours_ago: i64, key: &str) {
        h.tracker.add_issue(issue, "Fix login", &["Doing"]);
        h.store()
            .activate(
                "demo",
                "developer",
                "medior",
                0,
                Activation {
                    issue_id: issue.to_string(),
                    session_key: Some(key.to_string()),
                    start_time: Utc::now() - chrono::Duration::hours(hours_ago),
                    previous_label: Some(from.to_string()),
                },
            )
            .unwrap();
    }

    #[test]
    fn test_is_stale() {
        let now = Utc::now();
        let two_hours = Duration::from_secs(7200);
        assert!(!is_stale(Some(now - chrono::Duration::minutes(30)), now, two_hours));
        assert!(is_stale(Some(now - chrono::Duration::hours(3)), now, two_hours));
        assert!(is_stale(None, now, two_hours));
    }

    #[tokio::test]
    async fn test_dead_stale_session_reverts_to_previous_label() {
        let h = harness();
        occupy(&h, 8, "To Improve", 3, "agent:main:subagent:demo-developer-medior");
        h.runtime.set_alive(&[]);

        let report = HealthReconciler::new(h.services.clone())
            .check("demo", true)
            .await
            .unwrap();
        assert_eq!(report.fixed(), 1);
        assert_eq!(report.findings[0].kind, FindingKind::Zombie);
        assert_eq!(report.findings[0].revert_to.as_deref(), Some("To Improve"));
        // Back to rework, not to the first queue of the role.
        let labels = h.tracker.labels_of(8);
        assert!(labels.contains(&"To Improve".to_string()));
        assert!(!labels.contains(&"To Do".to_string()));
        assert!(h.project().find_issue("8").is_none());
        assert!(h.audit.kinds().contains(&"health_fix".to_string()));
    }

    #[tokio::test]
    async fn test_alive_or_fresh_slots_are_left_alone() {
        let h = harness();
        occupy(&h, 8, "To Do", 3, "dev-session");
        h.runtime.set_alive(&["dev-session"]);
        let report = HealthReconciler::new(h.services.clone())
            .check("demo", true)
            .await
            .unwrap();
        assert!(report.findings.is_empty());

        let h = harness();
        occupy(&h, 8, "To Do", 0, "dev-session");
        h.runtime.set_alive(&[]);
        let report = HealthReconciler::new(h.services.clone())
            .check("demo", true)
            .await
            .unwrap();
        assert!(report.findings.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_alive_set_skips_pass() {
        let h = harness();
        occupy(&h, 8, "To Do", 3, "dev-session");
        h.runtime.fail_list(true);

        let report = HealthReconciler::new(h.services.clone())
            .check("demo", true)
            .await
            .unwrap();
        assert!(report.skipped.is_some());
        assert!(report.findings.is_empty());
        assert!(h.project().find_issue("8").is_some());
    }

    #[tokio::test]
    async fn test_report_mode_does_not_mutate() {
        let h = harness();
        occupy(&h, 8, "To Do", 3, "dev-session");
        let before = h.project();

        let report = HealthReconciler::new(h.services.clone())
            .check("demo", false)
            .await
            .unwrap();
        assert_eq!(report.findings.len(), 1);
        assert!(!report.findings[0].fixed);
        assert_eq!(h.project(), before);
        assert!(h.tracker.calls().is_empty());
        assert!(h.audit.events().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_slot_is_released() {
        let h = harness();
        let patch = SlotPatch {
            active: Some(true),
            ..Default::default()
        };
        h.store()
            .update("demo", "tester", &RoleUpdate::slot("medior", 0, patch))
            .unwrap();
        h.runtime.fail_list(true);

        let report = HealthReconciler::new(h.services.clone())
            .check("demo", true)
            .await
            .unwrap();
        assert_eq!(report.findings[0].kind, FindingKind::Corrupt);
        assert!(report.findings[0].fixed);
        assert!(h.project().active_slots().is_empty());
    }

    #[tokio::test]
    async fn test_failed_revert_keeps_slot() {
        let h = harness();
        occupy(&h, 8, "To Do", 3, "dev-session");
        h.tracker.fail_transitions(true);

        let report = HealthReconciler::new(h.services.clone())
            .check("demo", true)
            .await
            .unwrap();
        assert!(!report.findings[0].fixed);
        assert_eq!(report.warnings.len(), 1);
        assert!(h.project().find_issue("8").is_some());
    }

    #[tokio::test]
    async fn test_issue_moved_by_hand_only_releases_slot() {
        let h = harness();
        occupy(&h, 8, "To Do", 3, "dev-session");
        h.tracker.add_issue(8, "Fix login", &["Refining"]);

        let report = HealthReconciler::new(h.services.clone())
            .check("demo", true)
            .await
            .unwrap();
        assert!(report.findings[0].fixed);
        assert!(h.tracker.labels_of(8).contains(&"Refining".to_string()));
        assert!(h.tracker.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unrecorded_dispatch_is_reverted_once_stale() {
        let mut settings = ForemanToml::default();
        settings.lock.timeout_ms = 100;
        settings.lock.poll_ms = 10;
        let h = harness_with(settings);
        h.tracker.add_issue(42, "Fix login", &["To Improve"]);
        let lock = h.dir.path().join("projects.json.lock");
        std::fs::write(&lock, "held").unwrap();
        let request = DispatchRequest {
            project: "demo".to_string(),
            issue_id: 42,
            role: "developer".to_string(),
            level: None,
        };
        let outcome = DispatchEngine::new(h.services.clone())
            .dispatch(&request)
            .await
            .unwrap()
            .outcome;
        assert!(outcome.state_degraded);
        std::fs::remove_file(&lock).unwrap();

        let reconciler = HealthReconciler::new(h.services.clone());
        let report = reconciler.check("demo", true).await.unwrap();
        assert!(report.findings.is_empty());
        assert!(h.tracker.labels_of(42).contains(&"Doing".to_string()));

        let later = Utc::now() + chrono::Duration::hours(3);
        let report = reconciler.check_at("demo", true, later).await.unwrap();
        assert_eq!(report.findings.len(), 1);
        let orphan = &report.findings[0];
        assert_eq!(orphan.kind, FindingKind::Orphan);
        assert_eq!(orphan.location(), "developer (no slot)");
        assert_eq!(orphan.revert_to.as_deref(), Some("To Improve"));
        assert!(orphan.fixed);
        let labels = h.tracker.labels_of(42);
        assert!(labels.contains(&"To Improve".to_string()));
        assert!(!labels.contains(&"Doing".to_string()));
        assert!(h.audit.kinds().contains(&"health_fix".to_string()));

        // Back in the queue, the next scan picks it up properly.
        let scan = QueueScanner::new(h.services.clone()).scan("demo", 5).await.unwrap();
        assert_eq!(scan.dispatched.len(), 1);
        assert!(h.project().find_issue("42").is_some());
    }

    #[tokio::test]
    async fn test_hand_labelled_active_issue_falls_back_to_first_queue() {
        let h = harness();
        h.tracker.add_issue(9, "Stray", &["Doing"]);

        let report = HealthReconciler::new(h.services.clone())
            .check("demo", false)
            .await
            .unwrap();
        assert_eq!(report.findings[0].kind, FindingKind::Orphan);
        assert_eq!(report.findings[0].revert_to.as_deref(), Some("To Do"));
        assert!(!report.findings[0].fixed);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(h.tracker.labels_of(9), vec!["Doing"]);
    }

    #[tokio::test]
    async fn test_held_active_issue_is_not_an_orphan() {
        let h = harness();
        occupy(&h, 8, "To Do", 0, "dev-session");
        h.runtime.set_alive(&["dev-session"]);

        let report = HealthReconciler::new(h.services.clone())
            .check_at("demo", true, Utc::now() + chrono::Duration::hours(3))
            .await
            .unwrap();
        assert!(report.findings.is_empty());
        assert!(h.tracker.labels_of(8).contains(&"Doing".to_string()));
    }
}
