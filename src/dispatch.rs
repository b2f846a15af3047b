//! DispatchEngine: hand one queued issue to a worker slot.
//!
//! The label transition from the queue label to the role's active label is
//! the commitment point. Everything before it can fail and leave no trace;
//! everything after it is best-effort and surfaces as `warnings` on the
//! [`DispatchOutcome`]. Nothing after the commitment point rolls the label
//! back: a dispatch whose worker never starts is repaired by the health pass,
//! which reverts the issue to the recorded `previous_label`.
//!
//! Task delivery runs detached. The caller gets a [`DeliveryHandle`] it may
//! await, but the outcome is final before delivery finishes.

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, DELIVERY_FAILED, DISPATCH, LABEL_COMMIT, LEVEL_SELECTION};
use crate::errors::{DispatchError, ProviderError};
use crate::prompt::{TaskContext, build_payload};
use crate::providers::{Issue, IssueState, IssueTracker};
use crate::roles::{
    REVIEW_AGENT_LABEL, REVIEW_HUMAN_LABEL, owner_label, parse_owner_label, select_level,
    session_key,
};
use crate::services::Services;
use crate::state::{Activation, Project, RoleWorkerState};
use crate::workflow::StateType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRequest {
    pub project: String,
    pub issue_id: u64,
    pub role: String,
    /// Explicit level; `None` lets level selection decide.
    pub level: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionAction {
    /// The slot had no session under this key; a new one was created.
    Spawn,
    /// The slot's existing session receives the task.
    Send,
}

impl std::fmt::Display for SessionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionAction::Spawn => write!(f, "spawn"),
            SessionAction::Send => write!(f, "send"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchOutcome {
    pub project: String,
    pub issue_id: u64,
    pub issue_title: String,
    pub role: String,
    pub level: String,
    pub level_reason: String,
    pub slot: usize,
    pub session_action: SessionAction,
    pub session_key: String,
    pub idempotency_key: String,
    pub from_label: String,
    pub to_label: String,
    pub announcement: String,
    pub warnings: Vec<String>,
    /// The slot activation was not persisted; the next health pass repairs it.
    pub state_degraded: bool,
}

/// The detached task delivery.
#[derive(Debug)]
pub struct DeliveryHandle {
    issue_id: u64,
    handle: JoinHandle<Result<(), ProviderError>>,
}

impl DeliveryHandle {
    pub async fn wait(self) -> Result<(), ProviderError> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(ProviderError::permanent(
                "runtime",
                format!("delivery task for #{} aborted: {}", self.issue_id, e),
            )),
        }
    }
}

#[derive(Debug)]
pub struct Dispatched {
    pub outcome: DispatchOutcome,
    pub delivery: DeliveryHandle,
}

/// Key that makes a repeated delivery of the same attempt a no-op.
///
/// `attempt` is the slot's task count after this dispatch, so a retry of the
/// same dispatch reuses the key while the next task on the slot does not.
pub fn idempotency_key(
    project: &str,
    issue_id: u64,
    role: &str,
    level: &str,
    session_key: &str,
    attempt: u32,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(project.as_bytes());
    hasher.update(b"\0");
    hasher.update(issue_id.to_string().as_bytes());
    hasher.update(b"\0");
    hasher.update(role.as_bytes());
    hasher.update(b"\0");
    hasher.update(level.as_bytes());
    hasher.update(b"\0");
    hasher.update(session_key.as_bytes());
    hasher.update(b"\0");
    hasher.update(attempt.to_string().as_bytes());
    format!("{:x}", hasher.finalize())[..32].to_string()
}

pub struct DispatchEngine {
    services: Services,
}

impl DispatchEngine {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    /// Validate the role and return its active label.
    fn active_label(&self, role: &str) -> Result<String, DispatchError> {
        self.services.roles().role(role)?;
        self.services
            .workflow
            .active_label(role)
            .map(str::to_string)
            .ok_or_else(|| {
                DispatchError::Validation(format!(
                    "role '{}' has no active state in the workflow",
                    role
                ))
            })
    }

    /// Dispatch by id: loads the project and the issue, then
    /// [`dispatch_issue`](Self::dispatch_issue).
    pub async fn dispatch(&self, req: &DispatchRequest) -> Result<Dispatched, DispatchError> {
        self.active_label(&req.role)?;
        if let Some(level) = &req.level {
            self.services.roles().check_level(&req.role, level)?;
        }
        let project = self.services.store.project(&req.project).await?;
        let tracker = self.services.tracker(&project)?;
        let issue = tracker.get_issue(req.issue_id).await?;
        self.dispatch_issue(&project, tracker.as_ref(), &issue, &req.role, req.level.as_deref())
            .await
    }

    /// Dispatch an already fetched issue against a project snapshot.
    pub async fn dispatch_issue(
        &self,
        project: &Project,
        tracker: &dyn IssueTracker,
        issue: &Issue,
        role: &str,
        level: Option<&str>,
    ) -> Result<Dispatched, DispatchError> {
        let services = &self.services;
        let workflow = &services.workflow;
        let active_label = self.active_label(role)?;
        let issue_key = issue.id.to_string();
        // The caller's snapshot may predate another dispatch; decide slots on
        // the stored state.
        let current = services.store.project(&project.slug).await?;

        // Validation: nothing has been touched yet.
        if let Some(held) = current.find_issue(&issue_key) {
            return Err(DispatchError::AlreadyActive {
                issue_id: issue.id,
                role: held.role,
                level: held.level,
            });
        }
        if issue.state == IssueState::Closed {
            return Err(DispatchError::Validation(format!(
                "issue #{} is closed",
                issue.id
            )));
        }
        let pickup = workflow.pickup_labels(role);
        let from_label = pickup
            .iter()
            .find(|label| issue.has_label(label))
            .map(|label| label.to_string())
            .ok_or_else(|| {
                DispatchError::Validation(format!(
                    "issue #{} is not queued for {} (expected one of: {})",
                    issue.id,
                    role,
                    pickup.join(", ")
                ))
            })?;

        let selection = select_level(
            services.roles(),
            role,
            level,
            &issue.title,
            &issue.body,
            &issue.labels,
        )?;
        let level = selection.level.as_str();
        let role_cfg = services.roles().role(role)?;
        let capacity = role_cfg.capacity(level);
        let idle = RoleWorkerState::default();
        let workers = current.role(role).unwrap_or(&idle);
        let slot = workers
            .find_free_slot(level, Some(capacity))
            .or_else(|| {
                let len = workers.slots(level).len();
                (len < capacity).then_some(len)
            })
            .ok_or_else(|| DispatchError::NoCapacity {
                project: project.slug.clone(),
                role: role.to_string(),
                level: level.to_string(),
            })?;

        let key = session_key(services.agent_id(), &project.slug, role, level, slot);
        let existing = workers.slots(level).get(slot);
        let session_action = if existing.and_then(|s| s.session_key.as_deref()) == Some(key.as_str())
        {
            SessionAction::Send
        } else {
            SessionAction::Spawn
        };
        let attempt = existing.and_then(|s| s.task_count).unwrap_or(0) + 1;
        let idem = idempotency_key(&project.slug, issue.id, role, level, &key, attempt);

        let mut warnings = Vec::new();
        let payload = self
            .build_payload(project, tracker, issue, role, level, &from_label, &mut warnings)
            .await;

        // Commitment point.
        tracker
            .transition_label(issue.id, &from_label, &active_label)
            .await
            .map_err(|source| DispatchError::Commitment {
                issue_id: issue.id,
                from: from_label.clone(),
                to: active_label.clone(),
                source,
            })?;
        info!(
            project = %project.slug,
            issue = issue.id,
            role,
            level,
            slot,
            from = %from_label,
            to = %active_label,
            "issue committed to worker"
        );
        services.audit.record(
            AuditEvent::new(LABEL_COMMIT, &project.slug)
                .issue(issue.id)
                .worker(role, level)
                .data(json!({
                    "slot": slot,
                    "sessionKey": key,
                    "from": from_label,
                    "to": active_label,
                })),
        );

        self.mark_issue(tracker, issue, role, level, &mut warnings).await;

        let model = role_cfg.model(level);
        if let Err(e) = services.runtime.ensure_session(&key, &model).await {
            let message = format!("could not ensure session {}: {}", key, e);
            warn!(project = %project.slug, issue = issue.id, "{}", message);
            warnings.push(message);
        }
        let delivery = self.spawn_delivery(
            &project.slug,
            issue.id,
            role,
            level,
            key.clone(),
            payload,
            idem.clone(),
        );

        let activation = Activation {
            issue_id: issue_key,
            session_key: (session_action == SessionAction::Spawn).then(|| key.clone()),
            start_time: Utc::now(),
            previous_label: Some(from_label.clone()),
        };
        let state_degraded = match services
            .store
            .activate(&project.slug, role, level, slot, activation)
            .await
        {
            Ok(_) => false,
            Err(e) => {
                let message = format!(
                    "slot {}/{}#{} for #{} was not recorded: {}",
                    role, level, slot, issue.id, e
                );
                warn!(project = %project.slug, issue = issue.id, "{}", message);
                warnings.push(message);
                true
            }
        };

        services.audit.record(
            AuditEvent::new(LEVEL_SELECTION, &project.slug)
                .issue(issue.id)
                .worker(role, level)
                .data(json!({ "reason": selection.reason })),
        );
        services.audit.record(
            AuditEvent::new(DISPATCH, &project.slug)
                .issue(issue.id)
                .worker(role, level)
                .data(json!({
                    "slot": slot,
                    "sessionAction": session_action,
                    "sessionKey": key,
                    "from": from_label,
                    "to": active_label,
                    "stateDegraded": state_degraded,
                })),
        );

        let announcement = format!(
            "{} ({}) picked up #{} \"{}\" [{} {}]",
            role, level, issue.id, issue.title, session_action, key
        );
        Ok(Dispatched {
            outcome: DispatchOutcome {
                project: project.slug.clone(),
                issue_id: issue.id,
                issue_title: issue.title.clone(),
                role: role.to_string(),
                level: level.to_string(),
                level_reason: selection.reason,
                slot,
                session_action,
                session_key: key,
                idempotency_key: idem,
                from_label,
                to_label: active_label,
                announcement,
                warnings,
                state_degraded,
            },
            delivery,
        })
    }

    /// Gather comments and pull request context. Lookups that fail are noted
    /// and left out.
    #[allow(clippy::too_many_arguments)]
    async fn build_payload(
        &self,
        project: &Project,
        tracker: &dyn IssueTracker,
        issue: &Issue,
        role: &str,
        level: &str,
        from_label: &str,
        warnings: &mut Vec<String>,
    ) -> String {
        let comments = match tracker.list_comments(issue.id).await {
            Ok(comments) => comments,
            Err(e) => {
                warnings.push(format!("comments for #{} unavailable: {}", issue.id, e));
                Vec::new()
            }
        };
        let pr = match tracker.get_review_status(issue.id).await {
            Ok(pr) => pr,
            Err(e) => {
                warnings.push(format!("pull request for #{} unavailable: {}", issue.id, e));
                None
            }
        };
        let from_review = self
            .services
            .workflow
            .state_by_label(from_label)
            .is_some_and(|(_, s)| s.kind == StateType::Review);
        let diff = if from_review && pr.is_some() {
            match tracker.get_pr_diff(issue.id).await {
                Ok(diff) => diff,
                Err(e) => {
                    warnings.push(format!("diff for #{} unavailable: {}", issue.id, e));
                    None
                }
            }
        } else {
            None
        };

        let valid_results = self.services.workflow.valid_results(role);
        build_payload(&TaskContext {
            project: &project.slug,
            repo: &project.repo,
            base_branch: &project.base_branch,
            issue,
            role,
            level,
            comments: &comments,
            pr: pr.as_ref(),
            diff: diff.as_deref(),
            valid_results: &valid_results,
        })
    }

    /// Ownership and review-routing markers. Never fails the dispatch.
    async fn mark_issue(
        &self,
        tracker: &dyn IssueTracker,
        issue: &Issue,
        role: &str,
        level: &str,
        warnings: &mut Vec<String>,
    ) {
        let mut note = |message: String| {
            warn!(issue = issue.id, "{}", message);
            warnings.push(message);
        };

        let owner = owner_label(role, level);
        for label in &issue.labels {
            if let Some((r, l)) = parse_owner_label(label)
                && r == role
                && l != level
                && let Err(e) = tracker.remove_label(issue.id, label).await
            {
                note(format!("could not remove '{}' from #{}: {}", label, issue.id, e));
            }
        }
        if !issue.has_label(&owner)
            && let Err(e) = tracker.add_label(issue.id, &owner).await
        {
            note(format!("could not add '{}' to #{}: {}", owner, issue.id, e));
        }

        let Some(route) = self.services.roles().review_route(role, level) else {
            return;
        };
        let stale = if route.label() == REVIEW_HUMAN_LABEL {
            REVIEW_AGENT_LABEL
        } else {
            REVIEW_HUMAN_LABEL
        };
        if issue.has_label(stale)
            && let Err(e) = tracker.remove_label(issue.id, stale).await
        {
            note(format!("could not remove '{}' from #{}: {}", stale, issue.id, e));
        }
        if !issue.has_label(route.label())
            && let Err(e) = tracker.add_label(issue.id, route.label()).await
        {
            note(format!(
                "could not add '{}' to #{}: {}",
                route.label(),
                issue.id,
                e
            ));
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_delivery(
        &self,
        project: &str,
        issue_id: u64,
        role: &str,
        level: &str,
        key: String,
        payload: String,
        idem: String,
    ) -> DeliveryHandle {
        let runtime = self.services.runtime.clone();
        let audit = self.services.audit.clone();
        let (project, role, level) = (project.to_string(), role.to_string(), level.to_string());
        let handle = tokio::spawn(async move {
            let result = runtime.deliver_task(&key, &payload, &idem).await;
            match &result {
                Ok(()) => debug!(project = %project, issue = issue_id, session = %key, "task delivered"),
                Err(e) => {
                    warn!(
                        project = %project,
                        issue = issue_id,
                        session = %key,
                        error = %e,
                        "task delivery failed"
                    );
                    audit.record(
                        AuditEvent::new(DELIVERY_FAILED, &project)
                            .issue(issue_id)
                            .worker(&role, &level)
                            .data(json!({ "sessionKey": key, "error": e.to_string() })),
                    );
                }
            }
            result
        });
        DeliveryHandle { issue_id, handle }
    }
}
