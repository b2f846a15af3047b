//! CompletionPipeline: route a worker's reported result to the next stage.
//!
//! Order of operations:
//! 1. resolve the completion rule (unknown pairs are rejected untouched)
//! 2. run the transition's actions in declared order
//! 3. move the label from the active label to the target
//! 4. release the slot, keeping its session key
//! 5. post the summary, audit, and re-scan the queues
//!
//! Only steps 1 and 3 can fail the call. A failed merge in step 2 swaps the
//! target for the state's `MERGE_FAILED` route.

use serde_json::json;
use tracing::{info, warn};

use crate::actions::{ActionContext, run_actions};
use crate::audit::{AuditEvent, COMPLETION};
use crate::dispatch::Dispatched;
use crate::errors::CompletionError;
use crate::providers::PrStatus;
use crate::queue::QueueScanner;
use crate::services::Services;
use crate::state::SlotRef;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub project: String,
    pub issue_id: u64,
    pub role: String,
    pub result: String,
    pub summary: Option<String>,
}

#[derive(Debug)]
pub struct CompletionOutcome {
    pub project: String,
    pub issue_id: u64,
    pub role: String,
    pub event: String,
    pub from_label: String,
    pub to_label: String,
    /// Slot that held the issue, if one did.
    pub slot: Option<SlotRef>,
    pub pr: Option<PrStatus>,
    pub merged: bool,
    pub merge_failed: bool,
    pub issue_closed: bool,
    pub issue_reopened: bool,
    pub announcement: String,
    pub warnings: Vec<String>,
    /// The slot release was not persisted.
    pub state_degraded: bool,
    /// Dispatches triggered by the follow-up queue scan.
    pub chained: Vec<Dispatched>,
}

pub struct CompletionPipeline {
    services: Services,
}

impl CompletionPipeline {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    pub async fn complete(
        &self,
        req: &CompletionRequest,
    ) -> Result<CompletionOutcome, CompletionError> {
        let services = &self.services;
        let workflow = &services.workflow;

        services.roles().role(&req.role)?;
        let rule = workflow
            .completion_rule(&req.role, &req.result)
            .ok_or_else(|| CompletionError::NoRule {
                role: req.role.clone(),
                result: req.result.clone(),
            })?;

        let project = services.store.project(&req.project).await?;
        let tracker = services.tracker(&project)?;
        let issue = tracker.get_issue(req.issue_id).await?;
        if !issue.has_label(&rule.from_label) {
            return Err(CompletionError::Validation(format!(
                "issue #{} is not in '{}' (labels: {})",
                issue.id,
                rule.from_label,
                issue.labels.join(", ")
            )));
        }
        let held = project
            .find_issue(&issue.id.to_string())
            .filter(|slot| slot.role == req.role);

        let mut warnings = Vec::new();
        let ctx = ActionContext {
            tracker: tracker.as_ref(),
            git: services.git.as_ref(),
            project: &project,
            issue_id: issue.id,
        };
        let actions = run_actions(&ctx, &rule.actions).await;
        warnings.extend(actions.warnings.iter().cloned());

        let to_label = if actions.merge_failed {
            match workflow.merge_failed_target(&rule.from_state) {
                Some((_, state)) => state.label.clone(),
                None => {
                    warnings.push(format!(
                        "merge failed but '{}' has no MERGE_FAILED route; continuing to '{}'",
                        rule.from_state, rule.to_label
                    ));
                    rule.to_label.clone()
                }
            }
        } else {
            rule.to_label.clone()
        };

        tracker
            .transition_label(issue.id, &rule.from_label, &to_label)
            .await
            .map_err(|source| CompletionError::Transition {
                issue_id: issue.id,
                from: rule.from_label.clone(),
                to: to_label.clone(),
                source,
            })?;
        info!(
            project = %project.slug,
            issue = issue.id,
            role = %req.role,
            event = %rule.event,
            from = %rule.from_label,
            to = %to_label,
            "issue completed"
        );

        let mut state_degraded = false;
        match &held {
            Some(slot) => {
                if let Err(e) = services
                    .store
                    .deactivate(&project.slug, &slot.role, &slot.level, slot.index)
                    .await
                {
                    let message = format!("slot {} for #{} was not released: {}", slot, issue.id, e);
                    warn!(project = %project.slug, "{}", message);
                    warnings.push(message);
                    state_degraded = true;
                }
            }
            None => {
                let message = format!("no {} slot was holding #{}", req.role, issue.id);
                warn!(project = %project.slug, "{}", message);
                warnings.push(message);
            }
        }

        if let Some(summary) = req.summary.as_deref().filter(|s| !s.trim().is_empty()) {
            let body = format!(
                "**{}** reported `{}`: {}\n\n{} → {}",
                req.role, req.result, summary.trim(), rule.from_label, to_label
            );
            if let Err(e) = tracker.add_comment(issue.id, &body).await {
                let message = format!("summary comment on #{} failed: {}", issue.id, e);
                warn!("{}", message);
                warnings.push(message);
            }
        }

        services.audit.record(
            AuditEvent::new(COMPLETION, &project.slug)
                .issue(issue.id)
                .data(json!({
                    "role": req.role,
                    "level": held.as_ref().map(|s| s.level.clone()),
                    "result": req.result,
                    "event": rule.event,
                    "from": rule.from_label,
                    "to": to_label,
                    "actions": rule.actions,
                    "merged": actions.merged,
                    "mergeFailed": actions.merge_failed,
                    "stateDegraded": state_degraded,
                })),
        );

        let mut chained = Vec::new();
        if services.settings.scheduling.auto_chain {
            let budget = services.settings.scheduling.max_dispatch_per_tick;
            match QueueScanner::new(services.clone())
                .scan(&project.slug, budget)
                .await
            {
                Ok(scan) => {
                    warnings.extend(scan.warnings);
                    chained = scan.dispatched;
                }
                Err(e) => warnings.push(format!("follow-up queue scan failed: {}", e)),
            }
        }

        let announcement = if actions.merge_failed {
            format!(
                "#{} {}: merge failed, sent to {}",
                issue.id, req.role, to_label
            )
        } else {
            format!(
                "#{} {} {}: {} → {}",
                issue.id, req.role, req.result, rule.from_label, to_label
            )
        };

        Ok(CompletionOutcome {
            project: project.slug.clone(),
            issue_id: issue.id,
            role: req.role.clone(),
            event: rule.event,
            from_label: rule.from_label,
            to_label,
            slot: held,
            pr: actions.pr,
            merged: actions.merged,
            merge_failed: actions.merge_failed,
            issue_closed: actions.closed,
            issue_reopened: actions.reopened,
            announcement,
            warnings,
            state_degraded,
            chained,
        })
    }
}
