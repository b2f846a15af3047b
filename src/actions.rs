//! Executes the side effects attached to a workflow transition.
//!
//! Shared by the completion pipeline and the review poller. Every action is
//! best-effort: failures become warnings on the [`ActionReport`]. A failed
//! merge is the one failure with a routing consequence: it stops the
//! remaining actions and sets `merge_failed`, and the caller takes the
//! state's `MERGE_FAILED` route instead of the original target.

use std::path::Path;

use tracing::{debug, warn};

use crate::providers::{IssueTracker, PrStatus, RepoSync};
use crate::state::Project;
use crate::workflow::Action;

pub struct ActionContext<'a> {
    pub tracker: &'a dyn IssueTracker,
    pub git: &'a dyn RepoSync,
    pub project: &'a Project,
    pub issue_id: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionReport {
    pub pr: Option<PrStatus>,
    pub pulled: bool,
    pub merged: bool,
    pub merge_failed: bool,
    pub closed: bool,
    pub reopened: bool,
    pub warnings: Vec<String>,
}

impl ActionReport {
    fn warn(&mut self, message: String) {
        warn!("{}", message);
        self.warnings.push(message);
    }
}

pub async fn run_actions(ctx: &ActionContext<'_>, actions: &[Action]) -> ActionReport {
    let mut report = ActionReport::default();
    let id = ctx.issue_id;

    for action in actions {
        debug!(project = %ctx.project.slug, issue = id, %action, "running action");
        match action {
            Action::GitPull => {
                let repo = Path::new(&ctx.project.repo);
                match ctx.git.pull(repo, &ctx.project.base_branch).await {
                    Ok(()) => report.pulled = true,
                    Err(e) => report.warn(format!("git pull in {} failed: {}", ctx.project.repo, e)),
                }
            }
            Action::DetectPr => match ctx.tracker.get_review_status(id).await {
                Ok(pr) => report.pr = pr,
                Err(e) => report.warn(format!("could not look up pull request for #{}: {}", id, e)),
            },
            Action::MergePr => match ctx.tracker.merge_pr(id).await {
                Ok(()) => report.merged = true,
                Err(e) => {
                    report.merge_failed = true;
                    report.warn(format!("merge for #{} failed: {}", id, e));
                    break;
                }
            },
            Action::CloseIssue => match ctx.tracker.close_issue(id).await {
                Ok(()) => report.closed = true,
                Err(e) => report.warn(format!("closing #{} failed: {}", id, e)),
            },
            Action::ReopenIssue => match ctx.tracker.reopen_issue(id).await {
                Ok(()) => report.reopened = true,
                Err(e) => report.warn(format!("reopening #{} failed: {}", id, e)),
            },
        }
    }

    report
}
