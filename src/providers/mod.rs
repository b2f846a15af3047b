//! External collaborators: the issue tracker, the worker session runtime and
//! the local git checkout.
//!
//! The engine only ever sees the traits below. Concrete bindings:
//! - [`github::GitHubTracker`]: GitHub REST API
//! - [`runtime::CommandRuntime`]: session runtime driven through a CLI
//! - [`git::GitCli`]: `git` subprocess
//!
//! [`resilience`] wraps any tracker or runtime with per-call timeouts,
//! backoff retry and a circuit breaker.

pub mod git;
pub mod github;
pub mod resilience;
pub mod runtime;

use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::ProviderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueState {
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub id: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub labels: Vec<String>,
    pub state: IssueState,
    #[serde(default)]
    pub url: String,
}

impl Issue {
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub author: String,
    pub body: String,
}

/// Review state of the pull request linked to an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrState {
    Open,
    Approved,
    ChangesRequested,
    Merged,
    /// Closed without merging.
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrStatus {
    pub number: u64,
    pub state: PrState,
    pub url: String,
}

#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// Short provider name for logs and errors.
    fn name(&self) -> &str;

    /// Create the label if missing. Existing labels are left as they are.
    async fn ensure_label(&self, name: &str, color: &str) -> Result<(), ProviderError>;

    async fn create_issue(&self, title: &str, body: &str, label: &str)
    -> Result<Issue, ProviderError>;

    /// Open issues carrying `label`.
    async fn list_issues_by_label(&self, label: &str) -> Result<Vec<Issue>, ProviderError>;

    async fn get_issue(&self, id: u64) -> Result<Issue, ProviderError>;

    async fn list_comments(&self, id: u64) -> Result<Vec<Comment>, ProviderError>;

    /// Replace `from` with `to` on the issue in one call. An issue that
    /// already has `to` and lacks `from` counts as done, so a retry after a
    /// lost reply succeeds. Fails if the issue carries neither.
    async fn transition_label(&self, id: u64, from: &str, to: &str) -> Result<(), ProviderError>;

    async fn add_label(&self, id: u64, label: &str) -> Result<(), ProviderError>;

    /// Removing a label the issue does not carry succeeds.
    async fn remove_label(&self, id: u64, label: &str) -> Result<(), ProviderError>;

    async fn close_issue(&self, id: u64) -> Result<(), ProviderError>;

    async fn reopen_issue(&self, id: u64) -> Result<(), ProviderError>;

    /// `None` when no pull request is linked to the issue.
    async fn get_review_status(&self, id: u64) -> Result<Option<PrStatus>, ProviderError>;

    async fn merge_pr(&self, id: u64) -> Result<(), ProviderError>;

    async fn get_pr_diff(&self, id: u64) -> Result<Option<String>, ProviderError>;

    async fn add_comment(&self, id: u64, body: &str) -> Result<(), ProviderError>;

    async fn health_check(&self) -> Result<(), ProviderError>;
}

/// Runtime hosting long-lived worker sessions.
#[async_trait]
pub trait SessionRuntime: Send + Sync {
    fn name(&self) -> &str;

    /// Make sure a session exists for `key`, configured for `model`.
    async fn ensure_session(&self, key: &str, model: &str) -> Result<(), ProviderError>;

    /// Hand a task to the session. The runtime drops repeats of the same
    /// `idempotency_key`.
    async fn deliver_task(
        &self,
        key: &str,
        payload: &str,
        idempotency_key: &str,
    ) -> Result<(), ProviderError>;

    /// Keys of sessions currently alive.
    async fn list_alive_sessions(&self) -> Result<HashSet<String>, ProviderError>;
}

/// Local repository synchronization after merges.
#[async_trait]
pub trait RepoSync: Send + Sync {
    async fn pull(&self, repo: &Path, branch: &str) -> Result<(), ProviderError>;
}
