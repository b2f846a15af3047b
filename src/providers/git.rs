//! Local repository sync through the `git` CLI.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use super::RepoSync;
use crate::errors::ProviderError;

const PROVIDER: &str = "git";

pub struct GitCli;

async fn git(repo: &Path, args: &[&str]) -> Result<String, ProviderError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| ProviderError::permanent(PROVIDER, format!("failed to run git: {}", e)))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProviderError::permanent(
            PROVIDER,
            format!("git {} failed: {}", args.join(" "), stderr.trim()),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// URL of the `origin` remote, used to infer the tracker repository.
pub async fn origin_url(repo: &Path) -> Result<String, ProviderError> {
    git(repo, &["remote", "get-url", "origin"]).await
}

#[async_trait]
impl RepoSync for GitCli {
    /// Fast-forward `branch` from origin. Only pulls when the checkout is on
    /// that branch so a worker's feature branch is never touched.
    async fn pull(&self, repo: &Path, branch: &str) -> Result<(), ProviderError> {
        let current = git(repo, &["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        if current != branch {
            tracing::debug!(repo = %repo.display(), current = %current, branch, "skipping pull, not on base branch");
            return Ok(());
        }
        git(repo, &["pull", "--ff-only", "origin", branch])
            .await
            .map(|_| ())
    }
}
