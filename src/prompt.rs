//! Task payload handed to a worker session.

use std::fmt::Write;

use crate::providers::{Comment, Issue, PrStatus};

/// Comments older than this many are left out of the payload.
const MAX_COMMENTS: usize = 10;
/// Diffs are cut at this many bytes (on a char boundary).
const MAX_DIFF_BYTES: usize = 20_000;

/// Everything that goes into one task message.
pub struct TaskContext<'a> {
    pub project: &'a str,
    pub repo: &'a str,
    pub base_branch: &'a str,
    pub issue: &'a Issue,
    pub role: &'a str,
    pub level: &'a str,
    pub comments: &'a [Comment],
    pub pr: Option<&'a PrStatus>,
    pub diff: Option<&'a str>,
    /// Results the worker may report, `done` first.
    pub valid_results: &'a [String],
}

fn truncate(text: &str, max: usize) -> (&str, bool) {
    if text.len() <= max {
        return (text, false);
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    (&text[..end], true)
}

pub fn build_payload(ctx: &TaskContext<'_>) -> String {
    let issue = ctx.issue;
    let mut out = String::new();

    let _ = writeln!(
        out,
        "# {} task: #{} {}",
        ctx.role.to_uppercase(),
        issue.id,
        issue.title
    );
    let _ = writeln!(out);
    let _ = writeln!(out, "- Project: {}", ctx.project);
    let _ = writeln!(out, "- Repository: {}", ctx.repo);
    let _ = writeln!(out, "- Base branch: {}", ctx.base_branch);
    let _ = writeln!(out, "- Level: {}", ctx.level);
    if !issue.url.is_empty() {
        let _ = writeln!(out, "- Issue: {}", issue.url);
    }

    let _ = writeln!(out, "\n## Description\n");
    if issue.body.trim().is_empty() {
        let _ = writeln!(out, "(no description)");
    } else {
        let _ = writeln!(out, "{}", issue.body.trim());
    }

    if !ctx.comments.is_empty() {
        let _ = writeln!(out, "\n## Recent comments\n");
        let skip = ctx.comments.len().saturating_sub(MAX_COMMENTS);
        for comment in &ctx.comments[skip..] {
            let _ = writeln!(out, "**{}**: {}\n", comment.author, comment.body.trim());
        }
    }

    if let Some(pr) = ctx.pr {
        let _ = writeln!(out, "\n## Pull request\n");
        let _ = writeln!(out, "#{} ({:?}): {}", pr.number, pr.state, pr.url);
    }

    if let Some(diff) = ctx.diff {
        let (shown, cut) = truncate(diff, MAX_DIFF_BYTES);
        let _ = writeln!(out, "\n## Diff\n\n```diff\n{}\n```", shown.trim_end());
        if cut {
            let _ = writeln!(out, "(diff truncated at {} bytes)", MAX_DIFF_BYTES);
        }
    }

    let _ = writeln!(out, "\n## Completion contract\n");
    let _ = writeln!(
        out,
        "When you stop working on this issue, for any reason, report exactly once:\n"
    );
    let _ = writeln!(
        out,
        "    foreman complete {} {} --role {} --result <RESULT> --summary \"<one paragraph>\"\n",
        ctx.project, issue.id, ctx.role
    );
    let _ = writeln!(out, "Valid results: {}.", ctx.valid_results.join(", "));
    let _ = writeln!(
        out,
        "Always report, even if you failed or got stuck: use `blocked` when you cannot finish. \
         An unreported task keeps its slot busy until the health check reclaims it."
    );

    out
}
