//! Worker-facing commands — `foreman dispatch`, `foreman complete`.

use anyhow::{Context, Result};

use foreman::completion::{CompletionPipeline, CompletionRequest};
use foreman::config::Config;
use foreman::dispatch::{DispatchEngine, DispatchRequest, Dispatched};

use super::print_warnings;

pub async fn cmd_dispatch(
    config: &Config,
    project: &str,
    issue: u64,
    role: &str,
    level: Option<String>,
    no_wait: bool,
) -> Result<()> {
    let services = super::services(config)?;
    let request = DispatchRequest {
        project: project.to_string(),
        issue_id: issue,
        role: role.to_string(),
        level,
    };
    let dispatched = DispatchEngine::new(services)
        .dispatch(&request)
        .await
        .with_context(|| format!("Failed to dispatch #{} to {}", issue, role))?;

    report_dispatch(&dispatched);
    if !no_wait {
        wait_for_delivery(vec![dispatched]).await;
    }
    Ok(())
}

pub async fn cmd_complete(
    config: &Config,
    project: &str,
    issue: u64,
    role: &str,
    result: &str,
    summary: Option<String>,
) -> Result<()> {
    let services = super::services(config)?;
    let request = CompletionRequest {
        project: project.to_string(),
        issue_id: issue,
        role: role.to_string(),
        result: result.to_string(),
        summary,
    };
    let outcome = CompletionPipeline::new(services)
        .complete(&request)
        .await
        .with_context(|| format!("Failed to complete #{} as {} {}", issue, role, result))?;

    println!("{}", outcome.announcement);
    if let Some(pr) = &outcome.pr {
        println!("  pull request #{}: {}", pr.number, pr.url);
    }
    if outcome.state_degraded {
        println!("  state degraded: the slot release was not saved; the health pass will repair it");
    }
    print_warnings(&outcome.warnings);

    for dispatched in &outcome.chained {
        report_dispatch(dispatched);
    }
    wait_for_delivery(outcome.chained).await;
    Ok(())
}

pub(super) fn report_dispatch(dispatched: &Dispatched) {
    let outcome = &dispatched.outcome;
    println!("{}", outcome.announcement);
    println!(
        "  {} → {}  slot {}/{}#{}  level: {}",
        outcome.from_label, outcome.to_label, outcome.role, outcome.level, outcome.slot, outcome.level_reason
    );
    if outcome.state_degraded {
        println!("  state degraded: the slot was not recorded; the health pass will repair it");
    }
    print_warnings(&outcome.warnings);
}

/// Keep the process alive until detached deliveries finish. Failures were
/// already logged and audited by the delivery task.
pub(super) async fn wait_for_delivery(dispatched: Vec<Dispatched>) {
    for d in dispatched {
        let issue = d.outcome.issue_id;
        if let Err(e) = d.delivery.wait().await {
            println!("  delivery of #{} failed: {}", issue, e);
        }
    }
}
