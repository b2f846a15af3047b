//! Maintenance passes — `foreman review`, `foreman health`, `foreman tick`, `foreman run`.

use std::time::Duration;

use anyhow::Result;

use foreman::config::Config;
use foreman::health::{FindingKind, HealthReconciler};
use foreman::heartbeat::Heartbeat;
use foreman::review::ReviewPoller;

use super::work::{report_dispatch, wait_for_delivery};
use super::{print_warnings, project_slugs};

pub async fn cmd_review(config: &Config, project: Option<&str>) -> Result<()> {
    let services = super::services(config)?;
    let poller = ReviewPoller::new(services.clone());

    for slug in project_slugs(&services, project).await? {
        let report = poller.poll(&slug).await?;
        println!("{}: {} review transitions", slug, report.transitions());
        for m in &report.moves {
            let note = if m.merge_failed {
                " (merge failed)"
            } else if m.merged {
                " (merged)"
            } else {
                ""
            };
            println!(
                "  #{} {}: {} → {}{}",
                m.issue_id, m.event, m.from_label, m.to_label, note
            );
        }
        print_warnings(&report.warnings);
    }
    Ok(())
}

pub async fn cmd_health(config: &Config, project: Option<&str>, fix: bool) -> Result<()> {
    let services = super::services(config)?;
    let reconciler = HealthReconciler::new(services.clone());

    for slug in project_slugs(&services, project).await? {
        let report = reconciler.check(&slug, fix).await?;
        if let Some(reason) = &report.skipped {
            println!("{}: zombie check skipped ({})", slug, reason);
        }
        if report.findings.is_empty() && report.skipped.is_none() {
            println!("{}: healthy", slug);
        }
        for finding in &report.findings {
            let what = match finding.kind {
                FindingKind::Corrupt => "corrupt".to_string(),
                FindingKind::Zombie | FindingKind::Orphan => format!(
                    "{} #{} → {}",
                    if finding.kind == FindingKind::Zombie { "zombie" } else { "orphan" },
                    finding.issue_id.as_deref().unwrap_or("?"),
                    finding.revert_to.as_deref().unwrap_or("?")
                ),
            };
            let status = if finding.fixed {
                "fixed"
            } else if fix {
                "not fixed"
            } else {
                "found"
            };
            println!("{}: {} {} [{}]", slug, finding.location(), what, status);
        }
        print_warnings(&report.warnings);
    }
    if !fix {
        println!("Report only; pass --fix to repair.");
    }
    Ok(())
}

pub async fn cmd_tick(config: &Config, project: Option<&str>) -> Result<()> {
    let services = super::services(config)?;
    let heartbeat = Heartbeat::new(services.clone());

    let mut dispatched = Vec::new();
    for slug in project_slugs(&services, project).await? {
        let mut report = heartbeat.tick(&slug).await;
        println!("{}", report.summary());
        for d in report.dispatched() {
            report_dispatch(d);
        }
        let warnings: Vec<String> = report.all_warnings().into_iter().map(String::from).collect();
        print_warnings(&warnings);
        if let Some(scan) = report.scan.take() {
            dispatched.extend(scan.dispatched);
        }
    }
    wait_for_delivery(dispatched).await;
    Ok(())
}

pub async fn cmd_run(config: &Config, interval: u64) -> Result<()> {
    let services = super::services(config)?;
    let interval = Duration::from_secs(interval.max(1));
    println!(
        "Foreman running every {}s over {} (Ctrl+C to stop)",
        interval.as_secs(),
        config.workspace.display()
    );

    let ticks = Heartbeat::new(services)
        .run_until(interval, shutdown_signal())
        .await;
    println!("Stopped after {} ticks.", ticks);
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    println!("\nShutting down...");
}
