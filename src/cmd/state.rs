//! State inspection and maintenance — `foreman status`, `foreman migrate`, `foreman audit`.

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;

use foreman::audit::{AuditEvent, AuditSink, JsonlAuditLog, MIGRATION};
use foreman::config::Config;
use foreman::state::migration::migrate_document;
use foreman::state::{ProjectsData, WorkerStateStore, lock};

pub fn cmd_status(config: &Config, only: Option<&str>, json: bool) -> Result<()> {
    let settings = config.load_settings()?;
    let store = WorkerStateStore::new(config.state_file.clone(), settings.lock.options());
    let mut data = store.read()?;
    if let Some(slug) = only {
        data.projects.retain(|key, _| key == slug);
        if data.projects.is_empty() {
            anyhow::bail!("Project '{}' not found", slug);
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }
    if data.projects.is_empty() {
        println!("No projects registered. Use 'foreman project add'.");
        return Ok(());
    }

    let now = Utc::now();
    for project in data.projects.values() {
        println!();
        println!(
            "{} ({})",
            project.name,
            project.remote.as_deref().unwrap_or(&project.slug)
        );
        for (role, state) in &project.workers {
            for (level, slots) in &state.levels {
                for (index, slot) in slots.iter().enumerate() {
                    let status = if slot.active {
                        let age = slot
                            .start_time
                            .map(|t| format!("{}m", now.signed_duration_since(t).num_minutes()))
                            .unwrap_or_else(|| "?".to_string());
                        format!(
                            "#{} for {} (from {})",
                            slot.issue_id.as_deref().unwrap_or("?"),
                            age,
                            slot.previous_label.as_deref().unwrap_or("?")
                        )
                    } else {
                        "idle".to_string()
                    };
                    println!("  {:<10} {:<7} {}  {}", role, level, index, status);
                }
            }
        }
    }
    println!();
    Ok(())
}

pub fn cmd_migrate(config: &Config, dry_run: bool) -> Result<()> {
    if !config.state_file.exists() {
        println!("No state file at {}; nothing to migrate.", config.state_file.display());
        return Ok(());
    }
    let text = std::fs::read_to_string(&config.state_file)
        .with_context(|| format!("Failed to read {}", config.state_file.display()))?;
    let (data, report): (ProjectsData, _) =
        migrate_document(&text).context("State file is not valid JSON")?;

    if report.is_empty() {
        println!("State is already in the current format.");
    } else {
        println!("Migrated roles: {}", report.migrated_roles.join(", "));
    }
    if dry_run {
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    let settings = config.load_settings()?;
    let store = WorkerStateStore::new(config.state_file.clone(), settings.lock.options());
    {
        let _guard = lock::acquire(&config.lock_file, &settings.lock.options())?;
        store.write(&data)?;
    }
    JsonlAuditLog::new(&config.log_dir).record(
        AuditEvent::new(MIGRATION, "*").data(json!({
            "migratedRoles": report.migrated_roles,
        })),
    );
    println!("Wrote {}", config.state_file.display());
    Ok(())
}

pub fn cmd_audit(config: &Config, limit: usize) -> Result<()> {
    let log = JsonlAuditLog::new(&config.log_dir);
    let events = log.recent(limit)?;
    if events.is_empty() {
        println!("No audit events in {}", log.path().display());
        return Ok(());
    }
    for event in events {
        println!("{}", serde_json::to_string(&event)?);
    }
    Ok(())
}
