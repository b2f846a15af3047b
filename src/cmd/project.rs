//! Project registration and tracker setup — `foreman project`.

use anyhow::{Context, Result};

use foreman::config::Config;
use foreman::providers::git::origin_url;
use foreman::providers::github::parse_owner_repo;
use foreman::state::Project;

use super::super::ProjectCommands;

pub async fn cmd_project(config: &Config, command: ProjectCommands) -> Result<()> {
    let services = super::services(config)?;

    match command {
        ProjectCommands::Add {
            slug,
            repo,
            remote,
            name,
            base_branch,
            channels,
        } => {
            let remote = match remote {
                Some(remote) => Some(remote),
                None => match origin_url(&repo).await {
                    Ok(url) => parse_owner_repo(&url),
                    Err(e) => {
                        tracing::debug!("no origin remote for {}: {}", repo.display(), e);
                        None
                    }
                },
            };

            let mut project = Project::new(&slug, &repo.to_string_lossy(), &base_branch);
            project.name = name.unwrap_or_else(|| slug.clone());
            project.remote = remote;
            project.channels = channels;

            let roles: Vec<(String, _)> = services
                .roles()
                .iter()
                .map(|(role, cfg)| (role.to_string(), cfg.desired_slots()))
                .collect();
            let slug_for_store = slug.clone();
            services
                .store
                .call(move |s| {
                    s.register_project(project)?;
                    for (role, desired) in &roles {
                        s.reconcile_slots(&slug_for_store, role, desired)?;
                    }
                    Ok(())
                })
                .await
                .context("Failed to register project")?;

            let project = services.store.project(&slug).await?;
            println!("Registered project '{}'", project.slug);
            println!("  repo:   {}", project.repo);
            match &project.remote {
                Some(remote) => println!("  remote: {}", remote),
                None => println!("  remote: none (pass --remote owner/name before dispatching)"),
            }
            for (role, state) in &project.workers {
                let sizes: Vec<String> = state
                    .levels
                    .iter()
                    .map(|(level, slots)| format!("{}={}", level, slots.len()))
                    .collect();
                println!("  {:<10} {}", role, sizes.join(", "));
            }
            Ok(())
        }
        ProjectCommands::List => {
            let data = services.store.read().await?;
            if data.projects.is_empty() {
                println!("No projects registered. Use 'foreman project add'.");
                return Ok(());
            }
            for project in data.projects.values() {
                println!(
                    "{:<16} {:<24} {} ({})",
                    project.slug,
                    project.remote.as_deref().unwrap_or("-"),
                    project.repo,
                    project.base_branch
                );
            }
            Ok(())
        }
        ProjectCommands::Labels { slug } => {
            let project = services.store.project(&slug).await?;
            let tracker = services.tracker(&project)?;

            let (ensured, failed) = services.ensure_labels(tracker.as_ref()).await;
            for (label, e) in &failed {
                println!("  failed: {} ({})", label, e);
            }
            println!(
                "Ensured {} labels in {} ({} failed)",
                ensured,
                project.remote.as_deref().unwrap_or(&project.slug),
                failed.len()
            );
            if !failed.is_empty() {
                anyhow::bail!("{} labels could not be created", failed.len());
            }
            Ok(())
        }
    }
}
