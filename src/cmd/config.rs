//! Workspace setup and configuration commands — `foreman init`, `foreman config`.

use anyhow::{Context, Result};

use foreman::config::Config;
use foreman::foreman_config::ForemanToml;

use super::super::ConfigCommands;

pub fn cmd_init(config: &Config, force: bool) -> Result<()> {
    config.ensure_directories()?;

    if config.config_file.exists() && !force {
        println!(
            "foreman.toml already exists at {}",
            config.config_file.display()
        );
        println!("Pass --force to overwrite it.");
        return Ok(());
    }

    ForemanToml::default()
        .save(&config.config_file)
        .context("Failed to write foreman.toml")?;

    println!("Initialized foreman workspace at {}", config.workspace.display());
    println!();
    println!("  foreman.toml   # roles, capacity, timeouts, workflow");
    println!("  projects.json  # worker slots (created on first project)");
    println!("  log/           # audit trail and daily logs");
    println!();
    println!("Next steps:");
    println!("  1. foreman project add <slug> --repo <path>");
    println!("  2. foreman project labels <slug>");
    println!("  3. foreman run");
    Ok(())
}

pub fn cmd_config(config: &Config, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            let settings = config.load_settings()?;
            println!();
            println!("Foreman Configuration");
            println!("=====================");
            println!();
            if config.config_file.exists() {
                println!("Config file: {}", config.config_file.display());
            } else {
                println!("No foreman.toml at {}; using defaults.", config.config_file.display());
            }
            println!("Workspace:   {}", config.workspace.display());
            println!();

            println!("agent_id = \"{}\"", settings.agent_id);
            println!();
            println!("[roles]");
            for (name, role) in settings.roles.iter() {
                let capacity: Vec<String> = role
                    .levels
                    .iter()
                    .map(|level| format!("{}={}", level, role.capacity(level)))
                    .collect();
                println!(
                    "  {:<10} default={:<7} capacity: {}",
                    name,
                    role.default_level,
                    capacity.join(", ")
                );
            }
            println!();
            println!("[scheduling]");
            println!("  execution = \"{}\"", settings.scheduling.execution);
            println!(
                "  max_dispatch_per_tick = {}",
                settings.scheduling.max_dispatch_per_tick
            );
            println!("  auto_chain = {}", settings.scheduling.auto_chain);
            println!();
            println!("[health]");
            println!("  stale_after_secs = {}", settings.health.stale_after_secs);
            println!();

            let workflow = settings.workflow();
            println!(
                "[workflow] {}",
                if settings.workflow.is_some() {
                    "(configured)"
                } else {
                    "(built-in)"
                }
            );
            for (label, _) in workflow.labels() {
                println!("  {}", label);
            }
            println!();
        }
        Some(ConfigCommands::Validate) => {
            if !config.config_file.exists() {
                println!("No foreman.toml found. Using defaults (valid).");
                return Ok(());
            }
            match ForemanToml::load(&config.config_file) {
                Ok(_) => println!("Configuration is valid."),
                Err(e) => anyhow::bail!("Configuration is invalid: {}", e),
            }
        }
    }

    Ok(())
}
