use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use foreman::config::Config;

mod cmd;

#[derive(Parser)]
#[command(name = "foreman")]
#[command(version, about = "Workflow-driven dispatch and completion engine for worker agents")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Workspace directory holding projects.json and foreman.toml
    /// (defaults to $FOREMAN_WORKSPACE, then ~/.foreman)
    #[arg(long, global = true)]
    pub workspace: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the workspace and a default foreman.toml
    Init {
        /// Overwrite an existing foreman.toml
        #[arg(long)]
        force: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Register projects and prepare their trackers
    Project {
        #[command(subcommand)]
        command: ProjectCommands,
    },
    /// Show worker slots per project
    Status {
        /// Only this project
        project: Option<String>,
        /// Print the raw state as JSON
        #[arg(long)]
        json: bool,
    },
    /// Hand one issue to a worker
    Dispatch {
        project: String,
        issue: u64,
        #[arg(short, long)]
        role: String,
        /// Worker level; chosen from the issue when omitted
        #[arg(short, long)]
        level: Option<String>,
        /// Return without waiting for the task delivery
        #[arg(long)]
        no_wait: bool,
    },
    /// Report a worker's result and move the issue on
    Complete {
        project: String,
        issue: u64,
        #[arg(short, long)]
        role: String,
        /// Result keyword, e.g. done, pass, fail, approve, reject, blocked
        #[arg(long)]
        result: String,
        /// Summary posted to the issue as a comment
        #[arg(short, long)]
        summary: Option<String>,
    },
    /// Advance review-state issues from their pull request status
    Review {
        project: Option<String>,
    },
    /// Find dead worker sessions and release their slots
    Health {
        project: Option<String>,
        /// Revert zombie issues and free their slots (report only otherwise)
        #[arg(long)]
        fix: bool,
    },
    /// Run one heartbeat tick over all projects
    Tick {
        project: Option<String>,
    },
    /// Run heartbeat ticks until interrupted
    Run {
        /// Seconds between ticks
        #[arg(short, long, default_value = "60")]
        interval: u64,
    },
    /// Rewrite projects.json in the current format
    Migrate {
        /// Show what would change without writing
        #[arg(long)]
        dry_run: bool,
    },
    /// Show recent audit events
    Audit {
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration
    Validate,
}

#[derive(Subcommand, Clone)]
pub enum ProjectCommands {
    /// Register a project
    Add {
        slug: String,
        /// Local clone of the repository
        #[arg(long)]
        repo: PathBuf,
        /// Tracker repository as owner/name; read from the clone's origin when omitted
        #[arg(long)]
        remote: Option<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value = "main")]
        base_branch: String,
        /// Notification channel id (repeatable)
        #[arg(long = "channel")]
        channels: Vec<String>,
    },
    /// List registered projects
    List,
    /// Create every workflow label in the project's tracker
    Labels { slug: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let config = Config::new(cli.workspace.clone(), cli.verbose)?;
    let log_dir = config.log_dir.is_dir().then_some(config.log_dir.as_path());
    let _log_guard = foreman::logging::init(cli.verbose, log_dir);

    match &cli.command {
        Commands::Init { force } => cmd::cmd_init(&config, *force)?,
        Commands::Config { command } => cmd::cmd_config(&config, command.clone())?,
        Commands::Project { command } => cmd::cmd_project(&config, command.clone()).await?,
        Commands::Status { project, json } => cmd::cmd_status(&config, project.as_deref(), *json)?,
        Commands::Dispatch {
            project,
            issue,
            role,
            level,
            no_wait,
        } => {
            cmd::cmd_dispatch(&config, project, *issue, role, level.clone(), *no_wait).await?;
        }
        Commands::Complete {
            project,
            issue,
            role,
            result,
            summary,
        } => {
            cmd::cmd_complete(&config, project, *issue, role, result, summary.clone()).await?;
        }
        Commands::Review { project } => cmd::cmd_review(&config, project.as_deref()).await?,
        Commands::Health { project, fix } => {
            cmd::cmd_health(&config, project.as_deref(), *fix).await?
        }
        Commands::Tick { project } => cmd::cmd_tick(&config, project.as_deref()).await?,
        Commands::Run { interval } => cmd::cmd_run(&config, *interval).await?,
        Commands::Migrate { dry_run } => cmd::cmd_migrate(&config, *dry_run)?,
        Commands::Audit { limit } => cmd::cmd_audit(&config, *limit)?,
    }

    Ok(())
}
