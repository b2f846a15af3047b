//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled                          |
//! |-----------|-------------------------------------------|
//! | `config`  | `Init`, `Config`                          |
//! | `project` | `Project`                                 |
//! | `state`   | `Status`, `Migrate`, `Audit`              |
//! | `work`    | `Dispatch`, `Complete`                    |
//! | `run`     | `Review`, `Health`, `Tick`, `Run`         |

pub mod config;
pub mod project;
pub mod run;
pub mod state;
pub mod work;

use anyhow::Result;
use foreman::config::Config;
use foreman::services::Services;

pub use config::{cmd_config, cmd_init};
pub use project::cmd_project;
pub use run::{cmd_health, cmd_review, cmd_run, cmd_tick};
pub use state::{cmd_audit, cmd_migrate, cmd_status};
pub use work::{cmd_complete, cmd_dispatch};

/// Load settings and wire the engine for commands that touch projects.
fn services(config: &Config) -> Result<Services> {
    config.ensure_directories()?;
    let settings = config.load_settings()?;
    Ok(Services::new(config, settings))
}

/// Registered project slugs, or just `only` when given.
async fn project_slugs(services: &Services, only: Option<&str>) -> Result<Vec<String>> {
    if let Some(slug) = only {
        return Ok(vec![slug.to_string()]);
    }
    let data = services.store.read().await?;
    Ok(data.projects.into_keys().collect())
}

fn print_warnings(warnings: &[String]) {
    for warning in warnings {
        println!("  warning: {}", warning);
    }
}
