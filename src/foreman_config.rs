//! `foreman.toml`: the workspace configuration file.
//!
//! Every section is optional; a missing file means all defaults.
//!
//! ```toml
//! agent_id = "main"
//!
//! [roles.developer]
//! levels = ["junior", "medior", "senior"]
//! default_level = "medior"
//! review_policy = "auto"
//! capacity = { medior = 2 }
//!
//! [scheduling]
//! execution = "parallel"
//! max_dispatch_per_tick = 4
//! auto_chain = true
//!
//! [health]
//! stale_after_secs = 7200
//!
//! [timeouts]
//! tracker_secs = 30
//! session_secs = 30
//! delivery_secs = 600
//!
//! [retry]
//! max_retries = 3
//! initial_delay_ms = 500
//! max_delay_ms = 8000
//! failure_threshold = 5
//! cooldown_secs = 60
//!
//! [lock]
//! timeout_ms = 5000
//! poll_ms = 50
//! stale_ms = 30000
//!
//! [tracker]
//! kind = "github"
//! token_env = "GITHUB_TOKEN"
//!
//! [runtime]
//! command = "openclaw"
//! ```
//!
//! A `[workflow]` table replaces the built-in workflow entirely.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::providers::resilience::{BreakerConfig, RetryConfig};
use crate::roles::RoleRegistry;
use crate::state::LockOptions;
use crate::workflow::WorkflowConfig;
use crate::workflow::defaults::default_workflow;

pub const CONFIG_FILE: &str = "foreman.toml";

/// How many roles may work a project at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Every role fills its own slots.
    #[default]
    Parallel,
    /// A role is only dispatched while no other role holds a slot.
    Sequential,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Parallel => write!(f, "parallel"),
            ExecutionMode::Sequential => write!(f, "sequential"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulingSection {
    #[serde(default)]
    pub execution: ExecutionMode,
    #[serde(default = "default_max_dispatch_per_tick")]
    pub max_dispatch_per_tick: usize,
    /// A completion immediately re-runs the queue scan.
    #[serde(default = "default_true")]
    pub auto_chain: bool,
}

fn default_max_dispatch_per_tick() -> usize {
    4
}

fn default_true() -> bool {
    true
}

impl Default for SchedulingSection {
    fn default() -> Self {
        Self {
            execution: ExecutionMode::default(),
            max_dispatch_per_tick: default_max_dispatch_per_tick(),
            auto_chain: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSection {
    /// Age after which an active slot with a dead session counts as a zombie.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

fn default_stale_after_secs() -> u64 {
    2 * 60 * 60
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutsSection {
    #[serde(default = "default_tracker_secs")]
    pub tracker_secs: u64,
    #[serde(default = "default_session_secs")]
    pub session_secs: u64,
    /// Task delivery can take minutes while the session boots.
    #[serde(default = "default_delivery_secs")]
    pub delivery_secs: u64,
}

fn default_tracker_secs() -> u64 {
    30
}

fn default_session_secs() -> u64 {
    30
}

fn default_delivery_secs() -> u64 {
    600
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            tracker_secs: default_tracker_secs(),
            session_secs: default_session_secs(),
            delivery_secs: default_delivery_secs(),
        }
    }
}

impl TimeoutsSection {
    pub fn tracker(&self) -> Duration {
        Duration::from_secs(self.tracker_secs)
    }

    pub fn session(&self) -> Duration {
        Duration::from_secs(self.session_secs)
    }

    pub fn delivery(&self) -> Duration {
        Duration::from_secs(self.delivery_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    8000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_secs() -> u64 {
    60
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

impl RetrySection {
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_multiplier: 2.0,
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            cooldown: Duration::from_secs(self.cooldown_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockSection {
    #[serde(default = "default_lock_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_lock_poll_ms")]
    pub poll_ms: u64,
    #[serde(default = "default_lock_stale_ms")]
    pub stale_ms: u64,
}

fn default_lock_timeout_ms() -> u64 {
    5000
}

fn default_lock_poll_ms() -> u64 {
    50
}

fn default_lock_stale_ms() -> u64 {
    30_000
}

impl Default for LockSection {
    fn default() -> Self {
        Self {
            timeout_ms: default_lock_timeout_ms(),
            poll_ms: default_lock_poll_ms(),
            stale_ms: default_lock_stale_ms(),
        }
    }
}

impl LockSection {
    pub fn options(&self) -> LockOptions {
        LockOptions {
            timeout: Duration::from_millis(self.timeout_ms),
            poll: Duration::from_millis(self.poll_ms),
            stale_after: Duration::from_millis(self.stale_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackerKind {
    #[default]
    Github,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerSection {
    #[serde(default)]
    pub kind: TrackerKind,
    /// Environment variable holding the API token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
}

fn default_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}

impl Default for TrackerSection {
    fn default() -> Self {
        Self {
            kind: TrackerKind::default(),
            token_env: default_token_env(),
            api_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSection {
    #[serde(default = "default_runtime_command")]
    pub command: String,
}

fn default_runtime_command() -> String {
    "openclaw".to_string()
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            command: default_runtime_command(),
        }
    }
}

fn default_agent_id() -> String {
    "main".to_string()
}

/// Parsed `foreman.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForemanToml {
    /// Orchestrating agent; part of every session key.
    #[serde(default = "default_agent_id")]
    pub agent_id: String,
    #[serde(default)]
    pub roles: RoleRegistry,
    #[serde(default)]
    pub scheduling: SchedulingSection,
    #[serde(default)]
    pub health: HealthSection,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub lock: LockSection,
    #[serde(default)]
    pub tracker: TrackerSection,
    #[serde(default)]
    pub runtime: RuntimeSection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<WorkflowConfig>,
}

impl Default for ForemanToml {
    fn default() -> Self {
        Self {
            agent_id: default_agent_id(),
            roles: RoleRegistry::default(),
            scheduling: SchedulingSection::default(),
            health: HealthSection::default(),
            timeouts: TimeoutsSection::default(),
            retry: RetrySection::default(),
            lock: LockSection::default(),
            tracker: TrackerSection::default(),
            runtime: RuntimeSection::default(),
            workflow: None,
        }
    }
}

impl ForemanToml {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parse and validate. The `[workflow]` table is validated while it is
    /// deserialized; the registry is cross-checked against it here.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let parsed: Self =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Load `<dir>/foreman.toml`, or defaults when it does not exist.
    pub fn load_or_default(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))?;
        std::fs::write(path, content).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })
    }

    /// The configured workflow, or the built-in one.
    pub fn workflow(&self) -> WorkflowConfig {
        self.workflow.clone().unwrap_or_else(default_workflow)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent_id.trim().is_empty() {
            return Err(ConfigError::Parse("agent_id must not be empty".to_string()));
        }
        if self.scheduling.max_dispatch_per_tick == 0 {
            return Err(ConfigError::Parse(
                "scheduling.max_dispatch_per_tick must be at least 1".to_string(),
            ));
        }
        self.roles.validate(&self.workflow())
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.health.stale_after_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_file_is_all_defaults() {
        let cfg = ForemanToml::parse("").unwrap();
        assert_eq!(cfg, ForemanToml::default());
        assert_eq!(cfg.agent_id, "main");
        assert_eq!(cfg.health.stale_after_secs, 7200);
        assert_eq!(cfg.scheduling.execution, ExecutionMode::Parallel);
        assert!(cfg.scheduling.auto_chain);
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let cfg = ForemanToml::parse(
            r#"
            agent_id = "ops"
            [scheduling]
            execution = "sequential"
            [timeouts]
            delivery_secs = 30
            "#,
        )
        .unwrap();
        assert_eq!(cfg.agent_id, "ops");
        assert_eq!(cfg.scheduling.execution, ExecutionMode::Sequential);
        assert_eq!(cfg.scheduling.max_dispatch_per_tick, 4);
        assert_eq!(cfg.timeouts.delivery(), Duration::from_secs(30));
        assert_eq!(cfg.timeouts.tracker_secs, 30);
    }

    #[test]
    fn test_roles_section_replaces_registry() {
        let cfg = ForemanToml::parse(
            r#"
            [roles.developer]
            levels = ["junior", "senior"]
            default_level = "junior"
            capacity = { senior = 3 }
            [roles.tester]
            levels = ["medior"]
            default_level = "medior"
            [roles.architect]
            levels = ["senior"]
            default_level = "senior"
            [roles.reviewer]
            levels = ["junior"]
            default_level = "junior"
            "#,
        )
        .unwrap();
        let dev = cfg.roles.role("developer").unwrap();
        assert_eq!(dev.capacity("senior"), 3);
        assert_eq!(dev.capacity("junior"), 1);
    }

    #[test]
    fn test_missing_workflow_role_rejected() {
        let err = ForemanToml::parse(
            r#"
            [roles.developer]
            levels = ["medior"]
            default_level = "medior"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("workflow role 'tester'"));
    }

    #[test]
    fn test_invalid_workflow_table_rejected() {
        let err = ForemanToml::parse(
            r#"
            [workflow]
            initial = "nowhere"
            [workflow.states.done]
            type = "terminal"
            label = "Done"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("initial state 'nowhere'"));
    }

    #[test]
    fn test_zero_dispatch_budget_rejected() {
        let err = ForemanToml::parse("[scheduling]\nmax_dispatch_per_tick = 0\n").unwrap_err();
        assert!(err.to_string().contains("max_dispatch_per_tick"));
    }

    #[test]
    fn test_load_or_default_without_file() {
        let dir = TempDir::new().unwrap();
        assert_eq!(
            ForemanToml::load_or_default(dir.path()).unwrap(),
            ForemanToml::default()
        );
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut cfg = ForemanToml::default();
        cfg.agent_id = "night-shift".to_string();
        cfg.save(&path).unwrap();
        assert_eq!(ForemanToml::load(&path).unwrap(), cfg);
    }

    #[test]
    fn test_lock_and_retry_conversions() {
        let cfg = ForemanToml::default();
        assert_eq!(cfg.lock.options(), LockOptions::default());
        assert_eq!(cfg.retry.retry_config().max_retries, 3);
        assert_eq!(cfg.retry.breaker_config().failure_threshold, 5);
    }
}
