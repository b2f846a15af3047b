//! Role and level registry.
//!
//! Roles (developer, tester, ...) and levels (junior, medior, senior) arrive
//! as free-form strings from the CLI and from issue labels. They are checked
//! against this registry at the boundary; past it, an unknown role or level
//! is a bug, not an input.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::workflow::WorkflowConfig;

/// Label marking an issue for human review of its pull request.
pub const REVIEW_HUMAN_LABEL: &str = "review:human";
/// Label marking an issue for review by a reviewer worker.
pub const REVIEW_AGENT_LABEL: &str = "review:agent";

/// Who reviews the pull request a role produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewPolicy {
    Human,
    Agent,
    /// Senior work goes to a human, everything else to a reviewer worker.
    #[default]
    Auto,
}

/// Resolved routing for one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewRoute {
    Human,
    Agent,
}

impl ReviewRoute {
    pub fn label(self) -> &'static str {
        match self {
            ReviewRoute::Human => REVIEW_HUMAN_LABEL,
            ReviewRoute::Agent => REVIEW_AGENT_LABEL,
        }
    }
}

/// Per-role settings from `[roles.<name>]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleConfig {
    pub levels: Vec<String>,
    pub default_level: String,
    /// Max concurrent workers per level. Missing levels get one slot.
    #[serde(default)]
    pub capacity: BTreeMap<String, usize>,
    /// Model handed to the session runtime per level. Missing levels use the level name.
    #[serde(default)]
    pub models: BTreeMap<String, String>,
    /// Set for roles whose output is a pull request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_policy: Option<ReviewPolicy>,
}

impl RoleConfig {
    fn new(levels: &[&str], default_level: &str, review_policy: Option<ReviewPolicy>) -> Self {
        Self {
            levels: levels.iter().map(|l| l.to_string()).collect(),
            default_level: default_level.to_string(),
            capacity: BTreeMap::new(),
            models: BTreeMap::new(),
            review_policy,
        }
    }

    pub fn has_level(&self, level: &str) -> bool {
        self.levels.iter().any(|l| l == level)
    }

    pub fn capacity(&self, level: &str) -> usize {
        self.capacity.get(level).copied().unwrap_or(1)
    }

    pub fn model(&self, level: &str) -> String {
        self.models
            .get(level)
            .cloned()
            .unwrap_or_else(|| level.to_string())
    }

    /// Desired slot count per level, for capacity reconciliation.
    pub fn desired_slots(&self) -> BTreeMap<String, usize> {
        self.levels
            .iter()
            .map(|l| (l.clone(), self.capacity(l)))
            .collect()
    }

    /// The highest declared level (last in declaration order).
    fn top_level(&self) -> Option<&str> {
        self.levels.last().map(String::as_str)
    }
}

/// Registry of every role the engine knows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleRegistry {
    roles: BTreeMap<String, RoleConfig>,
}

impl Default for RoleRegistry {
    fn default() -> Self {
        let mut roles = BTreeMap::new();
        roles.insert(
            "developer".to_string(),
            RoleConfig::new(
                &["junior", "medior", "senior"],
                "medior",
                Some(ReviewPolicy::Auto),
            ),
        );
        roles.insert(
            "tester".to_string(),
            RoleConfig::new(&["junior", "medior", "senior"], "medior", None),
        );
        roles.insert(
            "architect".to_string(),
            RoleConfig::new(&["junior", "senior"], "senior", None),
        );
        roles.insert(
            "reviewer".to_string(),
            RoleConfig::new(&["junior", "senior"], "junior", None),
        );
        Self { roles }
    }
}

impl RoleRegistry {
    pub fn new(roles: BTreeMap<String, RoleConfig>) -> Self {
        Self { roles }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.roles.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RoleConfig)> {
        self.roles.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn role(&self, role: &str) -> Result<&RoleConfig, ConfigError> {
        self.roles
            .get(role)
            .ok_or_else(|| ConfigError::UnknownRole(role.to_string()))
    }

    /// Reject a (role, level) pair the registry does not declare.
    pub fn check_level(&self, role: &str, level: &str) -> Result<&RoleConfig, ConfigError> {
        let cfg = self.role(role)?;
        if cfg.has_level(level) {
            Ok(cfg)
        } else {
            Err(ConfigError::UnknownLevel {
                role: role.to_string(),
                level: level.to_string(),
            })
        }
    }

    /// Review routing for work produced by `role` at `level`, if the role has a policy.
    pub fn review_route(&self, role: &str, level: &str) -> Option<ReviewRoute> {
        let cfg = self.roles.get(role)?;
        match cfg.review_policy? {
            ReviewPolicy::Human => Some(ReviewRoute::Human),
            ReviewPolicy::Agent => Some(ReviewRoute::Agent),
            ReviewPolicy::Auto if cfg.top_level() == Some(level) => Some(ReviewRoute::Human),
            ReviewPolicy::Auto => Some(ReviewRoute::Agent),
        }
    }

    /// Registry consistency plus cross-checks against the workflow.
    pub fn validate(&self, workflow: &WorkflowConfig) -> Result<(), ConfigError> {
        let mut problems = Vec::new();
        for (name, cfg) in &self.roles {
            if cfg.levels.is_empty() {
                problems.push(format!("role '{}' declares no levels", name));
            }
            if !cfg.has_level(&cfg.default_level) {
                problems.push(format!(
                    "role '{}' default_level '{}' is not one of its levels",
                    name, cfg.default_level
                ));
            }
            for level in cfg.capacity.keys().chain(cfg.models.keys()) {
                if !cfg.has_level(level) {
                    problems.push(format!("role '{}' configures unknown level '{}'", name, level));
                }
            }
        }
        for role in workflow.roles() {
            if !self.roles.contains_key(role) {
                problems.push(format!("workflow role '{}' is not in [roles]", role));
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::InvalidRegistry(problems.join("; ")))
        }
    }
}

/// Ownership marker put on an issue when it is dispatched.
pub fn owner_label(role: &str, level: &str) -> String {
    format!("{}:{}", role, level)
}

/// Parse an ownership marker back into (role, level).
pub fn parse_owner_label(label: &str) -> Option<(&str, &str)> {
    let (role, level) = label.split_once(':')?;
    if role.is_empty() || level.is_empty() || role == "review" {
        return None;
    }
    Some((role, level))
}

/// Deterministic session key for a worker slot.
///
/// The same (agent, project, role, level, slot) always yields the same key, so
/// a repeated dispatch lands on the session that already holds the context.
pub fn session_key(agent_id: &str, project: &str, role: &str, level: &str, slot: usize) -> String {
    let base = format!("agent:{}:subagent:{}-{}-{}", agent_id, project, role, level);
    if slot == 0 {
        base
    } else {
        format!("{}-{}", base, slot)
    }
}

const SENIOR_KEYWORDS: &[&str] = &[
    "architecture",
    "refactor",
    "migration",
    "security",
    "redesign",
    "performance",
];

const JUNIOR_KEYWORDS: &[&str] = &[
    "typo",
    "docs",
    "documentation",
    "rename",
    "readme",
    "lint",
    "copy",
];

/// Why a level was chosen, for the `level_selection` audit event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelSelection {
    pub level: String,
    pub reason: String,
}

/// Pick the level for an issue.
///
/// Order: explicit request → existing `<role>:<level>` marker on the issue →
/// keyword heuristic over title and body → the role's default.
pub fn select_level(
    registry: &RoleRegistry,
    role: &str,
    explicit: Option<&str>,
    title: &str,
    body: &str,
    labels: &[String],
) -> Result<LevelSelection, ConfigError> {
    let cfg = registry.role(role)?;

    if let Some(level) = explicit {
        registry.check_level(role, level)?;
        return Ok(LevelSelection {
            level: level.to_string(),
            reason: "requested explicitly".to_string(),
        });
    }

    for label in labels {
        if let Some((r, level)) = parse_owner_label(label)
            && r == role
            && cfg.has_level(level)
        {
            return Ok(LevelSelection {
                level: level.to_string(),
                reason: format!("issue carries '{}'", label),
            });
        }
    }

    let text = format!("{} {}", title, body).to_lowercase();
    let words: Vec<&str> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let hit = |keywords: &[&'static str]| keywords.iter().find(|k| words.contains(*k)).copied();

    if let Some(keyword) = hit(SENIOR_KEYWORDS)
        && let Some(level) = cfg.top_level()
    {
        return Ok(LevelSelection {
            level: level.to_string(),
            reason: format!("keyword '{}'", keyword),
        });
    }
    if let Some(keyword) = hit(JUNIOR_KEYWORDS)
        && let Some(level) = cfg.levels.first()
    {
        return Ok(LevelSelection {
            level: level.clone(),
            reason: format!("keyword '{}'", keyword),
        });
    }

    Ok(LevelSelection {
        level: cfg.default_level.clone(),
        reason: "role default".to_string(),
    })
}
