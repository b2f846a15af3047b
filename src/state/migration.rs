//! Read-side migration of older state documents.
//!
//! Three role shapes have existed:
//!
//! 1. flat: one worker per role, `{ active, issueId, level, sessions: { level: key }, ... }`
//!    (older still: `model` or `tier` instead of `level`, roles named `dev`/`qa`
//!    directly on the project)
//! 2. per-level: `{ levels: { level: { active, issueId, sessionKey, ... } } }`
//! 3. current: `{ levels: { level: [slot, ...] } }`
//!
//! Every shape is accepted on read and normalized to the current one. The
//! next write persists the normalized form; nothing is rewritten eagerly.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::{Project, ProjectsData, RoleWorkerState, Slot, de_opt_id, de_opt_time};

/// Level assumed for a flat worker that never recorded one.
pub const LEGACY_DEFAULT_LEVEL: &str = "medior";

/// Role keys that older documents stored directly on the project.
const LEGACY_ROLE_KEYS: &[(&str, &str)] = &[
    ("dev", "developer"),
    ("qa", "tester"),
    ("developer", "developer"),
    ("tester", "tester"),
    ("architect", "architect"),
    ("reviewer", "reviewer"),
];

/// Model names that older documents used in place of levels.
const LEGACY_MODEL_LEVELS: &[(&str, &str)] = &[
    ("haiku", "junior"),
    ("sonnet", "medior"),
    ("opus", "senior"),
];

/// What the migration had to do, for logging.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub migrated_roles: Vec<String>,
}

impl MigrationReport {
    pub fn is_empty(&self) -> bool {
        self.migrated_roles.is_empty()
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LevelShape {
    Slots(Vec<Slot>),
    Single(Slot),
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoleShape {
    #[serde(default)]
    levels: Option<BTreeMap<String, LevelShape>>,

    // Flat fields.
    #[serde(default)]
    active: bool,
    #[serde(default, deserialize_with = "de_opt_id")]
    issue_id: Option<String>,
    #[serde(default, alias = "model", alias = "tier")]
    level: Option<String>,
    #[serde(default)]
    sessions: BTreeMap<String, Option<String>>,
    #[serde(default)]
    session_key: Option<String>,
    #[serde(default, deserialize_with = "de_opt_time")]
    start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    previous_label: Option<String>,
    #[serde(default)]
    task_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectShape {
    #[serde(default)]
    slug: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    repo: Option<String>,
    #[serde(default)]
    remote: Option<String>,
    #[serde(default)]
    base_branch: Option<String>,
    #[serde(default)]
    channels: Vec<serde_json::Value>,
    #[serde(default)]
    workers: Option<BTreeMap<String, RoleShape>>,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct DocumentShape {
    #[serde(default)]
    projects: BTreeMap<String, ProjectShape>,
}

fn normalize_level(level: &str) -> String {
    LEGACY_MODEL_LEVELS
        .iter()
        .find(|(model, _)| level.eq_ignore_ascii_case(model))
        .map(|(_, l)| l.to_string())
        .unwrap_or_else(|| level.to_string())
}

/// Returns the role state and whether it was in an older shape.
fn migrate_role(shape: RoleShape) -> (RoleWorkerState, bool) {
    if let Some(levels) = shape.levels {
        let mut legacy = false;
        let levels = levels
            .into_iter()
            .map(|(level, slots)| match slots {
                LevelShape::Slots(slots) => (level, slots),
                LevelShape::Single(slot) => {
                    legacy = true;
                    (level, vec![slot])
                }
            })
            .collect();
        return (RoleWorkerState { levels }, legacy);
    }

    let mut levels: BTreeMap<String, Vec<Slot>> = BTreeMap::new();
    for (level, key) in shape.sessions {
        let key = key.filter(|k| !k.is_empty());
        levels.entry(normalize_level(&level)).or_insert_with(|| {
            vec![Slot {
                session_key: key,
                ..Slot::default()
            }]
        });
    }

    let holds_work = shape.active || shape.issue_id.is_some();
    if holds_work || shape.session_key.is_some() {
        let level = shape
            .level
            .as_deref()
            .map(normalize_level)
            .unwrap_or_else(|| LEGACY_DEFAULT_LEVEL.to_string());
        let slots = levels.entry(level).or_insert_with(|| vec![Slot::default()]);
        let slot = &mut slots[0];
        slot.active = shape.active;
        slot.issue_id = shape.issue_id;
        slot.start_time = shape.start_time;
        slot.previous_label = shape.previous_label;
        slot.task_count = shape.task_count;
        if shape.session_key.is_some() {
            slot.session_key = shape.session_key;
        }
    }

    (RoleWorkerState { levels }, true)
}

fn channel_id(value: serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Object(map) => {
            let kind = map.get("channel").and_then(|v| v.as_str());
            let id = map
                .get("channelId")
                .or_else(|| map.get("id"))
                .map(|v| match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })?;
            Some(match kind {
                Some(kind) => format!("{}:{}", kind, id),
                None => id,
            })
        }
        _ => None,
    }
}

fn migrate_project(key: &str, shape: ProjectShape, report: &mut MigrationReport) -> Project {
    let slug = shape.slug.unwrap_or_else(|| key.to_string());
    let mut workers = BTreeMap::new();

    let mut take = |role: String, role_shape: RoleShape, report: &mut MigrationReport| {
        let (state, legacy) = migrate_role(role_shape);
        if legacy {
            report.migrated_roles.push(format!("{}/{}", slug, role));
        }
        workers.insert(role, state);
    };

    if let Some(roles) = shape.workers {
        for (role, role_shape) in roles {
            take(role, role_shape, report);
        }
    } else {
        for (legacy_key, role) in LEGACY_ROLE_KEYS {
            let Some(value) = shape.extra.get(*legacy_key) else {
                continue;
            };
            if !value.is_object() {
                continue;
            }
            match serde_json::from_value::<RoleShape>(value.clone()) {
                Ok(role_shape) => take(role.to_string(), role_shape, report),
                Err(e) => {
                    tracing::warn!(project = %key, role = %legacy_key, error = %e, "skipping unreadable legacy worker entry");
                }
            }
        }
    }

    Project {
        name: shape.name.unwrap_or_else(|| slug.clone()),
        slug,
        repo: shape.repo.unwrap_or_default(),
        remote: shape.remote,
        base_branch: shape.base_branch.unwrap_or_else(|| "main".to_string()),
        channels: shape.channels.into_iter().filter_map(channel_id).collect(),
        workers,
    }
}

/// Parse a state document of any known shape into the current model.
pub fn migrate_document(text: &str) -> Result<(ProjectsData, MigrationReport), serde_json::Error> {
    let doc: DocumentShape = if text.trim().is_empty() {
        DocumentShape::default()
    } else {
        serde_json::from_str(text)?
    };
    let mut report = MigrationReport::default();
    let projects = doc
        .projects
        .into_iter()
        .map(|(key, shape)| {
            let project = migrate_project(&key, shape, &mut report);
            (project.slug.clone(), project)
        })
        .collect();
    Ok((ProjectsData { projects }, report))
}
