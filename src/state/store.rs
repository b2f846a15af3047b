use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::lock::{self, LockOptions};
use super::migration::migrate_document;
use super::{Project, ProjectsData, RoleUpdate, SlotPatch, SlotRef};
use crate::errors::StoreError;

/// Fields recorded when a slot takes an issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activation {
    pub issue_id: String,
    /// Only set when a new session was spawned; reuse keeps the stored key.
    pub session_key: Option<String>,
    pub start_time: DateTime<Utc>,
    pub previous_label: Option<String>,
}

/// File-backed worker state with read-modify-write under a lock file.
///
/// Reads are lock-free and always see a complete document because writes go
/// to a temp file that is renamed into place.
#[derive(Debug, Clone)]
pub struct WorkerStateStore {
    path: PathBuf,
    lock_path: PathBuf,
    lock: LockOptions,
}

impl WorkerStateStore {
    pub fn new(path: impl Into<PathBuf>, lock: LockOptions) -> Self {
        let path = path.into();
        let mut lock_path = path.clone().into_os_string();
        lock_path.push(".lock");
        Self {
            path,
            lock_path: PathBuf::from(lock_path),
            lock,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document, migrating older shapes. A missing file is empty.
    pub fn read(&self) -> Result<ProjectsData, StoreError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(ProjectsData::default()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        let (data, report) = migrate_document(&text).map_err(|e| StoreError::Parse {
            path: self.path.clone(),
            message: e.to_string(),
        })?;
        if !report.is_empty() {
            tracing::info!(
                roles = ?report.migrated_roles,
                "migrated legacy worker state on read"
            );
        }
        Ok(data)
    }

    /// Replace the document atomically: temp file, fsync, rename.
    pub fn write(&self, data: &ProjectsData) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let body = serde_json::to_vec_pretty(data)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(format!(".tmp.{}", std::process::id()));
        let tmp = PathBuf::from(tmp);

        let result = (|| {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&body)?;
            file.write_all(b"\n")?;
            file.sync_all()?;
            fs::rename(&tmp, &self.path)
        })();
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result.map_err(io_err)
    }

    /// Lock, read, apply `f`, write back if anything changed, unlock.
    ///
    /// When `f` fails nothing is written.
    pub fn modify<R>(
        &self,
        f: impl FnOnce(&mut ProjectsData) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let _guard = lock::acquire(&self.lock_path, &self.lock)?;
        let before = self.read()?;
        let mut data = before.clone();
        let out = f(&mut data)?;
        if data != before {
            self.write(&data)?;
        }
        Ok(out)
    }

    pub fn project(&self, slug: &str) -> Result<Project, StoreError> {
        self.read()?
            .projects
            .remove(slug)
            .ok_or_else(|| StoreError::ProjectNotFound(slug.to_string()))
    }

    pub fn register_project(&self, project: Project) -> Result<(), StoreError> {
        self.modify(|data| {
            if data.projects.contains_key(&project.slug) {
                return Err(StoreError::ProjectExists(project.slug.clone()));
            }
            data.projects.insert(project.slug.clone(), project);
            Ok(())
        })
    }

    /// Merge a partial role update into the stored project and return the
    /// project as persisted.
    pub fn update(
        &self,
        slug: &str,
        role: &str,
        update: &RoleUpdate,
    ) -> Result<Project, StoreError> {
        self.modify(|data| {
            let project = data
                .projects
                .get_mut(slug)
                .ok_or_else(|| StoreError::ProjectNotFound(slug.to_string()))?;
            project
                .workers
                .entry(role.to_string())
                .or_default()
                .apply(update);
            Ok(project.clone())
        })
    }

    /// Record that `slot` took an issue.
    ///
    /// Checked under the lock: the slot must be idle or already hold this
    /// issue, and no other slot may hold it. A dispatch that decided on a
    /// stale snapshot gets `SlotOccupied` or `IssueHeld` and nothing is
    /// written.
    pub fn activate(
        &self,
        slug: &str,
        role: &str,
        level: &str,
        slot: usize,
        activation: Activation,
    ) -> Result<Project, StoreError> {
        self.modify(|data| {
            let project = data
                .projects
                .get_mut(slug)
                .ok_or_else(|| StoreError::ProjectNotFound(slug.to_string()))?;
            let target = SlotRef {
                role: role.to_string(),
                level: level.to_string(),
                index: slot,
            };
            if let Some(held) = project.find_issue(&activation.issue_id)
                && held != target
            {
                return Err(StoreError::IssueHeld {
                    issue_id: activation.issue_id,
                    held_by: held.to_string(),
                });
            }
            let current = project
                .role(role)
                .and_then(|r| r.slots(level).get(slot));
            if let Some(current) = current
                && current.active
                && !current.holds(&activation.issue_id)
            {
                return Err(StoreError::SlotOccupied {
                    role: role.to_string(),
                    level: level.to_string(),
                    index: slot,
                    holder: current.issue_id.clone().unwrap_or_default(),
                });
            }

            let patch = SlotPatch {
                active: Some(true),
                issue_id: Some(Some(activation.issue_id)),
                session_key: activation.session_key,
                start_time: Some(Some(activation.start_time)),
                previous_label: Some(activation.previous_label),
                bump_task_count: true,
            };
            project
                .workers
                .entry(role.to_string())
                .or_default()
                .apply(&RoleUpdate::slot(level, slot, patch));
            Ok(project.clone())
        })
    }

    /// Release a slot. Unknown slots are an error; an already idle slot is
    /// a no-op.
    pub fn deactivate(
        &self,
        slug: &str,
        role: &str,
        level: &str,
        slot: usize,
    ) -> Result<Project, StoreError> {
        self.modify(|data| {
            let project = data
                .projects
                .get_mut(slug)
                .ok_or_else(|| StoreError::ProjectNotFound(slug.to_string()))?;
            let exists = project
                .role(role)
                .is_some_and(|r| slot < r.slots(level).len());
            if !exists {
                return Err(StoreError::SlotNotFound {
                    role: role.to_string(),
                    level: level.to_string(),
                    index: slot,
                });
            }
            project
                .workers
                .entry(role.to_string())
                .or_default()
                .apply(&RoleUpdate::slot(level, slot, SlotPatch::deactivate()));
            Ok(project.clone())
        })
    }

    /// Resize a role's slot arrays toward `desired`. Returns whether the
    /// stored state changed.
    pub fn reconcile_slots(
        &self,
        slug: &str,
        role: &str,
        desired: &BTreeMap<String, usize>,
    ) -> Result<bool, StoreError> {
        self.modify(|data| {
            let project = data
                .projects
                .get_mut(slug)
                .ok_or_else(|| StoreError::ProjectNotFound(slug.to_string()))?;
            Ok(project
                .workers
                .entry(role.to_string())
                .or_default()
                .reconcile_slots(desired))
        })
    }
}

/// Async access to the store: every call runs on the blocking pool since
/// lock polling and fsync block.
#[derive(Debug, Clone)]
pub struct StoreHandle {
    inner: Arc<WorkerStateStore>,
}

impl StoreHandle {
    pub fn new(store: WorkerStateStore) -> Self {
        Self {
            inner: Arc::new(store),
        }
    }

    /// Run `f` against the store on a blocking thread.
    pub async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&WorkerStateStore) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// The store itself, for synchronous callers such as the CLI setup path.
    pub fn store(&self) -> &WorkerStateStore {
        &self.inner
    }

    pub async fn read(&self) -> Result<ProjectsData, StoreError> {
        self.call(|s| s.read()).await
    }

    pub async fn project(&self, slug: &str) -> Result<Project, StoreError> {
        let slug = slug.to_string();
        self.call(move |s| s.project(&slug)).await
    }

    pub async fn activate(
        &self,
        slug: &str,
        role: &str,
        level: &str,
        slot: usize,
        activation: Activation,
    ) -> Result<Project, StoreError> {
        let (slug, role, level) = (slug.to_string(), role.to_string(), level.to_string());
        self.call(move |s| s.activate(&slug, &role, &level, slot, activation))
            .await
    }

    pub async fn deactivate(
        &self,
        slug: &str,
        role: &str,
        level: &str,
        slot: usize,
    ) -> Result<Project, StoreError> {
        let (slug, role, level) = (slug.to_string(), role.to_string(), level.to_string());
        self.call(move |s| s.deactivate(&slug, &role, &level, slot))
            .await
    }

    pub async fn reconcile_slots(
        &self,
        slug: &str,
        role: &str,
        desired: BTreeMap<String, usize>,
    ) -> Result<bool, StoreError> {
        let (slug, role) = (slug.to_string(), role.to_string());
        self.call(move |s| s.reconcile_slots(&slug, &role, &desired))
            .await
    }
}
