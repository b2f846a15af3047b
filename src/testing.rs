//! In-memory collaborators and a wired [`Services`] for engine tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use crate::audit::MemoryAudit;
use crate::errors::ProviderError;
use crate::foreman_config::ForemanToml;
use crate::providers::{
    Comment, Issue, IssueState, IssueTracker, PrState, PrStatus, RepoSync, SessionRuntime,
};
use crate::services::{Services, TrackerFactory};
use crate::state::{Project, StoreHandle, WorkerStateStore};

const PROVIDER: &str = "memory";

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Scripted tracker. Every mutating call is appended to `calls`.
#[derive(Default)]
pub struct MemoryTracker {
    issues: Mutex<BTreeMap<u64, Issue>>,
    comments: Mutex<HashMap<u64, Vec<Comment>>>,
    prs: Mutex<HashMap<u64, PrStatus>>,
    diffs: Mutex<HashMap<u64, String>>,
    labels: Mutex<BTreeMap<String, String>>,
    calls: Mutex<Vec<String>>,
    fail_merge: Mutex<HashSet<u64>>,
    fail_transitions: Mutex<bool>,
    fail_secondary_labels: Mutex<bool>,
    dropped_replies: Mutex<u32>,
    after_transition: Mutex<Option<TransitionHook>>,
}

type TransitionHook = Box<dyn Fn(u64) + Send + Sync>;

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_issue(&self, id: u64, title: &str, labels: &[&str]) {
        lock(&self.issues).insert(
            id,
            Issue {
                id,
                title: title.to_string(),
                body: String::new(),
                labels: labels.iter().map(|l| l.to_string()).collect(),
                state: IssueState::Open,
                url: format!("https://tracker.test/issues/{}", id),
            },
        );
    }

    pub fn set_body(&self, id: u64, body: &str) {
        if let Some(issue) = lock(&self.issues).get_mut(&id) {
            issue.body = body.to_string();
        }
    }

    pub fn add_comment_from(&self, id: u64, author: &str, body: &str) {
        lock(&self.comments).entry(id).or_default().push(Comment {
            author: author.to_string(),
            body: body.to_string(),
        });
    }

    pub fn set_pr(&self, id: u64, state: PrState) {
        lock(&self.prs).insert(
            id,
            PrStatus {
                number: id + 1000,
                state,
                url: format!("https://tracker.test/pull/{}", id + 1000),
            },
        );
    }

    pub fn set_diff(&self, id: u64, diff: &str) {
        lock(&self.diffs).insert(id, diff.to_string());
    }

    pub fn fail_merge(&self, id: u64) {
        lock(&self.fail_merge).insert(id);
    }

    pub fn fail_transitions(&self, fail: bool) {
        *lock(&self.fail_transitions) = fail;
    }

    pub fn fail_secondary_labels(&self, fail: bool) {
        *lock(&self.fail_secondary_labels) = fail;
    }

    /// The next `n` transitions are applied but report a transient failure.
    pub fn drop_transition_replies(&self, n: u32) {
        *lock(&self.dropped_replies) = n;
    }

    /// Run `hook` right after each applied transition.
    pub fn after_transition(&self, hook: impl Fn(u64) + Send + Sync + 'static) {
        *lock(&self.after_transition) = Some(Box::new(hook));
    }

    pub fn issue(&self, id: u64) -> Issue {
        lock(&self.issues)[&id].clone()
    }

    pub fn labels_of(&self, id: u64) -> Vec<String> {
        self.issue(id).labels
    }

    pub fn known_labels(&self) -> Vec<String> {
        lock(&self.labels).keys().cloned().collect()
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn comments_on(&self, id: u64) -> Vec<Comment> {
        lock(&self.comments).get(&id).cloned().unwrap_or_default()
    }

    fn record(&self, call: String) {
        lock(&self.calls).push(call);
    }

    fn with_issue<R>(
        &self,
        id: u64,
        f: impl FnOnce(&mut Issue) -> R,
    ) -> Result<R, ProviderError> {
        let mut issues = lock(&self.issues);
        let issue = issues
            .get_mut(&id)
            .ok_or_else(|| ProviderError::not_found(PROVIDER, format!("issue #{}", id)))?;
        Ok(f(issue))
    }
}

#[async_trait]
impl IssueTracker for MemoryTracker {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn ensure_label(&self, name: &str, color: &str) -> Result<(), ProviderError> {
        lock(&self.labels).insert(name.to_string(), color.to_string());
        Ok(())
    }

    async fn create_issue(
        &self,
        title: &str,
        body: &str,
        label: &str,
    ) -> Result<Issue, ProviderError> {
        let id = lock(&self.issues).keys().last().copied().unwrap_or(0) + 1;
        self.add_issue(id, title, &[label]);
        self.set_body(id, body);
        self.record(format!("create #{}", id));
        Ok(self.issue(id))
    }

    async fn list_issues_by_label(&self, label: &str) -> Result<Vec<Issue>, ProviderError> {
        Ok(lock(&self.issues)
            .values()
            .filter(|i| i.state == IssueState::Open && i.has_label(label))
            .cloned()
            .collect())
    }

    async fn get_issue(&self, id: u64) -> Result<Issue, ProviderError> {
        self.with_issue(id, |i| i.clone())
    }

    async fn list_comments(&self, id: u64) -> Result<Vec<Comment>, ProviderError> {
        Ok(self.comments_on(id))
    }

    async fn transition_label(&self, id: u64, from: &str, to: &str) -> Result<(), ProviderError> {
        if *lock(&self.fail_transitions) {
            return Err(ProviderError::transient(PROVIDER, "transition refused"));
        }
        let applied = self.with_issue(id, |issue| {
            if !issue.has_label(from) {
                if issue.has_label(to) {
                    return Ok(false);
                }
                return Err(ProviderError::permanent(
                    PROVIDER,
                    format!("issue #{} does not carry label '{}'", id, from),
                ));
            }
            issue.labels.retain(|l| l != from);
            if !issue.has_label(to) {
                issue.labels.push(to.to_string());
            }
            Ok(true)
        })??;
        if !applied {
            return Ok(());
        }
        self.record(format!("transition #{} {} -> {}", id, from, to));
        if let Some(hook) = lock(&self.after_transition).as_ref() {
            hook(id);
        }
        let mut dropped = lock(&self.dropped_replies);
        if *dropped > 0 {
            *dropped -= 1;
            return Err(ProviderError::transient(PROVIDER, "reply lost"));
        }
        Ok(())
    }

    async fn add_label(&self, id: u64, label: &str) -> Result<(), ProviderError> {
        if *lock(&self.fail_secondary_labels) {
            return Err(ProviderError::permanent(PROVIDER, "labels unavailable"));
        }
        self.with_issue(id, |issue| {
            if !issue.has_label(label) {
                issue.labels.push(label.to_string());
            }
        })?;
        self.record(format!("add_label #{} {}", id, label));
        Ok(())
    }

    async fn remove_label(&self, id: u64, label: &str) -> Result<(), ProviderError> {
        if *lock(&self.fail_secondary_labels) {
            return Err(ProviderError::permanent(PROVIDER, "labels unavailable"));
        }
        self.with_issue(id, |issue| issue.labels.retain(|l| l != label))?;
        Ok(())
    }

    async fn close_issue(&self, id: u64) -> Result<(), ProviderError> {
        self.with_issue(id, |issue| issue.state = IssueState::Closed)?;
        self.record(format!("close #{}", id));
        Ok(())
    }

    async fn reopen_issue(&self, id: u64) -> Result<(), ProviderError> {
        self.with_issue(id, |issue| issue.state = IssueState::Open)?;
        self.record(format!("reopen #{}", id));
        Ok(())
    }

    async fn get_review_status(&self, id: u64) -> Result<Option<PrStatus>, ProviderError> {
        Ok(lock(&self.prs).get(&id).cloned())
    }

    async fn merge_pr(&self, id: u64) -> Result<(), ProviderError> {
        if lock(&self.fail_merge).contains(&id) {
            return Err(ProviderError::permanent(PROVIDER, "merge conflict"));
        }
        let mut prs = lock(&self.prs);
        let pr = prs
            .get_mut(&id)
            .ok_or_else(|| ProviderError::not_found(PROVIDER, format!("pull request for #{}", id)))?;
        pr.state = PrState::Merged;
        drop(prs);
        self.record(format!("merge #{}", id));
        Ok(())
    }

    async fn get_pr_diff(&self, id: u64) -> Result<Option<String>, ProviderError> {
        Ok(lock(&self.diffs).get(&id).cloned())
    }

    async fn add_comment(&self, id: u64, body: &str) -> Result<(), ProviderError> {
        self.add_comment_from(id, "foreman", body);
        self.record(format!("comment #{}", id));
        Ok(())
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// Every project shares one tracker.
pub struct SharedTracker(pub Arc<MemoryTracker>);

impl TrackerFactory for SharedTracker {
    fn for_project(&self, _project: &Project) -> Result<Arc<dyn IssueTracker>, ProviderError> {
        Ok(self.0.clone())
    }
}

/// Records sessions and deliveries.
#[derive(Default)]
pub struct MemoryRuntime {
    alive: Mutex<HashSet<String>>,
    ensured: Mutex<Vec<(String, String)>>,
    delivered: Mutex<Vec<(String, String, String)>>,
    fail_list: Mutex<bool>,
    fail_delivery: Mutex<bool>,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_alive(&self, keys: &[&str]) {
        *lock(&self.alive) = keys.iter().map(|k| k.to_string()).collect();
    }

    pub fn fail_list(&self, fail: bool) {
        *lock(&self.fail_list) = fail;
    }

    pub fn fail_delivery(&self, fail: bool) {
        *lock(&self.fail_delivery) = fail;
    }

    pub fn ensured(&self) -> Vec<(String, String)> {
        lock(&self.ensured).clone()
    }

    /// (session key, payload, idempotency key)
    pub fn delivered(&self) -> Vec<(String, String, String)> {
        lock(&self.delivered).clone()
    }
}

#[async_trait]
impl SessionRuntime for MemoryRuntime {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn ensure_session(&self, key: &str, model: &str) -> Result<(), ProviderError> {
        lock(&self.ensured).push((key.to_string(), model.to_string()));
        lock(&self.alive).insert(key.to_string());
        Ok(())
    }

    async fn deliver_task(
        &self,
        key: &str,
        payload: &str,
        idempotency_key: &str,
    ) -> Result<(), ProviderError> {
        if *lock(&self.fail_delivery) {
            return Err(ProviderError::permanent(PROVIDER, "session rejected task"));
        }
        lock(&self.delivered).push((
            key.to_string(),
            payload.to_string(),
            idempotency_key.to_string(),
        ));
        Ok(())
    }

    async fn list_alive_sessions(&self) -> Result<HashSet<String>, ProviderError> {
        if *lock(&self.fail_list) {
            return Err(ProviderError::transient(PROVIDER, "runtime unreachable"));
        }
        Ok(lock(&self.alive).clone())
    }
}

#[derive(Default)]
pub struct MemoryGit {
    pulls: Mutex<Vec<(PathBuf, String)>>,
}

impl MemoryGit {
    pub fn pulls(&self) -> Vec<(PathBuf, String)> {
        lock(&self.pulls).clone()
    }
}

#[async_trait]
impl RepoSync for MemoryGit {
    async fn pull(&self, repo: &Path, branch: &str) -> Result<(), ProviderError> {
        lock(&self.pulls).push((repo.to_path_buf(), branch.to_string()));
        Ok(())
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub services: Services,
    pub tracker: Arc<MemoryTracker>,
    pub runtime: Arc<MemoryRuntime>,
    pub git: Arc<MemoryGit>,
    pub audit: Arc<MemoryAudit>,
}

impl Harness {
    pub fn store(&self) -> &WorkerStateStore {
        self.services.store.store()
    }

    pub fn project(&self) -> Project {
        self.store().project("demo").unwrap()
    }
}

/// Services over a temp workspace with project `demo` registered and its
/// slots sized to the configured capacity.
pub fn harness() -> Harness {
    harness_with(ForemanToml::default())
}

pub fn harness_with(settings: ForemanToml) -> Harness {
    let dir = TempDir::new().unwrap();
    let tracker = Arc::new(MemoryTracker::new());
    let runtime = Arc::new(MemoryRuntime::new());
    let git = Arc::new(MemoryGit::default());
    let audit = Arc::new(MemoryAudit::new());

    let store = WorkerStateStore::new(dir.path().join("projects.json"), settings.lock.options());
    let mut project = Project::new("demo", "/srv/demo", "main");
    project.remote = Some("acme/demo".to_string());
    store.register_project(project).unwrap();
    for (role, cfg) in settings.roles.iter() {
        store
            .reconcile_slots("demo", role, &cfg.desired_slots())
            .unwrap();
    }

    let services = Services {
        workflow: Arc::new(settings.workflow()),
        settings: Arc::new(settings),
        store: StoreHandle::new(store),
        trackers: Arc::new(SharedTracker(tracker.clone())),
        runtime: runtime.clone(),
        git: git.clone(),
        audit: audit.clone(),
    };

    Harness {
        dir,
        services,
        tracker,
        runtime,
        git,
        audit,
    }
}
