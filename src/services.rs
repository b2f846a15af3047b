//! The engine context: configuration, the state store and every external
//! collaborator, built once at startup and passed by reference to the engines.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::audit::{AuditSink, JsonlAuditLog};
use crate::config::Config;
use crate::errors::ProviderError;
use crate::foreman_config::{ForemanToml, TrackerKind};
use crate::providers::git::GitCli;
use crate::providers::github::GitHubTracker;
use crate::providers::resilience::{
    BreakerConfig, Resilience, ResilientRuntime, ResilientTracker, RetryConfig, TimedRepoSync,
};
use crate::providers::runtime::CommandRuntime;
use crate::providers::{IssueTracker, RepoSync, SessionRuntime};
use crate::roles::{REVIEW_AGENT_LABEL, REVIEW_HUMAN_LABEL, RoleRegistry, owner_label};
use crate::state::{Project, StoreHandle, WorkerStateStore};
use crate::workflow::WorkflowConfig;

const ROUTING_COLOR: &str = "#bfd4f2";
const OWNER_COLOR: &str = "#ededed";

/// Timeout for `git pull` during transition actions.
const GIT_TIMEOUT: Duration = Duration::from_secs(120);

/// Hands out the tracker for a project. Trackers are per project because each
/// project lives in its own remote repository.
pub trait TrackerFactory: Send + Sync {
    fn for_project(&self, project: &Project) -> Result<Arc<dyn IssueTracker>, ProviderError>;
}

/// GitHub trackers, one per remote, each with its own circuit breaker.
pub struct GitHubTrackers {
    token: Option<String>,
    token_env: String,
    api_url: Option<String>,
    timeout: Duration,
    retry: RetryConfig,
    breaker: BreakerConfig,
    cache: Mutex<HashMap<String, Arc<dyn IssueTracker>>>,
}

impl GitHubTrackers {
    pub fn from_settings(settings: &ForemanToml) -> Self {
        let token = std::env::var(&settings.tracker.token_env)
            .ok()
            .filter(|t| !t.trim().is_empty());
        Self {
            token,
            token_env: settings.tracker.token_env.clone(),
            api_url: settings.tracker.api_url.clone(),
            timeout: settings.timeouts.tracker(),
            retry: settings.retry.retry_config(),
            breaker: settings.retry.breaker_config(),
            cache: Mutex::new(HashMap::new()),
        }
    }
}

impl TrackerFactory for GitHubTrackers {
    fn for_project(&self, project: &Project) -> Result<Arc<dyn IssueTracker>, ProviderError> {
        let remote = project.remote.as_deref().ok_or_else(|| {
            ProviderError::permanent(
                "github",
                format!(
                    "project '{}' has no remote; register it with --remote owner/name",
                    project.slug
                ),
            )
        })?;
        let token = self.token.as_deref().ok_or_else(|| {
            ProviderError::permanent("github", format!("{} is not set", self.token_env))
        })?;

        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tracker) = cache.get(remote) {
            return Ok(tracker.clone());
        }
        let mut client = GitHubTracker::new(remote, token);
        if let Some(api_url) = &self.api_url {
            client = client.with_api_url(api_url);
        }
        let tracker: Arc<dyn IssueTracker> = Arc::new(ResilientTracker::new(
            client,
            Resilience::new("github", self.timeout, self.retry, self.breaker),
        ));
        cache.insert(remote.to_string(), tracker.clone());
        Ok(tracker)
    }
}

/// Everything an engine needs. Cheap to clone.
#[derive(Clone)]
pub struct Services {
    pub settings: Arc<ForemanToml>,
    pub workflow: Arc<WorkflowConfig>,
    pub store: StoreHandle,
    pub trackers: Arc<dyn TrackerFactory>,
    pub runtime: Arc<dyn SessionRuntime>,
    pub git: Arc<dyn RepoSync>,
    pub audit: Arc<dyn AuditSink>,
}

impl Services {
    /// Wire the production collaborators for a workspace.
    pub fn new(config: &Config, settings: ForemanToml) -> Self {
        let retry = settings.retry.retry_config();
        let breaker = settings.retry.breaker_config();
        let runtime = ResilientRuntime::new(
            CommandRuntime::new(&settings.runtime.command),
            Resilience::new("runtime", settings.timeouts.session(), retry, breaker),
            Resilience::new("runtime", settings.timeouts.delivery(), retry, breaker),
        );
        let trackers: Arc<dyn TrackerFactory> = match settings.tracker.kind {
            TrackerKind::Github => Arc::new(GitHubTrackers::from_settings(&settings)),
        };
        let store = StoreHandle::new(WorkerStateStore::new(
            config.state_file.clone(),
            settings.lock.options(),
        ));

        Self {
            workflow: Arc::new(settings.workflow()),
            store,
            trackers,
            runtime: Arc::new(runtime),
            git: Arc::new(TimedRepoSync::new(GitCli, GIT_TIMEOUT)),
            audit: Arc::new(JsonlAuditLog::new(&config.log_dir)),
            settings: Arc::new(settings),
        }
    }

    pub fn roles(&self) -> &RoleRegistry {
        &self.settings.roles
    }

    pub fn agent_id(&self) -> &str {
        &self.settings.agent_id
    }

    pub fn tracker(&self, project: &Project) -> Result<Arc<dyn IssueTracker>, ProviderError> {
        self.trackers.for_project(project)
    }

    /// Every label the engine writes: workflow states, review routing and
    /// one owner marker per (role, level), with their colors.
    pub fn tracker_labels(&self) -> Vec<(String, String)> {
        let mut labels: Vec<(String, String)> = self
            .workflow
            .labels()
            .into_iter()
            .map(|(label, color)| (label.to_string(), color.to_string()))
            .collect();
        labels.push((REVIEW_HUMAN_LABEL.to_string(), ROUTING_COLOR.to_string()));
        labels.push((REVIEW_AGENT_LABEL.to_string(), ROUTING_COLOR.to_string()));
        for (role, cfg) in self.roles().iter() {
            for level in &cfg.levels {
                labels.push((owner_label(role, level), OWNER_COLOR.to_string()));
            }
        }
        labels
    }

    /// Create any missing engine labels on `tracker`. Returns how many were
    /// ensured and the failures.
    pub async fn ensure_labels(
        &self,
        tracker: &dyn IssueTracker,
    ) -> (usize, Vec<(String, ProviderError)>) {
        let mut ensured = 0;
        let mut failed = Vec::new();
        for (label, color) in self.tracker_labels() {
            match tracker.ensure_label(&label, &color).await {
                Ok(()) => ensured += 1,
                Err(e) => failed.push((label, e)),
            }
        }
        (ensured, failed)
    }
}
