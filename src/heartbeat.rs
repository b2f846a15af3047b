//! Periodic tick: one pass of every maintenance loop per project.
//!
//! Order within a project matters. Slots are sized first so the health pass
//! and the queue scan see the configured capacity; health runs before the
//! scan so zombie slots are free again by the time the queues are read.

use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::dispatch::Dispatched;
use crate::errors::StoreError;
use crate::health::{HealthReconciler, HealthReport};
use crate::queue::{QueueScanner, ScanReport};
use crate::review::{ReviewPoller, ReviewReport};
use crate::services::Services;

#[derive(Debug, Default)]
pub struct TickReport {
    pub project: String,
    /// Roles whose slot arrays were resized.
    pub resized: Vec<String>,
    pub health: Option<HealthReport>,
    pub review: Option<ReviewReport>,
    pub scan: Option<ScanReport>,
    pub warnings: Vec<String>,
}

impl TickReport {
    pub fn dispatched(&self) -> &[Dispatched] {
        self.scan
            .as_ref()
            .map(|s| s.dispatched.as_slice())
            .unwrap_or_default()
    }

    /// Everything that went wrong in any pass.
    pub fn all_warnings(&self) -> Vec<&str> {
        let nested = [
            self.health.as_ref().map(|h| &h.warnings),
            self.review.as_ref().map(|r| &r.warnings),
            self.scan.as_ref().map(|s| &s.warnings),
        ];
        self.warnings
            .iter()
            .chain(nested.into_iter().flatten().flatten())
            .map(String::as_str)
            .collect()
    }

    pub fn summary(&self) -> String {
        format!(
            "{}: {} fixed, {} reviewed, {} dispatched, {} warnings",
            self.project,
            self.health.as_ref().map_or(0, |h| h.fixed()),
            self.review.as_ref().map_or(0, |r| r.transitions()),
            self.dispatched().len(),
            self.all_warnings().len()
        )
    }
}

pub struct Heartbeat {
    services: Services,
}

impl Heartbeat {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    /// One tick for one project. Each pass is independent: a failed pass
    /// becomes a warning and the next one still runs.
    pub async fn tick(&self, slug: &str) -> TickReport {
        let mut report = TickReport {
            project: slug.to_string(),
            ..Default::default()
        };

        for (role, cfg) in self.services.roles().iter() {
            match self
                .services
                .store
                .reconcile_slots(slug, role, cfg.desired_slots())
                .await
            {
                Ok(true) => report.resized.push(role.to_string()),
                Ok(false) => {}
                Err(e) => report.warnings.push(format!("resizing {} slots failed: {}", role, e)),
            }
        }

        match HealthReconciler::new(self.services.clone())
            .check(slug, true)
            .await
        {
            Ok(health) => report.health = Some(health),
            Err(e) => report.warnings.push(format!("health pass failed: {}", e)),
        }

        match ReviewPoller::new(self.services.clone()).poll(slug).await {
            Ok(review) => report.review = Some(review),
            Err(e) => report.warnings.push(format!("review poll failed: {}", e)),
        }

        let budget = self.services.settings.scheduling.max_dispatch_per_tick;
        match QueueScanner::new(self.services.clone())
            .scan(slug, budget)
            .await
        {
            Ok(scan) => report.scan = Some(scan),
            Err(e) => report.warnings.push(format!("queue scan failed: {}", e)),
        }

        for message in &report.warnings {
            warn!(project = slug, "{}", message);
        }
        report
    }

    /// One tick for every registered project. Projects tick concurrently;
    /// they share nothing but the state file lock.
    pub async fn tick_all(&self) -> Result<Vec<TickReport>, StoreError> {
        let data = self.services.store.read().await?;
        let reports = join_all(data.projects.keys().map(|slug| self.tick(slug))).await;
        for report in &reports {
            info!("{}", report.summary());
        }
        Ok(reports)
    }

    /// Tick every `interval` until `shutdown` resolves. Returns the number of
    /// ticks run.
    pub async fn run_until(
        &self,
        interval: Duration,
        shutdown: impl Future<Output = ()>,
    ) -> usize {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        let mut ticks = 0;

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(ticks, "heartbeat stopped");
                    return ticks;
                }
                _ = ticker.tick() => {
                    ticks += 1;
                    debug!(tick = ticks, "heartbeat");
                    if let Err(e) = self.tick_all().await {
                        warn!("heartbeat tick failed: {}", e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foreman_config::ForemanToml;
    use crate::providers::PrState;
    use crate::testing::{harness, harness_with};

    #[tokio::test]
    async fn test_tick_runs_every_pass() {
        let h = harness();
        h.tracker.add_issue(1, "Feature", &["To Do"]);
        h.tracker.add_issue(2, "Reviewed", &["To Review", "review:human"]);
        h.tracker.set_pr(2, PrState::Approved);

        let report = Heartbeat::new(h.services.clone()).tick("demo").await;
        assert!(report.health.is_some());
        assert_eq!(report.review.as_ref().map(|r| r.transitions()), Some(1));
        // #2 lands in To Test during the review poll and the scan picks it up.
        let mut ids: Vec<u64> = report.dispatched().iter().map(|d| d.outcome.issue_id).collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2]);
        assert!(report.all_warnings().is_empty());
    }

    #[tokio::test]
    async fn test_tick_resizes_slots_to_capacity() {
        let h = harness();
        let shrunk = [("medior".to_string(), 0)].into_iter().collect();
        h.store().reconcile_slots("demo", "developer", &shrunk).unwrap();
        h.tracker.add_issue(1, "Feature", &["To Do"]);

        let report = Heartbeat::new(h.services.clone()).tick("demo").await;
        assert_eq!(report.resized, vec!["developer".to_string()]);
        assert_eq!(h.project().role("developer").unwrap().slots("medior").len(), 1);
        assert_eq!(report.dispatched().len(), 1);
    }

    #[tokio::test]
    async fn test_tick_respects_dispatch_budget() {
        let mut settings = ForemanToml::default();
        settings.scheduling.max_dispatch_per_tick = 1;
        let h = harness_with(settings);
        h.tracker.add_issue(1, "Feature", &["To Do"]);
        h.tracker.add_issue(2, "Check", &["To Test"]);

        let report = Heartbeat::new(h.services.clone()).tick("demo").await;
        assert!(report.resized.is_empty());
        assert_eq!(report.dispatched().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_project_becomes_warnings() {
        let h = harness();
        let report = Heartbeat::new(h.services.clone()).tick("nope").await;
        assert!(report.health.is_none());
        assert!(report.scan.is_none());
        assert!(!report.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_tick_all_covers_every_project() {
        let h = harness();
        let mut other = crate::state::Project::new("other", "/srv/other", "main");
        other.remote = Some("acme/other".to_string());
        h.store().register_project(other).unwrap();

        let reports = Heartbeat::new(h.services.clone()).tick_all().await.unwrap();
        let mut projects: Vec<&str> = reports.iter().map(|r| r.project.as_str()).collect();
        projects.sort();
        assert_eq!(projects, vec!["demo", "other"]);
        // The new project gets its slots on the first tick.
        let other = h.store().project("other").unwrap();
        assert!(other.role("developer").is_some());
    }

    #[tokio::test]
    async fn test_run_until_stops_on_shutdown() {
        let h = harness();
        let heartbeat = Heartbeat::new(h.services.clone());
        let ticks = heartbeat
            .run_until(Duration::from_millis(10), tokio::time::sleep(Duration::from_millis(35)))
            .await;
        assert!(ticks >= 1);
    }
}
