//! Timeouts, exponential backoff and a circuit breaker around providers.
//!
//! Only transient failures and timeouts are retried. Consecutive failures
//! open the breaker; while open every call fails fast with
//! [`ProviderError::Unhealthy`] until the cooldown lets a trial call through.

use std::collections::HashSet;
use std::future::Future;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{info, warn};

use super::{Comment, Issue, IssueTracker, PrStatus, RepoSync, SessionRuntime};
use crate::errors::ProviderError;

/// Configuration for exponential backoff retry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    pub const DEFAULT: Self = Self {
        max_retries: 3,
        initial_delay: Duration::from_millis(500),
        max_delay: Duration::from_secs(8),
        backoff_multiplier: 2.0,
    };

    pub const NONE: Self = Self {
        max_retries: 0,
        initial_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
        backoff_multiplier: 1.0,
    };

    /// `initial_delay * backoff_multiplier^attempt`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = self.backoff_multiplier.powi(attempt as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Whether an operation may be repeated safely.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RetryPolicy {
    #[default]
    RetryTransient,
    /// Writes that would duplicate on repeat (comments, new issues).
    NoRetry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: u32,
    opened_at: Option<Instant>,
    /// Start of the single call let through while half-open.
    trial_started: Option<Instant>,
}

/// Consecutive-failure circuit breaker for one provider.
#[derive(Debug)]
pub struct CircuitBreaker {
    provider: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(provider: &str, config: BreakerConfig) -> Self {
        Self {
            provider: provider.to_string(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                opened_at: None,
                trial_started: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Whether a call may go out now. An open breaker turns half-open once
    /// the cooldown has passed and then admits one trial call at a time. A
    /// trial call that never reported back is replaced after another cooldown.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => {
                let lost = inner
                    .trial_started
                    .is_none_or(|t| t.elapsed() >= self.config.cooldown);
                if lost {
                    inner.trial_started = Some(Instant::now());
                }
                lost
            }
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .is_some_and(|t| t.elapsed() >= self.config.cooldown);
                if cooled {
                    info!(provider = %self.provider, "circuit breaker half-open, probing");
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_started = Some(Instant::now());
                }
                cooled
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            info!(provider = %self.provider, "circuit breaker closed after successful trial call");
        }
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.opened_at = None;
        inner.trial_started = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.failures = inner.failures.saturating_add(1);
        let trip = match inner.state {
            CircuitState::Closed => inner.failures >= self.config.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        if trip {
            warn!(
                provider = %self.provider,
                failures = inner.failures,
                "circuit breaker opening"
            );
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.trial_started = None;
        }
    }
}

/// Timeout, retry and breaker for one provider.
#[derive(Debug)]
pub struct Resilience {
    provider: String,
    timeout: Duration,
    retry: RetryConfig,
    breaker: CircuitBreaker,
}

impl Resilience {
    pub fn new(provider: &str, timeout: Duration, retry: RetryConfig, breaker: BreakerConfig) -> Self {
        Self {
            provider: provider.to_string(),
            timeout,
            retry,
            breaker: CircuitBreaker::new(provider, breaker),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Run `operation` under this provider's guards.
    pub async fn call<T, F, Fut>(
        &self,
        operation: &str,
        policy: RetryPolicy,
        mut f: F,
    ) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let max_attempts = match policy {
            RetryPolicy::NoRetry => 1,
            RetryPolicy::RetryTransient => self.retry.max_retries + 1,
        };
        let mut attempt = 0;
        loop {
            if !self.breaker.allow_request() {
                return Err(ProviderError::Unhealthy {
                    provider: self.provider.clone(),
                });
            }
            let result = match tokio::time::timeout(self.timeout, f()).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout {
                    provider: self.provider.clone(),
                    operation: operation.to_string(),
                    secs: self.timeout.as_secs(),
                }),
            };
            match result {
                Ok(value) => {
                    self.breaker.record_success();
                    return Ok(value);
                }
                Err(e) => {
                    if e.counts_as_failure() {
                        self.breaker.record_failure();
                    } else {
                        self.breaker.record_success();
                    }
                    attempt += 1;
                    if !e.is_retryable() || attempt >= max_attempts {
                        return Err(e);
                    }
                    let delay = self.retry.delay_for_attempt(attempt - 1);
                    warn!(
                        provider = %self.provider,
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying provider call"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Any [`IssueTracker`] behind [`Resilience`].
pub struct ResilientTracker<T> {
    inner: T,
    guard: Resilience,
}

impl<T: IssueTracker> ResilientTracker<T> {
    pub fn new(inner: T, guard: Resilience) -> Self {
        Self { inner, guard }
    }
}

#[async_trait]
impl<T: IssueTracker> IssueTracker for ResilientTracker<T> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn ensure_label(&self, name: &str, color: &str) -> Result<(), ProviderError> {
        self.guard
            .call("ensure_label", RetryPolicy::RetryTransient, || {
                self.inner.ensure_label(name, color)
            })
            .await
    }

    async fn create_issue(
        &self,
        title: &str,
        body: &str,
        label: &str,
    ) -> Result<Issue, ProviderError> {
        self.guard
            .call("create_issue", RetryPolicy::NoRetry, || {
                self.inner.create_issue(title, body, label)
            })
            .await
    }

    async fn list_issues_by_label(&self, label: &str) -> Result<Vec<Issue>, ProviderError> {
        self.guard
            .call("list_issues_by_label", RetryPolicy::RetryTransient, || {
                self.inner.list_issues_by_label(label)
            })
            .await
    }

    async fn get_issue(&self, id: u64) -> Result<Issue, ProviderError> {
        self.guard
            .call("get_issue", RetryPolicy::RetryTransient, || self.inner.get_issue(id))
            .await
    }

    async fn list_comments(&self, id: u64) -> Result<Vec<Comment>, ProviderError> {
        self.guard
            .call("list_comments", RetryPolicy::RetryTransient, || {
                self.inner.list_comments(id)
            })
            .await
    }

    async fn transition_label(&self, id: u64, from: &str, to: &str) -> Result<(), ProviderError> {
        self.guard
            .call("transition_label", RetryPolicy::RetryTransient, || {
                self.inner.transition_label(id, from, to)
            })
            .await
    }

    async fn add_label(&self, id: u64, label: &str) -> Result<(), ProviderError> {
        self.guard
            .call("add_label", RetryPolicy::RetryTransient, || {
                self.inner.add_label(id, label)
            })
            .await
    }

    async fn remove_label(&self, id: u64, label: &str) -> Result<(), ProviderError> {
        self.guard
            .call("remove_label", RetryPolicy::RetryTransient, || {
                self.inner.remove_label(id, label)
            })
            .await
    }

    async fn close_issue(&self, id: u64) -> Result<(), ProviderError> {
        self.guard
            .call("close_issue", RetryPolicy::RetryTransient, || self.inner.close_issue(id))
            .await
    }

    async fn reopen_issue(&self, id: u64) -> Result<(), ProviderError> {
        self.guard
            .call("reopen_issue", RetryPolicy::RetryTransient, || {
                self.inner.reopen_issue(id)
            })
            .await
    }

    async fn get_review_status(&self, id: u64) -> Result<Option<PrStatus>, ProviderError> {
        self.guard
            .call("get_review_status", RetryPolicy::RetryTransient, || {
                self.inner.get_review_status(id)
            })
            .await
    }

    async fn merge_pr(&self, id: u64) -> Result<(), ProviderError> {
        // A retried merge of an already merged PR comes back as a permanent
        // "not mergeable", which the caller treats as a merge failure.
        self.guard
            .call("merge_pr", RetryPolicy::NoRetry, || self.inner.merge_pr(id))
            .await
    }

    async fn get_pr_diff(&self, id: u64) -> Result<Option<String>, ProviderError> {
        self.guard
            .call("get_pr_diff", RetryPolicy::RetryTransient, || {
                self.inner.get_pr_diff(id)
            })
            .await
    }

    async fn add_comment(&self, id: u64, body: &str) -> Result<(), ProviderError> {
        self.guard
            .call("add_comment", RetryPolicy::NoRetry, || {
                self.inner.add_comment(id, body)
            })
            .await
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        self.guard
            .call("health_check", RetryPolicy::NoRetry, || self.inner.health_check())
            .await
    }
}

/// Any [`SessionRuntime`] behind [`Resilience`].
///
/// Delivery gets its own, longer timeout.
pub struct ResilientRuntime<R> {
    inner: R,
    guard: Resilience,
    delivery: Resilience,
}

impl<R: SessionRuntime> ResilientRuntime<R> {
    pub fn new(inner: R, guard: Resilience, delivery: Resilience) -> Self {
        Self {
            inner,
            guard,
            delivery,
        }
    }
}

#[async_trait]
impl<R: SessionRuntime> SessionRuntime for ResilientRuntime<R> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn ensure_session(&self, key: &str, model: &str) -> Result<(), ProviderError> {
        self.guard
            .call("ensure_session", RetryPolicy::RetryTransient, || {
                self.inner.ensure_session(key, model)
            })
            .await
    }

    async fn deliver_task(
        &self,
        key: &str,
        payload: &str,
        idempotency_key: &str,
    ) -> Result<(), ProviderError> {
        self.delivery
            .call("deliver_task", RetryPolicy::RetryTransient, || {
                self.inner.deliver_task(key, payload, idempotency_key)
            })
            .await
    }

    async fn list_alive_sessions(&self) -> Result<HashSet<String>, ProviderError> {
        self.guard
            .call("list_alive_sessions", RetryPolicy::RetryTransient, || {
                self.inner.list_alive_sessions()
            })
            .await
    }
}

/// [`RepoSync`] with a timeout only; a failed pull is never retried.
pub struct TimedRepoSync<G> {
    inner: G,
    guard: Resilience,
}

impl<G: RepoSync> TimedRepoSync<G> {
    pub fn new(inner: G, timeout: Duration) -> Self {
        Self {
            inner,
            guard: Resilience::new("git", timeout, RetryConfig::NONE, BreakerConfig::default()),
        }
    }
}

#[async_trait]
impl<G: RepoSync> RepoSync for TimedRepoSync<G> {
    async fn pull(&self, repo: &Path, branch: &str) -> Result<(), ProviderError> {
        self.guard
            .call("pull", RetryPolicy::NoRetry, || self.inner.pull(repo, branch))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryTracker;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            backoff_multiplier: 2.0,
        }
    }

    fn guard(max_retries: u32, threshold: u32) -> Resilience {
        Resilience::new(
            "test",
            Duration::from_millis(200),
            fast_retry(max_retries),
            BreakerConfig {
                failure_threshold: threshold,
                cooldown: Duration::from_secs(60),
            },
        )
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let cfg = RetryConfig {
            max_retries: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        };
        assert_eq!(cfg.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(cfg.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(cfg.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(cfg.delay_for_attempt(3), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried_until_success() {
        let g = guard(3, 10);
        let calls = AtomicU32::new(0);
        let result = g
            .call("op", RetryPolicy::RetryTransient, || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ProviderError::transient("test", "502"))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let g = guard(3, 10);
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = g
            .call("op", RetryPolicy::RetryTransient, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::permanent("test", "422"))
            })
            .await;
        assert!(matches!(result, Err(ProviderError::Permanent { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_retry_policy_makes_one_attempt() {
        let g = guard(3, 10);
        let calls = AtomicU32::new(0);
        let _: Result<(), _> = g
            .call("op", RetryPolicy::NoRetry, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::transient("test", "503"))
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_slow_call_times_out() {
        let g = guard(0, 10);
        let result: Result<(), _> = g
            .call("slow", RetryPolicy::RetryTransient, || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(
            result,
            Err(ProviderError::Timeout { ref operation, .. }) if operation == "slow"
        ));
    }

    #[tokio::test]
    async fn test_breaker_opens_and_fails_fast() {
        let g = guard(0, 2);
        for _ in 0..2 {
            let _: Result<(), _> = g
                .call("op", RetryPolicy::RetryTransient, || async {
                    Err(ProviderError::permanent("test", "down"))
                })
                .await;
        }
        assert_eq!(g.breaker().state(), CircuitState::Open);

        let calls = AtomicU32::new(0);
        let result: Result<(), _> = g
            .call("op", RetryPolicy::RetryTransient, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(ProviderError::Unhealthy { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_not_found_does_not_open_breaker() {
        let g = guard(0, 1);
        let _: Result<(), _> = g
            .call("op", RetryPolicy::RetryTransient, || async {
                Err(ProviderError::not_found("test", "issue #1"))
            })
            .await;
        assert_eq!(g.breaker().state(), CircuitState::Closed);
    }

    #[test]
    fn test_breaker_half_opens_after_cooldown() {
        let breaker = CircuitBreaker::new(
            "test",
            BreakerConfig {
                failure_threshold: 1,
                cooldown: Duration::ZERO,
            },
        );
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.allow_request());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_admits_a_single_trial_call() {
        let breaker = CircuitBreaker::new(
            "test",
            BreakerConfig {
                failure_threshold: 1,
                cooldown: Duration::from_millis(50),
            },
        );
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(60));

        assert!(breaker.allow_request());
        assert!(!breaker.allow_request());
        assert!(!breaker.allow_request());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        assert!(breaker.allow_request());
        assert!(breaker.allow_request());
    }

    #[test]
    fn test_lost_trial_call_is_replaced_after_cooldown() {
        let breaker = CircuitBreaker::new(
            "test",
            BreakerConfig {
                failure_threshold: 1,
                cooldown: Duration::from_millis(30),
            },
        );
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(40));
        assert!(breaker.allow_request());
        assert!(!breaker.allow_request());
        std::thread::sleep(Duration::from_millis(40));
        assert!(breaker.allow_request());
    }

    #[tokio::test]
    async fn test_retried_transition_that_already_landed_succeeds() {
        let tracker = MemoryTracker::new();
        tracker.add_issue(1, "Fix login", &["To Do", "developer:medior"]);
        tracker.drop_transition_replies(1);
        let resilient = ResilientTracker::new(tracker, guard(3, 10));

        resilient.transition_label(1, "To Do", "Doing").await.unwrap();
        assert_eq!(resilient.inner.labels_of(1), vec!["developer:medior", "Doing"]);
    }

    #[tokio::test]
    async fn test_transition_from_missing_label_still_fails() {
        let tracker = MemoryTracker::new();
        tracker.add_issue(1, "Fix login", &["Planning"]);
        let resilient = ResilientTracker::new(tracker, guard(3, 10));

        let err = resilient
            .transition_label(1, "To Do", "Doing")
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Permanent { .. }));
    }
}
