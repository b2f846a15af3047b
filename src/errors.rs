//! Typed error hierarchy for the Foreman engine.
//!
//! One enum per subsystem:
//! - `ConfigError` — workflow and role-registry validation at load time
//! - `StoreError` — worker state persistence and locking
//! - `ProviderError` — tracker / session-runtime / git collaborators
//! - `DispatchError` — failures that abort a dispatch before or at the commitment point
//! - `CompletionError` — failures that abort a completion before the label moves
//!
//! Advisory failures (best-effort labeling, notifications, post-commit state
//! writes) are never represented here; they travel as `warnings` on the
//! operation outcome instead.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid workflow: {}", .0.join("; "))]
    InvalidWorkflow(Vec<String>),

    #[error("Unknown role '{0}'")]
    UnknownRole(String),

    #[error("Unknown level '{level}' for role '{role}'")]
    UnknownLevel { role: String, level: String },

    #[error("Invalid role registry: {0}")]
    InvalidRegistry(String),
}

/// Errors from the worker state store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("State file IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse state file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Timed out after {waited_ms}ms waiting for state lock {path}")]
    LockTimeout { path: PathBuf, waited_ms: u64 },

    #[error("Project '{0}' not found")]
    ProjectNotFound(String),

    #[error("Project '{0}' already exists")]
    ProjectExists(String),

    #[error("No slot {index} at level '{level}' for role '{role}'")]
    SlotNotFound {
        role: String,
        level: String,
        index: usize,
    },

    #[error("Slot {role}/{level}#{index} is already held by #{holder}")]
    SlotOccupied {
        role: String,
        level: String,
        index: usize,
        holder: String,
    },

    #[error("Issue #{issue_id} is already held by slot {held_by}")]
    IssueHeld { issue_id: String, held_by: String },

    #[error("State task panicked: {0}")]
    Join(String),
}

/// Errors from external collaborators (tracker, session runtime, git).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Worth retrying: rate limits, 5xx, network hiccups.
    #[error("Transient {provider} failure: {message}")]
    Transient { provider: String, message: String },

    #[error("{provider} call failed: {message}")]
    Permanent { provider: String, message: String },

    #[error("{provider}: {what} not found")]
    NotFound { provider: String, what: String },

    #[error("{provider} call '{operation}' timed out after {secs}s")]
    Timeout {
        provider: String,
        operation: String,
        secs: u64,
    },

    /// Circuit breaker is open; the call was not attempted.
    #[error("Provider {provider} unhealthy (circuit open)")]
    Unhealthy { provider: String },
}

impl ProviderError {
    pub fn transient(provider: &str, message: impl Into<String>) -> Self {
        Self::Transient {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    pub fn permanent(provider: &str, message: impl Into<String>) -> Self {
        Self::Permanent {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    pub fn not_found(provider: &str, what: impl Into<String>) -> Self {
        Self::NotFound {
            provider: provider.to_string(),
            what: what.into(),
        }
    }

    /// Whether a retry with backoff may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Timeout { .. })
    }

    /// Whether this failure counts against the circuit breaker.
    /// A missing issue is an answer, not an outage.
    pub fn counts_as_failure(&self) -> bool {
        !matches!(self, Self::NotFound { .. } | Self::Unhealthy { .. })
    }
}

/// Errors that abort a dispatch. Everything after the label transition is
/// advisory and reported through `DispatchOutcome::warnings` instead.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Invalid dispatch request: {0}")]
    Validation(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("No free {role}/{level} slot in project '{project}'")]
    NoCapacity {
        project: String,
        role: String,
        level: String,
    },

    #[error("Issue #{issue_id} is already being worked on by {role}/{level}")]
    AlreadyActive {
        issue_id: u64,
        role: String,
        level: String,
    },

    /// The label transition failed; nothing was mutated and a retry is safe.
    #[error("Failed to move issue #{issue_id} from '{from}' to '{to}': {source}")]
    Commitment {
        issue_id: u64,
        from: String,
        to: String,
        #[source]
        source: ProviderError,
    },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors that abort a completion before the label transition.
#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("No completion rule for role '{role}' with result '{result}'")]
    NoRule { role: String, result: String },

    #[error("Invalid completion request: {0}")]
    Validation(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to move issue #{issue_id} from '{from}' to '{to}': {source}")]
    Transition {
        issue_id: u64,
        from: String,
        to: String,
        #[source]
        source: ProviderError,
    },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_retry_classification() {
        assert!(ProviderError::transient("github", "502").is_retryable());
        assert!(
            ProviderError::Timeout {
                provider: "github".into(),
                operation: "get_issue".into(),
                secs: 30
            }
            .is_retryable()
        );
        assert!(!ProviderError::permanent("github", "bad request").is_retryable());
        assert!(!ProviderError::not_found("github", "issue #1").is_retryable());
    }

    #[test]
    fn not_found_does_not_trip_the_breaker() {
        assert!(!ProviderError::not_found("github", "issue #1").counts_as_failure());
        assert!(ProviderError::permanent("github", "boom").counts_as_failure());
    }

    #[test]
    fn invalid_workflow_lists_every_problem() {
        let err = ConfigError::InvalidWorkflow(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "Invalid workflow: a; b");
    }

    #[test]
    fn dispatch_commitment_carries_labels() {
        let err = DispatchError::Commitment {
            issue_id: 42,
            from: "To Do".into(),
            to: "Doing".into(),
            source: ProviderError::transient("github", "502"),
        };
        let msg = err.to_string();
        assert!(msg.contains("#42"));
        assert!(msg.contains("To Do"));
        assert!(msg.contains("Doing"));
    }

    #[test]
    fn store_error_converts_into_dispatch_error() {
        let err: DispatchError = StoreError::ProjectNotFound("demo".into()).into();
        assert!(matches!(
            err,
            DispatchError::Store(StoreError::ProjectNotFound(_))
        ));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&ConfigError::UnknownRole("x".into()));
        assert_std_error(&StoreError::ProjectNotFound("x".into()));
        assert_std_error(&ProviderError::transient("x", "y"));
        assert_std_error(&CompletionError::Validation("x".into()));
    }
}
