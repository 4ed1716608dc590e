//! Error types and failure classification.
//!
//! Every fallible core operation returns [`AutodevResult`]. Failures that
//! reach the scheduler's pause logic are classified once, at the execution
//! engine boundary, into a [`FailureKind`]; nothing downstream re-inspects
//! error strings.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for core operations.
pub type AutodevResult<T> = Result<T, AutodevError>;

/// Classification of an execution failure, used to decide whether the
/// auto loop should pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The user (or a caller) cancelled the run. Not an error condition.
    Abort,
    /// The agent provider reported an exhausted quota or spent credits.
    QuotaExhausted,
    /// The agent provider is rate limiting or overloaded.
    RateLimit,
    /// The agent session itself failed.
    AgentError,
    /// Anything else: store errors, IO, corrupted state.
    Unknown,
}

impl FailureKind {
    /// Capacity-related failures pause the auto loop immediately, without
    /// waiting for the consecutive-failure threshold.
    pub fn is_capacity(self) -> bool {
        matches!(self, Self::QuotaExhausted | Self::RateLimit)
    }

    /// Whether this kind represents a deliberate stop rather than a failure.
    pub fn is_abort(self) -> bool {
        matches!(self, Self::Abort)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Abort => write!(f, "abort"),
            Self::QuotaExhausted => write!(f, "quota_exhausted"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::AgentError => write!(f, "agent_error"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// A classified failure, as handed to the failure tracker and carried on
/// failure events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureInfo {
    pub kind: FailureKind,
    pub message: String,
}

impl FailureInfo {
    pub fn from_error(err: &AutodevError) -> Self {
        Self {
            kind: err.classify(),
            message: err.to_string(),
        }
    }
}

/// Errors that can occur during orchestration operations.
#[derive(Error, Debug)]
pub enum AutodevError {
    /// Feature id not present in the caller's store.
    #[error("Feature not found: {feature_id}")]
    FeatureNotFound { feature_id: String },

    /// A lease already exists for this feature and reuse was not allowed.
    #[error("Feature is already running: {feature_id}")]
    AlreadyRunning { feature_id: String },

    /// An auto loop is already active for this project/worktree key.
    #[error("Auto loop already running for {project} ({branch})")]
    LoopAlreadyRunning { project: PathBuf, branch: String },

    /// The resolved working directory failed validation.
    #[error("Invalid working directory {path}: {reason}")]
    WorkdirInvalid { path: PathBuf, reason: String },

    /// The agent session returned an error.
    #[error("Agent run failed: {message}")]
    Agent { message: String },

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error surfaced by a collaborator trait (store, pipeline, resolver).
    #[error(transparent)]
    External(#[from] anyhow::Error),
}

impl AutodevError {
    /// Create a feature not found error
    pub fn feature_not_found(feature_id: impl Into<String>) -> Self {
        Self::FeatureNotFound {
            feature_id: feature_id.into(),
        }
    }

    /// Create an already running error
    pub fn already_running(feature_id: impl Into<String>) -> Self {
        Self::AlreadyRunning {
            feature_id: feature_id.into(),
        }
    }

    /// Create a loop already running error
    pub fn loop_already_running(project: impl Into<PathBuf>, branch: Option<&str>) -> Self {
        Self::LoopAlreadyRunning {
            project: project.into(),
            branch: branch.unwrap_or("default").to_string(),
        }
    }

    /// Create a working directory validation error
    pub fn workdir_invalid(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::WorkdirInvalid {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Wrap an agent session failure, preserving the full error chain text.
    pub fn agent(err: anyhow::Error) -> Self {
        Self::Agent {
            message: format!("{err:#}"),
        }
    }

    /// Classify this error for the scheduler's pause logic.
    ///
    /// Message patterns win over the error's structural variant, so a quota
    /// message surfaced through any path still pauses the loop immediately.
    pub fn classify(&self) -> FailureKind {
        match self {
            Self::Agent { message } => {
                classify_message(message).unwrap_or(FailureKind::AgentError)
            }
            Self::External(err) => {
                classify_message(&format!("{err:#}")).unwrap_or(FailureKind::Unknown)
            }
            _ => classify_message(&self.to_string()).unwrap_or(FailureKind::Unknown),
        }
    }
}

/// Substring classification over a failure message. First match wins, in
/// the order abort, quota, rate limit.
fn classify_message(message: &str) -> Option<FailureKind> {
    let lower = message.to_lowercase();

    const ABORT_PATTERNS: &[&str] = &["abort", "cancel", "interrupt"];
    const QUOTA_PATTERNS: &[&str] = &["quota", "usage limit", "credit balance", "out of credits"];
    const RATE_LIMIT_PATTERNS: &[&str] =
        &["rate limit", "too many requests", "429", "overloaded"];

    if ABORT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return Some(FailureKind::Abort);
    }
    if QUOTA_PATTERNS.iter().any(|p| lower.contains(p)) {
        return Some(FailureKind::QuotaExhausted);
    }
    if RATE_LIMIT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return Some(FailureKind::RateLimit);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AutodevError::feature_not_found("auth-flow");
        assert!(err.to_string().contains("auth-flow"));

        let err = AutodevError::loop_already_running("/work/proj", Some("feat/login"));
        assert!(err.to_string().contains("feat/login"));

        let err = AutodevError::loop_already_running("/work/proj", None);
        assert!(err.to_string().contains("default"));
    }

    #[test]
    fn test_classify_quota() {
        let err = AutodevError::agent(anyhow::anyhow!("provider said: quota exceeded for org"));
        assert_eq!(err.classify(), FailureKind::QuotaExhausted);

        let err = AutodevError::agent(anyhow::anyhow!("Your credit balance is too low"));
        assert_eq!(err.classify(), FailureKind::QuotaExhausted);
    }

    #[test]
    fn test_classify_rate_limit() {
        let err = AutodevError::agent(anyhow::anyhow!("HTTP 429: Too Many Requests"));
        assert_eq!(err.classify(), FailureKind::RateLimit);

        let err = AutodevError::agent(anyhow::anyhow!("upstream overloaded, retry later"));
        assert_eq!(err.classify(), FailureKind::RateLimit);
    }

    #[test]
    fn test_classify_abort_wins_over_other_patterns() {
        // A cancelled run may still mention the request that was in flight.
        let err = AutodevError::agent(anyhow::anyhow!("operation aborted while rate limited"));
        assert_eq!(err.classify(), FailureKind::Abort);
    }

    #[test]
    fn test_classify_agent_default() {
        let err = AutodevError::agent(anyhow::anyhow!("session exited with code 1"));
        assert_eq!(err.classify(), FailureKind::AgentError);
    }

    #[test]
    fn test_classify_external_default_unknown() {
        let err: AutodevError = anyhow::anyhow!("disk quota exceeded").into();
        // Pattern match still applies to collaborator errors.
        assert_eq!(err.classify(), FailureKind::QuotaExhausted);

        let err: AutodevError = anyhow::anyhow!("feature store unavailable").into();
        assert_eq!(err.classify(), FailureKind::Unknown);
    }

    #[test]
    fn test_capacity_kinds() {
        assert!(FailureKind::QuotaExhausted.is_capacity());
        assert!(FailureKind::RateLimit.is_capacity());
        assert!(!FailureKind::AgentError.is_capacity());
        assert!(!FailureKind::Abort.is_capacity());
        assert!(!FailureKind::Unknown.is_capacity());
    }

    #[test]
    fn test_failure_info_from_error() {
        let err = AutodevError::agent(anyhow::anyhow!("rate limit hit"));
        let info = FailureInfo::from_error(&err);
        assert_eq!(info.kind, FailureKind::RateLimit);
        assert!(info.message.contains("rate limit"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: AutodevError = io_err.into();
        assert!(matches!(err, AutodevError::Io(_)));
        assert_eq!(err.classify(), FailureKind::Unknown);
    }

    #[test]
    fn test_kind_display_snake_case() {
        assert_eq!(FailureKind::QuotaExhausted.to_string(), "quota_exhausted");
        assert_eq!(FailureKind::RateLimit.to_string(), "rate_limit");
        assert_eq!(FailureKind::Abort.to_string(), "abort");
    }
}
