//! Event types emitted by the orchestration core.
//!
//! Events are the only outward-facing signal surface: UIs, logs, and tests
//! all observe the same stream. Payloads are serde-tagged so subscribers
//! can forward them over any transport as JSON.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FailureKind;

/// Everything the core announces about executions and auto loops.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    /// An execution began (status already moved to `in_progress`).
    FeatureStarted {
        project_path: PathBuf,
        feature_id: String,
        auto_mode: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        worktree_path: Option<PathBuf>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        branch_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// An execution ended without an error. `passes` is false when the run
    /// was cancelled rather than finished.
    FeatureCompleted {
        project_path: PathBuf,
        feature_id: String,
        passes: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        learnings: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// An execution failed; `kind` is the classified failure.
    FeatureFailed {
        project_path: PathBuf,
        feature_id: String,
        kind: FailureKind,
        message: String,
        timestamp: DateTime<Utc>,
    },

    AutoLoopStarted {
        project_path: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        branch_name: Option<String>,
        max_concurrency: usize,
        timestamp: DateTime<Utc>,
    },

    AutoLoopStopped {
        project_path: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        branch_name: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// The loop stopped itself after repeated or capacity failures.
    AutoLoopPaused {
        project_path: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        branch_name: Option<String>,
        kind: FailureKind,
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// Nothing pending and nothing running for this loop's worktree.
    AutoLoopIdle {
        project_path: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        branch_name: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// Startup scan found features that were interrupted mid-run.
    InterruptedFeaturesDetected {
        project_path: PathBuf,
        /// Feature ids with a saved agent transcript to resume from.
        with_context: Vec<String>,
        /// Feature ids that will restart fresh.
        without_context: Vec<String>,
        timestamp: DateTime<Utc>,
    },
}

impl OrchestratorEvent {
    /// The serde tag of this event.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::FeatureStarted { .. } => "feature_started",
            Self::FeatureCompleted { .. } => "feature_completed",
            Self::FeatureFailed { .. } => "feature_failed",
            Self::AutoLoopStarted { .. } => "auto_loop_started",
            Self::AutoLoopStopped { .. } => "auto_loop_stopped",
            Self::AutoLoopPaused { .. } => "auto_loop_paused",
            Self::AutoLoopIdle { .. } => "auto_loop_idle",
            Self::InterruptedFeaturesDetected { .. } => "interrupted_features_detected",
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::FeatureStarted { timestamp, .. }
            | Self::FeatureCompleted { timestamp, .. }
            | Self::FeatureFailed { timestamp, .. }
            | Self::AutoLoopStarted { timestamp, .. }
            | Self::AutoLoopStopped { timestamp, .. }
            | Self::AutoLoopPaused { timestamp, .. }
            | Self::AutoLoopIdle { timestamp, .. }
            | Self::InterruptedFeaturesDetected { timestamp, .. } => *timestamp,
        }
    }

    pub fn project_path(&self) -> &Path {
        match self {
            Self::FeatureStarted { project_path, .. }
            | Self::FeatureCompleted { project_path, .. }
            | Self::FeatureFailed { project_path, .. }
            | Self::AutoLoopStarted { project_path, .. }
            | Self::AutoLoopStopped { project_path, .. }
            | Self::AutoLoopPaused { project_path, .. }
            | Self::AutoLoopIdle { project_path, .. }
            | Self::InterruptedFeaturesDetected { project_path, .. } => project_path,
        }
    }

    /// Feature id for per-feature events, `None` for loop-level ones.
    pub fn feature_id(&self) -> Option<&str> {
        match self {
            Self::FeatureStarted { feature_id, .. }
            | Self::FeatureCompleted { feature_id, .. }
            | Self::FeatureFailed { feature_id, .. } => Some(feature_id),
            _ => None,
        }
    }
}
