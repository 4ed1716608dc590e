//! Feature domain types and the feature store port.
//!
//! Features are owned by the embedding application; the core only reads
//! them, moves their status along, and never touches how they are stored.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Lifecycle status of a feature.
///
/// The four fixed states are joined by an open `pipeline_<step>` family:
/// a feature parked mid-pipeline carries the id of the step it stopped at.
/// Unrecognized strings round-trip untouched so a store with richer states
/// never loses data through this crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FeatureStatus {
    Backlog,
    InProgress,
    WaitingApproval,
    Verified,
    /// Parked inside the post-agent pipeline at the named step.
    Pipeline(String),
    /// Any status string this crate does not schedule or resume.
    Other(String),
}

impl FeatureStatus {
    pub fn pipeline(step_id: impl Into<String>) -> Self {
        Self::Pipeline(step_id.into())
    }

    /// Eligible for an auto-loop launch.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Backlog)
    }

    /// Interrupted mid-run: either executing or parked inside the pipeline.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::InProgress | Self::Pipeline(_))
    }

    /// Step id when the status belongs to the pipeline family.
    pub fn pipeline_step_id(&self) -> Option<&str> {
        match self {
            Self::Pipeline(step) => Some(step),
            _ => None,
        }
    }
}

impl Default for FeatureStatus {
    fn default() -> Self {
        Self::Backlog
    }
}

impl fmt::Display for FeatureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backlog => write!(f, "backlog"),
            Self::InProgress => write!(f, "in_progress"),
            Self::WaitingApproval => write!(f, "waiting_approval"),
            Self::Verified => write!(f, "verified"),
            Self::Pipeline(step) => write!(f, "pipeline_{step}"),
            Self::Other(raw) => write!(f, "{raw}"),
        }
    }
}

impl From<String> for FeatureStatus {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "backlog" => Self::Backlog,
            "in_progress" => Self::InProgress,
            "waiting_approval" => Self::WaitingApproval,
            "verified" => Self::Verified,
            _ => match raw.strip_prefix("pipeline_") {
                Some(step) if !step.is_empty() => Self::Pipeline(step.to_string()),
                _ => Self::Other(raw),
            },
        }
    }
}

impl From<FeatureStatus> for String {
    fn from(status: FeatureStatus) -> Self {
        status.to_string()
    }
}

/// Approval state of a feature's implementation plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Draft,
    PendingReview,
    Approved,
}

/// An implementation plan attached to a feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSpec {
    pub status: PlanStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl PlanSpec {
    pub fn approved(content: impl Into<String>) -> Self {
        Self {
            status: PlanStatus::Approved,
            content: Some(content.into()),
        }
    }
}

/// A unit of work the orchestrator can execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: FeatureStatus,

    /// Branch this feature's work lives on, when worktrees are in play.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_spec: Option<PlanSpec>,

    /// Opted out of automated verification; completion parks at
    /// `waiting_approval` instead of `verified`.
    #[serde(default)]
    pub skip_tests: bool,

    /// Image attachments forwarded to the agent session.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<PathBuf>,

    /// Model tag forwarded to the agent session, reporting only otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Pipeline step ids this feature skips.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_pipeline_steps: Vec<String>,
}

impl Feature {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            status: FeatureStatus::Backlog,
            branch_name: None,
            plan_spec: None,
            skip_tests: false,
            images: Vec::new(),
            model: None,
            excluded_pipeline_steps: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_status(mut self, status: FeatureStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch_name = Some(branch.into());
        self
    }

    pub fn with_plan(mut self, plan: PlanSpec) -> Self {
        self.plan_spec = Some(plan);
        self
    }

    pub fn with_skip_tests(mut self, skip: bool) -> Self {
        self.skip_tests = skip;
        self
    }

    /// Approved plan content awaiting execution, if any.
    pub fn approved_plan(&self) -> Option<&str> {
        self.plan_spec
            .as_ref()
            .filter(|plan| plan.status == PlanStatus::Approved)
            .and_then(|plan| plan.content.as_deref())
            .filter(|content| !content.trim().is_empty())
    }
}

/// Read/update access to the embedding application's feature storage.
///
/// `list` exists for the scheduler's pending query and the startup recovery
/// scan; implementations are free to back it with a directory walk, a
/// database, or anything else.
#[async_trait]
pub trait FeatureStore: Send + Sync {
    async fn load(&self, project: &Path, feature_id: &str) -> anyhow::Result<Option<Feature>>;

    async fn update_status(
        &self,
        project: &Path,
        feature_id: &str,
        status: FeatureStatus,
    ) -> anyhow::Result<()>;

    async fn list(&self, project: &Path) -> anyhow::Result<Vec<Feature>>;
}
