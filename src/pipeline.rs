//! Post-agent pipeline port.
//!
//! After the main agent session succeeds, a project may run an ordered set
//! of follow-up steps (verification, commit, push, review, whatever the
//! embedding application configures). The steps' business logic lives
//! outside this crate; the core only needs their ids and ordering, plus a
//! driver to execute or resume them.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::feature::{Feature, FeatureStatus};

/// One configured pipeline step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStep {
    pub id: String,
    pub name: String,
    pub order: u32,
}

impl PipelineStep {
    pub fn new(id: impl Into<String>, name: impl Into<String>, order: u32) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            order,
        }
    }
}

/// Where a feature sits relative to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub is_pipeline: bool,
    pub step_id: Option<String>,
    pub step_index: Option<usize>,
    pub total_steps: Option<usize>,
}

impl PipelineStatus {
    pub fn not_pipeline() -> Self {
        Self {
            is_pipeline: false,
            step_id: None,
            step_index: None,
            total_steps: None,
        }
    }

    pub fn in_step(step_id: impl Into<String>, step_index: usize, total_steps: usize) -> Self {
        Self {
            is_pipeline: true,
            step_id: Some(step_id.into()),
            step_index: Some(step_index),
            total_steps: Some(total_steps),
        }
    }
}

/// Everything a driver needs to run the pipeline for one feature.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub project_path: PathBuf,
    pub work_dir: PathBuf,
    pub worktree_path: Option<PathBuf>,
    pub branch_name: Option<String>,
    pub feature_id: String,
    /// Steps to run, already filtered and ordered.
    pub steps: Vec<PipelineStep>,
    pub cancel: CancellationToken,
}

/// Pipeline execution supplied by the embedding application.
#[async_trait]
pub trait PipelineDriver: Send + Sync {
    /// Steps configured for the project, in no particular order.
    async fn configured_steps(&self, project: &Path) -> anyhow::Result<Vec<PipelineStep>>;

    /// Run the given steps to completion. The driver owns per-step status
    /// bookkeeping (the `pipeline_<step>` statuses) while it runs.
    async fn execute(&self, ctx: PipelineContext) -> anyhow::Result<()>;

    /// Report where the feature sits relative to the pipeline.
    async fn detect_status(
        &self,
        project: &Path,
        feature_id: &str,
        status: &FeatureStatus,
    ) -> anyhow::Result<PipelineStatus>;

    /// Continue a feature parked mid-pipeline from its recorded position.
    async fn resume(
        &self,
        project: &Path,
        feature: &Feature,
        use_worktrees: bool,
        status: PipelineStatus,
    ) -> anyhow::Result<()>;
}

/// Order the configured steps and drop the ones a feature excludes.
pub fn runnable_steps(steps: &[PipelineStep], excluded: &[String]) -> Vec<PipelineStep> {
    let mut steps: Vec<PipelineStep> = steps
        .iter()
        .filter(|step| !excluded.contains(&step.id))
        .cloned()
        .collect();
    steps.sort_by_key(|step| step.order);
    steps
}

/// Derive a pipeline position from a feature status and the step list.
/// Drivers with no richer bookkeeping can use this as their `detect_status`.
pub fn position_from_status(status: &FeatureStatus, steps: &[PipelineStep]) -> PipelineStatus {
    let Some(step_id) = status.pipeline_step_id() else {
        return PipelineStatus::not_pipeline();
    };

    let ordered = runnable_steps(steps, &[]);
    match ordered.iter().position(|step| step.id == step_id) {
        Some(index) => PipelineStatus::in_step(step_id, index, ordered.len()),
        // Status names a step that is no longer configured; still a
        // pipeline position, just an unmapped one.
        None => PipelineStatus {
            is_pipeline: true,
            step_id: Some(step_id.to_string()),
            step_index: None,
            total_steps: Some(ordered.len()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steps() -> Vec<PipelineStep> {
        vec![
            PipelineStep::new("push", "Push branch", 3),
            PipelineStep::new("verify", "Run checks", 1),
            PipelineStep::new("commit", "Commit work", 2),
        ]
    }

    #[test]
    fn test_runnable_steps_ordering_and_exclusion() {
        let runnable = runnable_steps(&steps(), &["commit".to_string()]);
        let ids: Vec<&str> = runnable.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["verify", "push"]);
    }

    #[test]
    fn test_position_from_status() {
        let position = position_from_status(&FeatureStatus::pipeline("commit"), &steps());
        assert!(position.is_pipeline);
        assert_eq!(position.step_id.as_deref(), Some("commit"));
        assert_eq!(position.step_index, Some(1));
        assert_eq!(position.total_steps, Some(3));

        let position = position_from_status(&FeatureStatus::InProgress, &steps());
        assert_eq!(position, PipelineStatus::not_pipeline());
    }

    #[test]
    fn test_position_for_removed_step() {
        let position = position_from_status(&FeatureStatus::pipeline("deploy"), &steps());
        assert!(position.is_pipeline);
        assert_eq!(position.step_id.as_deref(), Some("deploy"));
        assert_eq!(position.step_index, None);
    }
}
