//! Crash recovery: persisted execution snapshots, saved agent output,
//! and the manager that picks interrupted features back up.

pub mod context;
pub mod state_file;

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::{AutodevError, AutodevResult};
use crate::events::{OrchestratorEvent, SharedEventBus};
use crate::executor::{prompts, Collaborators, ExecutionRequest, FeatureExecutor};
use crate::feature::FeatureStore;
use crate::leases::{AcquireRequest, SharedLeaseTracker};
use crate::pipeline::PipelineDriver;
use crate::workspace::verify_workdir;

pub use context::{extract_learnings, extract_summary, ContextStore};
pub use state_file::{ExecutionState, ExecutionStateStore};

/// How a resume request was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeAction {
    /// Another execution already holds the feature; nothing to do.
    AlreadyRunning,
    /// The feature was mid-pipeline and was handed to the pipeline driver.
    PipelineResumed,
    /// The agent was re-run with the saved transcript as its starting point.
    ContinuedFromContext,
    /// No saved context existed; the feature started over.
    RestartedFresh,
}

/// What a startup scan found and did.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// Interrupted features that had saved agent output.
    pub with_context: Vec<String>,
    /// Interrupted features with nothing saved; these restart fresh.
    pub without_context: Vec<String>,
    /// How many resumes ran to completion.
    pub resumed: usize,
    /// Features whose resume errored; they are retried by a later scan.
    pub failed: Vec<String>,
}

impl RecoveryReport {
    pub fn interrupted_count(&self) -> usize {
        self.with_context.len() + self.without_context.len()
    }
}

/// Resumes interrupted feature work after a crash or restart.
pub struct RecoveryManager {
    tracker: SharedLeaseTracker,
    events: SharedEventBus,
    contexts: ContextStore,
    store: Arc<dyn FeatureStore>,
    pipeline: Arc<dyn PipelineDriver>,
    executor: Arc<FeatureExecutor>,
}

impl RecoveryManager {
    pub fn new(
        tracker: SharedLeaseTracker,
        events: SharedEventBus,
        contexts: ContextStore,
        collaborators: Collaborators,
        executor: Arc<FeatureExecutor>,
    ) -> Self {
        Self {
            tracker,
            events,
            contexts,
            store: collaborators.store,
            pipeline: collaborators.pipeline,
            executor,
        }
    }

    /// Resume one interrupted feature.
    ///
    /// Safe to call twice: the second caller observes the lease and
    /// backs off with [`ResumeAction::AlreadyRunning`]. The lease is
    /// held across the routing decision so the check and the start are
    /// one atomic step.
    pub async fn resume_feature(
        &self,
        project: &Path,
        feature_id: &str,
        use_worktrees: bool,
        called_internally: bool,
    ) -> AutodevResult<ResumeAction> {
        let project = verify_workdir(project)?;

        if !called_internally && self.tracker.is_running(feature_id) {
            info!(feature_id, "feature already running, resume skipped");
            return Ok(ResumeAction::AlreadyRunning);
        }

        let acquire =
            AcquireRequest::new(feature_id, &project).with_allow_reuse(called_internally);
        if let Err(err) = self.tracker.acquire(acquire) {
            return match err {
                AutodevError::AlreadyRunning { .. } => {
                    info!(feature_id, "lost the resume race, feature already running");
                    Ok(ResumeAction::AlreadyRunning)
                }
                other => Err(other),
            };
        }

        let result = self
            .dispatch_resume(&project, feature_id, use_worktrees)
            .await;
        self.tracker.release(feature_id, false);
        result
    }

    /// Startup scan: find every interrupted feature in the project and
    /// resume each one in turn. Per-feature failures are logged and do
    /// not stop the scan.
    pub async fn resume_interrupted(
        &self,
        project: &Path,
        use_worktrees: bool,
    ) -> AutodevResult<RecoveryReport> {
        let project = verify_workdir(project)?;
        let features = self.store.list(&project).await?;

        let mut report = RecoveryReport::default();
        for feature in &features {
            if !feature.status.is_interrupted() || self.tracker.is_running(&feature.id) {
                continue;
            }
            if self.contexts.context_exists(&project, &feature.id) {
                report.with_context.push(feature.id.clone());
            } else {
                report.without_context.push(feature.id.clone());
            }
        }

        if report.interrupted_count() == 0 {
            debug!(project = %project.display(), "no interrupted features");
            return Ok(report);
        }

        info!(
            project = %project.display(),
            with_context = report.with_context.len(),
            without_context = report.without_context.len(),
            "found interrupted features"
        );
        self.events
            .publish(OrchestratorEvent::InterruptedFeaturesDetected {
                project_path: project.clone(),
                with_context: report.with_context.clone(),
                without_context: report.without_context.clone(),
                timestamp: Utc::now(),
            });

        let ids: Vec<String> = report
            .with_context
            .iter()
            .chain(report.without_context.iter())
            .cloned()
            .collect();
        for feature_id in ids {
            match self
                .resume_feature(&project, &feature_id, use_worktrees, false)
                .await
            {
                Ok(action) => {
                    debug!(feature_id, ?action, "resume finished");
                    report.resumed += 1;
                }
                Err(err) => {
                    warn!(feature_id, error = %err, "resume failed");
                    report.failed.push(feature_id);
                }
            }
        }
        Ok(report)
    }

    /// Route one held feature to the right resume path.
    async fn dispatch_resume(
        &self,
        project: &Path,
        feature_id: &str,
        use_worktrees: bool,
    ) -> AutodevResult<ResumeAction> {
        let feature = self
            .store
            .load(project, feature_id)
            .await?
            .ok_or_else(|| AutodevError::feature_not_found(feature_id))?;

        let position = self
            .pipeline
            .detect_status(project, feature_id, &feature.status)
            .await?;
        if position.is_pipeline {
            info!(
                feature_id,
                step = position.step_id.as_deref().unwrap_or("unknown"),
                "resuming mid-pipeline"
            );
            self.pipeline
                .resume(project, &feature, use_worktrees, position)
                .await?;
            return Ok(ResumeAction::PipelineResumed);
        }

        if let Some(transcript) = self.contexts.read_context(project, feature_id)? {
            info!(feature_id, "resuming from saved agent output");
            let request = ExecutionRequest::new(project, feature_id)
                .with_use_worktrees(use_worktrees)
                .with_continuation(prompts::resume_prompt(&feature, &transcript))
                .with_called_internally(true);
            self.executor.execute(request).await?;
            return Ok(ResumeAction::ContinuedFromContext);
        }

        info!(feature_id, "no saved output, restarting feature");
        let request = ExecutionRequest::new(project, feature_id)
            .with_use_worktrees(use_worktrees)
            .with_called_internally(true);
        self.executor.execute(request).await?;
        Ok(ResumeAction::RestartedFresh)
    }
}
