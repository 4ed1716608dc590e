//! Feature execution state machine.
//!
//! `FeatureExecutor::execute` drives one feature from `backlog` to its
//! final status: lease the feature, load it, resolve the working
//! directory, run the agent, hand off to the pipeline when steps are
//! configured, then finalize. An approved plan does not run the agent
//! directly; it turns into a continuation prompt and the loop takes
//! another pass, so the pass that does the work observes the lease count
//! at two.
//!
//! Errors are classified exactly once, here at the boundary. Inner
//! collaborators return plain `anyhow` errors and stay ignorant of
//! failure kinds.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::anyhow;
use chrono::Utc;
use tracing::{error, info, warn};

use crate::agent::{AgentInvocation, AgentRunner};
use crate::config::OrchestratorConfig;
use crate::error::{AutodevError, AutodevResult, FailureInfo};
use crate::events::{OrchestratorEvent, SharedEventBus};
use crate::feature::{Feature, FeatureStatus, FeatureStore};
use crate::leases::{AcquireRequest, RunningFeatureUpdate, SharedLeaseTracker};
use crate::pipeline::{runnable_steps, PipelineContext, PipelineDriver};
use crate::recovery::{ContextStore, ExecutionStateStore};
use crate::scheduler::{LoopKey, SharedLoopRegistry};
use crate::workspace::{verify_workdir, WorktreeResolver};

use super::prompts;

/// One request to run a feature to completion.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub project_path: PathBuf,
    pub feature_id: String,
    /// Launched by the auto loop rather than an explicit user action.
    pub auto_mode: bool,
    /// Resolve the feature's branch to a worktree before running.
    pub use_worktrees: bool,
    /// Explicit working directory, bypassing worktree resolution.
    pub worktree_path: Option<PathBuf>,
    /// Branch of the auto loop that launched this run, for failure
    /// accounting and state snapshots.
    pub loop_branch: Option<String>,
    /// Pre-built prompt that replaces the fresh task prompt.
    pub continuation_prompt: Option<String>,
    /// Set when another orchestrator component calls in while already
    /// holding a lease on this feature.
    pub called_internally: bool,
}

impl ExecutionRequest {
    pub fn new(project_path: impl Into<PathBuf>, feature_id: impl Into<String>) -> Self {
        Self {
            project_path: project_path.into(),
            feature_id: feature_id.into(),
            auto_mode: false,
            use_worktrees: false,
            worktree_path: None,
            loop_branch: None,
            continuation_prompt: None,
            called_internally: false,
        }
    }

    pub fn with_auto_mode(mut self, auto_mode: bool) -> Self {
        self.auto_mode = auto_mode;
        self
    }

    pub fn with_use_worktrees(mut self, use_worktrees: bool) -> Self {
        self.use_worktrees = use_worktrees;
        self
    }

    pub fn with_worktree_path(mut self, path: Option<PathBuf>) -> Self {
        self.worktree_path = path;
        self
    }

    pub fn with_loop_branch(mut self, branch: Option<String>) -> Self {
        self.loop_branch = branch;
        self
    }

    pub fn with_continuation(mut self, prompt: impl Into<String>) -> Self {
        self.continuation_prompt = Some(prompt.into());
        self
    }

    pub fn with_called_internally(mut self, called_internally: bool) -> Self {
        self.called_internally = called_internally;
        self
    }
}

/// What a finished execution looked like.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub feature_id: String,
    /// True when the run completed its work, false when it was stopped.
    pub passes: bool,
    pub final_status: Option<FeatureStatus>,
    pub summary: Option<String>,
    pub learnings: Option<String>,
    /// True when the run ended because of a stop request.
    pub stopped: bool,
}

/// Result of one pass through the machine.
enum PassOutcome {
    /// Run again with this prompt. The pass keeps its lease.
    Continue(String),
    Finished(ExecutionOutcome),
}

/// Collaborator implementations supplied by the embedding application.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn FeatureStore>,
    pub agent: Arc<dyn AgentRunner>,
    pub worktrees: Arc<dyn WorktreeResolver>,
    pub pipeline: Arc<dyn PipelineDriver>,
}

/// Drives single-feature executions against the shared lease tracker.
pub struct FeatureExecutor {
    config: Arc<OrchestratorConfig>,
    tracker: SharedLeaseTracker,
    events: SharedEventBus,
    loops: SharedLoopRegistry,
    states: Arc<ExecutionStateStore>,
    contexts: ContextStore,
    store: Arc<dyn FeatureStore>,
    agent: Arc<dyn AgentRunner>,
    worktrees: Arc<dyn WorktreeResolver>,
    pipeline: Arc<dyn PipelineDriver>,
}

impl FeatureExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<OrchestratorConfig>,
        tracker: SharedLeaseTracker,
        events: SharedEventBus,
        loops: SharedLoopRegistry,
        states: Arc<ExecutionStateStore>,
        contexts: ContextStore,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            config,
            tracker,
            events,
            loops,
            states,
            contexts,
            store: collaborators.store,
            agent: collaborators.agent,
            worktrees: collaborators.worktrees,
            pipeline: collaborators.pipeline,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run a feature to completion.
    ///
    /// Holds a lease for the whole call and releases exactly what it
    /// acquired, even on failure. Stop requests surface as a successful
    /// return with `stopped` set; real failures come back as errors
    /// after the failure event has been published.
    pub async fn execute(&self, request: ExecutionRequest) -> AutodevResult<ExecutionOutcome> {
        let mut held: u32 = 0;
        let mut continuation = request.continuation_prompt.clone();

        let result = match verify_workdir(&request.project_path) {
            Ok(project) => loop {
                match self
                    .run_pass(&request, &project, continuation.take(), &mut held)
                    .await
                {
                    Ok(PassOutcome::Continue(prompt)) => continuation = Some(prompt),
                    Ok(PassOutcome::Finished(outcome)) => break Ok(outcome),
                    Err(err) => break Err(err),
                }
            },
            Err(err) => Err(err),
        };

        let outcome = match result {
            Ok(outcome) => Ok(outcome),
            Err(err) => self.handle_failure(&request, err).await,
        };

        for _ in 0..held {
            self.tracker.release(&request.feature_id, false);
        }
        if request.auto_mode {
            if let Err(err) = self
                .states
                .persist(&request.project_path, request.loop_branch.as_deref())
            {
                warn!(error = %err, "failed to persist execution state after run");
            }
        }
        outcome
    }

    /// Cancel a running execution and force-release its lease. The old
    /// run unwinds through its cancellation token while the feature is
    /// already free to be leased again. Returns false if the feature is
    /// not running.
    pub fn stop_feature(&self, feature_id: &str) -> bool {
        info!(feature_id, "stop requested");
        self.tracker.release(feature_id, true)
    }

    async fn run_pass(
        &self,
        request: &ExecutionRequest,
        project: &Path,
        continuation: Option<String>,
        held: &mut u32,
    ) -> AutodevResult<PassOutcome> {
        let feature_id = request.feature_id.as_str();

        let acquire = AcquireRequest::new(feature_id, project)
            .with_auto_mode(request.auto_mode)
            .with_allow_reuse(request.called_internally || *held > 0)
            .with_branch(request.loop_branch.clone());
        let entry = self.tracker.acquire(acquire)?;
        *held += 1;
        let cancel = entry.cancel.clone();

        let feature = self
            .store
            .load(project, feature_id)
            .await?
            .ok_or_else(|| AutodevError::feature_not_found(feature_id))?;

        // An approved plan becomes the prompt for the next pass instead
        // of running the agent on the raw feature text. Skipped when a
        // continuation prompt was already supplied.
        if continuation.is_none() {
            if let Some(plan) = feature.approved_plan() {
                info!(feature_id, "approved plan found, executing plan");
                let prompt = prompts::plan_continuation_prompt(&feature, plan);
                return Ok(PassOutcome::Continue(prompt));
            }

            // A transcript left behind by an interrupted run redirects
            // this call onto the resume path, so executing the feature
            // again picks up where it stopped instead of starting over.
            match self.contexts.read_context(project, feature_id) {
                Ok(Some(saved)) => {
                    info!(feature_id, "saved agent output found, resuming from it");
                    let prompt = prompts::resume_prompt(&feature, &saved);
                    return Ok(PassOutcome::Continue(prompt));
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(feature_id, error = %err, "failed to read saved agent output");
                }
            }
        }

        let (work_dir, worktree_path, branch_name) =
            self.resolve_workdir(request, project, &feature).await?;

        self.store
            .update_status(project, feature_id, FeatureStatus::InProgress)
            .await?;
        self.tracker.update(
            feature_id,
            RunningFeatureUpdate {
                worktree_path: worktree_path.clone(),
                branch_name: branch_name.clone(),
                model: feature.model.clone(),
                ..Default::default()
            },
        );
        if request.auto_mode {
            if let Err(err) = self.states.persist(project, request.loop_branch.as_deref()) {
                warn!(error = %err, "failed to persist execution state at start");
            }
        }
        self.events.publish(OrchestratorEvent::FeatureStarted {
            project_path: project.to_path_buf(),
            feature_id: feature_id.to_string(),
            auto_mode: request.auto_mode,
            worktree_path: worktree_path.clone(),
            branch_name: branch_name.clone(),
            model: feature.model.clone(),
            timestamp: Utc::now(),
        });
        info!(
            feature_id,
            work_dir = %work_dir.display(),
            auto_mode = request.auto_mode,
            "starting feature execution"
        );

        let prompt = match continuation {
            Some(prompt) => prompt,
            None => prompts::task_prompt(&feature),
        };
        let invocation = AgentInvocation::new(project, &work_dir, feature_id, prompt)
            .with_images(feature.images.clone())
            .with_model(feature.model.clone())
            .with_cancel(cancel.clone());
        self.agent.run(invocation).await.map_err(AutodevError::agent)?;
        if cancel.is_cancelled() {
            return Err(AutodevError::agent(anyhow!("run cancelled by stop request")));
        }

        let steps = self.pipeline.configured_steps(project).await?;
        let runnable = runnable_steps(&steps, &feature.excluded_pipeline_steps);
        if !runnable.is_empty() {
            info!(feature_id, steps = runnable.len(), "handing off to pipeline");
            let ctx = PipelineContext {
                project_path: project.to_path_buf(),
                work_dir: work_dir.clone(),
                worktree_path: worktree_path.clone(),
                branch_name: branch_name.clone(),
                feature_id: feature_id.to_string(),
                steps: runnable,
                cancel: cancel.clone(),
            };
            self.pipeline.execute(ctx).await?;
            if cancel.is_cancelled() {
                return Err(AutodevError::agent(anyhow!("run cancelled by stop request")));
            }
        }

        self.finalize(request, project, &feature).await
    }

    /// Resolve where the agent runs. An explicit directory must be
    /// valid; a failed worktree lookup falls back to the project root.
    async fn resolve_workdir(
        &self,
        request: &ExecutionRequest,
        project: &Path,
        feature: &Feature,
    ) -> AutodevResult<(PathBuf, Option<PathBuf>, Option<String>)> {
        if let Some(explicit) = &request.worktree_path {
            let work_dir = verify_workdir(explicit)?;
            return Ok((
                work_dir.clone(),
                Some(work_dir),
                feature.branch_name.clone(),
            ));
        }

        if request.use_worktrees {
            if let Some(branch) = &feature.branch_name {
                match self.worktrees.find_worktree(project, branch).await {
                    Ok(Some(path)) => {
                        let work_dir = verify_workdir(&path)?;
                        return Ok((work_dir.clone(), Some(work_dir), Some(branch.clone())));
                    }
                    Ok(None) => {
                        warn!(
                            feature_id = %feature.id,
                            branch,
                            "no worktree for branch, running in project root"
                        );
                    }
                    Err(err) => {
                        warn!(
                            feature_id = %feature.id,
                            branch,
                            error = %err,
                            "worktree lookup failed, running in project root"
                        );
                    }
                }
                return Ok((project.to_path_buf(), None, Some(branch.clone())));
            }
        }

        Ok((project.to_path_buf(), None, request.loop_branch.clone()))
    }

    async fn finalize(
        &self,
        request: &ExecutionRequest,
        project: &Path,
        feature: &Feature,
    ) -> AutodevResult<PassOutcome> {
        let feature_id = request.feature_id.as_str();
        let final_status = if feature.skip_tests {
            FeatureStatus::WaitingApproval
        } else {
            FeatureStatus::Verified
        };
        self.store
            .update_status(project, feature_id, final_status.clone())
            .await?;

        if request.auto_mode {
            self.loops
                .record_success(&LoopKey::new(project, request.loop_branch.as_deref()));
        }

        let transcript = match self.contexts.read_context(project, feature_id) {
            Ok(transcript) => transcript,
            Err(err) => {
                warn!(feature_id, error = %err, "failed to read saved agent output");
                None
            }
        };
        let summary = transcript
            .as_deref()
            .and_then(crate::recovery::extract_summary);
        let learnings = transcript
            .as_deref()
            .and_then(crate::recovery::extract_learnings);

        self.events.publish(OrchestratorEvent::FeatureCompleted {
            project_path: project.to_path_buf(),
            feature_id: feature_id.to_string(),
            passes: true,
            summary: summary.clone(),
            learnings: learnings.clone(),
            timestamp: Utc::now(),
        });
        info!(feature_id, status = %final_status, "feature execution complete");

        Ok(PassOutcome::Finished(ExecutionOutcome {
            feature_id: feature_id.to_string(),
            passes: true,
            final_status: Some(final_status),
            summary,
            learnings,
            stopped: false,
        }))
    }

    /// Classify a failed run, publish the matching event, and feed the
    /// auto-loop failure tracker. Stop requests come back as an `Ok`
    /// outcome with `stopped` set; everything else stays an error.
    async fn handle_failure(
        &self,
        request: &ExecutionRequest,
        err: AutodevError,
    ) -> AutodevResult<ExecutionOutcome> {
        let feature_id = request.feature_id.as_str();

        // A lease that was already held belongs to a healthy run; do not
        // publish events or count failures for the loser of a start race.
        if matches!(err, AutodevError::AlreadyRunning { .. }) {
            warn!(feature_id, "feature is already running");
            return Err(err);
        }

        let info = FailureInfo::from_error(&err);
        if info.kind.is_abort() {
            info!(feature_id, "feature execution stopped");
            // The status stays where the run left it; an interrupted
            // in_progress feature is exactly what the resume path
            // looks for.
            self.events.publish(OrchestratorEvent::FeatureCompleted {
                project_path: request.project_path.clone(),
                feature_id: feature_id.to_string(),
                passes: false,
                summary: None,
                learnings: None,
                timestamp: Utc::now(),
            });
            return Ok(ExecutionOutcome {
                feature_id: feature_id.to_string(),
                passes: false,
                final_status: None,
                summary: None,
                learnings: None,
                stopped: true,
            });
        }

        error!(feature_id, kind = %info.kind, error = %err, "feature execution failed");
        self.reset_to_backlog(request).await;
        self.events.publish(OrchestratorEvent::FeatureFailed {
            project_path: request.project_path.clone(),
            feature_id: feature_id.to_string(),
            kind: info.kind,
            message: info.message.clone(),
            timestamp: Utc::now(),
        });

        if request.auto_mode {
            let key = LoopKey::new(&request.project_path, request.loop_branch.as_deref());
            if self.loops.track_failure(&key, &info) {
                self.loops.signal_pause(&key, &info);
            }
        }

        Err(err)
    }

    /// Best-effort status reset so a failed run does not look
    /// interrupted to the startup scan. Only plain `in_progress` is
    /// touched; pipeline statuses keep their position for resume.
    async fn reset_to_backlog(&self, request: &ExecutionRequest) {
        let loaded = self
            .store
            .load(&request.project_path, &request.feature_id)
            .await;
        match loaded {
            Ok(Some(feature)) if feature.status == FeatureStatus::InProgress => {
                if let Err(err) = self
                    .store
                    .update_status(
                        &request.project_path,
                        &request.feature_id,
                        FeatureStatus::Backlog,
                    )
                    .await
                {
                    warn!(
                        feature_id = %request.feature_id,
                        error = %err,
                        "failed to reset feature status"
                    );
                }
            }
            Ok(_) => {}
            Err(err) => {
                warn!(
                    feature_id = %request.feature_id,
                    error = %err,
                    "failed to load feature for status reset"
                );
            }
        }
    }
}
