//! Wiring for the whole orchestration stack.
//!
//! Embedding applications hand over an [`OrchestratorConfig`] and their
//! collaborator implementations; this module builds the lease tracker,
//! event bus, stores, executor, auto-loop manager, and recovery manager
//! with the right sharing between them.

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::config::OrchestratorConfig;
use crate::error::AutodevResult;
use crate::events::{EventBus, SharedEventBus};
use crate::executor::{Collaborators, FeatureExecutor};
use crate::leases::{LeaseTracker, SharedLeaseTracker};
use crate::recovery::{ContextStore, ExecutionStateStore, RecoveryManager, RecoveryReport};
use crate::scheduler::{AutoLoopManager, LoopRegistry, SharedLoopRegistry};
use crate::workspace::verify_workdir;

/// Fully wired orchestration stack.
///
/// All components share the same tracker, bus, and registry; cloning the
/// public handles is cheap.
pub struct Orchestrator {
    pub config: Arc<OrchestratorConfig>,
    pub tracker: SharedLeaseTracker,
    pub events: SharedEventBus,
    pub loops: SharedLoopRegistry,
    pub states: Arc<ExecutionStateStore>,
    pub contexts: ContextStore,
    pub executor: Arc<FeatureExecutor>,
    pub auto_loops: Arc<AutoLoopManager>,
    pub recovery: Arc<RecoveryManager>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, collaborators: Collaborators) -> Self {
        let config = Arc::new(config);
        let tracker = LeaseTracker::shared(collaborators.worktrees.clone());
        let events = EventBus::new().shared();
        let loops = LoopRegistry::shared(events.clone());
        let states = Arc::new(ExecutionStateStore::new(
            config.clone(),
            tracker.clone(),
            loops.clone(),
        ));
        let contexts = ContextStore::new(config.clone());
        let executor = Arc::new(FeatureExecutor::new(
            config.clone(),
            tracker.clone(),
            events.clone(),
            loops.clone(),
            states.clone(),
            contexts.clone(),
            collaborators.clone(),
        ));
        let auto_loops = Arc::new(AutoLoopManager::new(
            config.clone(),
            tracker.clone(),
            events.clone(),
            loops.clone(),
            states.clone(),
            collaborators.clone(),
            executor.clone(),
        ));
        let recovery = Arc::new(RecoveryManager::new(
            tracker.clone(),
            events.clone(),
            contexts.clone(),
            collaborators,
            executor.clone(),
        ));
        Self {
            config,
            tracker,
            events,
            loops,
            states,
            contexts,
            executor,
            auto_loops,
            recovery,
        }
    }

    /// Startup recovery for one project worktree: resume whatever was
    /// interrupted, then restart the auto loop if the saved snapshot
    /// says it was running.
    pub async fn recover_project(
        &self,
        project: &Path,
        branch: Option<&str>,
    ) -> AutodevResult<RecoveryReport> {
        let project = verify_workdir(project)?;
        let saved = self.states.load(&project, branch)?;

        let report = self
            .recovery
            .resume_interrupted(&project, self.config.use_worktrees)
            .await?;

        if let Some(state) = saved {
            if state.auto_loop_was_running && !self.auto_loops.is_running(&project, branch).await {
                info!(
                    project = %project.display(),
                    max_concurrency = state.max_concurrency,
                    "restarting auto loop from saved state"
                );
                self.auto_loops
                    .start(&project, branch, Some(state.max_concurrency))
                    .await?;
            }
        }
        Ok(report)
    }
}
