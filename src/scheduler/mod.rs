//! Autonomous scheduling: one polling loop per project and worktree that
//! launches pending features up to a concurrency cap, plus the shared
//! registry those loops and the executor both report into.

pub mod failure;
pub mod registry;

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::error::AutodevResult;
use crate::events::{OrchestratorEvent, SharedEventBus};
use crate::executor::{Collaborators, ExecutionRequest, FeatureExecutor};
use crate::feature::{Feature, FeatureStatus, FeatureStore};
use crate::leases::{AcquireRequest, SharedLeaseTracker};
use crate::recovery::ExecutionStateStore;
use crate::workspace::{same_worktree, verify_workdir, WorktreeResolver};

pub use failure::FailureTracker;
pub use registry::{LoopKey, LoopRegistry, LoopStatus, SharedLoopRegistry};

/// Runs the auto loops. One loop per `(project, worktree)` pair; each
/// loop polls for pending features and launches them fire-and-forget
/// until its worktree-scoped concurrency cap is reached.
pub struct AutoLoopManager {
    config: Arc<OrchestratorConfig>,
    tracker: SharedLeaseTracker,
    events: SharedEventBus,
    loops: SharedLoopRegistry,
    states: Arc<ExecutionStateStore>,
    store: Arc<dyn FeatureStore>,
    worktrees: Arc<dyn WorktreeResolver>,
    executor: Arc<FeatureExecutor>,
}

impl AutoLoopManager {
    pub fn new(
        config: Arc<OrchestratorConfig>,
        tracker: SharedLeaseTracker,
        events: SharedEventBus,
        loops: SharedLoopRegistry,
        states: Arc<ExecutionStateStore>,
        collaborators: Collaborators,
        executor: Arc<FeatureExecutor>,
    ) -> Self {
        Self {
            config,
            tracker,
            events,
            loops,
            states,
            store: collaborators.store,
            worktrees: collaborators.worktrees,
            executor,
        }
    }

    /// Start the auto loop for a project worktree and return the
    /// effective concurrency it will run with.
    ///
    /// Registers the loop, resets features that look stuck from a dead
    /// run, snapshots execution state, then spawns the polling task.
    /// Fails if a live loop already exists for the same key; a paused
    /// loop is replaced.
    pub async fn start(
        self: &Arc<Self>,
        project: &Path,
        branch: Option<&str>,
        max_concurrency: Option<usize>,
    ) -> AutodevResult<usize> {
        let project = verify_workdir(project)?;
        let branch = self.normalize_branch(&project, branch).await;
        let key = LoopKey::new(&project, branch);
        let max = self.config.effective_concurrency(branch, max_concurrency);
        let cancel = self
            .loops
            .begin(key.clone(), max, self.config.failure_threshold)?;

        self.reset_stuck_features(&project).await;

        if let Err(err) = self.states.persist(&project, branch) {
            warn!(error = %err, "failed to persist execution state at loop start");
        }
        self.events.publish(OrchestratorEvent::AutoLoopStarted {
            project_path: project.clone(),
            branch_name: branch.map(str::to_string),
            max_concurrency: max,
            timestamp: Utc::now(),
        });
        info!(
            project = %project.display(),
            branch = branch.unwrap_or("default"),
            max_concurrency = max,
            "auto loop started"
        );

        let manager = Arc::clone(self);
        let branch = branch.map(str::to_string);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.poll_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut was_idle = false;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        manager
                            .tick(&project, branch.as_deref(), max, &mut was_idle)
                            .await;
                    }
                }
            }
            debug!(project = %project.display(), "auto loop task exited");
        });

        Ok(max)
    }

    /// Stop the auto loop for a project worktree. In-flight executions
    /// keep running; the returned count says how many. Stopping an
    /// absent loop is a no-op reporting zero.
    pub async fn stop(&self, project: &Path, branch: Option<&str>) -> AutodevResult<usize> {
        let project = verify_workdir(project).unwrap_or_else(|_| project.to_path_buf());
        let branch = self.normalize_branch(&project, branch).await;
        let key = LoopKey::new(&project, branch);
        if !self.loops.remove(&key) {
            debug!(project = %project.display(), "no auto loop to stop");
            return Ok(0);
        }

        let still_running = self
            .tracker
            .running_count_for_worktree(&project, branch)
            .await;
        if let Err(err) = self.states.clear(&project, branch) {
            warn!(error = %err, "failed to clear execution state on stop");
        }
        self.events.publish(OrchestratorEvent::AutoLoopStopped {
            project_path: project.clone(),
            branch_name: branch.map(str::to_string),
            timestamp: Utc::now(),
        });
        info!(
            project = %project.display(),
            branch = branch.unwrap_or("default"),
            still_running,
            "auto loop stopped"
        );
        Ok(still_running)
    }

    /// Whether a live (not paused) loop exists for this worktree.
    pub async fn is_running(&self, project: &Path, branch: Option<&str>) -> bool {
        let project = verify_workdir(project).unwrap_or_else(|_| project.to_path_buf());
        let branch = self.normalize_branch(&project, branch).await;
        self.loops.is_running(&LoopKey::new(&project, branch))
    }

    /// Snapshot of every registered loop, paused ones included.
    pub fn running_loops(&self) -> Vec<LoopStatus> {
        self.loops.all()
    }

    /// Fold a branch naming the primary worktree into the default-worktree
    /// marker, so `Some("main")` and `None` address the same loop and the
    /// same state file. A failed lookup keeps the name as given.
    async fn normalize_branch<'a>(
        &self,
        project: &Path,
        branch: Option<&'a str>,
    ) -> Option<&'a str> {
        let named = branch?;
        match self.worktrees.current_branch(project).await {
            Ok(Some(primary)) if primary == named => None,
            Ok(_) => Some(named),
            Err(err) => {
                debug!(error = %err, "could not resolve primary branch");
                Some(named)
            }
        }
    }

    /// One scheduling pass: list features, launch eligible ones into
    /// free slots, publish the idle event on the transition into quiet.
    async fn tick(&self, project: &Path, branch: Option<&str>, max: usize, was_idle: &mut bool) {
        let features = match self.store.list(project).await {
            Ok(features) => features,
            Err(err) => {
                warn!(project = %project.display(), error = %err, "failed to list features");
                return;
            }
        };
        let primary = match self.worktrees.current_branch(project).await {
            Ok(primary) => primary,
            Err(err) => {
                debug!(error = %err, "could not resolve primary branch");
                None
            }
        };

        let candidates: Vec<&Feature> = features
            .iter()
            .filter(|f| f.status == FeatureStatus::Backlog)
            .filter(|f| !self.tracker.is_running(&f.id))
            .filter(|f| same_worktree(f.branch_name.as_deref(), branch, primary.as_deref()))
            .collect();
        let running = self
            .tracker
            .running_count_for_worktree(project, branch)
            .await;

        if candidates.is_empty() && running == 0 {
            if !*was_idle {
                info!(project = %project.display(), "auto loop idle, nothing pending");
                self.events.publish(OrchestratorEvent::AutoLoopIdle {
                    project_path: project.to_path_buf(),
                    branch_name: branch.map(str::to_string),
                    timestamp: Utc::now(),
                });
            }
            *was_idle = true;
            return;
        }
        *was_idle = false;

        if running >= max {
            debug!(running, max, "auto loop at capacity");
            return;
        }

        // Each admitted feature takes its lease before its task is
        // spawned, so every later capacity check already counts it even
        // if the execution has not started yet. The execution re-enters
        // the lease as an internal caller; the wrapper gives this one
        // back once the run is over.
        let slots = max - running;
        for feature in candidates.into_iter().take(slots) {
            let acquire = AcquireRequest::new(&feature.id, project)
                .with_auto_mode(true)
                .with_branch(branch.map(str::to_string));
            if let Err(err) = self.tracker.acquire(acquire) {
                debug!(feature_id = %feature.id, error = %err, "launch lost a start race");
                continue;
            }
            info!(feature_id = %feature.id, "auto loop launching feature");
            let request = ExecutionRequest::new(project, &feature.id)
                .with_auto_mode(true)
                .with_use_worktrees(self.config.use_worktrees)
                .with_loop_branch(branch.map(str::to_string))
                .with_called_internally(true);
            let executor = Arc::clone(&self.executor);
            let tracker = Arc::clone(&self.tracker);
            let feature_id = feature.id.clone();
            tokio::spawn(async move {
                if let Err(err) = executor.execute(request).await {
                    debug!(error = %err, "auto launch ended in error");
                }
                tracker.release(&feature_id, false);
            });
        }
    }

    /// Features left `in_progress` by a dead process, with no lease to
    /// back them, go back to `backlog` so the loop can pick them up.
    /// Pipeline positions are left alone; recovery owns those.
    async fn reset_stuck_features(&self, project: &Path) {
        let features = match self.store.list(project).await {
            Ok(features) => features,
            Err(err) => {
                warn!(error = %err, "failed to scan for stuck features");
                return;
            }
        };
        for feature in features {
            if feature.status == FeatureStatus::InProgress && !self.tracker.is_running(&feature.id)
            {
                info!(feature_id = %feature.id, "resetting stuck feature to backlog");
                if let Err(err) = self
                    .store
                    .update_status(project, &feature.id, FeatureStatus::Backlog)
                    .await
                {
                    warn!(feature_id = %feature.id, error = %err, "failed to reset stuck feature");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentInvocation, AgentRunner};
    use crate::events::EventBus;
    use crate::executor::Collaborators;
    use crate::leases::LeaseTracker;
    use crate::pipeline::{PipelineContext, PipelineDriver, PipelineStatus, PipelineStep};
    use crate::recovery::ContextStore;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Mutex;

    struct MemoryStore {
        features: Mutex<HashMap<String, Feature>>,
    }

    impl MemoryStore {
        fn with(features: Vec<Feature>) -> Arc<Self> {
            Arc::new(Self {
                features: Mutex::new(
                    features.into_iter().map(|f| (f.id.clone(), f)).collect(),
                ),
            })
        }

        fn status_of(&self, id: &str) -> Option<FeatureStatus> {
            self.features
                .lock()
                .unwrap()
                .get(id)
                .map(|f| f.status.clone())
        }
    }

    #[async_trait]
    impl FeatureStore for MemoryStore {
        async fn load(&self, _project: &Path, feature_id: &str) -> anyhow::Result<Option<Feature>> {
            Ok(self.features.lock().unwrap().get(feature_id).cloned())
        }

        async fn update_status(
            &self,
            _project: &Path,
            feature_id: &str,
            status: FeatureStatus,
        ) -> anyhow::Result<()> {
            let mut features = self.features.lock().unwrap();
            let feature = features
                .get_mut(feature_id)
                .ok_or_else(|| anyhow::anyhow!("no such feature"))?;
            feature.status = status;
            Ok(())
        }

        async fn list(&self, _project: &Path) -> anyhow::Result<Vec<Feature>> {
            let mut all: Vec<Feature> = self.features.lock().unwrap().values().cloned().collect();
            all.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(all)
        }
    }

    struct NoAgent;

    #[async_trait]
    impl AgentRunner for NoAgent {
        async fn run(&self, _invocation: AgentInvocation) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct NoPipeline;

    #[async_trait]
    impl PipelineDriver for NoPipeline {
        async fn configured_steps(&self, _project: &Path) -> anyhow::Result<Vec<PipelineStep>> {
            Ok(Vec::new())
        }

        async fn execute(&self, _ctx: PipelineContext) -> anyhow::Result<()> {
            Ok(())
        }

        async fn detect_status(
            &self,
            _project: &Path,
            _feature_id: &str,
            _status: &FeatureStatus,
        ) -> anyhow::Result<PipelineStatus> {
            Ok(PipelineStatus::not_pipeline())
        }

        async fn resume(
            &self,
            _project: &Path,
            _feature: &Feature,
            _use_worktrees: bool,
            _status: PipelineStatus,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct NoWorktrees;

    #[async_trait]
    impl WorktreeResolver for NoWorktrees {
        async fn find_worktree(
            &self,
            _project: &Path,
            _branch: &str,
        ) -> anyhow::Result<Option<PathBuf>> {
            Ok(None)
        }

        async fn current_branch(&self, _project: &Path) -> anyhow::Result<Option<String>> {
            Ok(None)
        }
    }

    /// Resolver for a repo whose checked-out primary branch is `main`.
    struct MainWorktrees;

    #[async_trait]
    impl WorktreeResolver for MainWorktrees {
        async fn find_worktree(
            &self,
            _project: &Path,
            _branch: &str,
        ) -> anyhow::Result<Option<PathBuf>> {
            Ok(None)
        }

        async fn current_branch(&self, _project: &Path) -> anyhow::Result<Option<String>> {
            Ok(Some("main".to_string()))
        }
    }

    fn manager_with(store: Arc<MemoryStore>) -> Arc<AutoLoopManager> {
        manager_on(store, Arc::new(NoWorktrees))
    }

    fn manager_on(
        store: Arc<MemoryStore>,
        worktrees: Arc<dyn WorktreeResolver>,
    ) -> Arc<AutoLoopManager> {
        let config = Arc::new(OrchestratorConfig {
            poll_interval_ms: 50,
            ..OrchestratorConfig::default()
        });
        let tracker = LeaseTracker::shared(worktrees.clone());
        let events = EventBus::new().shared();
        let loops = LoopRegistry::shared(events.clone());
        let states = Arc::new(ExecutionStateStore::new(
            config.clone(),
            tracker.clone(),
            loops.clone(),
        ));
        let contexts = ContextStore::new(config.clone());
        let collaborators = Collaborators {
            store,
            agent: Arc::new(NoAgent),
            worktrees,
            pipeline: Arc::new(NoPipeline),
        };
        let executor = Arc::new(FeatureExecutor::new(
            config.clone(),
            tracker.clone(),
            events.clone(),
            loops.clone(),
            states.clone(),
            contexts,
            collaborators.clone(),
        ));
        Arc::new(AutoLoopManager::new(
            config,
            tracker,
            events,
            loops,
            states,
            collaborators,
            executor,
        ))
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::with(vec![]);
        let manager = manager_with(store);

        let max = manager.start(dir.path(), None, None).await.unwrap();
        assert_eq!(max, 3);
        let err = manager.start(dir.path(), None, None).await.unwrap_err();
        assert!(err.to_string().contains("already running"));

        manager.stop(dir.path(), None).await.unwrap();
    }

    #[tokio::test]
    async fn test_start_resets_stuck_features() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::with(vec![
            Feature::new("stuck", "Left behind").with_status(FeatureStatus::InProgress),
            Feature::new("done", "Finished").with_status(FeatureStatus::Verified),
        ]);
        let manager = manager_with(store.clone());

        manager.start(dir.path(), None, None).await.unwrap();

        assert_eq!(store.status_of("stuck"), Some(FeatureStatus::Backlog));
        assert_eq!(store.status_of("done"), Some(FeatureStatus::Verified));

        manager.stop(dir.path(), None).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_without_loop_reports_zero() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::with(vec![]);
        let manager = manager_with(store);

        let still_running = manager.stop(dir.path(), None).await.unwrap();
        assert_eq!(still_running, 0);
    }

    #[tokio::test]
    async fn test_is_running_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::with(vec![]);
        let manager = manager_with(store);

        assert!(!manager.is_running(dir.path(), None).await);
        manager.start(dir.path(), None, None).await.unwrap();
        assert!(manager.is_running(dir.path(), None).await);
        assert!(!manager.is_running(dir.path(), Some("feat/other")).await);

        manager.stop(dir.path(), None).await.unwrap();
        assert!(!manager.is_running(dir.path(), None).await);
    }

    #[tokio::test]
    async fn test_primary_branch_names_the_default_loop() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::with(vec![]);
        let manager = manager_on(store, Arc::new(MainWorktrees));

        manager.start(dir.path(), None, None).await.unwrap();

        // Naming the checked-out branch addresses the same loop as
        // passing no branch at all.
        let err = manager
            .start(dir.path(), Some("main"), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already running"));
        assert!(manager.is_running(dir.path(), Some("main")).await);
        assert!(!manager.is_running(dir.path(), Some("feat/x")).await);

        let still_running = manager.stop(dir.path(), Some("main")).await.unwrap();
        assert_eq!(still_running, 0);
        assert!(!manager.is_running(dir.path(), None).await);
        // The stop under the primary branch name cleared the
        // default-worktree snapshot.
        let project = dir.path().canonicalize().unwrap();
        assert!(!project.join(".autodev/execution-state.json").exists());
    }

    #[tokio::test]
    async fn test_tick_takes_leases_before_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::with(vec![
            Feature::new("f1", "One"),
            Feature::new("f2", "Two"),
            Feature::new("f3", "Three"),
        ]);
        let manager = manager_with(store);
        let project = dir.path().canonicalize().unwrap();

        // Both slots are committed the moment the tick returns, before
        // any spawned execution has had a chance to run.
        let mut was_idle = false;
        manager.tick(&project, None, 2, &mut was_idle).await;
        assert_eq!(manager.tracker.running_count(&project), 2);

        // A second tick on the same quiescent runtime sees the committed
        // launches and admits nothing on top of them.
        let mut was_idle = false;
        manager.tick(&project, None, 2, &mut was_idle).await;
        assert_eq!(manager.tracker.running_count(&project), 2);
    }

    #[tokio::test]
    async fn test_start_writes_state_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::with(vec![]);
        let manager = manager_with(store);

        manager.start(dir.path(), None, None).await.unwrap();
        let project = dir.path().canonicalize().unwrap();
        assert!(project.join(".autodev/execution-state.json").is_file());

        manager.stop(dir.path(), None).await.unwrap();
        assert!(!project.join(".autodev/execution-state.json").exists());
    }
}
