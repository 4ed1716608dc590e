//! Lease tracker: the single source of truth for live executions.
//!
//! Every execution holds a lease keyed by feature id. Nested entries into
//! the execution engine (an approved-plan continuation, an internal resume)
//! re-acquire the same lease with `allow_reuse`, bumping a reference count
//! instead of failing, and release once per acquisition on the way out. An
//! entry exists exactly while its count is positive, so "is this feature
//! running" is always one map lookup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{AutodevError, AutodevResult};
use crate::workspace::{same_worktree, WorktreeResolver};

/// Shared handle used across the executor, scheduler, and recovery.
pub type SharedLeaseTracker = Arc<LeaseTracker>;

/// A live execution entry.
#[derive(Debug, Clone)]
pub struct RunningFeature {
    pub feature_id: String,
    pub project_path: PathBuf,
    pub worktree_path: Option<PathBuf>,
    pub branch_name: Option<String>,
    /// Launched by the auto loop rather than a direct caller.
    pub auto_mode: bool,
    pub started_at: DateTime<Utc>,
    /// Number of live acquisitions. Never observed below 1.
    pub lease_count: u32,
    /// Reporting-only tags.
    pub model: Option<String>,
    pub provider: Option<String>,
    /// Cancelling this token asks the run to stop cooperatively.
    pub cancel: CancellationToken,
}

/// Arguments for [`LeaseTracker::acquire`].
#[derive(Debug, Clone)]
pub struct AcquireRequest {
    pub feature_id: String,
    pub project_path: PathBuf,
    pub auto_mode: bool,
    /// Treat an existing lease as a nested acquisition instead of a
    /// conflict.
    pub allow_reuse: bool,
    pub worktree_path: Option<PathBuf>,
    pub branch_name: Option<String>,
    pub model: Option<String>,
    pub provider: Option<String>,
}

impl AcquireRequest {
    pub fn new(feature_id: impl Into<String>, project_path: impl Into<PathBuf>) -> Self {
        Self {
            feature_id: feature_id.into(),
            project_path: project_path.into(),
            auto_mode: false,
            allow_reuse: false,
            worktree_path: None,
            branch_name: None,
            model: None,
            provider: None,
        }
    }

    pub fn with_auto_mode(mut self, auto_mode: bool) -> Self {
        self.auto_mode = auto_mode;
        self
    }

    pub fn with_allow_reuse(mut self, allow_reuse: bool) -> Self {
        self.allow_reuse = allow_reuse;
        self
    }

    pub fn with_worktree(mut self, worktree_path: Option<PathBuf>) -> Self {
        self.worktree_path = worktree_path;
        self
    }

    pub fn with_branch(mut self, branch_name: Option<String>) -> Self {
        self.branch_name = branch_name;
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_provider(mut self, provider: Option<String>) -> Self {
        self.provider = provider;
        self
    }
}

/// Partial metadata update applied to a live entry. `None` fields are left
/// untouched.
#[derive(Debug, Default, Clone)]
pub struct RunningFeatureUpdate {
    pub worktree_path: Option<PathBuf>,
    pub branch_name: Option<String>,
    pub model: Option<String>,
    pub provider: Option<String>,
}

/// Ref-counted registry of live executions.
///
/// Project paths are compared as given; callers canonicalize before
/// acquiring so the same checkout never appears under two spellings.
pub struct LeaseTracker {
    running: Mutex<HashMap<String, RunningFeature>>,
    worktrees: Arc<dyn WorktreeResolver>,
}

impl LeaseTracker {
    pub fn new(worktrees: Arc<dyn WorktreeResolver>) -> Self {
        Self {
            running: Mutex::new(HashMap::new()),
            worktrees,
        }
    }

    pub fn shared(worktrees: Arc<dyn WorktreeResolver>) -> SharedLeaseTracker {
        Arc::new(Self::new(worktrees))
    }

    // A poisoned lock only means some other thread panicked mid-read; every
    // mutation here is a single statement, so the map itself stays valid.
    fn guard(&self) -> MutexGuard<'_, HashMap<String, RunningFeature>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take (or re-enter) the lease for a feature.
    ///
    /// A fresh acquisition creates the entry with `lease_count = 1` and a
    /// new cancel token. With `allow_reuse`, an existing entry has its
    /// count bumped and any non-`None` request metadata merged in; the
    /// original `auto_mode` and token are kept. Without `allow_reuse`, an
    /// existing entry is a conflict.
    pub fn acquire(&self, request: AcquireRequest) -> AutodevResult<RunningFeature> {
        let mut running = self.guard();

        if let Some(entry) = running.get_mut(&request.feature_id) {
            if !request.allow_reuse {
                warn!(
                    feature_id = %request.feature_id,
                    lease_count = entry.lease_count,
                    "acquire refused: feature already running"
                );
                return Err(AutodevError::already_running(request.feature_id));
            }

            entry.lease_count += 1;
            merge(entry, &request);
            debug!(
                feature_id = %entry.feature_id,
                lease_count = entry.lease_count,
                "lease re-acquired"
            );
            return Ok(entry.clone());
        }

        let entry = RunningFeature {
            feature_id: request.feature_id.clone(),
            project_path: request.project_path,
            worktree_path: request.worktree_path,
            branch_name: request.branch_name,
            auto_mode: request.auto_mode,
            started_at: Utc::now(),
            lease_count: 1,
            model: request.model,
            provider: request.provider,
            cancel: CancellationToken::new(),
        };
        debug!(feature_id = %entry.feature_id, auto_mode = entry.auto_mode, "lease acquired");
        running.insert(request.feature_id, entry.clone());
        Ok(entry)
    }

    /// Give back one lease. The entry disappears when the last lease goes;
    /// `force` removes it outright and cancels the token. Releasing an
    /// absent id is a no-op returning `false`.
    pub fn release(&self, feature_id: &str, force: bool) -> bool {
        let mut running = self.guard();

        let Some(entry) = running.get_mut(feature_id) else {
            debug!(feature_id, "release for untracked feature ignored");
            return false;
        };

        if force {
            entry.cancel.cancel();
            running.remove(feature_id);
            debug!(feature_id, "lease force-released");
            return true;
        }

        if entry.lease_count <= 1 {
            running.remove(feature_id);
            debug!(feature_id, "last lease released");
        } else {
            entry.lease_count -= 1;
            debug!(feature_id, lease_count = entry.lease_count, "lease released");
        }
        true
    }

    pub fn is_running(&self, feature_id: &str) -> bool {
        self.guard().contains_key(feature_id)
    }

    /// Snapshot of one entry.
    pub fn get(&self, feature_id: &str) -> Option<RunningFeature> {
        self.guard().get(feature_id).cloned()
    }

    /// Snapshot of every entry, oldest first.
    pub fn all(&self) -> Vec<RunningFeature> {
        let mut entries: Vec<RunningFeature> = self.guard().values().cloned().collect();
        entries.sort_by_key(|entry| entry.started_at);
        entries
    }

    /// Snapshot of the entries for one project, oldest first.
    pub fn for_project(&self, project: &Path) -> Vec<RunningFeature> {
        let mut entries: Vec<RunningFeature> = self
            .guard()
            .values()
            .filter(|entry| entry.project_path == project)
            .cloned()
            .collect();
        entries.sort_by_key(|entry| entry.started_at);
        entries
    }

    pub fn running_count(&self, project: &Path) -> usize {
        self.guard()
            .values()
            .filter(|entry| entry.project_path == project)
            .count()
    }

    /// Count the project's entries sharing a worktree with `branch`.
    ///
    /// `None` means the default worktree. Entries recorded against the
    /// primary branch by name belong to the default worktree too, so the
    /// primary branch is looked up first and both sides are normalized
    /// through it.
    pub async fn running_count_for_worktree(
        &self,
        project: &Path,
        branch: Option<&str>,
    ) -> usize {
        let primary = match self.worktrees.current_branch(project).await {
            Ok(primary) => primary,
            Err(err) => {
                debug!(project = %project.display(), error = %err, "primary branch lookup failed");
                None
            }
        };

        self.guard()
            .values()
            .filter(|entry| entry.project_path == project)
            .filter(|entry| {
                same_worktree(entry.branch_name.as_deref(), branch, primary.as_deref())
            })
            .count()
    }

    /// Merge non-`None` fields of `update` into a live entry.
    pub fn update(&self, feature_id: &str, update: RunningFeatureUpdate) -> bool {
        let mut running = self.guard();
        let Some(entry) = running.get_mut(feature_id) else {
            return false;
        };

        if update.worktree_path.is_some() {
            entry.worktree_path = update.worktree_path;
        }
        if update.branch_name.is_some() {
            entry.branch_name = update.branch_name;
        }
        if update.model.is_some() {
            entry.model = update.model;
        }
        if update.provider.is_some() {
            entry.provider = update.provider;
        }
        true
    }

    /// Ask a live run to stop. The entry stays until its holder releases.
    pub fn cancel(&self, feature_id: &str) -> bool {
        let running = self.guard();
        match running.get(feature_id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }
}

fn merge(entry: &mut RunningFeature, request: &AcquireRequest) {
    if request.worktree_path.is_some() {
        entry.worktree_path = request.worktree_path.clone();
    }
    if request.branch_name.is_some() {
        entry.branch_name = request.branch_name.clone();
    }
    if request.model.is_some() {
        entry.model = request.model.clone();
    }
    if request.provider.is_some() {
        entry.provider = request.provider.clone();
    }
}
