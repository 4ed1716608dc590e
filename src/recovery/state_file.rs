//! Execution-state snapshots.
//!
//! A snapshot written at every execution boundary is what makes crash
//! recovery possible: after a restart, the startup scan can tell which
//! features were mid-run and whether an auto loop was active. Files live
//! under the project's data directory, one per worktree, with the default
//! worktree's file doubling as the legacy single-file location from before
//! snapshots were branch-scoped.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::OrchestratorConfig;
use crate::error::AutodevResult;
use crate::leases::SharedLeaseTracker;
use crate::scheduler::registry::{LoopKey, SharedLoopRegistry};

pub const EXECUTION_STATE_VERSION: u32 = 1;

const STATE_FILE_NAME: &str = "execution-state.json";

/// Snapshot of what was running, written as camelCase JSON for
/// compatibility with the original on-disk format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    pub version: u32,
    pub auto_loop_was_running: bool,
    pub max_concurrency: usize,
    pub project_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub running_feature_ids: Vec<String>,
    pub saved_at: DateTime<Utc>,
}

/// Reads and writes execution-state snapshots.
///
/// The snapshot content is assembled live from the lease tracker and the
/// loop registry, so callers never hand-build an [`ExecutionState`].
pub struct ExecutionStateStore {
    config: Arc<OrchestratorConfig>,
    tracker: SharedLeaseTracker,
    loops: SharedLoopRegistry,
}

impl ExecutionStateStore {
    pub fn new(
        config: Arc<OrchestratorConfig>,
        tracker: SharedLeaseTracker,
        loops: SharedLoopRegistry,
    ) -> Self {
        Self {
            config,
            tracker,
            loops,
        }
    }

    /// Snapshot file for one project/worktree.
    pub fn state_path(&self, project: &Path, branch: Option<&str>) -> PathBuf {
        let dir = self.config.data_dir(project);
        match branch {
            Some(branch) => dir.join(format!(
                "execution-state--{}.json",
                sanitize_branch(branch)
            )),
            None => dir.join(STATE_FILE_NAME),
        }
    }

    /// Write the current snapshot for this project/worktree.
    pub fn persist(&self, project: &Path, branch: Option<&str>) -> AutodevResult<ExecutionState> {
        let key = LoopKey::new(project, branch);
        let (auto_loop_was_running, max_concurrency) =
            self.loops.loop_state(&key).unwrap_or_else(|| {
                (false, self.config.effective_concurrency(branch, None))
            });

        let running_feature_ids = self
            .tracker
            .for_project(project)
            .into_iter()
            .map(|entry| entry.feature_id)
            .collect();

        let state = ExecutionState {
            version: EXECUTION_STATE_VERSION,
            auto_loop_was_running,
            max_concurrency,
            project_path: project.to_path_buf(),
            branch_name: branch.map(str::to_string),
            running_feature_ids,
            saved_at: Utc::now(),
        };

        let path = self.state_path(project, branch);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        // Write-then-rename so a crash mid-write never leaves a torn file.
        let json = serde_json::to_string_pretty(&state)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;

        debug!(path = %path.display(), "execution state saved");
        Ok(state)
    }

    /// Load the snapshot, falling back to the legacy single-file location
    /// for branch-scoped loops. An absent file is not an error.
    pub fn load(
        &self,
        project: &Path,
        branch: Option<&str>,
    ) -> AutodevResult<Option<ExecutionState>> {
        let path = self.state_path(project, branch);
        if let Some(state) = read_state(&path)? {
            return Ok(Some(state));
        }

        if branch.is_some() {
            let legacy = self.state_path(project, None);
            if let Some(state) = read_state(&legacy)? {
                debug!(path = %legacy.display(), "loaded legacy execution state");
                return Ok(Some(state));
            }
        }

        Ok(None)
    }

    /// Remove the snapshot for this project/worktree. Missing files are
    /// fine.
    pub fn clear(&self, project: &Path, branch: Option<&str>) -> AutodevResult<()> {
        let path = self.state_path(project, branch);
        if path.exists() {
            std::fs::remove_file(&path)?;
            debug!(path = %path.display(), "execution state cleared");
        }
        Ok(())
    }
}

fn read_state(path: &Path) -> AutodevResult<Option<ExecutionState>> {
    if !path.exists() {
        return Ok(None);
    }
    let json = std::fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&json)?))
}

/// Branch names become file-name-safe by mapping everything outside
/// `[A-Za-z0-9]` to `-`.
fn sanitize_branch(branch: &str) -> String {
    branch
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}
