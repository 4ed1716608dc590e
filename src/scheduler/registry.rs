//! Registry of live auto loops.
//!
//! Keyed by (project, branch), one entry per running or paused loop. The
//! registry is shared between the loop manager (which starts and stops
//! loops) and the execution engine (which reports failures into it), so it
//! owns the pause decision end to end.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{AutodevError, AutodevResult, FailureInfo};
use crate::events::{OrchestratorEvent, SharedEventBus};

use super::failure::FailureTracker;

/// Shared handle to the loop registry.
pub type SharedLoopRegistry = Arc<LoopRegistry>;

/// Identity of one auto loop: a project checkout plus an optional branch.
/// `None` is the default worktree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LoopKey {
    pub project_path: PathBuf,
    pub branch_name: Option<String>,
}

impl LoopKey {
    pub fn new(project_path: impl Into<PathBuf>, branch_name: Option<&str>) -> Self {
        Self {
            project_path: project_path.into(),
            branch_name: branch_name.map(str::to_string),
        }
    }
}

/// Reporting snapshot of one loop.
#[derive(Debug, Clone, Serialize)]
pub struct LoopStatus {
    pub project_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    pub max_concurrency: usize,
    pub paused: bool,
    pub started_at: DateTime<Utc>,
}

struct LoopEntry {
    max_concurrency: usize,
    cancel: CancellationToken,
    paused: bool,
    failures: FailureTracker,
    started_at: DateTime<Utc>,
}

/// Loop bookkeeping shared across the scheduler and the executor.
pub struct LoopRegistry {
    loops: Mutex<HashMap<LoopKey, LoopEntry>>,
    events: SharedEventBus,
}

impl LoopRegistry {
    pub fn new(events: SharedEventBus) -> Self {
        Self {
            loops: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn shared(events: SharedEventBus) -> SharedLoopRegistry {
        Arc::new(Self::new(events))
    }

    fn guard(&self) -> MutexGuard<'_, HashMap<LoopKey, LoopEntry>> {
        self.loops.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new loop and hand back its cancellation token.
    ///
    /// A live entry under the same key is a conflict; a paused entry is
    /// replaced, since pausing already cancelled its token.
    pub fn begin(
        &self,
        key: LoopKey,
        max_concurrency: usize,
        failure_threshold: u32,
    ) -> AutodevResult<CancellationToken> {
        let mut loops = self.guard();

        if let Some(existing) = loops.get(&key) {
            if !existing.paused {
                return Err(AutodevError::loop_already_running(
                    key.project_path.clone(),
                    key.branch_name.as_deref(),
                ));
            }
            info!(
                project = %key.project_path.display(),
                branch = key.branch_name.as_deref().unwrap_or("default"),
                "replacing paused auto loop"
            );
        }

        let cancel = CancellationToken::new();
        loops.insert(
            key,
            LoopEntry {
                max_concurrency,
                cancel: cancel.clone(),
                paused: false,
                failures: FailureTracker::new(failure_threshold),
                started_at: Utc::now(),
            },
        );
        Ok(cancel)
    }

    /// Drop the entry, cancelling its token. Returns `false` if absent.
    pub fn remove(&self, key: &LoopKey) -> bool {
        match self.guard().remove(key) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Live (non-paused) loop for this key?
    pub fn is_running(&self, key: &LoopKey) -> bool {
        self.guard().get(key).map(|e| !e.paused).unwrap_or(false)
    }

    /// Loop state for snapshot persistence: (live, max_concurrency).
    pub fn loop_state(&self, key: &LoopKey) -> Option<(bool, usize)> {
        self.guard()
            .get(key)
            .map(|entry| (!entry.paused, entry.max_concurrency))
    }

    pub fn status(&self, key: &LoopKey) -> Option<LoopStatus> {
        self.guard().get(key).map(|entry| LoopStatus {
            project_path: key.project_path.clone(),
            branch_name: key.branch_name.clone(),
            max_concurrency: entry.max_concurrency,
            paused: entry.paused,
            started_at: entry.started_at,
        })
    }

    /// Snapshot of every tracked loop, paused ones included.
    pub fn all(&self) -> Vec<LoopStatus> {
        let loops = self.guard();
        let mut statuses: Vec<LoopStatus> = loops
            .iter()
            .map(|(key, entry)| LoopStatus {
                project_path: key.project_path.clone(),
                branch_name: key.branch_name.clone(),
                max_concurrency: entry.max_concurrency,
                paused: entry.paused,
                started_at: entry.started_at,
            })
            .collect();
        statuses.sort_by_key(|status| status.started_at);
        statuses
    }

    /// Clear the failure streak after a successful execution.
    pub fn record_success(&self, key: &LoopKey) {
        if let Some(entry) = self.guard().get_mut(key) {
            entry.failures.record_success();
        }
    }

    /// Feed one classified failure into the loop's tracker.
    ///
    /// Returns `true` when the loop should pause. Executions with no live
    /// loop (manual runs) track nothing.
    pub fn track_failure(&self, key: &LoopKey, info: &FailureInfo) -> bool {
        let mut loops = self.guard();
        match loops.get_mut(key) {
            Some(entry) if !entry.paused => entry.failures.record_failure(info.kind),
            _ => false,
        }
    }

    /// Stop a loop because of failures: cancel its tick task, keep the
    /// entry around marked paused, and announce the pause.
    pub fn signal_pause(&self, key: &LoopKey, info: &FailureInfo) -> bool {
        let paused = {
            let mut loops = self.guard();
            match loops.get_mut(key) {
                Some(entry) if !entry.paused => {
                    entry.paused = true;
                    entry.cancel.cancel();
                    true
                }
                _ => false,
            }
        };

        if paused {
            warn!(
                project = %key.project_path.display(),
                branch = key.branch_name.as_deref().unwrap_or("default"),
                kind = %info.kind,
                "auto loop paused"
            );
            self.events.publish(OrchestratorEvent::AutoLoopPaused {
                project_path: key.project_path.clone(),
                branch_name: key.branch_name.clone(),
                kind: info.kind,
                message: info.message.clone(),
                timestamp: Utc::now(),
            });
        }

        paused
    }

    /// Loops tracked for one project, any branch.
    pub fn for_project(&self, project: &Path) -> Vec<LoopStatus> {
        self.all()
            .into_iter()
            .filter(|status| status.project_path == project)
            .collect()
    }
}
