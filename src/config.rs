//! Orchestrator configuration.
//!
//! Values come from `Default`, then optionally from `AUTODEV_*` environment
//! variables. Per-project paths are derived from the configured data
//! directory name, so the crate never assumes a global state location.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Directory created inside each project for orchestrator state.
pub const DEFAULT_DATA_DIR_NAME: &str = ".autodev";

/// Scheduler tick interval when nothing overrides it.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;

/// Hard fallback when neither the caller nor the config names a limit.
pub const DEFAULT_MAX_CONCURRENCY: usize = 3;

/// Consecutive failures tolerated before an auto loop pauses.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Configuration for the orchestration core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Name of the per-project state directory (joined onto the project root).
    pub data_dir_name: String,

    /// Auto-loop poll interval in milliseconds.
    pub poll_interval_ms: u64,

    /// Project-wide concurrency limit, if the embedding app sets one.
    pub default_max_concurrency: Option<usize>,

    /// Per-branch concurrency overrides, keyed by branch name.
    pub worktree_concurrency: HashMap<String, usize>,

    /// Consecutive-failure threshold for pausing an auto loop.
    pub failure_threshold: u32,

    /// Whether executions resolve git worktrees for feature branches.
    pub use_worktrees: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            data_dir_name: DEFAULT_DATA_DIR_NAME.to_string(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            default_max_concurrency: None,
            worktree_concurrency: HashMap::new(),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            use_worktrees: false,
        }
    }
}

impl OrchestratorConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(name) = std::env::var("AUTODEV_DATA_DIR") {
            if !name.is_empty() {
                config.data_dir_name = name;
            }
        }
        if let Ok(ms) = std::env::var("AUTODEV_POLL_INTERVAL_MS") {
            if let Ok(n) = ms.parse() {
                config.poll_interval_ms = n;
            }
        }
        if let Ok(max) = std::env::var("AUTODEV_MAX_CONCURRENCY") {
            if let Ok(n) = max.parse() {
                config.default_max_concurrency = Some(n);
            }
        }
        if let Ok(threshold) = std::env::var("AUTODEV_FAILURE_THRESHOLD") {
            if let Ok(n) = threshold.parse() {
                config.failure_threshold = n;
            }
        }
        if let Ok(val) = std::env::var("AUTODEV_USE_WORKTREES") {
            config.use_worktrees = val.to_lowercase() == "true" || val == "1";
        }

        config
    }

    /// Scheduler tick interval as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Per-project state directory.
    pub fn data_dir(&self, project: &Path) -> PathBuf {
        project.join(&self.data_dir_name)
    }

    /// Per-feature artifact directory inside the state directory.
    pub fn feature_dir(&self, project: &Path, feature_id: &str) -> PathBuf {
        self.data_dir(project).join("features").join(feature_id)
    }

    /// Resolve the concurrency limit for one auto loop.
    ///
    /// Resolution order: explicit caller value, per-branch override,
    /// project-wide default, hard fallback. Branch overrides only apply to
    /// named branches; the default worktree uses the project-wide value.
    pub fn effective_concurrency(
        &self,
        branch: Option<&str>,
        explicit: Option<usize>,
    ) -> usize {
        explicit
            .or_else(|| {
                branch
                    .and_then(|b| self.worktree_concurrency.get(b))
                    .copied()
            })
            .or(self.default_max_concurrency)
            .unwrap_or(DEFAULT_MAX_CONCURRENCY)
            .max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.data_dir_name, ".autodev");
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.failure_threshold, 3);
        assert!(config.default_max_concurrency.is_none());
    }

    #[test]
    fn test_data_dir_layout() {
        let config = OrchestratorConfig::default();
        let project = Path::new("/work/proj");
        assert_eq!(config.data_dir(project), PathBuf::from("/work/proj/.autodev"));
        assert_eq!(
            config.feature_dir(project, "auth-flow"),
            PathBuf::from("/work/proj/.autodev/features/auth-flow")
        );
    }

    #[test]
    fn test_effective_concurrency_chain() {
        let mut config = OrchestratorConfig::default();

        // Hard fallback when nothing is configured.
        assert_eq!(config.effective_concurrency(None, None), 3);

        config.default_max_concurrency = Some(2);
        assert_eq!(config.effective_concurrency(None, None), 2);
        assert_eq!(config.effective_concurrency(Some("feat/a"), None), 2);

        config
            .worktree_concurrency
            .insert("feat/a".to_string(), 5);
        assert_eq!(config.effective_concurrency(Some("feat/a"), None), 5);
        assert_eq!(config.effective_concurrency(Some("feat/b"), None), 2);
        // Overrides never apply to the default worktree.
        assert_eq!(config.effective_concurrency(None, None), 2);

        // The explicit caller value always wins.
        assert_eq!(config.effective_concurrency(Some("feat/a"), Some(1)), 1);
    }

    #[test]
    fn test_effective_concurrency_floor() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.effective_concurrency(None, Some(0)), 1);
    }

    #[test]
    fn test_from_env_overrides() {
        std::env::set_var("AUTODEV_POLL_INTERVAL_MS", "250");
        std::env::set_var("AUTODEV_MAX_CONCURRENCY", "7");
        let config = OrchestratorConfig::from_env();
        std::env::remove_var("AUTODEV_POLL_INTERVAL_MS");
        std::env::remove_var("AUTODEV_MAX_CONCURRENCY");

        assert_eq!(config.poll_interval_ms, 250);
        assert_eq!(config.default_max_concurrency, Some(7));
    }

    #[test]
    fn test_config_serde_partial() {
        let config: OrchestratorConfig = serde_json::from_str(r#"{"poll_interval_ms": 100}"#)
            .expect("partial config should deserialize");
        assert_eq!(config.poll_interval_ms, 100);
        assert_eq!(config.data_dir_name, ".autodev");
    }
}
