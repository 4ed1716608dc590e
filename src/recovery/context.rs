//! Saved agent transcripts.
//!
//! Whatever the agent produced before an interruption is the context a
//! resumed run continues from. The transcript also carries the summary and
//! learnings blocks reported on completion, extracted best-effort here.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::config::OrchestratorConfig;
use crate::error::AutodevResult;

const CONTEXT_FILE_NAME: &str = "agent-output.md";

/// Per-feature transcript storage under the project data directory.
#[derive(Clone)]
pub struct ContextStore {
    config: Arc<OrchestratorConfig>,
}

impl ContextStore {
    pub fn new(config: Arc<OrchestratorConfig>) -> Self {
        Self { config }
    }

    pub fn context_path(&self, project: &Path, feature_id: &str) -> PathBuf {
        self.config
            .feature_dir(project, feature_id)
            .join(CONTEXT_FILE_NAME)
    }

    /// Whether a resumable transcript exists for this feature.
    pub fn context_exists(&self, project: &Path, feature_id: &str) -> bool {
        self.context_path(project, feature_id).is_file()
    }

    /// Read the saved transcript, `None` when there is none.
    pub fn read_context(
        &self,
        project: &Path,
        feature_id: &str,
    ) -> AutodevResult<Option<String>> {
        let path = self.context_path(project, feature_id);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(std::fs::read_to_string(path)?))
    }

    /// Save a transcript, replacing any previous one.
    pub fn save_context(
        &self,
        project: &Path,
        feature_id: &str,
        content: &str,
    ) -> AutodevResult<()> {
        let path = self.context_path(project, feature_id);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let tmp = path.with_extension("md.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &path)?;
        debug!(feature_id, path = %path.display(), "agent context saved");
        Ok(())
    }

    /// Remove a transcript. Missing files are fine.
    pub fn clear_context(&self, project: &Path, feature_id: &str) -> AutodevResult<()> {
        let path = self.context_path(project, feature_id);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// Pull the summary block out of an agent transcript, if one exists.
/// Looks for a `<summary>` tag first, then a `## Summary` heading.
pub fn extract_summary(output: &str) -> Option<String> {
    extract_tagged(output, "summary").or_else(|| extract_heading(output, "summary"))
}

/// Same as [`extract_summary`] but for the learnings block.
pub fn extract_learnings(output: &str) -> Option<String> {
    extract_tagged(output, "learnings").or_else(|| extract_heading(output, "learnings"))
}

fn extract_tagged(output: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");

    // The last block wins; earlier ones belong to earlier passes.
    let start = output.rfind(&open)? + open.len();
    let end = output[start..].find(&close)? + start;

    let content = output[start..end].trim();
    (!content.is_empty()).then(|| content.to_string())
}

fn extract_heading(output: &str, heading: &str) -> Option<String> {
    let mut collected: Vec<&str> = Vec::new();
    let mut in_section = false;

    for line in output.lines() {
        let trimmed = line.trim();
        if in_section {
            if trimmed.starts_with("## ") || trimmed.starts_with("# ") {
                break;
            }
            collected.push(line);
        } else if let Some(rest) = trimmed.strip_prefix("## ") {
            if rest.trim().eq_ignore_ascii_case(heading) {
                in_section = true;
            }
        }
    }

    let content = collected.join("\n").trim().to_string();
    (!content.is_empty()).then_some(content)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ContextStore {
        ContextStore::new(Arc::new(OrchestratorConfig::default()))
    }

    #[test]
    fn test_context_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path();
        let store = store();

        assert!(!store.context_exists(project, "f1"));
        assert!(store.read_context(project, "f1").unwrap().is_none());

        store
            .save_context(project, "f1", "did some work on the login form")
            .unwrap();
        assert!(store.context_exists(project, "f1"));
        assert_eq!(
            store.read_context(project, "f1").unwrap().as_deref(),
            Some("did some work on the login form")
        );

        store.clear_context(project, "f1").unwrap();
        assert!(!store.context_exists(project, "f1"));
        store.clear_context(project, "f1").unwrap();
    }

    #[test]
    fn test_context_path_layout() {
        let store = store();
        assert_eq!(
            store.context_path(Path::new("/proj"), "f1"),
            PathBuf::from("/proj/.autodev/features/f1/agent-output.md")
        );
    }

    #[test]
    fn test_extract_tagged_summary() {
        let output = "noise\n<summary>\nAdded the login form.\n</summary>\ntrailer";
        assert_eq!(
            extract_summary(output).as_deref(),
            Some("Added the login form.")
        );
    }

    #[test]
    fn test_extract_last_tagged_block() {
        let output = "<summary>first pass</summary>\nmore work\n<summary>final pass</summary>";
        assert_eq!(extract_summary(output).as_deref(), Some("final pass"));
    }

    #[test]
    fn test_extract_heading_section() {
        let output = "\
intro

## Summary

Wired the login form to the auth endpoint.
Handled the error toast.

## Learnings

The form library debounces validation.

## Next steps
n/a";
        assert_eq!(
            extract_summary(output).as_deref(),
            Some("Wired the login form to the auth endpoint.\nHandled the error toast.")
        );
        assert_eq!(
            extract_learnings(output).as_deref(),
            Some("The form library debounces validation.")
        );
    }

    #[test]
    fn test_extract_missing_or_empty() {
        assert_eq!(extract_summary("no blocks here"), None);
        assert_eq!(extract_summary("<summary>   </summary>"), None);
        assert_eq!(extract_summary("<summary>unclosed"), None);
    }
}
