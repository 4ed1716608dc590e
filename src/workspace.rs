//! Working directory resolution.
//!
//! Feature work can land in the project root or in a git worktree keyed by
//! the feature's branch. The lookup itself sits behind [`WorktreeResolver`]
//! so tests and non-git setups can stub it; [`GitWorktrees`] is the stock
//! implementation shelling out to git.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context};
use async_trait::async_trait;

use crate::error::{AutodevError, AutodevResult};

/// Maps branches to worktree paths and reports the primary branch.
#[async_trait]
pub trait WorktreeResolver: Send + Sync {
    /// Path of the worktree checked out on `branch`, if one exists.
    async fn find_worktree(&self, project: &Path, branch: &str)
        -> anyhow::Result<Option<PathBuf>>;

    /// Branch currently checked out in the project root. `None` for a
    /// detached HEAD.
    async fn current_branch(&self, project: &Path) -> anyhow::Result<Option<String>>;
}

/// Stock resolver backed by the git CLI.
#[derive(Debug, Default, Clone)]
pub struct GitWorktrees;

impl GitWorktrees {
    pub fn new() -> Self {
        Self
    }

    fn run_git(&self, dir: &Path, args: &[&str]) -> anyhow::Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .with_context(|| format!("Failed to run git {}", args.join(" ")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git {} failed: {}", args.join(" "), stderr.trim());
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl WorktreeResolver for GitWorktrees {
    async fn find_worktree(
        &self,
        project: &Path,
        branch: &str,
    ) -> anyhow::Result<Option<PathBuf>> {
        let stdout = self.run_git(project, &["worktree", "list", "--porcelain"])?;
        Ok(parse_worktree_list(&stdout)
            .into_iter()
            .find(|(_, wt_branch)| wt_branch == branch)
            .map(|(path, _)| path))
    }

    async fn current_branch(&self, project: &Path) -> anyhow::Result<Option<String>> {
        let stdout = self.run_git(project, &["rev-parse", "--abbrev-ref", "HEAD"])?;
        let branch = stdout.trim();
        if branch.is_empty() || branch == "HEAD" {
            Ok(None)
        } else {
            Ok(Some(branch.to_string()))
        }
    }
}

/// Parse `git worktree list --porcelain` output into (path, branch) pairs.
/// Detached worktrees carry no `branch` line and are skipped.
fn parse_worktree_list(porcelain: &str) -> Vec<(PathBuf, String)> {
    let mut entries = Vec::new();
    let mut current_path: Option<PathBuf> = None;

    for line in porcelain.lines() {
        if let Some(path_str) = line.strip_prefix("worktree ") {
            current_path = Some(PathBuf::from(path_str));
        } else if let Some(branch_ref) = line.strip_prefix("branch refs/heads/") {
            if let Some(path) = current_path.take() {
                entries.push((path, branch_ref.to_string()));
            }
        }
    }

    entries
}

/// Validate a resolved working directory before handing it to an agent.
pub fn verify_workdir(path: &Path) -> AutodevResult<PathBuf> {
    let canonical = path.canonicalize().map_err(|e| {
        AutodevError::workdir_invalid(path, format!("cannot resolve path: {e}"))
    })?;

    if !canonical.is_dir() {
        return Err(AutodevError::workdir_invalid(canonical, "not a directory"));
    }

    Ok(canonical)
}

/// Whether two branch designators refer to the same worktree.
///
/// `None` means the default worktree, which is the same checkout as an
/// explicit reference to the primary branch, so both sides normalize
/// through the primary branch name before comparing.
pub fn same_worktree(a: Option<&str>, b: Option<&str>, primary: Option<&str>) -> bool {
    a.or(primary) == b.or(primary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_worktree_normalization() {
        // The default worktree equals an explicit primary-branch reference.
        assert!(same_worktree(None, Some("main"), Some("main")));
        assert!(same_worktree(Some("main"), None, Some("main")));
        assert!(same_worktree(None, None, Some("main")));
        assert!(same_worktree(None, None, None));

        assert!(!same_worktree(Some("feat/a"), None, Some("main")));
        assert!(!same_worktree(Some("feat/a"), Some("feat/b"), Some("main")));
        // Without a primary branch, a named branch is not the default.
        assert!(!same_worktree(Some("main"), None, None));
    }

    #[test]
    fn test_parse_worktree_list() {
        let porcelain = "\
worktree /work/proj
HEAD 1111111111111111111111111111111111111111
branch refs/heads/main

worktree /work/proj-worktrees/feat-login
HEAD 2222222222222222222222222222222222222222
branch refs/heads/feat/login

worktree /work/proj-worktrees/detached
HEAD 3333333333333333333333333333333333333333
detached
";
        let entries = parse_worktree_list(porcelain);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, PathBuf::from("/work/proj"));
        assert_eq!(entries[0].1, "main");
        assert_eq!(entries[1].1, "feat/login");
    }

    #[test]
    fn test_verify_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let verified = verify_workdir(dir.path()).unwrap();
        assert!(verified.is_dir());

        let missing = dir.path().join("nope");
        let err = verify_workdir(&missing).unwrap_err();
        assert!(matches!(err, AutodevError::WorkdirInvalid { .. }));
    }

    #[tokio::test]
    async fn test_git_worktrees_against_real_repo() {
        let repo = tempfile::tempdir().unwrap();
        let wt_base = tempfile::tempdir().unwrap();

        for args in [
            vec!["init"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test"],
        ] {
            Command::new("git")
                .args(&args)
                .current_dir(repo.path())
                .output()
                .unwrap();
        }
        std::fs::write(repo.path().join("README.md"), "hello").unwrap();
        Command::new("git")
            .args(["add", "."])
            .current_dir(repo.path())
            .output()
            .unwrap();
        Command::new("git")
            .args(["commit", "-m", "init"])
            .current_dir(repo.path())
            .output()
            .unwrap();

        let resolver = GitWorktrees::new();

        let branch = resolver.current_branch(repo.path()).await.unwrap();
        assert!(branch.is_some());

        // No worktree exists for this branch yet.
        let found = resolver
            .find_worktree(repo.path(), "feat-login")
            .await
            .unwrap();
        assert!(found.is_none());

        let wt_path = wt_base.path().join("feat-login");
        Command::new("git")
            .args([
                "worktree",
                "add",
                "-b",
                "feat-login",
                &wt_path.display().to_string(),
            ])
            .current_dir(repo.path())
            .output()
            .unwrap();

        let found = resolver
            .find_worktree(repo.path(), "feat-login")
            .await
            .unwrap()
            .expect("worktree should be listed");
        assert_eq!(
            found.canonicalize().unwrap(),
            wt_path.canonicalize().unwrap()
        );
    }
}
