//! Git worktree sandbox — generalizes the donor's `WorktreeBridge` into the
//! `coordination::executor_loop::Sandbox` trait boundary, adding the
//! discard-without-merge path the executor loop needs on gate failure or a
//! denied approval.

use std::path::{Path, PathBuf};
use std::process::Command;

use async_trait::async_trait;
use coordination::executor_loop::{ExecutorError, Sandbox};

/// Info about an active worktree.
#[derive(Debug, Clone)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: String,
}

fn run_git(args: &[&str], dir: &Path) -> Result<String, ExecutorError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| ExecutorError::Sandbox(format!("failed to execute git {args:?}: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ExecutorError::Sandbox(format!("git {args:?} failed: {stderr}")));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Manages one git worktree per issue.
pub struct WorktreeSandbox {
    base_dir: PathBuf,
    repo_root: PathBuf,
}

impl WorktreeSandbox {
    /// `base_dir`: parent directory for worktrees. If `None`, auto-detects:
    ///   - `/cluster/shared/wt/` if that NFS mount exists
    ///   - `/tmp/executor-wt/` otherwise
    pub fn new(base_dir: Option<PathBuf>, repo_root: impl AsRef<Path>) -> Result<Self, ExecutorError> {
        let repo_root = repo_root.as_ref().to_path_buf();
        run_git(&["rev-parse", "--git-dir"], &repo_root)
            .map_err(|_| ExecutorError::Sandbox(format!("not a git repository: {}", repo_root.display())))?;

        let base_dir = base_dir.unwrap_or_else(|| {
            let cluster_path = PathBuf::from("/cluster/shared/wt");
            if cluster_path.exists() {
                cluster_path
            } else {
                PathBuf::from("/tmp/executor-wt")
            }
        });
        std::fs::create_dir_all(&base_dir)
            .map_err(|e| ExecutorError::Sandbox(format!("failed to create worktree base dir: {e}")))?;

        Ok(Self { base_dir, repo_root })
    }

    pub fn worktree_path(&self, issue_id: &str) -> PathBuf {
        self.base_dir.join(issue_id)
    }

    fn branch_name(issue_id: &str) -> String {
        format!("executor/{issue_id}")
    }

    pub fn list(&self) -> Result<Vec<WorktreeInfo>, ExecutorError> {
        let output = run_git(&["worktree", "list", "--porcelain"], &self.repo_root)?;

        let mut infos = Vec::new();
        let mut current_path: Option<PathBuf> = None;
        let mut current_branch: Option<String> = None;
        for line in output.lines() {
            if let Some(path_str) = line.strip_prefix("worktree ") {
                if let (Some(path), Some(branch)) = (current_path.take(), current_branch.take()) {
                    infos.push(WorktreeInfo { path, branch });
                }
                current_path = Some(PathBuf::from(path_str));
            } else if let Some(branch_ref) = line.strip_prefix("branch refs/heads/") {
                current_branch = Some(branch_ref.to_string());
            }
        }
        if let (Some(path), Some(branch)) = (current_path, current_branch) {
            infos.push(WorktreeInfo { path, branch });
        }
        Ok(infos)
    }

    fn remove_worktree_and_branch(&self, issue_id: &str) {
        let wt_path = self.worktree_path(issue_id);
        let branch = Self::branch_name(issue_id);

        if let Err(e) = run_git(&["worktree", "remove", "--force", &wt_path.display().to_string()], &self.repo_root) {
            tracing::warn!(target: "git_safety", issue_id, error = %e, "git worktree remove warning");
        }
        if let Err(e) = run_git(&["branch", "-D", &branch], &self.repo_root) {
            tracing::warn!(target: "git_safety", issue_id, error = %e, "git branch -D warning");
        }
    }
}

#[async_trait]
impl Sandbox for WorktreeSandbox {
    async fn create(&self, issue_id: &str) -> Result<PathBuf, ExecutorError> {
        let wt_path = self.worktree_path(issue_id);
        if wt_path.exists() {
            return Err(ExecutorError::Sandbox(format!("worktree already exists for {issue_id}")));
        }
        let branch = Self::branch_name(issue_id);
        run_git(
            &["worktree", "add", "-b", &branch, &wt_path.display().to_string()],
            &self.repo_root,
        )?;
        Ok(wt_path)
    }

    async fn merge_and_remove(&self, issue_id: &str) -> Result<(), ExecutorError> {
        let wt_path = self.worktree_path(issue_id);
        let branch = Self::branch_name(issue_id);

        if wt_path.exists() {
            let status = run_git(&["status", "--porcelain"], &wt_path)?;
            if !status.is_empty() {
                return Err(ExecutorError::Sandbox(format!(
                    "worktree {issue_id} has uncommitted changes, refusing to merge"
                )));
            }
        }

        run_git(
            &["merge", "--no-ff", &branch, "-m", &format!("executor: merge {issue_id}")],
            &self.repo_root,
        )
        .map_err(|e| ExecutorError::Sandbox(format!("merge failed for {issue_id} (possible conflict): {e}")))?;

        self.remove_worktree_and_branch(issue_id);
        Ok(())
    }

    async fn discard(&self, issue_id: &str) -> Result<(), ExecutorError> {
        self.remove_worktree_and_branch(issue_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;

    fn init_repo(dir: &Path) {
        for args in [
            vec!["init"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test"],
        ] {
            StdCommand::new("git").args(&args).current_dir(dir).output().unwrap();
        }
        std::fs::write(dir.join("README.md"), "hello").unwrap();
        StdCommand::new("git").args(["add", "."]).current_dir(dir).output().unwrap();
        StdCommand::new("git").args(["commit", "-m", "init"]).current_dir(dir).output().unwrap();
    }

    #[tokio::test]
    async fn create_then_discard_removes_worktree_and_branch() {
        let repo_dir = tempfile::tempdir().unwrap();
        let wt_base = tempfile::tempdir().unwrap();
        init_repo(repo_dir.path());

        let sandbox = WorktreeSandbox::new(Some(wt_base.path().to_path_buf()), repo_dir.path()).unwrap();
        let wt_path = sandbox.create("issue-1").await.unwrap();
        assert!(wt_path.exists());

        sandbox.discard("issue-1").await.unwrap();
        assert!(!wt_path.exists());
        assert!(!sandbox.list().unwrap().iter().any(|w| w.branch == "executor/issue-1"));
    }

    #[tokio::test]
    async fn creating_twice_for_the_same_issue_fails() {
        let repo_dir = tempfile::tempdir().unwrap();
        let wt_base = tempfile::tempdir().unwrap();
        init_repo(repo_dir.path());

        let sandbox = WorktreeSandbox::new(Some(wt_base.path().to_path_buf()), repo_dir.path()).unwrap();
        sandbox.create("issue-1").await.unwrap();
        assert!(sandbox.create("issue-1").await.is_err());
    }
}
