//! Approval Gate — presents a human with a summary of the work an agent
//! produced for an issue and records a bit-exact yes/no/diff-view decision
//! before the branch is allowed to merge.

use std::io::{self, BufRead, Write};

use thiserror::Error;

use crate::harness::{GitManager, HarnessError};
use crate::issue_store::Issue;
use crate::verifier::VerifierReport;

/// Environment variable checked for a non-interactive auto-approve override.
/// Any non-empty value bypasses the prompt and approves.
pub const DEFAULT_AUTO_APPROVE_ENV_VAR: &str = "VC_APPROVAL_AUTO_APPROVE";

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("failed to build approval summary: {0}")]
    Summary(#[from] HarnessError),

    #[error("failed to read approval decision: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct ApprovalResult {
    pub approved: bool,
    pub outcome: String,
    pub auto_approved: bool,
}

/// Presents a change for human sign-off before it merges to main.
pub struct ApprovalGate {
    git: GitManager,
    auto_approve_env_var: String,
}

impl ApprovalGate {
    pub fn new(git: GitManager) -> Self {
        Self {
            git,
            auto_approve_env_var: DEFAULT_AUTO_APPROVE_ENV_VAR.to_string(),
        }
    }

    pub fn with_auto_approve_env_var(mut self, var: impl Into<String>) -> Self {
        self.auto_approve_env_var = var.into();
        self
    }

    fn gate_icons(report: &VerifierReport) -> String {
        report
            .gates
            .iter()
            .map(|g| {
                let icon = if g.outcome.is_passed() { "\u{2713}" } else { "\u{2717}" };
                format!("{icon} {}", g.gate)
            })
            .collect::<Vec<_>>()
            .join("  ")
    }

    fn build_summary(&self, issue: &Issue, report: &VerifierReport, base: &str) -> Result<String, ApprovalError> {
        let branch = self.git.current_branch()?;
        let changed_files = self.git.diff_name_only(base)?;
        let diff_stat = self.git.diff_stat(base)?;
        let commits = self.git.commit_log(&format!("{base}..HEAD"))?;

        let mut out = String::new();
        out.push_str(&"=".repeat(80));
        out.push('\n');
        out.push_str(&format!("Issue {}: {}\n", issue.id, issue.title));
        out.push_str(&format!("Branch: {branch}\n"));
        out.push_str(&format!("Gates: {}\n", Self::gate_icons(report)));
        out.push_str(&format!("Changed files ({}):\n", changed_files.len()));
        for f in &changed_files {
            out.push_str(&format!("  {f}\n"));
        }
        out.push_str("\nDiff stat:\n");
        out.push_str(&diff_stat);
        out.push_str("\n\nCommits:\n");
        for c in &commits {
            out.push_str(&format!("  {c}\n"));
        }
        out.push_str(&"=".repeat(80));
        out.push('\n');
        Ok(out)
    }

    fn auto_approve_override(&self) -> bool {
        std::env::var(&self.auto_approve_env_var)
            .map(|v| !v.is_empty())
            .unwrap_or(false)
    }

    /// Build the summary, optionally auto-approve, otherwise drive the
    /// interactive y/n/d prompt loop on stdin/stdout.
    pub fn run(&self, issue: &Issue, report: &VerifierReport, base: &str) -> Result<ApprovalResult, ApprovalError> {
        let summary = self.build_summary(issue, report, base)?;
        println!("{summary}");

        if self.auto_approve_override() {
            return Ok(ApprovalResult {
                approved: true,
                outcome: format!("auto-approved via {}", self.auto_approve_env_var),
                auto_approved: true,
            });
        }

        let stdin = io::stdin();
        let mut lines = stdin.lock().lines();

        loop {
            print!("Approve merge to main? [y/n/d=show diff]: ");
            io::stdout().flush()?;

            let Some(line) = lines.next() else {
                return Ok(ApprovalResult {
                    approved: false,
                    outcome: "no input available, denied".to_string(),
                    auto_approved: false,
                });
            };
            let line = line?;
            match line.trim().to_ascii_lowercase().as_str() {
                "y" | "yes" => {
                    return Ok(ApprovalResult {
                        approved: true,
                        outcome: "approved by operator".to_string(),
                        auto_approved: false,
                    });
                }
                "n" | "no" => {
                    return Ok(ApprovalResult {
                        approved: false,
                        outcome: "denied by operator".to_string(),
                        auto_approved: false,
                    });
                }
                "d" | "diff" => {
                    let diff = self.git.diff_full(base).unwrap_or_default();
                    println!("{diff}");
                }
                other => {
                    println!("unrecognized input '{other}', expected y/n/d");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue_store::{IssueKind, IssueStatus};
    use std::process::Command;
    use tempfile::tempdir;

    fn setup_repo() -> (tempfile::TempDir, GitManager, String) {
        let dir = tempdir().unwrap();
        Command::new("git").args(["init"]).current_dir(dir.path()).output().unwrap();
        Command::new("git")
            .args(["config", "user.email", "test@test.com"])
            .current_dir(dir.path())
            .output()
            .unwrap();
        Command::new("git")
            .args(["config", "user.name", "Test"])
            .current_dir(dir.path())
            .output()
            .unwrap();
        std::fs::write(dir.path().join("README.md"), "# Test").unwrap();
        Command::new("git").args(["add", "."]).current_dir(dir.path()).output().unwrap();
        Command::new("git")
            .args(["commit", "-m", "Initial commit"])
            .current_dir(dir.path())
            .output()
            .unwrap();
        let git = GitManager::new(dir.path(), "[checkpoint]");
        let base = git.current_commit_full().unwrap();

        std::fs::write(dir.path().join("feature.txt"), "content").unwrap();
        git.create_checkpoint("issue-1", "did the work").unwrap();

        (dir, git, base)
    }

    fn sample_issue() -> Issue {
        let now = chrono::Utc::now();
        Issue {
            id: "issue-1".into(),
            title: "do the thing".into(),
            description: String::new(),
            status: IssueStatus::InProgress,
            priority: 2,
            kind: IssueKind::Task,
            labels: vec![],
            acceptance_criteria: None,
            created_at: now,
            updated_at: now,
            discovered: false,
        }
    }

    #[test]
    fn auto_approve_env_var_bypasses_prompt() {
        let (_dir, git, base) = setup_repo();
        let var = "VC_APPROVAL_AUTO_APPROVE_TEST_1";
        std::env::set_var(var, "1");
        let gate = ApprovalGate::new(git).with_auto_approve_env_var(var);
        let report = VerifierReport::new("/tmp".to_string());
        let result = gate.run(&sample_issue(), &report, &base).unwrap();
        std::env::remove_var(var);

        assert!(result.approved);
        assert!(result.auto_approved);
    }

    #[test]
    fn blank_auto_approve_env_var_does_not_bypass() {
        let (_dir, git, _base) = setup_repo();
        let var = "VC_APPROVAL_AUTO_APPROVE_TEST_2";
        std::env::set_var(var, "");
        let gate = ApprovalGate::new(git).with_auto_approve_env_var(var);
        std::env::remove_var(var);

        assert!(!gate.auto_approve_override());
    }

    #[test]
    fn summary_lists_changed_files_and_commits() {
        let (_dir, git, base) = setup_repo();
        let gate = ApprovalGate::new(git);
        let report = VerifierReport::new("/tmp".to_string());
        let summary = gate.build_summary(&sample_issue(), &report, &base).unwrap();

        assert!(summary.contains("feature.txt"));
        assert!(summary.contains("issue-1"));
    }
}
