//! External AI coding agent runner — invokes a configured CLI coding agent
//! as a subprocess per issue and pumps its stdout through the watchdog.
//!
//! This is distinct from `coordination::ai_client::AiClient`, which is used
//! for short completions (anomaly analysis, recovery strategy). The agent
//! here does the actual multi-turn code editing and may run for minutes.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use coordination::executor_loop::{AgentRunner, ExecutorError};
use coordination::issue_store::Issue;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

fn format_task_prompt(issue: &Issue) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!("# Task: {}\n\n", issue.title));
    prompt.push_str(&format!("**Issue ID:** {} | **Kind:** {:?}\n\n", issue.id, issue.kind));

    if !issue.description.is_empty() {
        prompt.push_str("## Description\n");
        prompt.push_str(&issue.description);
        prompt.push_str("\n\n");
    }

    if let Some(criteria) = &issue.acceptance_criteria {
        prompt.push_str("## Acceptance Criteria\n");
        prompt.push_str(criteria);
        prompt.push('\n');
    }

    prompt
}

/// Runs a configured external coding-agent command (e.g. a Claude Code or
/// Codex CLI binary) as a subprocess per issue. The prompt is written to the
/// child's stdin; stdout and stderr are pumped line-by-line through
/// `on_output` so the watchdog can observe progress and detect anomalies.
pub struct SubprocessAgentRunner {
    program: String,
    args: Vec<String>,
}

impl SubprocessAgentRunner {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl AgentRunner for SubprocessAgentRunner {
    async fn run(
        &self,
        issue: &Issue,
        workdir: &Path,
        on_output: &(dyn for<'a> Fn(&'a str) + Send + Sync),
        cancel: CancellationToken,
    ) -> Result<bool, ExecutorError> {
        let prompt = format_task_prompt(issue);

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutorError::Agent(format!("failed to spawn {}: {e}", self.program)))?;

        {
            use tokio::io::AsyncWriteExt;
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| ExecutorError::Agent("agent child has no stdin".to_string()))?;
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| ExecutorError::Agent(format!("failed to write prompt: {e}")))?;
            drop(stdin);
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecutorError::Agent("agent child has no stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExecutorError::Agent("agent child has no stderr".to_string()))?;

        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Err(ExecutorError::Agent("agent run cancelled".to_string()));
                }
                line = stdout_lines.next_line() => {
                    match line {
                        Ok(Some(l)) => { on_output(&l); }
                        Ok(None) => break,
                        Err(e) => return Err(ExecutorError::Agent(format!("stdout read error: {e}"))),
                    }
                }
                line = stderr_lines.next_line() => {
                    match line {
                        Ok(Some(l)) => { on_output(&l); }
                        Ok(None) => {}
                        Err(e) => return Err(ExecutorError::Agent(format!("stderr read error: {e}"))),
                    }
                }
            }
        }

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(ExecutorError::Agent("agent run cancelled".to_string()));
            }
            status = child.wait() => status.map_err(|e| ExecutorError::Agent(format!("agent wait failed: {e}")))?,
        };

        Ok(status.success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coordination::issue_store::{IssueKind, IssueStatus};
    use std::sync::{Arc, Mutex};

    fn sample_issue() -> Issue {
        let now = chrono::Utc::now();
        Issue {
            id: "issue-1".into(),
            title: "echo something".into(),
            description: "print a line of output".into(),
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

    #[tokio::test]
    async fn successful_command_streams_output_and_reports_success() {
        let runner = SubprocessAgentRunner::new("cat", vec![]);
        let lines = Arc::new(Mutex::new(Vec::new()));
        let lines_clone = lines.clone();
        let on_output = move |l: &str| lines_clone.lock().unwrap().push(l.to_string());

        let workdir = tempfile::tempdir().unwrap();
        let ok = runner
            .run(&sample_issue(), workdir.path(), &on_output, CancellationToken::new())
            .await
            .unwrap();

        assert!(ok);
        assert!(lines.lock().unwrap().iter().any(|l| l.contains("print a line of output")));
    }

    #[tokio::test]
    async fn nonzero_exit_reports_failure_not_error() {
        let runner = SubprocessAgentRunner::new("sh", vec!["-c".to_string(), "cat >/dev/null; exit 1".to_string()]);
        let workdir = tempfile::tempdir().unwrap();
        let ok = runner
            .run(&sample_issue(), workdir.path(), &|_| {}, CancellationToken::new())
            .await
            .unwrap();

        assert!(!ok);
    }

    #[tokio::test]
    async fn cancellation_kills_child_and_returns_error() {
        let runner = SubprocessAgentRunner::new("sh", vec!["-c".to_string(), "cat >/dev/null; sleep 30".to_string()]);
        let workdir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            cancel_clone.cancel();
        });

        let result = runner.run(&sample_issue(), workdir.path(), &|_| {}, cancel).await;
        assert!(result.is_err());
    }
}
