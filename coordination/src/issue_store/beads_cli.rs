//! `IssueStore` backed by the external `bd`/`br` beads CLI.
//!
//! beads is binary-only — no lib.rs — so every operation shells out, the
//! same way [`crate::harness::git_manager::GitManager`] shells out to
//! `git`. The binary name is read from `VC_BEADS_BIN`, defaulting to `bd`.

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use super::{
    Checkpoint, ClaimOutcome, Dependency, ExecutionState, Issue, IssueEvent, IssueStore,
    IssueStoreError, IssueStoreResult, ReadyWorkFilter, ReleaseOptions, WorkerInstance,
};

pub struct BeadsCli {
    bin: String,
    db_path: Option<String>,
}

impl BeadsCli {
    pub fn new() -> Self {
        Self {
            bin: std::env::var("VC_BEADS_BIN").unwrap_or_else(|_| "bd".into()),
            db_path: std::env::var("VC_BEADS_DB").ok(),
        }
    }

    pub fn with_db_path(mut self, path: impl Into<String>) -> Self {
        self.db_path = Some(path.into());
        self
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.bin);
        if let Some(db) = &self.db_path {
            cmd.arg("--db").arg(db);
        }
        cmd.args(args);
        cmd
    }

    async fn run_json<T: for<'de> Deserialize<'de>>(&self, args: &[&str]) -> IssueStoreResult<T> {
        let output = self
            .command(args)
            .output()
            .await
            .map_err(|e| IssueStoreError::Backend(format!("{} {}: {e}", self.bin, args.join(" "))))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(IssueStoreError::Backend(format!(
                "{} {} failed: {stderr}",
                self.bin,
                args.join(" ")
            )));
        }

        serde_json::from_slice(&output.stdout).map_err(IssueStoreError::Serde)
    }

    async fn run(&self, args: &[&str]) -> IssueStoreResult<String> {
        let output = self
            .command(args)
            .output()
            .await
            .map_err(|e| IssueStoreError::Backend(format!("{} {}: {e}", self.bin, args.join(" "))))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("already claimed") || stderr.contains("AlreadyClaimed") {
                return Err(IssueStoreError::AlreadyClaimed(
                    args.get(1).unwrap_or(&"?").to_string(),
                ));
            }
            return Err(IssueStoreError::Backend(format!(
                "{} {} failed: {stderr}",
                self.bin,
                args.join(" ")
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl Default for BeadsCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IssueStore for BeadsCli {
    async fn get_issue(&self, id: &str) -> IssueStoreResult<Issue> {
        self.run_json(&["show", id, "--json"]).await
    }

    async fn create_issue(&self, issue: Issue) -> IssueStoreResult<Issue> {
        let body = serde_json::to_string(&issue)?;
        self.run_json(&["create", "--json", &body]).await
    }

    async fn update_issue(&self, issue: Issue) -> IssueStoreResult<Issue> {
        let body = serde_json::to_string(&issue)?;
        self.run_json(&["update", &issue.id, "--json", &body]).await
    }

    async fn add_dependency(&self, dep: Dependency) -> IssueStoreResult<()> {
        let kind = match dep.kind {
            super::DependencyKind::Blocks => "blocks",
            super::DependencyKind::DiscoveredFrom => "discovered-from",
            super::DependencyKind::Parent => "parent",
        };
        self.run(&["dep", "add", &dep.issue_id, &dep.depends_on_id, "--type", kind])
            .await?;
        Ok(())
    }

    async fn list_dependencies(&self, issue_id: &str) -> IssueStoreResult<Vec<Dependency>> {
        self.run_json(&["dep", "list", issue_id, "--json"]).await
    }

    async fn add_label(&self, issue_id: &str, label: &str) -> IssueStoreResult<()> {
        self.run(&["label", "add", issue_id, label]).await?;
        Ok(())
    }

    async fn add_event(&self, event: IssueEvent) -> IssueStoreResult<()> {
        self.run(&["comment", &event.issue_id, "--body", &event.body, "--actor", &event.actor])
            .await?;
        Ok(())
    }

    async fn get_ready_work(&self, filter: ReadyWorkFilter) -> IssueStoreResult<Vec<Issue>> {
        let mut args = vec!["ready".to_string(), "--json".to_string()];
        if let Some(kind) = filter.kind {
            args.push("--type".into());
            args.push(format!("{kind:?}").to_lowercase());
        }
        if let Some(label) = &filter.label {
            args.push("--label".into());
            args.push(label.clone());
        }
        if let Some(limit) = filter.limit {
            args.push("--limit".into());
            args.push(limit.to_string());
        }
        let args_ref: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_json(&args_ref).await
    }

    async fn claim_issue(&self, issue_id: &str, worker_id: &str) -> IssueStoreResult<ClaimOutcome> {
        self.run_json(&["claim", issue_id, "--worker", worker_id, "--json"])
            .await
    }

    async fn release_issue(&self, issue_id: &str, opts: ReleaseOptions) -> IssueStoreResult<()> {
        let mut args = vec!["release".to_string(), issue_id.to_string()];
        if opts.reopen {
            args.push("--reopen".into());
        }
        if let Some(comment) = &opts.comment {
            args.push("--comment".into());
            args.push(comment.clone());
        }
        for label in &opts.add_labels {
            args.push("--label".into());
            args.push(label.clone());
        }
        let args_ref: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&args_ref).await?;
        Ok(())
    }

    async fn get_execution_state(&self, issue_id: &str) -> IssueStoreResult<Option<ExecutionState>> {
        let output = self.command(&["state", issue_id, "--json"]).output().await;
        match output {
            Ok(o) if o.status.success() => {
                if o.stdout.trim_ascii().is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(serde_json::from_slice(&o.stdout)?))
                }
            }
            Ok(o) => {
                let stderr = String::from_utf8_lossy(&o.stderr);
                if stderr.contains("no active execution") {
                    Ok(None)
                } else {
                    Err(IssueStoreError::Backend(stderr.to_string()))
                }
            }
            Err(e) => Err(IssueStoreError::Backend(e.to_string())),
        }
    }

    async fn update_execution_state(&self, state: ExecutionState) -> IssueStoreResult<()> {
        let body = serde_json::to_string(&state)?;
        self.run(&["state", "set", &state.issue_id, "--json", &body]).await?;
        Ok(())
    }

    async fn get_checkpoint(&self, issue_id: &str) -> IssueStoreResult<Option<Checkpoint>> {
        let output = self.command(&["checkpoint", "get", issue_id, "--json"]).output().await;
        match output {
            Ok(o) if o.status.success() => {
                if o.stdout.trim_ascii().is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(serde_json::from_slice(&o.stdout)?))
                }
            }
            Ok(_) => Ok(None),
            Err(e) => Err(IssueStoreError::Backend(e.to_string())),
        }
    }

    async fn save_checkpoint(&self, checkpoint: Checkpoint) -> IssueStoreResult<()> {
        let body = serde_json::to_string(&checkpoint)?;
        self.run(&["checkpoint", "set", &checkpoint.issue_id, "--json", &body])
            .await?;
        Ok(())
    }

    async fn register_worker(&self, instance: WorkerInstance) -> IssueStoreResult<()> {
        let body = serde_json::to_string(&instance)?;
        self.run(&["worker", "register", "--json", &body]).await?;
        Ok(())
    }

    async fn heartbeat_worker(
        &self,
        worker_id: &str,
        _at: chrono::DateTime<chrono::Utc>,
    ) -> IssueStoreResult<()> {
        self.run(&["worker", "heartbeat", worker_id]).await?;
        Ok(())
    }

    async fn list_active_workers(&self) -> IssueStoreResult<Vec<WorkerInstance>> {
        self.run_json(&["worker", "list", "--status=running", "--json"]).await
    }

    async fn cleanup_stale_workers(
        &self,
        older_than: chrono::Duration,
    ) -> IssueStoreResult<Vec<WorkerInstance>> {
        let secs = older_than.num_seconds().to_string();
        self.run_json(&["worker", "reap", "--older-than-secs", &secs, "--json"])
            .await
    }

    async fn delete_old_stopped_workers(&self, older_than: chrono::Duration) -> IssueStoreResult<usize> {
        let secs = older_than.num_seconds().to_string();
        let out = self
            .run(&["worker", "gc", "--older-than-secs", &secs])
            .await?;
        Ok(out.trim().parse().unwrap_or(0))
    }

    async fn detect_cycles(&self, issue_id: &str) -> IssueStoreResult<Option<Vec<String>>> {
        let out = self.run(&["dep", "cycles", issue_id]).await?;
        if out.trim().is_empty() {
            Ok(None)
        } else {
            Ok(Some(out.split("->").map(|s| s.trim().to_string()).collect()))
        }
    }

    async fn find_open_escalation(
        &self,
        affected_issue_label: &str,
        anomaly_type_label: &str,
    ) -> IssueStoreResult<Option<Issue>> {
        let mut found: Vec<Issue> = self
            .run_json(&[
                "list",
                "--label",
                "watchdog-escalation",
                "--label",
                affected_issue_label,
                "--label",
                anomaly_type_label,
                "--status",
                "open",
                "--json",
            ])
            .await?;
        Ok(found.pop())
    }
}
