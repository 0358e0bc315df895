//! External issue store interface.
//!
//! The persistent schema behind this trait is out of scope for this crate —
//! only the operations below are specified. Two reference implementations
//! are provided: [`memory::InMemoryIssueStore`] for tests, and
//! [`beads_cli::BeadsCli`], which shells out to the `bd`/`br` binary family
//! the way [`crate::harness::git_manager::GitManager`] shells out to `git`.

pub mod beads_cli;
pub mod graph;
pub mod memory;
pub mod polecat;
pub mod types;

use async_trait::async_trait;
use thiserror::Error;

pub use types::*;

#[derive(Debug, Error)]
pub enum IssueStoreError {
    #[error("issue not found: {0}")]
    NotFound(String),

    #[error("issue {0} is already claimed")]
    AlreadyClaimed(String),

    #[error("no active execution state for issue {0}")]
    NoActiveExecution(String),

    #[error("dependency cycle detected: {0}")]
    CycleDetected(String),

    #[error("backend command failed: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl IssueStoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend(_))
    }
}

pub type IssueStoreResult<T> = Result<T, IssueStoreError>;

/// Operations an autonomous executor needs against a project's issue
/// tracker. Implementations must serialize `claim_issue` so that at most one
/// worker ever holds a given issue's execution state at a time.
#[async_trait]
pub trait IssueStore: Send + Sync {
    async fn get_issue(&self, id: &str) -> IssueStoreResult<Issue>;
    async fn create_issue(&self, issue: Issue) -> IssueStoreResult<Issue>;
    async fn update_issue(&self, issue: Issue) -> IssueStoreResult<Issue>;

    async fn add_dependency(&self, dep: Dependency) -> IssueStoreResult<()>;
    async fn list_dependencies(&self, issue_id: &str) -> IssueStoreResult<Vec<Dependency>>;

    async fn add_label(&self, issue_id: &str, label: &str) -> IssueStoreResult<()>;
    async fn add_event(&self, event: IssueEvent) -> IssueStoreResult<()>;

    /// Ready-to-claim issues: open, not blocked by an open `Blocks` dependency.
    async fn get_ready_work(&self, filter: ReadyWorkFilter) -> IssueStoreResult<Vec<Issue>>;

    /// Atomically claim an issue for `worker_id`. Fails with
    /// [`IssueStoreError::AlreadyClaimed`] if another execution state is
    /// already active for this issue.
    async fn claim_issue(&self, issue_id: &str, worker_id: &str) -> IssueStoreResult<ClaimOutcome>;

    /// Release an issue's execution state, optionally reopening it and
    /// leaving a comment / labels behind (used by the watchdog escalation
    /// path and by the executor loop on both success and failure).
    async fn release_issue(&self, issue_id: &str, opts: ReleaseOptions) -> IssueStoreResult<()>;

    async fn get_execution_state(&self, issue_id: &str) -> IssueStoreResult<Option<ExecutionState>>;
    async fn update_execution_state(&self, state: ExecutionState) -> IssueStoreResult<()>;

    async fn get_checkpoint(&self, issue_id: &str) -> IssueStoreResult<Option<Checkpoint>>;
    async fn save_checkpoint(&self, checkpoint: Checkpoint) -> IssueStoreResult<()>;

    async fn register_worker(&self, instance: WorkerInstance) -> IssueStoreResult<()>;
    async fn heartbeat_worker(&self, worker_id: &str, at: chrono::DateTime<chrono::Utc>) -> IssueStoreResult<()>;
    async fn list_active_workers(&self) -> IssueStoreResult<Vec<WorkerInstance>>;
    async fn cleanup_stale_workers(&self, older_than: chrono::Duration) -> IssueStoreResult<Vec<WorkerInstance>>;
    async fn delete_old_stopped_workers(&self, older_than: chrono::Duration) -> IssueStoreResult<usize>;

    /// Detect a cycle in the `Blocks` dependency subgraph reachable from
    /// `issue_id`. Returns the cycle as a sequence of issue ids, if any.
    async fn detect_cycles(&self, issue_id: &str) -> IssueStoreResult<Option<Vec<String>>>;

    /// Find an open escalation issue carrying both labels, used by the
    /// intervention controller to dedupe repeated anomaly reports.
    async fn find_open_escalation(
        &self,
        affected_issue_label: &str,
        anomaly_type_label: &str,
    ) -> IssueStoreResult<Option<Issue>>;
}
