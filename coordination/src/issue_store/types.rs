//! Data model for the issue store: issues, dependencies, labels, execution
//! state, checkpoints and worker instances.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Status of an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Open,
    InProgress,
    Blocked,
    Closed,
}

/// Kind of issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    Task,
    Bug,
    Chore,
    Epic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: IssueStatus,
    /// Lower value is higher priority.
    pub priority: u8,
    pub kind: IssueKind,
    pub labels: Vec<String>,
    pub acceptance_criteria: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// `true` for issues the system itself discovered (e.g. split-off gate
    /// failures) rather than issues authored by a planner.
    pub discovered: bool,
}

impl Issue {
    pub fn is_ready(&self, blocked_by_open_dependency: bool) -> bool {
        self.status == IssueStatus::Open && !blocked_by_open_dependency
    }
}

/// Kind of dependency edge between two issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    Blocks,
    DiscoveredFrom,
    Parent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dependency {
    pub issue_id: String,
    pub depends_on_id: String,
    pub kind: DependencyKind,
}

/// A free-text or reserved label/event comment attached to an issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueEvent {
    pub issue_id: String,
    pub actor: String,
    pub body: String,
    pub at: DateTime<Utc>,
}

/// Phase of an issue's active execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    Claimed,
    Assessing,
    Executing,
    Analyzing,
    Gates,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    pub issue_id: String,
    pub worker_id: String,
    pub phase: ExecutionPhase,
    pub claimed_at: DateTime<Utc>,
    pub last_checkpoint_at: Option<DateTime<Utc>>,
    pub intervention_count: u32,
    pub last_intervention_at: Option<DateTime<Utc>>,
}

impl ExecutionState {
    pub fn new(issue_id: impl Into<String>, worker_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            issue_id: issue_id.into(),
            worker_id: worker_id.into(),
            phase: ExecutionPhase::Claimed,
            claimed_at: now,
            last_checkpoint_at: None,
            intervention_count: 0,
            last_intervention_at: None,
        }
    }

    pub fn record_intervention(&mut self, now: DateTime<Utc>) {
        self.intervention_count += 1;
        self.last_intervention_at = Some(now);
    }

    pub fn reset_interventions(&mut self) {
        self.intervention_count = 0;
        self.last_intervention_at = None;
    }
}

/// Opaque checkpoint blob, overwritten on each save.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub issue_id: String,
    pub saved_at: DateTime<Utc>,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInstance {
    pub worker_id: String,
    pub hostname: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub status: WorkerStatus,
}

/// Filter applied when listing ready work.
#[derive(Debug, Clone, Default)]
pub struct ReadyWorkFilter {
    pub kind: Option<IssueKind>,
    pub label: Option<String>,
    pub limit: Option<usize>,
}

/// Result of a claim attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimOutcome {
    pub issue: Issue,
    pub execution_state: ExecutionState,
}

/// Metadata bundle used when releasing an issue back to the pool.
#[derive(Debug, Clone, Default)]
pub struct ReleaseOptions {
    pub reopen: bool,
    pub comment: Option<String>,
    pub add_labels: Vec<String>,
}

pub type EventSeverityMap = HashMap<String, u64>;
