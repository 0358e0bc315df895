//! In-memory `IssueStore` reference implementation, used by tests and by
//! the test gate's forced `:memory:` mode.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;

use super::graph::detect_cycle_from;
use super::{
    Checkpoint, ClaimOutcome, Dependency, ExecutionState, Issue, IssueEvent, IssueStatus,
    IssueStore, IssueStoreError, IssueStoreResult, ReadyWorkFilter, ReleaseOptions, WorkerInstance,
    WorkerStatus,
};

#[derive(Default)]
struct Tables {
    issues: HashMap<String, Issue>,
    dependencies: Vec<Dependency>,
    events: Vec<IssueEvent>,
    execution_states: HashMap<String, ExecutionState>,
    checkpoints: HashMap<String, Checkpoint>,
    workers: HashMap<String, WorkerInstance>,
}

/// Single-process, single-mutex issue store. Good enough for tests and for
/// the isolated `:memory:` environment the test gate forces on agent-driven
/// test runs — it is explicitly not meant to survive a process restart.
pub struct InMemoryIssueStore {
    tables: Mutex<Tables>,
}

impl Default for InMemoryIssueStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryIssueStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
        }
    }

    /// Events recorded for `issue_id`, oldest first. Test-only introspection
    /// hook — `IssueStore::add_event` is otherwise fire-and-forget.
    pub fn events_for(&self, issue_id: &str) -> Vec<IssueEvent> {
        let tables = self.tables.lock().unwrap();
        tables.events.iter().filter(|e| e.issue_id == issue_id).cloned().collect()
    }
}

#[async_trait]
impl IssueStore for InMemoryIssueStore {
    async fn get_issue(&self, id: &str) -> IssueStoreResult<Issue> {
        let tables = self.tables.lock().unwrap();
        tables
            .issues
            .get(id)
            .cloned()
            .ok_or_else(|| IssueStoreError::NotFound(id.to_string()))
    }

    async fn create_issue(&self, issue: Issue) -> IssueStoreResult<Issue> {
        let mut tables = self.tables.lock().unwrap();
        tables.issues.insert(issue.id.clone(), issue.clone());
        Ok(issue)
    }

    async fn update_issue(&self, issue: Issue) -> IssueStoreResult<Issue> {
        let mut tables = self.tables.lock().unwrap();
        if !tables.issues.contains_key(&issue.id) {
            return Err(IssueStoreError::NotFound(issue.id));
        }
        tables.issues.insert(issue.id.clone(), issue.clone());
        Ok(issue)
    }

    async fn add_dependency(&self, dep: Dependency) -> IssueStoreResult<()> {
        let mut tables = self.tables.lock().unwrap();
        if let Some(cycle) = detect_cycle_from(
            &{
                let mut all = tables.dependencies.clone();
                all.push(dep.clone());
                all
            },
            &dep.issue_id,
        ) {
            return Err(IssueStoreError::CycleDetected(cycle.join(" -> ")));
        }
        tables.dependencies.push(dep);
        Ok(())
    }

    async fn list_dependencies(&self, issue_id: &str) -> IssueStoreResult<Vec<Dependency>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .dependencies
            .iter()
            .filter(|d| d.issue_id == issue_id)
            .cloned()
            .collect())
    }

    async fn add_label(&self, issue_id: &str, label: &str) -> IssueStoreResult<()> {
        let mut tables = self.tables.lock().unwrap();
        let issue = tables
            .issues
            .get_mut(issue_id)
            .ok_or_else(|| IssueStoreError::NotFound(issue_id.to_string()))?;
        if !issue.labels.iter().any(|l| l == label) {
            issue.labels.push(label.to_string());
        }
        Ok(())
    }

    async fn add_event(&self, event: IssueEvent) -> IssueStoreResult<()> {
        let mut tables = self.tables.lock().unwrap();
        tables.events.push(event);
        Ok(())
    }

    async fn get_ready_work(&self, filter: ReadyWorkFilter) -> IssueStoreResult<Vec<Issue>> {
        let tables = self.tables.lock().unwrap();
        let mut ready: Vec<Issue> = tables
            .issues
            .values()
            .filter(|issue| issue.status == IssueStatus::Open)
            .filter(|issue| {
                !tables.dependencies.iter().any(|d| {
                    d.issue_id == issue.id
                        && d.kind == super::DependencyKind::Blocks
                        && tables
                            .issues
                            .get(&d.depends_on_id)
                            .map(|dep_issue| dep_issue.status != IssueStatus::Closed)
                            .unwrap_or(false)
                })
            })
            .filter(|issue| filter.kind.map(|k| k == issue.kind).unwrap_or(true))
            .filter(|issue| {
                filter
                    .label
                    .as_ref()
                    .map(|l| issue.labels.iter().any(|il| il == l))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();

        ready.sort_by_key(|i| i.priority);
        if let Some(limit) = filter.limit {
            ready.truncate(limit);
        }
        Ok(ready)
    }

    async fn claim_issue(&self, issue_id: &str, worker_id: &str) -> IssueStoreResult<ClaimOutcome> {
        let mut tables = self.tables.lock().unwrap();
        if tables.execution_states.contains_key(issue_id) {
            return Err(IssueStoreError::AlreadyClaimed(issue_id.to_string()));
        }
        let mut issue = tables
            .issues
            .get(issue_id)
            .cloned()
            .ok_or_else(|| IssueStoreError::NotFound(issue_id.to_string()))?;
        issue.status = IssueStatus::InProgress;
        issue.updated_at = Utc::now();
        tables.issues.insert(issue.id.clone(), issue.clone());

        let state = ExecutionState::new(issue_id, worker_id, Utc::now());
        tables
            .execution_states
            .insert(issue_id.to_string(), state.clone());

        Ok(ClaimOutcome {
            issue,
            execution_state: state,
        })
    }

    async fn release_issue(&self, issue_id: &str, opts: ReleaseOptions) -> IssueStoreResult<()> {
        let mut tables = self.tables.lock().unwrap();
        tables
            .execution_states
            .remove(issue_id)
            .ok_or_else(|| IssueStoreError::NoActiveExecution(issue_id.to_string()))?;

        if let Some(issue) = tables.issues.get_mut(issue_id) {
            if opts.reopen {
                issue.status = IssueStatus::Open;
            }
            for label in &opts.add_labels {
                if !issue.labels.iter().any(|l| l == label) {
                    issue.labels.push(label.clone());
                }
            }
            issue.updated_at = Utc::now();
        }

        if let Some(comment) = opts.comment {
            tables.events.push(IssueEvent {
                issue_id: issue_id.to_string(),
                actor: "system".to_string(),
                body: comment,
                at: Utc::now(),
            });
        }

        Ok(())
    }

    async fn get_execution_state(&self, issue_id: &str) -> IssueStoreResult<Option<ExecutionState>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.execution_states.get(issue_id).cloned())
    }

    async fn update_execution_state(&self, state: ExecutionState) -> IssueStoreResult<()> {
        let mut tables = self.tables.lock().unwrap();
        tables.execution_states.insert(state.issue_id.clone(), state);
        Ok(())
    }

    async fn get_checkpoint(&self, issue_id: &str) -> IssueStoreResult<Option<Checkpoint>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.checkpoints.get(issue_id).cloned())
    }

    async fn save_checkpoint(&self, checkpoint: Checkpoint) -> IssueStoreResult<()> {
        let mut tables = self.tables.lock().unwrap();
        tables
            .checkpoints
            .insert(checkpoint.issue_id.clone(), checkpoint);
        Ok(())
    }

    async fn register_worker(&self, instance: WorkerInstance) -> IssueStoreResult<()> {
        let mut tables = self.tables.lock().unwrap();
        tables.workers.insert(instance.worker_id.clone(), instance);
        Ok(())
    }

    async fn heartbeat_worker(
        &self,
        worker_id: &str,
        at: chrono::DateTime<chrono::Utc>,
    ) -> IssueStoreResult<()> {
        let mut tables = self.tables.lock().unwrap();
        let worker = tables
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| IssueStoreError::NotFound(worker_id.to_string()))?;
        worker.last_heartbeat_at = at;
        Ok(())
    }

    async fn list_active_workers(&self) -> IssueStoreResult<Vec<WorkerInstance>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .workers
            .values()
            .filter(|w| w.status == WorkerStatus::Running)
            .cloned()
            .collect())
    }

    async fn cleanup_stale_workers(
        &self,
        older_than: chrono::Duration,
    ) -> IssueStoreResult<Vec<WorkerInstance>> {
        let mut tables = self.tables.lock().unwrap();
        let now = Utc::now();
        let mut reaped = Vec::new();
        for worker in tables.workers.values_mut() {
            if worker.status == WorkerStatus::Running
                && now.signed_duration_since(worker.last_heartbeat_at) > older_than
            {
                worker.status = WorkerStatus::Stopped;
                reaped.push(worker.clone());
            }
        }
        let reaped_ids: Vec<String> = reaped.iter().map(|w| w.worker_id.clone()).collect();
        tables.execution_states.retain(|_, state| {
            !reaped_ids.contains(&state.worker_id)
        });
        Ok(reaped)
    }

    async fn delete_old_stopped_workers(&self, older_than: chrono::Duration) -> IssueStoreResult<usize> {
        let mut tables = self.tables.lock().unwrap();
        let now = Utc::now();
        let before = tables.workers.len();
        tables.workers.retain(|_, w| {
            !(w.status == WorkerStatus::Stopped
                && now.signed_duration_since(w.last_heartbeat_at) > older_than)
        });
        Ok(before - tables.workers.len())
    }

    async fn detect_cycles(&self, issue_id: &str) -> IssueStoreResult<Option<Vec<String>>> {
        let tables = self.tables.lock().unwrap();
        Ok(detect_cycle_from(&tables.dependencies, issue_id))
    }

    async fn find_open_escalation(
        &self,
        affected_issue_label: &str,
        anomaly_type_label: &str,
    ) -> IssueStoreResult<Option<Issue>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .issues
            .values()
            .find(|issue| {
                issue.status != IssueStatus::Closed
                    && issue.labels.iter().any(|l| l == "watchdog-escalation")
                    && issue.labels.iter().any(|l| l == affected_issue_label)
                    && issue.labels.iter().any(|l| l == anomaly_type_label)
            })
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue_store::{IssueKind};
    use proptest::prelude::*;

    fn sample_issue(id: &str) -> Issue {
        let now = Utc::now();
        Issue {
            id: id.to_string(),
            title: format!("issue {id}"),
            description: String::new(),
            status: IssueStatus::Open,
            priority: 1,
            kind: IssueKind::Task,
            labels: vec![],
            acceptance_criteria: None,
            created_at: now,
            updated_at: now,
            discovered: false,
        }
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let store = InMemoryIssueStore::new();
        store.create_issue(sample_issue("a")).await.unwrap();

        store.claim_issue("a", "worker-1").await.unwrap();
        let second = store.claim_issue("a", "worker-2").await;
        assert!(matches!(second, Err(IssueStoreError::AlreadyClaimed(_))));
    }

    #[tokio::test]
    async fn release_reopens_on_request() {
        let store = InMemoryIssueStore::new();
        store.create_issue(sample_issue("a")).await.unwrap();
        store.claim_issue("a", "worker-1").await.unwrap();

        store
            .release_issue(
                "a",
                ReleaseOptions {
                    reopen: true,
                    comment: Some("watchdog killed agent".into()),
                    add_labels: vec!["needs-approval".into()],
                },
            )
            .await
            .unwrap();

        let issue = store.get_issue("a").await.unwrap();
        assert_eq!(issue.status, IssueStatus::Open);
        assert!(issue.labels.contains(&"needs-approval".to_string()));
        assert!(store.get_execution_state("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ready_work_excludes_blocked_issues() {
        let store = InMemoryIssueStore::new();
        store.create_issue(sample_issue("a")).await.unwrap();
        store.create_issue(sample_issue("b")).await.unwrap();
        store
            .add_dependency(Dependency {
                issue_id: "a".into(),
                depends_on_id: "b".into(),
                kind: super::super::DependencyKind::Blocks,
            })
            .await
            .unwrap();

        let ready = store.get_ready_work(ReadyWorkFilter::default()).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, "b");
    }

    #[tokio::test]
    async fn adding_a_cyclic_dependency_is_rejected() {
        let store = InMemoryIssueStore::new();
        store.create_issue(sample_issue("a")).await.unwrap();
        store.create_issue(sample_issue("b")).await.unwrap();
        store
            .add_dependency(Dependency {
                issue_id: "a".into(),
                depends_on_id: "b".into(),
                kind: super::super::DependencyKind::Blocks,
            })
            .await
            .unwrap();

        let result = store
            .add_dependency(Dependency {
                issue_id: "b".into(),
                depends_on_id: "a".into(),
                kind: super::super::DependencyKind::Blocks,
            })
            .await;
        assert!(matches!(result, Err(IssueStoreError::CycleDetected(_))));
    }

    proptest::proptest! {
        /// Property 1: however many workers race to claim the same issue,
        /// and in whatever order, exactly one claim succeeds.
        #[test]
        fn exactly_one_worker_claims_a_contested_issue(
            worker_ids in proptest::collection::vec("[a-z]{3,8}", 2..8)
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let store = InMemoryIssueStore::new();
                store.create_issue(sample_issue("contested")).await.unwrap();

                let mut successes = 0;
                for worker_id in &worker_ids {
                    if store.claim_issue("contested", worker_id).await.is_ok() {
                        successes += 1;
                    }
                }
                prop_assert_eq!(successes, 1);
                Ok(())
            })?;
        }
    }
}
