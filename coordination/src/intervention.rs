//! Intervention controller: turns an [`AnomalyReport`] into cancellation,
//! escalation bookkeeping and execution-state mutation.
//!
//! The single `tokio::sync::Mutex` here protects only the cancel handle and
//! the in-memory history, mirroring the donor's discipline of never holding
//! a lock across store I/O: every method captures what it needs under the
//! lock, releases it, then talks to the [`IssueStore`].

use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::anomaly::{AnomalyReport, AnomalySeverity, AnomalyType, RecommendedAction};
use crate::issue_store::{
    Issue, IssueEvent, IssueKind, IssueStatus, IssueStore, IssueStoreError,
};

#[derive(Debug, Error)]
pub enum InterventionError {
    #[error("issue store error: {0}")]
    Store(#[from] IssueStoreError),
}

const HISTORY_CAPACITY: usize = 200;

#[derive(Debug, Clone)]
pub struct InterventionRecord {
    pub issue_id: String,
    pub action: RecommendedAction,
    pub anomaly_type: Option<AnomalyType>,
    pub severity: Option<AnomalySeverity>,
    pub at: chrono::DateTime<Utc>,
}

struct AgentHandle {
    issue_id: String,
    cancel: CancellationToken,
}

/// Dispatches anomaly reports to agent cancellation and escalation
/// bookkeeping. One instance per worker, shared between the watchdog loop
/// and the executor loop via `Arc`.
pub struct InterventionController {
    store: Arc<dyn IssueStore>,
    worker_id: String,
    agent: tokio::sync::Mutex<Option<AgentHandle>>,
    history: tokio::sync::Mutex<VecDeque<InterventionRecord>>,
}

fn severity_priority(severity: AnomalySeverity) -> u8 {
    match severity {
        AnomalySeverity::Critical => 0,
        AnomalySeverity::High => 1,
        AnomalySeverity::Medium => 2,
        AnomalySeverity::Low => 3,
    }
}

fn anomaly_type_label(t: AnomalyType) -> &'static str {
    match t {
        AnomalyType::InfiniteLoop => "anomaly:infinite_loop",
        AnomalyType::Thrashing => "anomaly:thrashing",
        AnomalyType::StuckState => "anomaly:stuck_state",
        AnomalyType::Regression => "anomaly:regression",
        AnomalyType::ResourceSpike => "anomaly:resource_spike",
        AnomalyType::ContextExhaustion => "anomaly:context_exhaustion",
        AnomalyType::Other => "anomaly:other",
    }
}

impl InterventionController {
    pub fn new(store: Arc<dyn IssueStore>, worker_id: impl Into<String>) -> Self {
        Self {
            store,
            worker_id: worker_id.into(),
            agent: tokio::sync::Mutex::new(None),
            history: tokio::sync::Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
        }
    }

    pub async fn set_agent(&self, issue_id: &str, cancel: CancellationToken) {
        let mut guard = self.agent.lock().await;
        *guard = Some(AgentHandle {
            issue_id: issue_id.to_string(),
            cancel,
        });
    }

    pub async fn clear_agent(&self) {
        let mut guard = self.agent.lock().await;
        *guard = None;
    }

    async fn cancel_current_agent(&self, expected_issue_id: &str) {
        let guard = self.agent.lock().await;
        if let Some(handle) = guard.as_ref() {
            if handle.issue_id == expected_issue_id {
                handle.cancel.cancel();
            }
        }
    }

    async fn push_history(&self, record: InterventionRecord) {
        let mut history = self.history.lock().await;
        if history.len() == HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(record);
    }

    pub async fn history(&self) -> Vec<InterventionRecord> {
        self.history.lock().await.iter().cloned().collect()
    }

    /// Dispatch `report` for `issue_id`. No-op (besides history) if the
    /// report claims no anomaly was detected.
    pub async fn intervene(&self, issue_id: &str, report: &AnomalyReport) -> Result<(), InterventionError> {
        if !report.detected {
            return Ok(());
        }
        let Some(action) = report.recommended_action else {
            return Ok(());
        };

        let cancels_agent = matches!(
            action,
            RecommendedAction::StopExecution
                | RecommendedAction::RestartAgent
                | RecommendedAction::MarkAsBlocked
                | RecommendedAction::Checkpoint
        );
        if cancels_agent {
            self.cancel_current_agent(issue_id).await;
        }

        let raises_escalation = matches!(
            action,
            RecommendedAction::StopExecution
                | RecommendedAction::RestartAgent
                | RecommendedAction::MarkAsBlocked
                | RecommendedAction::NotifyHuman
                | RecommendedAction::Investigate
                | RecommendedAction::Monitor
                | RecommendedAction::Checkpoint
        );
        if raises_escalation {
            self.raise_or_update_escalation(issue_id, report).await?;
        }

        if matches!(action, RecommendedAction::MarkAsBlocked) {
            if let Ok(mut parent) = self.store.get_issue(issue_id).await {
                parent.status = IssueStatus::Blocked;
                parent.updated_at = Utc::now();
                self.store.update_issue(parent).await?;
            }
            let _ = self.store.add_label(issue_id, "escalated").await;
        }

        let comment = format!(
            "watchdog intervention: action={action:?} type={:?} severity={:?} confidence={:.2}\n{}",
            report.anomaly_type, report.severity, report.confidence, report.description
        );
        let _ = self
            .store
            .add_event(IssueEvent {
                issue_id: issue_id.to_string(),
                actor: format!("watchdog-{}", self.worker_id),
                body: comment,
                at: Utc::now(),
            })
            .await;

        if let Ok(Some(mut state)) = self.store.get_execution_state(issue_id).await {
            state.record_intervention(Utc::now());
            let _ = self.store.update_execution_state(state).await;
        }

        self.push_history(InterventionRecord {
            issue_id: issue_id.to_string(),
            action,
            anomaly_type: report.anomaly_type,
            severity: report.severity,
            at: Utc::now(),
        })
        .await;

        Ok(())
    }

    async fn raise_or_update_escalation(
        &self,
        issue_id: &str,
        report: &AnomalyReport,
    ) -> Result<(), InterventionError> {
        let affected_label = format!("affected-issue:{issue_id}");
        let anomaly_label = anomaly_type_label(report.anomaly_type.unwrap_or(AnomalyType::Other));
        let severity = report.severity.unwrap_or(AnomalySeverity::Low);

        if let Some(mut existing) = self
            .store
            .find_open_escalation(&affected_label, anomaly_label)
            .await?
        {
            existing.description.push_str(&format!(
                "\n\n[{}] {}",
                Utc::now().to_rfc3339(),
                report.description
            ));
            let existing_priority = existing.priority;
            let candidate_priority = priority_from_severity(severity);
            existing.priority = existing_priority.min(candidate_priority);
            existing.updated_at = Utc::now();
            self.store.update_issue(existing.clone()).await?;
            self.store
                .add_event(IssueEvent {
                    issue_id: existing.id.clone(),
                    actor: format!("watchdog-{}", self.worker_id),
                    body: format!("new detection: {}", report.description),
                    at: Utc::now(),
                })
                .await?;
            return Ok(());
        }

        let now = Utc::now();
        let escalation = Issue {
            id: uuid::Uuid::new_v4().to_string(),
            title: format!("Watchdog escalation: {anomaly_label} on {issue_id}"),
            description: report.description.clone(),
            status: IssueStatus::Open,
            priority: priority_from_severity(severity),
            kind: IssueKind::Task,
            labels: vec![
                "watchdog-escalation".to_string(),
                affected_label,
                anomaly_label.to_string(),
            ],
            acceptance_criteria: None,
            created_at: now,
            updated_at: now,
            discovered: true,
        };
        self.store.create_issue(escalation).await?;
        Ok(())
    }
}

fn priority_from_severity(severity: AnomalySeverity) -> u8 {
    severity_priority(severity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue_store::memory::InMemoryIssueStore;

    fn sample_issue(id: &str) -> Issue {
        let now = Utc::now();
        Issue {
            id: id.to_string(),
            title: "t".into(),
            description: "d".into(),
            status: IssueStatus::Open,
            priority: 2,
            kind: IssueKind::Task,
            labels: vec![],
            acceptance_criteria: None,
            created_at: now,
            updated_at: now,
            discovered: false,
        }
    }

    async fn store_with_claimed_issue() -> (Arc<dyn IssueStore>, String) {
        let store: Arc<dyn IssueStore> = Arc::new(InMemoryIssueStore::new());
        let id = uuid::Uuid::new_v4().to_string();
        let issue = store.create_issue(sample_issue(&id)).await.unwrap();
        store.claim_issue(&issue.id, "worker-1").await.unwrap();
        (store, issue.id)
    }

    fn detected(action: RecommendedAction) -> AnomalyReport {
        AnomalyReport {
            detected: true,
            anomaly_type: Some(AnomalyType::StuckState),
            severity: Some(AnomalySeverity::High),
            recommended_action: Some(action),
            confidence: 0.9,
            description: "no progress for 5 minutes".into(),
            reasoning: "...".into(),
            affected_issues: vec![],
            metrics: None,
        }
    }

    #[tokio::test]
    async fn no_anomaly_is_a_no_op() {
        let (store, issue_id) = store_with_claimed_issue().await;
        let controller = InterventionController::new(store, "worker-1");
        controller.intervene(&issue_id, &AnomalyReport::none()).await.unwrap();
        assert!(controller.history().await.is_empty());
    }

    #[tokio::test]
    async fn stop_execution_cancels_agent_and_raises_escalation() {
        let (store, issue_id) = store_with_claimed_issue().await;
        let controller = InterventionController::new(store.clone(), "worker-1");
        let token = CancellationToken::new();
        controller.set_agent(&issue_id, token.clone()).await;

        controller
            .intervene(&issue_id, &detected(RecommendedAction::StopExecution))
            .await
            .unwrap();

        assert!(token.is_cancelled());
        assert_eq!(controller.history().await.len(), 1);

        let escalation = store
            .find_open_escalation(&format!("affected-issue:{issue_id}"), "anomaly:stuck_state")
            .await
            .unwrap();
        assert!(escalation.is_some());
    }

    #[tokio::test]
    async fn repeated_detection_updates_existing_escalation_instead_of_duplicating() {
        let (store, issue_id) = store_with_claimed_issue().await;
        let controller = InterventionController::new(store.clone(), "worker-1");

        controller
            .intervene(&issue_id, &detected(RecommendedAction::NotifyHuman))
            .await
            .unwrap();
        controller
            .intervene(&issue_id, &detected(RecommendedAction::NotifyHuman))
            .await
            .unwrap();

        let escalation = store
            .find_open_escalation(&format!("affected-issue:{issue_id}"), "anomaly:stuck_state")
            .await
            .unwrap()
            .unwrap();
        assert!(escalation.description.contains("no progress for 5 minutes"));
    }

    #[tokio::test]
    async fn mark_as_blocked_sets_blocked_status_and_escalated_label() {
        let (store, issue_id) = store_with_claimed_issue().await;
        let controller = InterventionController::new(store.clone(), "worker-1");

        controller
            .intervene(&issue_id, &detected(RecommendedAction::MarkAsBlocked))
            .await
            .unwrap();

        let issue = store.get_issue(&issue_id).await.unwrap();
        assert_eq!(issue.status, IssueStatus::Blocked);
        assert!(issue.labels.iter().any(|l| l == "escalated"));
    }

    #[tokio::test]
    async fn checkpoint_cancels_agent_and_raises_escalation() {
        let (store, issue_id) = store_with_claimed_issue().await;
        let controller = InterventionController::new(store.clone(), "worker-1");
        let token = CancellationToken::new();
        controller.set_agent(&issue_id, token.clone()).await;

        controller
            .intervene(&issue_id, &detected(RecommendedAction::Checkpoint))
            .await
            .unwrap();

        assert!(token.is_cancelled());
        let escalation = store
            .find_open_escalation(&format!("affected-issue:{issue_id}"), "anomaly:stuck_state")
            .await
            .unwrap();
        assert!(escalation.is_some());
    }

    #[tokio::test]
    async fn backoff_does_not_cancel_or_escalate() {
        let (store, issue_id) = store_with_claimed_issue().await;
        let controller = InterventionController::new(store.clone(), "worker-1");
        let token = CancellationToken::new();
        controller.set_agent(&issue_id, token.clone()).await;

        controller
            .intervene(&issue_id, &detected(RecommendedAction::Backoff))
            .await
            .unwrap();

        assert!(!token.is_cancelled());
        let escalation = store
            .find_open_escalation(&format!("affected-issue:{issue_id}"), "anomaly:stuck_state")
            .await
            .unwrap();
        assert!(escalation.is_none());
    }
}
