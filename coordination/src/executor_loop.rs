//! Executor Loop: claims ready work, wires the telemetry/watchdog/gate/
//! approval machinery around a single agent invocation, and releases the
//! execution state on every exit path.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::ai_client::{AiClient, AiClientError};
use crate::anomaly::AnomalyAnalyzer;
use crate::approval::{ApprovalError, ApprovalGate};
use crate::context_usage::ContextUsageDetector;
use crate::gates::recovery::{self, RecoveryError};
use crate::intervention::{InterventionController, InterventionError};
use crate::issue_store::{
    ExecutionPhase, Issue, IssueStatus, IssueStore, IssueStoreError, ReadyWorkFilter, ReleaseOptions,
};
use crate::telemetry::TelemetryMonitor;
use crate::verifier::pipeline::{Verifier, VerifierConfig};
use crate::watchdog::{Watchdog, WatchdogConfig};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("issue store error: {0}")]
    Store(#[from] IssueStoreError),

    #[error("intervention error: {0}")]
    Intervention(#[from] InterventionError),

    #[error("recovery error: {0}")]
    Recovery(#[from] RecoveryError),

    #[error("approval error: {0}")]
    Approval(#[from] ApprovalError),

    #[error("AI client error: {0}")]
    AiClient(#[from] AiClientError),

    #[error("sandbox error: {0}")]
    Sandbox(String),

    #[error("agent error: {0}")]
    Agent(String),
}

/// Provisions an isolated working tree per issue. Implemented outside this
/// crate (`crates/executor::sandbox::WorktreeSandbox`); this trait is the
/// boundary the executor loop depends on.
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn create(&self, issue_id: &str) -> Result<PathBuf, ExecutorError>;
    async fn merge_and_remove(&self, issue_id: &str) -> Result<(), ExecutorError>;
    async fn discard(&self, issue_id: &str) -> Result<(), ExecutorError>;
}

/// Invokes the external AI coding agent inside a sandbox working tree,
/// streaming its output line-by-line to `on_output`. Implemented outside
/// this crate (`crates/executor::ai_agent`); this trait is the boundary.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(
        &self,
        issue: &Issue,
        workdir: &Path,
        on_output: &(dyn for<'a> Fn(&'a str) + Send + Sync),
        cancel: CancellationToken,
    ) -> Result<bool, ExecutorError>;
}

/// Wraps a shared `Arc<C>` so a fresh [`AnomalyAnalyzer`] can be built per
/// issue execution without requiring `C: Clone`.
struct SharedAiClient<C>(Arc<C>);

impl<C> Clone for SharedAiClient<C> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

#[async_trait]
impl<C: AiClient> AiClient for SharedAiClient<C> {
    async fn complete(&self, prompt: &str) -> Result<String, AiClientError> {
        self.0.complete(prompt).await
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorLoopConfig {
    pub worker_id: String,
    /// Identifies which external AI coding agent is driving execution, used
    /// to tag context-usage events (e.g. `"claude-code"`, `"aider"`).
    pub agent_name: String,
    pub watchdog_config: WatchdogConfig,
    pub verifier_config: VerifierConfig,
    pub merge_base_branch: String,
    /// How long to sleep before re-polling ready work when the queue is empty.
    pub idle_poll_interval: Duration,
}

impl Default for ExecutorLoopConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker-1".to_string(),
            agent_name: "coding-agent".to_string(),
            watchdog_config: WatchdogConfig::default(),
            verifier_config: VerifierConfig::default(),
            merge_base_branch: "main".to_string(),
            idle_poll_interval: Duration::from_secs(10),
        }
    }
}

/// RAII guard that releases an issue's execution state unless it was
/// already released on the happy path. Mirrors [`crate::worker_registry::ProjectLock`]'s
/// idempotent-`Drop` idiom: an `Option` sentinel stands in for the `released`
/// flag, and `Drop` falls back to a best-effort detached release since the
/// store API is async but `Drop` is not.
struct ReleaseGuard {
    store: Arc<dyn IssueStore>,
    issue_id: String,
    pending: Option<ReleaseOptions>,
}

impl ReleaseGuard {
    fn new(store: Arc<dyn IssueStore>, issue_id: String) -> Self {
        Self {
            store,
            issue_id,
            pending: Some(ReleaseOptions {
                reopen: true,
                comment: Some("released: executor exited without an explicit release".to_string()),
                add_labels: vec![],
            }),
        }
    }

    async fn release(&mut self, opts: ReleaseOptions) -> Result<(), ExecutorError> {
        if self.pending.take().is_none() {
            return Ok(());
        }
        self.store.release_issue(&self.issue_id, opts).await?;
        Ok(())
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        let Some(opts) = self.pending.take() else {
            return;
        };
        let store = self.store.clone();
        let issue_id = self.issue_id.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = store.release_issue(&issue_id, opts).await {
                    tracing::error!(target: "executor", issue_id = %issue_id, error = %e, "failed to release issue on drop");
                }
            });
        }
    }
}

/// One iteration's outcome, surfaced mainly for tests and CLI logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationOutcome {
    NoReadyWork,
    ClaimLost,
    Completed { issue_id: String, merged: bool },
    Blocked { issue_id: String },
}

pub struct ExecutorLoop<C: AiClient> {
    store: Arc<dyn IssueStore>,
    ai_client: Arc<C>,
    sandbox: Arc<dyn Sandbox>,
    agent: Arc<dyn AgentRunner>,
    telemetry: Arc<TelemetryMonitor>,
    context_detector: Arc<ContextUsageDetector>,
    intervention: Arc<InterventionController>,
    approval: ApprovalGate,
    config: ExecutorLoopConfig,
    paused: AtomicBool,
}

impl<C: AiClient + 'static> ExecutorLoop<C> {
    pub fn new(
        store: Arc<dyn IssueStore>,
        ai_client: Arc<C>,
        sandbox: Arc<dyn Sandbox>,
        agent: Arc<dyn AgentRunner>,
        approval: ApprovalGate,
        config: ExecutorLoopConfig,
    ) -> Self {
        let intervention = Arc::new(InterventionController::new(store.clone(), config.worker_id.clone()));
        let context_detector = Arc::new(ContextUsageDetector::with_store(store.clone()));
        Self {
            store,
            ai_client,
            sandbox,
            agent,
            telemetry: Arc::new(TelemetryMonitor::default()),
            context_detector,
            intervention,
            approval,
            config,
            paused: AtomicBool::new(false),
        }
    }

    /// Paused between issue claims, polled at the top of each iteration.
    /// Mid-agent-invocation pausing isn't modeled separately since the
    /// agent invocation is already cancellable and a mid-flight pause is
    /// indistinguishable from a cancel-and-requeue.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Run iterations until `cancellation` fires.
    pub async fn run(&self, cancellation: &CancellationToken) {
        loop {
            if cancellation.is_cancelled() {
                return;
            }
            if self.is_paused() {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.idle_poll_interval) => continue,
                    _ = cancellation.cancelled() => return,
                }
            }

            match self.run_once(cancellation).await {
                Ok(IterationOutcome::NoReadyWork) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.idle_poll_interval) => {}
                        _ = cancellation.cancelled() => return,
                    }
                }
                Ok(outcome) => {
                    tracing::info!(target: "executor", ?outcome, "iteration complete");
                }
                Err(e) => {
                    tracing::error!(target: "executor", error = %e, "iteration failed");
                }
            }
        }
    }

    /// Step 1-2: pick the highest-priority ready issue and atomically claim it.
    async fn claim_next(&self) -> Result<Option<Issue>, ExecutorError> {
        let mut ready = self.store.get_ready_work(ReadyWorkFilter::default()).await?;
        ready.sort_by_key(|i| i.priority);
        let Some(candidate) = ready.into_iter().next() else {
            return Ok(None);
        };

        match self.store.claim_issue(&candidate.id, &self.config.worker_id).await {
            Ok(outcome) => Ok(Some(outcome.issue)),
            Err(IssueStoreError::AlreadyClaimed(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Run exactly one claim → dispatch → supervise → gate → approve →
    /// release cycle.
    pub async fn run_once(&self, cancellation: &CancellationToken) -> Result<IterationOutcome, ExecutorError> {
        let Some(issue) = self.claim_next().await? else {
            return Ok(IterationOutcome::NoReadyWork);
        };

        let mut guard = ReleaseGuard::new(self.store.clone(), issue.id.clone());
        let outcome = self.drive_issue(&issue, cancellation).await;

        match &outcome {
            Ok(IterationOutcome::Completed { merged: true, .. }) => {
                guard
                    .release(ReleaseOptions {
                        reopen: false,
                        comment: Some("completed and merged".to_string()),
                        add_labels: vec![],
                    })
                    .await?;
            }
            Ok(_) => {
                guard
                    .release(ReleaseOptions {
                        reopen: false,
                        comment: Some("execution finished".to_string()),
                        add_labels: vec![],
                    })
                    .await?;
            }
            Err(e) => {
                guard
                    .release(ReleaseOptions {
                        reopen: true,
                        comment: Some(format!("execution error, requeued: {e}")),
                        add_labels: vec![],
                    })
                    .await?;
            }
        }

        outcome
    }

    async fn drive_issue(&self, issue: &Issue, cancellation: &CancellationToken) -> Result<IterationOutcome, ExecutorError> {
        self.telemetry.start(&issue.id, &self.config.worker_id);
        self.telemetry
            .record_state_transition(ExecutionPhase::Claimed, ExecutionPhase::Assessing);

        let workdir = self.sandbox.create(&issue.id).await?;

        let agent_cancel = cancellation.child_token();
        self.intervention.set_agent(&issue.id, agent_cancel.clone()).await;

        let analyzer = AnomalyAnalyzer::new(SharedAiClient(self.ai_client.clone()));
        let watchdog = Arc::new(Watchdog::new(
            self.config.watchdog_config.clone(),
            analyzer,
            self.context_detector.clone(),
            self.telemetry.clone(),
            self.intervention.clone(),
            issue.id.clone(),
        ));
        let watchdog_handle = crate::watchdog::spawn(watchdog.clone());

        self.telemetry
            .record_state_transition(ExecutionPhase::Assessing, ExecutionPhase::Executing);

        let context_detector = self.context_detector.clone();
        let telemetry = self.telemetry.clone();
        let issue_id = issue.id.clone();
        let worker_id = self.config.worker_id.clone();
        let agent_name = self.config.agent_name.clone();
        let on_output = move |line: &str| {
            telemetry.record_event("agent_output_line");
            let context_detector = context_detector.clone();
            let issue_id = issue_id.clone();
            let worker_id = worker_id.clone();
            let agent_name = agent_name.clone();
            let line = line.to_string();
            tokio::spawn(async move {
                context_detector.parse(&line, &issue_id, &worker_id, &agent_name).await;
            });
        };

        let agent_result = self.agent.run(issue, &workdir, &on_output, agent_cancel).await;
        self.intervention.clear_agent().await;
        watchdog_handle.stop().await;

        let agent_success = agent_result?;

        self.telemetry
            .record_state_transition(ExecutionPhase::Executing, ExecutionPhase::Analyzing);
        self.telemetry
            .record_state_transition(ExecutionPhase::Analyzing, ExecutionPhase::Gates);

        if !agent_success {
            self.telemetry.end(false, false);
            self.sandbox.discard(&issue.id).await?;
            self.mark_blocked(issue).await?;
            return Ok(IterationOutcome::Blocked { issue_id: issue.id.clone() });
        }

        let verifier = Verifier::new(&workdir, self.config.verifier_config.clone());
        let (report, recovery_outcome) =
            recovery::run_with_recovery(&verifier, self.ai_client.as_ref(), self.store.as_ref(), issue, None, cancellation)
                .await?;

        for gate in &report.gates {
            self.telemetry.record_gate_result(
                &gate.gate,
                gate.outcome.is_passed(),
                Duration::from_millis(gate.duration_ms),
                gate.stderr_excerpt.clone(),
            );
        }
        self.telemetry.end(report.all_green, report.all_green);

        if !report.all_green {
            self.sandbox.discard(&issue.id).await?;
            // The recovery strategist (or its deterministic fallback) has
            // already mutated the issue's status/labels as appropriate.
            let _ = recovery_outcome;
            return Ok(IterationOutcome::Blocked { issue_id: issue.id.clone() });
        }

        watchdog.reset_on_success().await;

        let approval = self.approval.run(issue, &report, &self.config.merge_base_branch)?;
        if approval.approved {
            self.sandbox.merge_and_remove(&issue.id).await?;
            let mut closed = self.store.get_issue(&issue.id).await?;
            closed.status = IssueStatus::Closed;
            closed.updated_at = chrono::Utc::now();
            self.store.update_issue(closed).await?;
            Ok(IterationOutcome::Completed { issue_id: issue.id.clone(), merged: true })
        } else {
            self.sandbox.discard(&issue.id).await?;
            self.mark_blocked(issue).await?;
            Ok(IterationOutcome::Blocked { issue_id: issue.id.clone() })
        }
    }

    async fn mark_blocked(&self, issue: &Issue) -> Result<(), ExecutorError> {
        let mut blocked = self.store.get_issue(&issue.id).await?;
        blocked.status = IssueStatus::Blocked;
        blocked.updated_at = chrono::Utc::now();
        self.store.update_issue(blocked).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai_client::MockAiClient;
    use crate::issue_store::memory::InMemoryIssueStore;
    use crate::issue_store::{IssueKind, IssueStatus as Status};

    struct FakeSandbox;
    #[async_trait]
    impl Sandbox for FakeSandbox {
        async fn create(&self, _issue_id: &str) -> Result<PathBuf, ExecutorError> {
            Ok(PathBuf::from("/tmp/fake-sandbox"))
        }
        async fn merge_and_remove(&self, _issue_id: &str) -> Result<(), ExecutorError> {
            Ok(())
        }
        async fn discard(&self, _issue_id: &str) -> Result<(), ExecutorError> {
            Ok(())
        }
    }

    struct FakeAgent {
        succeeds: bool,
    }
    #[async_trait]
    impl AgentRunner for FakeAgent {
        async fn run(
            &self,
            _issue: &Issue,
            _workdir: &Path,
            on_output: &(dyn for<'a> Fn(&'a str) + Send + Sync),
            _cancel: CancellationToken,
        ) -> Result<bool, ExecutorError> {
            on_output("doing work");
            Ok(self.succeeds)
        }
    }

    fn sample_issue(id: &str) -> Issue {
        let now = chrono::Utc::now();
        Issue {
            id: id.to_string(),
            title: "t".into(),
            description: "d".into(),
            status: Status::Open,
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
    async fn no_ready_work_is_reported_without_claiming() {
        let store: Arc<dyn IssueStore> = Arc::new(InMemoryIssueStore::new());
        let ai = Arc::new(MockAiClient::new(vec![]));
        let approval = ApprovalGate::new(crate::harness::GitManager::new(".", "[checkpoint]"));

        let exec = ExecutorLoop::new(
            store,
            ai,
            Arc::new(FakeSandbox),
            Arc::new(FakeAgent { succeeds: true }),
            approval,
            ExecutorLoopConfig::default(),
        );

        let cancellation = CancellationToken::new();
        let outcome = exec.run_once(&cancellation).await.unwrap();
        assert_eq!(outcome, IterationOutcome::NoReadyWork);
    }

    #[test]
    fn pause_and_resume_toggle_flag() {
        let store: Arc<dyn IssueStore> = Arc::new(InMemoryIssueStore::new());
        let ai = Arc::new(MockAiClient::new(vec![]));
        let approval = ApprovalGate::new(crate::harness::GitManager::new(".", "[checkpoint]"));
        let exec = ExecutorLoop::new(
            store,
            ai,
            Arc::new(FakeSandbox),
            Arc::new(FakeAgent { succeeds: true }),
            approval,
            ExecutorLoopConfig::default(),
        );
        assert!(!exec.is_paused());
        exec.pause();
        assert!(exec.is_paused());
        exec.resume();
        assert!(!exec.is_paused());
    }

    #[tokio::test]
    async fn failing_agent_blocks_and_requeues_for_discard() {
        let store: Arc<dyn IssueStore> = Arc::new(InMemoryIssueStore::new());
        store.create_issue(sample_issue("issue-1")).await.unwrap();
        let ai = Arc::new(MockAiClient::new(vec![]));
        let approval = ApprovalGate::new(crate::harness::GitManager::new(".", "[checkpoint]"));

        let exec = ExecutorLoop::new(
            store,
            ai,
            Arc::new(FakeSandbox),
            Arc::new(FakeAgent { succeeds: false }),
            approval,
            ExecutorLoopConfig::default(),
        );

        let cancellation = CancellationToken::new();
        let outcome = exec.run_once(&cancellation).await.unwrap();
        assert_eq!(outcome, IterationOutcome::Blocked { issue_id: "issue-1".to_string() });
    }
}
