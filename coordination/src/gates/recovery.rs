//! AI-driven recovery strategist layered on top of the deterministic
//! quality-gate pipeline, plus the progress-heartbeat wrapper the watchdog
//! and interactive callers rely on.

use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::ai_client::{AiClient, AiClientError};
use crate::issue_store::{
    Dependency, DependencyKind, Issue, IssueEvent, IssueKind, IssueStatus, IssueStore, IssueStoreError,
};
use crate::verifier::pipeline::{Verifier, VerifierConfig};
use crate::verifier::report::{GateOutcome, GateResult, VerifierReport};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const RECOVERY_TIMEOUT: Duration = Duration::from_secs(120);
const OUTPUT_TRUNCATION_CHARS: usize = 1000;

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("issue store error: {0}")]
    Store(#[from] IssueStoreError),

    #[error("AI client error: {0}")]
    Client(#[from] AiClientError),
}

/// Emitted on entering each gate and then every 30s while any gate runs.
#[derive(Debug, Clone)]
pub struct GateProgress {
    pub current_gate: String,
    pub gates_completed: usize,
    pub gates_total: usize,
    pub elapsed_secs: u64,
}

pub type ProgressCallback = Arc<dyn Fn(GateProgress) + Send + Sync>;

fn gates_total(config: &VerifierConfig) -> usize {
    [
        config.check_fmt,
        config.check_clippy,
        config.check_sg,
        config.check_compile,
        config.check_test,
        config.check_deny,
        config.check_doc,
    ]
    .into_iter()
    .filter(|enabled| *enabled)
    .count()
}

/// Run the pipeline, emitting a progress heartbeat every 30s until it
/// finishes or `cancellation` fires. Returns `None` if cancelled before the
/// pipeline produced a report.
pub async fn run_pipeline_with_heartbeat(
    verifier: &Verifier,
    progress: Option<ProgressCallback>,
    cancellation: &CancellationToken,
) -> Option<VerifierReport> {
    let start = Instant::now();
    let total = gates_total(verifier.config());
    if let Some(cb) = &progress {
        cb(GateProgress {
            current_gate: "starting".to_string(),
            gates_completed: 0,
            gates_total: total,
            elapsed_secs: 0,
        });
    }

    let pipeline_fut = verifier.run_pipeline();
    tokio::pin!(pipeline_fut);
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            report = &mut pipeline_fut => return Some(report),
            _ = heartbeat.tick() => {
                if let Some(cb) = &progress {
                    cb(GateProgress {
                        current_gate: "running".to_string(),
                        gates_completed: 0,
                        gates_total: total,
                        elapsed_secs: start.elapsed().as_secs(),
                    });
                }
            }
            _ = cancellation.cancelled() => return None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    FixInPlace,
    AcceptableFailure,
    SplitWork,
    Escalate,
    Retry,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RecoveryIssueDraft {
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RecoveryDecision {
    pub action: RecoveryAction,
    #[serde(default)]
    pub mark_blocked: bool,
    #[serde(default)]
    pub close_original: bool,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub issues: Vec<RecoveryIssueDraft>,
}

/// What actually happened after recovery ran: either the AI's decision was
/// applied, or the deterministic fallback kicked in.
#[derive(Debug, Clone)]
pub struct RecoveryOutcome {
    pub action: Option<RecoveryAction>,
    pub used_fallback: bool,
    pub created_issue_ids: Vec<String>,
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= OUTPUT_TRUNCATION_CHARS {
        text.to_string()
    } else {
        let truncated: String = text.chars().take(OUTPUT_TRUNCATION_CHARS).collect();
        format!("{truncated}... [truncated]")
    }
}

fn extract_json_block(text: &str) -> Option<&str> {
    if let Some(start) = text.find("```json") {
        let json_start = start + 7;
        if let Some(end) = text[json_start..].find("```") {
            return Some(text[json_start..json_start + end].trim());
        }
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn parse_decision(text: &str) -> Option<RecoveryDecision> {
    let candidate = extract_json_block(text).unwrap_or(text);
    static TRAILING_COMMA: std::sync::LazyLock<regex::Regex> =
        std::sync::LazyLock::new(|| regex::Regex::new(r",\s*([}\]])").unwrap());
    let cleaned = TRAILING_COMMA.replace_all(candidate, "$1");
    serde_json::from_str(&cleaned).ok()
}

fn gate_summary(failed_gates: &[&GateResult]) -> String {
    failed_gates
        .iter()
        .map(|g| {
            format!(
                "- {} (exit {:?}): {}",
                g.gate,
                g.exit_code,
                truncate(g.stderr_excerpt.as_deref().unwrap_or(""))
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn build_prompt(issue: &Issue, failed_gates: &[&GateResult]) -> String {
    format!(
        "The quality-gate pipeline failed for issue `{}` (\"{}\").\n\n\
         Failed gates:\n{}\n\n\
         Decide how to recover. Respond with ONLY a JSON object: \
         {{\"action\": \"fix_in_place\"|\"acceptable_failure\"|\"split_work\"|\"escalate\"|\"retry\", \
         \"mark_blocked\": bool, \"close_original\": bool, \"requires_approval\": bool, \
         \"comment\": string, \"issues\": [{{\"title\": string, \"body\": string}}]}}",
        issue.id,
        issue.title,
        gate_summary(failed_gates),
    )
}

/// Run the pipeline and, on any gate failure, consult an AI recovery
/// strategist (falling back to deterministic per-gate blockers on timeout,
/// client error, or an unparsable/unknown response).
pub async fn run_with_recovery<C: AiClient>(
    verifier: &Verifier,
    ai: &C,
    store: &dyn IssueStore,
    issue: &Issue,
    progress: Option<ProgressCallback>,
    cancellation: &CancellationToken,
) -> Result<(VerifierReport, Option<RecoveryOutcome>), RecoveryError> {
    let Some(report) = run_pipeline_with_heartbeat(verifier, progress, cancellation).await else {
        return Ok((VerifierReport::new(verifier.working_dir().display().to_string()), None));
    };

    if report.all_green {
        return Ok((report, None));
    }

    let failed_gates: Vec<&GateResult> = report
        .gates
        .iter()
        .filter(|g| g.outcome == GateOutcome::Failed)
        .collect();
    if failed_gates.is_empty() {
        return Ok((report, None));
    }

    let prompt = build_prompt(issue, &failed_gates);
    let decision = match tokio::time::timeout(RECOVERY_TIMEOUT, ai.complete(&prompt)).await {
        Ok(Ok(text)) => parse_decision(&text),
        Ok(Err(e)) => {
            tracing::warn!(target: "gates", error = %e, "recovery strategist call failed, using fallback");
            None
        }
        Err(_) => {
            tracing::warn!(target: "gates", "recovery strategist call timed out, using fallback");
            None
        }
    };

    let outcome = match decision {
        Some(decision) => apply_decision(store, issue, &decision).await?,
        None => {
            deterministic_fallback(store, issue, &failed_gates).await?
        }
    };

    Ok((report, Some(outcome)))
}

async fn apply_decision(
    store: &dyn IssueStore,
    issue: &Issue,
    decision: &RecoveryDecision,
) -> Result<RecoveryOutcome, RecoveryError> {
    let mut created_issue_ids = Vec::new();

    match decision.action {
        RecoveryAction::FixInPlace => {
            for draft in &decision.issues {
                let child = create_child_issue(store, issue, draft, "discovered:gate-failure").await?;
                store
                    .add_dependency(Dependency {
                        issue_id: issue.id.clone(),
                        depends_on_id: child.id.clone(),
                        kind: DependencyKind::Blocks,
                    })
                    .await?;
                created_issue_ids.push(child.id);
            }
            if decision.mark_blocked {
                set_status(store, issue, IssueStatus::Blocked).await?;
            }
        }
        RecoveryAction::AcceptableFailure => {
            for draft in &decision.issues {
                let child = create_child_issue(store, issue, draft, "discovered:pre-existing").await?;
                created_issue_ids.push(child.id);
            }
            add_comment(store, issue, &format!("acceptable failure: {}", decision.comment)).await?;
            if decision.close_original && !decision.requires_approval {
                set_status(store, issue, IssueStatus::Closed).await?;
            } else {
                store.add_label(&issue.id, "needs-approval").await?;
            }
        }
        RecoveryAction::SplitWork => {
            for draft in &decision.issues {
                let child = create_child_issue(store, issue, draft, "discovered:split-work").await?;
                store
                    .add_dependency(Dependency {
                        issue_id: child.id.clone(),
                        depends_on_id: issue.id.clone(),
                        kind: DependencyKind::DiscoveredFrom,
                    })
                    .await?;
                created_issue_ids.push(child.id);
            }
            if decision.close_original {
                set_status(store, issue, IssueStatus::Closed).await?;
            }
        }
        RecoveryAction::Escalate => {
            store.add_label(&issue.id, "escalated").await?;
            add_comment(store, issue, &decision.comment).await?;
            if decision.mark_blocked {
                set_status(store, issue, IssueStatus::Blocked).await?;
            }
        }
        RecoveryAction::Retry => {
            add_comment(store, issue, &decision.comment).await?;
        }
    }

    Ok(RecoveryOutcome {
        action: Some(decision.action),
        used_fallback: false,
        created_issue_ids,
    })
}

async fn deterministic_fallback(
    store: &dyn IssueStore,
    issue: &Issue,
    failed_gates: &[&GateResult],
) -> Result<RecoveryOutcome, RecoveryError> {
    let mut created_issue_ids = Vec::new();
    for gate in failed_gates {
        let draft = RecoveryIssueDraft {
            title: format!("Fix {} gate failure on {}", gate.gate, issue.id),
            body: truncate(gate.stderr_excerpt.as_deref().unwrap_or("(no output captured)")),
        };
        let child = create_child_issue(store, issue, &draft, "discovered:gate-failure").await?;
        store
            .add_dependency(Dependency {
                issue_id: issue.id.clone(),
                depends_on_id: child.id.clone(),
                kind: DependencyKind::Blocks,
            })
            .await?;
        created_issue_ids.push(child.id);
    }
    set_status(store, issue, IssueStatus::Blocked).await?;

    tracing::error!(
        target: "gates",
        issue_id = %issue.id,
        failed_gates = failed_gates.iter().map(|g| g.gate.as_str()).collect::<Vec<_>>().join(","),
        "recovery strategist unavailable, applied deterministic fallback"
    );

    Ok(RecoveryOutcome {
        action: None,
        used_fallback: true,
        created_issue_ids,
    })
}

async fn create_child_issue(
    store: &dyn IssueStore,
    parent: &Issue,
    draft: &RecoveryIssueDraft,
    provenance_label: &str,
) -> Result<Issue, RecoveryError> {
    let now = chrono::Utc::now();
    let child = Issue {
        id: uuid::Uuid::new_v4().to_string(),
        title: draft.title.clone(),
        description: draft.body.clone(),
        status: IssueStatus::Open,
        priority: parent.priority,
        kind: IssueKind::Bug,
        labels: vec![provenance_label.to_string()],
        acceptance_criteria: None,
        created_at: now,
        updated_at: now,
        discovered: true,
    };
    Ok(store.create_issue(child).await?)
}

async fn set_status(store: &dyn IssueStore, issue: &Issue, status: IssueStatus) -> Result<(), RecoveryError> {
    let mut updated = store.get_issue(&issue.id).await?;
    updated.status = status;
    updated.updated_at = chrono::Utc::now();
    store.update_issue(updated).await?;
    Ok(())
}

async fn add_comment(store: &dyn IssueStore, issue: &Issue, body: &str) -> Result<(), RecoveryError> {
    store
        .add_event(IssueEvent {
            issue_id: issue.id.clone(),
            actor: "gates".to_string(),
            body: truncate(body),
            at: chrono::Utc::now(),
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai_client::MockAiClient;
    use crate::issue_store::memory::InMemoryIssueStore;

    fn sample_issue(id: &str) -> Issue {
        let now = chrono::Utc::now();
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

    fn failed_gate(name: &str) -> GateResult {
        GateResult {
            started_at: chrono::Utc::now(),
            gate: name.to_string(),
            outcome: GateOutcome::Failed,
            duration_ms: 10,
            exit_code: Some(1),
            error_count: 1,
            warning_count: 0,
            errors: vec![],
            stderr_excerpt: Some("boom".to_string()),
        }
    }

    #[tokio::test]
    async fn fallback_creates_one_blocker_per_failed_gate_and_blocks_parent() {
        let store = InMemoryIssueStore::new();
        let issue = store.create_issue(sample_issue("parent")).await.unwrap();
        let gates = vec![failed_gate("build"), failed_gate("test")];
        let gate_refs: Vec<&GateResult> = gates.iter().collect();

        let outcome = deterministic_fallback(&store, &issue, &gate_refs).await.unwrap();

        assert!(outcome.used_fallback);
        assert_eq!(outcome.created_issue_ids.len(), 2);
        let parent = store.get_issue("parent").await.unwrap();
        assert_eq!(parent.status, IssueStatus::Blocked);
    }

    #[tokio::test]
    async fn escalate_decision_adds_label_and_comment() {
        let store = InMemoryIssueStore::new();
        let issue = store.create_issue(sample_issue("parent")).await.unwrap();

        let decision = RecoveryDecision {
            action: RecoveryAction::Escalate,
            mark_blocked: true,
            close_original: false,
            requires_approval: false,
            comment: "needs human eyes".into(),
            issues: vec![],
        };
        apply_decision(&store, &issue, &decision).await.unwrap();

        let parent = store.get_issue("parent").await.unwrap();
        assert!(parent.labels.contains(&"escalated".to_string()));
        assert_eq!(parent.status, IssueStatus::Blocked);
    }

    #[test]
    fn parses_fenced_recovery_decision() {
        let text = "```json\n{\"action\": \"retry\", \"comment\": \"flaky\"}\n```";
        let decision = parse_decision(text).unwrap();
        assert_eq!(decision.action, RecoveryAction::Retry);
    }

    #[tokio::test]
    async fn unparsable_ai_response_falls_back_deterministically() {
        let store = InMemoryIssueStore::new();
        let issue = store.create_issue(sample_issue("parent")).await.unwrap();
        let ai = MockAiClient::new(vec!["I refuse to answer in JSON.".to_string()]);
        let gates = vec![failed_gate("lint")];
        let gate_refs: Vec<&GateResult> = gates.iter().collect();
        let prompt = build_prompt(&issue, &gate_refs);
        let text = ai.complete(&prompt).await.unwrap();
        assert!(parse_decision(&text).is_none());
    }
}
