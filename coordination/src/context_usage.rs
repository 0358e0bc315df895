//! Context-window usage detection.
//!
//! Parses an AI coding agent's stdout for token-window usage signals and
//! maintains a burn-rate estimate, the same way
//! [`crate::feedback::error_parser`] classifies rustc diagnostics with a
//! table of compiled `Regex` statics.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::Mutex;

use crate::issue_store::{IssueEvent, IssueStore};

static CONTEXT_RATIO_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)context:\s*(\d+)\s*/\s*(\d+)\s*\((\d+(?:\.\d+)?)%\)").unwrap()
});

static TOKEN_USAGE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)token usage:\s*(\d+)\s*/\s*(\d+)").unwrap());

static COMPACTION_WARNING_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)approaching auto-?compaction limit").unwrap());

const DEFAULT_WINDOW_TOKENS: u64 = 200_000;
const ESTIMATED_WARNING_PCT: f64 = 85.0;
const EXHAUSTION_THRESHOLD_PCT: f64 = 80.0;
const HISTORY_CAPACITY: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl UsageSeverity {
    fn from_pct(pct: f64) -> Self {
        if pct >= 90.0 {
            Self::Critical
        } else if pct >= 80.0 {
            Self::Error
        } else if pct >= 60.0 {
            Self::Warning
        } else {
            Self::Info
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Measurement {
    at: DateTime<Utc>,
    pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContextUsageMetrics {
    pub current_pct: f64,
    pub burn_rate_pct_per_min: f64,
    pub is_exhausting: bool,
    pub estimated_exhaustion_at: Option<DateTime<Utc>>,
}

/// Parses agent output for context-window usage lines and tracks burn rate
/// over a bounded history.
pub struct ContextUsageDetector {
    default_window_tokens: u64,
    exhaustion_threshold_pct: f64,
    history: Mutex<VecDeque<Measurement>>,
    store: Option<Arc<dyn IssueStore>>,
}

impl Default for ContextUsageDetector {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_TOKENS, EXHAUSTION_THRESHOLD_PCT, None)
    }
}

impl ContextUsageDetector {
    pub fn new(default_window_tokens: u64, exhaustion_threshold_pct: f64, store: Option<Arc<dyn IssueStore>>) -> Self {
        Self {
            default_window_tokens,
            exhaustion_threshold_pct,
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
            store,
        }
    }

    pub fn with_store(store: Arc<dyn IssueStore>) -> Self {
        Self::new(DEFAULT_WINDOW_TOKENS, EXHAUSTION_THRESHOLD_PCT, Some(store))
    }

    /// Parse one chunk of agent stdout. Returns `Some(severity)` if a usage
    /// signal was recognized in this chunk. Best-effort: on a recognized
    /// signal, appends a `context_usage` event to the store for `issue_id`
    /// bucketed into the returned severity; a store failure is logged and
    /// never surfaced to the caller.
    pub async fn parse(&self, chunk: &str, issue_id: &str, worker_id: &str, agent: &str) -> Option<UsageSeverity> {
        let pct = if let Some(caps) = CONTEXT_RATIO_PATTERN.captures(chunk) {
            caps.get(3)?.as_str().parse::<f64>().ok()?
        } else if let Some(caps) = TOKEN_USAGE_PATTERN.captures(chunk) {
            let used: f64 = caps.get(1)?.as_str().parse().ok()?;
            let total: f64 = caps.get(2)?.as_str().parse().ok()?;
            if total <= 0.0 {
                return None;
            }
            (used / total) * 100.0
        } else if COMPACTION_WARNING_PATTERN.is_match(chunk) {
            ESTIMATED_WARNING_PCT
        } else {
            return None;
        };

        self.record(pct);
        let severity = UsageSeverity::from_pct(pct);
        self.emit_event(issue_id, worker_id, agent, pct, severity).await;
        Some(severity)
    }

    async fn emit_event(&self, issue_id: &str, worker_id: &str, agent: &str, pct: f64, severity: UsageSeverity) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        let body = format!(
            "context_usage: severity={severity:?} pct={pct:.1} agent={agent}"
        );
        if let Err(e) = store
            .add_event(IssueEvent {
                issue_id: issue_id.to_string(),
                actor: format!("context-usage-{worker_id}"),
                body,
                at: Utc::now(),
            })
            .await
        {
            tracing::warn!(issue_id, worker_id, error = %e, "failed to record context_usage event");
        }
    }

    fn record(&self, pct: f64) {
        let mut history = self.history.lock().unwrap();
        if history.len() == HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(Measurement {
            at: Utc::now(),
            pct,
        });
    }

    pub fn metrics(&self) -> ContextUsageMetrics {
        let history = self.history.lock().unwrap();
        let Some(latest) = history.back() else {
            return ContextUsageMetrics::default();
        };

        let burn_rate = history
            .front()
            .filter(|first| first.at != latest.at)
            .map(|first| {
                let elapsed_min = (latest.at - first.at).num_milliseconds() as f64 / 60_000.0;
                if elapsed_min < 0.001 {
                    0.0
                } else {
                    ((latest.pct - first.pct) / elapsed_min).max(0.0)
                }
            })
            .unwrap_or(0.0);

        let is_exhausting = latest.pct >= self.exhaustion_threshold_pct;
        let estimated_exhaustion_at = if is_exhausting && burn_rate > 0.0 {
            let remaining_pct = (100.0 - latest.pct).max(0.0);
            let minutes_remaining = remaining_pct / burn_rate;
            Some(latest.at + chrono::Duration::seconds((minutes_remaining * 60.0) as i64))
        } else {
            None
        };

        ContextUsageMetrics {
            current_pct: latest.pct,
            burn_rate_pct_per_min: burn_rate,
            is_exhausting,
            estimated_exhaustion_at,
        }
    }

    pub fn default_window_tokens(&self) -> u64 {
        self.default_window_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue_store::memory::InMemoryIssueStore;
    use crate::issue_store::{Issue, IssueKind, IssueStatus};

    #[tokio::test]
    async fn parses_context_ratio_line() {
        let detector = ContextUsageDetector::default();
        let severity = detector
            .parse("Context: 150000/200000 (75%)", "issue-1", "worker-1", "claude-code")
            .await
            .unwrap();
        assert_eq!(severity, UsageSeverity::Warning);
        assert_eq!(detector.metrics().current_pct, 75.0);
    }

    #[tokio::test]
    async fn parses_token_usage_line() {
        let detector = ContextUsageDetector::default();
        let severity = detector
            .parse("Token usage: 180000/200000", "issue-1", "worker-1", "claude-code")
            .await
            .unwrap();
        assert_eq!(severity, UsageSeverity::Error);
        assert_eq!(detector.metrics().current_pct, 90.0);
    }

    #[tokio::test]
    async fn recognizes_compaction_warning_without_numbers() {
        let detector = ContextUsageDetector::default();
        let severity = detector
            .parse(
                "Warning: approaching auto-compaction limit, consider wrapping up",
                "issue-1",
                "worker-1",
                "claude-code",
            )
            .await
            .unwrap();
        assert_eq!(severity, UsageSeverity::Warning);
        assert_eq!(detector.metrics().current_pct, ESTIMATED_WARNING_PCT);
    }

    #[tokio::test]
    async fn ignores_unrelated_output() {
        let detector = ContextUsageDetector::default();
        assert!(detector
            .parse("running cargo test...", "issue-1", "worker-1", "claude-code")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn is_exhausting_flips_past_threshold() {
        let detector = ContextUsageDetector::default();
        detector
            .parse("Context: 50000/200000 (25%)", "issue-1", "worker-1", "claude-code")
            .await;
        assert!(!detector.metrics().is_exhausting);
        detector
            .parse("Context: 170000/200000 (85%)", "issue-1", "worker-1", "claude-code")
            .await;
        assert!(detector.metrics().is_exhausting);
    }

    #[tokio::test]
    async fn records_context_usage_event_when_store_is_wired() {
        let memory = Arc::new(InMemoryIssueStore::new());
        let now = Utc::now();
        memory
            .create_issue(Issue {
                id: "issue-1".into(),
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
            })
            .await
            .unwrap();

        let store: Arc<dyn IssueStore> = memory.clone();
        let detector = ContextUsageDetector::with_store(store);
        detector
            .parse("Context: 150000/200000 (75%)", "issue-1", "worker-1", "claude-code")
            .await;

        let events = memory.events_for("issue-1");
        assert_eq!(events.len(), 1);
        assert!(events[0].body.contains("context_usage"));
        assert!(events[0].body.contains("Warning"));
    }
}
