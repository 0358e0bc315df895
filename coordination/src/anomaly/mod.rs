//! Anomaly analyzer — "zero framework cognition".
//!
//! This module contains no hardcoded thresholds or heuristics for what
//! constitutes an anomaly. It formats telemetry into a prompt and asks the
//! configured [`AiClient`] for a verdict; the only logic here is prompt
//! construction and resilient parsing of the JSON the model returns,
//! grounded on the `extract_json_block`/`extract_json_array` helpers used
//! elsewhere in this codebase for tolerant LLM-output parsing.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;

use crate::ai_client::{AiClient, AiClientError};
use crate::context_usage::ContextUsageMetrics;
use crate::telemetry::IterationMetrics;

#[derive(Debug, Error)]
pub enum AnomalyError {
    #[error("AI client error: {0}")]
    Client(#[from] AiClientError),

    #[error("could not parse an anomaly report out of the model response: {0}")]
    UnparsableResponse(String),

    #[error("anomaly detection timed out")]
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalySeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    InfiniteLoop,
    Thrashing,
    StuckState,
    Regression,
    ResourceSpike,
    ContextExhaustion,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    StopExecution,
    RestartAgent,
    MarkAsBlocked,
    Investigate,
    Monitor,
    NotifyHuman,
    Checkpoint,
    Backoff,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyMetrics {
    #[serde(default)]
    pub suggested_interval: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyReport {
    pub detected: bool,
    #[serde(default)]
    pub anomaly_type: Option<AnomalyType>,
    #[serde(default)]
    pub severity: Option<AnomalySeverity>,
    #[serde(default)]
    pub recommended_action: Option<RecommendedAction>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub affected_issues: Vec<String>,
    #[serde(default)]
    pub metrics: Option<AnomalyMetrics>,
}

impl AnomalyReport {
    pub fn none() -> Self {
        Self {
            detected: false,
            anomaly_type: None,
            severity: None,
            recommended_action: None,
            confidence: 0.0,
            description: String::new(),
            reasoning: String::new(),
            affected_issues: vec![],
            metrics: None,
        }
    }
}

/// Context handed to the analyzer for a single detection pass.
pub struct AnalysisContext<'a> {
    pub issue_id: &'a str,
    pub telemetry_window: &'a [IterationMetrics],
    pub current_execution: Option<&'a IterationMetrics>,
    pub context_usage: Option<&'a ContextUsageMetrics>,
    pub recent_interventions: &'a [String],
}

/// Strip a markdown code fence if present, then fall back to the first
/// `{` .. last `}` span.
fn extract_json_block(text: &str) -> Option<&str> {
    if let Some(start) = text.find("```json") {
        let json_start = start + 7;
        if let Some(end) = text[json_start..].find("```") {
            return Some(text[json_start..json_start + end].trim());
        }
    }
    if let Some(start) = text.find("```") {
        let json_start = start + 3;
        if let Some(end) = text[json_start..].find("```") {
            return Some(text[json_start..json_start + end].trim());
        }
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end > start {
        Some(&text[start..=end])
    } else {
        None
    }
}

static TRAILING_COMMA: LazyLock<Regex> = LazyLock::new(|| Regex::new(r",\s*([}\]])").unwrap());

/// Tolerate trailing commas and truncated output by progressively trimming
/// back to the last balanced `}` before giving up.
fn resilient_parse(text: &str) -> Result<AnomalyReport, AnomalyError> {
    let candidate = extract_json_block(text).unwrap_or(text);
    let cleaned = TRAILING_COMMA.replace_all(candidate, "$1");

    if let Ok(report) = serde_json::from_str::<AnomalyReport>(&cleaned) {
        return Ok(report);
    }

    // Truncated output: walk backwards to the last `}` and retry.
    if let Some(last_brace) = cleaned.rfind('}') {
        if let Ok(report) = serde_json::from_str::<AnomalyReport>(&cleaned[..=last_brace]) {
            return Ok(report);
        }
    }

    Err(AnomalyError::UnparsableResponse(text.chars().take(500).collect()))
}

pub struct AnomalyAnalyzer<C: AiClient> {
    client: C,
    timeout: Duration,
}

impl<C: AiClient> AnomalyAnalyzer<C> {
    pub fn new(client: C) -> Self {
        Self {
            client,
            timeout: Duration::from_secs(120),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn detect(&self, ctx: AnalysisContext<'_>) -> Result<AnomalyReport, AnomalyError> {
        let prompt = self.build_prompt(&ctx);
        let call = self.client.complete(&prompt);
        let response = tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| AnomalyError::Timeout)??;
        resilient_parse(&response)
    }

    fn build_prompt(&self, ctx: &AnalysisContext<'_>) -> String {
        let now: DateTime<Utc> = Utc::now();
        let window_json = serde_json::to_string_pretty(ctx.telemetry_window).unwrap_or_default();
        let current_json = ctx
            .current_execution
            .map(|c| serde_json::to_string_pretty(c).unwrap_or_default())
            .unwrap_or_else(|| "null".into());
        let context_usage_json = ctx
            .context_usage
            .map(|c| serde_json::to_string_pretty(c).unwrap_or_default())
            .unwrap_or_else(|| "null".into());

        format!(
            "You are the anomaly detector for an autonomous coding agent supervisor. \
             It is now {now}. Analyze the execution telemetry below for issue `{issue}` \
             and decide whether the agent is behaving anomalously.\n\n\
             The presence of `agent_tool_use` events in the telemetry indicates the agent \
             is actively working — do not treat that alone as a stall.\n\n\
             ## Telemetry window\n{window}\n\n\
             ## Current execution\n{current}\n\n\
             ## Context window usage\n{usage}\n\n\
             ## Recent interventions\n{interventions}\n\n\
             Respond with ONLY a JSON object matching this shape:\n\
             {{\"detected\": bool, \"anomaly_type\": \"infinite_loop\"|\"thrashing\"|\"stuck_state\"|\
             \"regression\"|\"resource_spike\"|\"context_exhaustion\"|\"other\"|null, \
             \"severity\": \"low\"|\"medium\"|\"high\"|\"critical\"|null, \
             \"recommended_action\": \"stop_execution\"|\"restart_agent\"|\"mark_as_blocked\"|\
             \"investigate\"|\"monitor\"|\"notify_human\"|\"checkpoint\"|\"backoff\"|null, \
             \"confidence\": 0.0-1.0, \"description\": string, \"reasoning\": string, \
             \"affected_issues\": [string], \"metrics\": {{\"suggested_interval\": string|null}}|null}}",
            now = now.to_rfc3339(),
            issue = ctx.issue_id,
            window = window_json,
            current = current_json,
            usage = context_usage_json,
            interventions = ctx.recent_interventions.join("\n"),
        )
    }
}
