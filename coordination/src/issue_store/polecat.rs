//! Polecat single-task-mode interop types.
//!
//! These are data-only: the stdout JSON contract a caller that invokes this
//! executor for a single issue and reads the result back expects. No
//! execution logic lives here — `executor_loop`/`gates::recovery` build one
//! of these and print it, nothing in this module runs anything.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolecatStatus {
    Completed,
    Partial,
    Blocked,
    Failed,
    Decomposed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityGateOutcome {
    pub passed: bool,
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecompositionResult {
    pub discovered_issue_ids: Vec<String>,
    pub reason: String,
}

/// The single JSON object printed to stdout in single-task mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolecatResult {
    pub status: PolecatStatus,
    pub success: bool,
    pub iterations: u32,
    pub converged: bool,
    pub duration_seconds: f64,
    pub files_modified: Vec<String>,
    pub quality_gates: HashMap<String, QualityGateOutcome>,
    pub discovered_issues: Vec<String>,
    pub punted_items: Vec<String>,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decomposition: Option<DecompositionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preflight_result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let result = PolecatResult {
            status: PolecatStatus::Completed,
            success: true,
            iterations: 3,
            converged: true,
            duration_seconds: 12.5,
            files_modified: vec!["src/lib.rs".into()],
            quality_gates: HashMap::from([(
                "clippy".to_string(),
                QualityGateOutcome { passed: true, output: String::new(), error: None },
            )]),
            discovered_issues: vec![],
            punted_items: vec![],
            summary: "fixed the thing".into(),
            decomposition: None,
            error: None,
            preflight_result: None,
            message: None,
            suggested_action: None,
        };

        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"status\":\"completed\""));
        let round_tripped: PolecatResult = serde_json::from_str(&json).unwrap();
        assert_eq!(round_tripped.iterations, 3);
    }
}
