//! Telemetry monitor: a bounded sliding window of execution records.
//!
//! Builder pattern and snapshot semantics are generalized from
//! [`crate`]'s per-iteration `MetricsCollector` (cargo-iteration telemetry
//! for a single agent session) to per-issue-execution telemetry for the
//! watchdog: state transitions, event counts, phase durations and gate
//! outcomes instead of token counts and cargo iteration numbers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use std::time::Duration;

use crate::issue_store::ExecutionPhase;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: ExecutionPhase,
    pub to: ExecutionPhase,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateOutcomeRecord {
    pub gate: String,
    pub passed: bool,
    pub duration_ms: u64,
    pub message: Option<String>,
}

/// Finalized telemetry for one completed (or in-progress) issue execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationMetrics {
    pub issue_id: String,
    pub worker_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub event_counts: HashMap<String, u64>,
    pub state_transitions: Vec<StateTransition>,
    pub phase_durations_ms: HashMap<String, u64>,
    pub gate_results: Vec<GateOutcomeRecord>,
    pub discovered_issue_count: u64,
    pub success: Option<bool>,
    pub gates_passed: Option<bool>,
}

impl IterationMetrics {
    fn new(issue_id: &str, worker_id: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            issue_id: issue_id.to_string(),
            worker_id: worker_id.to_string(),
            started_at,
            ended_at: None,
            event_counts: HashMap::new(),
            state_transitions: Vec::new(),
            phase_durations_ms: HashMap::new(),
            gate_results: Vec::new(),
            discovered_issue_count: 0,
            success: None,
            gates_passed: None,
        }
    }
}

const DEFAULT_WINDOW_SIZE: usize = 100;

/// Bounded sliding-window telemetry collector. All operations are
/// synchronized by a single `RwLock`; writes never perform I/O.
pub struct TelemetryMonitor {
    window_size: usize,
    inner: RwLock<Inner>,
}

struct Inner {
    window: VecDeque<IterationMetrics>,
    current: Option<IterationMetrics>,
}

impl Default for TelemetryMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }
}

impl TelemetryMonitor {
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size: window_size.max(1),
            inner: RwLock::new(Inner {
                window: VecDeque::with_capacity(window_size.max(1)),
                current: None,
            }),
        }
    }

    pub fn start(&self, issue_id: &str, worker_id: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.current = Some(IterationMetrics::new(issue_id, worker_id, Utc::now()));
    }

    pub fn end(&self, success: bool, gates_passed: bool) {
        let mut inner = self.inner.write().unwrap();
        if let Some(mut record) = inner.current.take() {
            record.ended_at = Some(Utc::now());
            record.success = Some(success);
            record.gates_passed = Some(gates_passed);
            if inner.window.len() == self.window_size {
                inner.window.pop_front();
            }
            inner.window.push_back(record);
        }
    }

    pub fn record_event(&self, event_type: &str) {
        let mut inner = self.inner.write().unwrap();
        if let Some(record) = inner.current.as_mut() {
            *record.event_counts.entry(event_type.to_string()).or_insert(0) += 1;
        }
    }

    pub fn record_state_transition(&self, from: ExecutionPhase, to: ExecutionPhase) {
        let mut inner = self.inner.write().unwrap();
        if let Some(record) = inner.current.as_mut() {
            record.state_transitions.push(StateTransition {
                from,
                to,
                at: Utc::now(),
            });
        }
    }

    pub fn record_phase_duration(&self, name: &str, duration: Duration) {
        let mut inner = self.inner.write().unwrap();
        if let Some(record) = inner.current.as_mut() {
            record
                .phase_durations_ms
                .insert(name.to_string(), duration.as_millis() as u64);
        }
    }

    pub fn record_gate_result(&self, gate: &str, passed: bool, duration: Duration, message: Option<String>) {
        let mut inner = self.inner.write().unwrap();
        if let Some(record) = inner.current.as_mut() {
            record.gate_results.push(GateOutcomeRecord {
                gate: gate.to_string(),
                passed,
                duration_ms: duration.as_millis() as u64,
                message,
            });
        }
    }

    pub fn record_discovered_issues(&self, count: u64) {
        let mut inner = self.inner.write().unwrap();
        if let Some(record) = inner.current.as_mut() {
            record.discovered_issue_count += count;
        }
    }

    /// Deep copy of the bounded window.
    pub fn snapshot(&self) -> Vec<IterationMetrics> {
        self.inner.read().unwrap().window.iter().cloned().collect()
    }

    /// Deep copy of the in-progress record, if any.
    pub fn current(&self) -> Option<IterationMetrics> {
        self.inner.read().unwrap().current.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn no_current_execution_is_a_silent_no_op() {
        let monitor = TelemetryMonitor::new(10);
        monitor.record_event("agent_tool_use");
        assert!(monitor.current().is_none());
    }

    #[test]
    fn snapshot_is_a_deep_copy() {
        let monitor = TelemetryMonitor::new(10);
        monitor.start("issue-1", "worker-1");
        monitor.record_event("agent_tool_use");
        monitor.end(true, true);

        let mut snapshot = monitor.snapshot();
        snapshot[0].event_counts.insert("mutated".into(), 99);

        let second_snapshot = monitor.snapshot();
        assert!(!second_snapshot[0].event_counts.contains_key("mutated"));
    }

    #[test]
    fn window_is_bounded() {
        let monitor = TelemetryMonitor::new(2);
        for i in 0..5 {
            monitor.start(&format!("issue-{i}"), "worker-1");
            monitor.end(true, true);
        }
        assert_eq!(monitor.snapshot().len(), 2);
        assert_eq!(monitor.snapshot()[1].issue_id, "issue-4");
    }

    #[test]
    fn only_one_current_execution_at_a_time() {
        let monitor = TelemetryMonitor::new(10);
        monitor.start("issue-1", "worker-1");
        monitor.start("issue-2", "worker-1");
        assert_eq!(monitor.current().unwrap().issue_id, "issue-2");
    }

    proptest::proptest! {
        /// Property 9: whatever events were recorded, mutating one snapshot's
        /// owned records can never affect a later snapshot of the same window.
        #[test]
        fn snapshot_is_always_a_deep_copy(event_names in proptest::collection::vec("[a-z_]{1,12}", 0..20)) {
            let monitor = TelemetryMonitor::new(10);
            monitor.start("issue-1", "worker-1");
            for name in &event_names {
                monitor.record_event(name);
            }
            monitor.end(true, true);

            let mut first = monitor.snapshot();
            if let Some(record) = first.first_mut() {
                record.event_counts.clear();
                record.event_counts.insert("tampered".into(), u64::MAX);
                record.state_transitions.clear();
            }

            let second = monitor.snapshot();
            prop_assert!(!second[0].event_counts.contains_key("tampered"));
            for name in &event_names {
                prop_assert!(second[0].event_counts.contains_key(name.as_str()));
            }
        }
    }
}
