//! Coordination engine for an autonomous issue-driven code-change executor.
//!
//! This crate implements the execution-and-supervision core consumed by the
//! `executor` binary: the work-claim and checkpoint protocol over an issue
//! store, a quality-gate pipeline with AI-driven failure recovery, a
//! watchdog that supervises a running agent for behavioral anomalies and
//! context exhaustion, and the human approval gate that sits between a
//! passing gate run and a merge.
//!
//! # Modules
//!
//! - [`issue_store`]: persistence trait plus in-memory and `beads`-CLI-backed
//!   implementations.
//! - [`worker_registry`]: worker instance registration, heartbeats, stale
//!   reclamation, and the project-scoped exclusive lock.
//! - [`telemetry`]: bounded sliding window of execution records.
//! - [`context_usage`]: agent stdout parsing for context-window usage.
//! - [`anomaly`]: AI-backed anomaly detection over telemetry and context.
//! - [`intervention`]: executes anomaly-response actions against the agent
//!   and the issue store.
//! - [`watchdog`]: timer loop orchestrating telemetry, context-usage,
//!   anomaly analysis and intervention.
//! - [`gates`] / [`verifier`]: build/test/lint gate pipeline and its
//!   AI-driven recovery strategy.
//! - [`approval`]: summary + diff presentation and decision recording.
//! - [`executor_loop`]: claims ready work and wires the above components
//!   around a single agent invocation.
//! - [`ai_client`]: thin completion trait used by the anomaly analyzer and
//!   the gate-recovery strategist, with retry and circuit-breaking.
//! - [`harness`]: git checkpoint/diff/rollback wrapper used by the approval
//!   gate and the executor loop's sandbox.
//! - [`feedback`]: cargo output parsing shared by the verifier pipeline.

#![allow(dead_code)]
#![allow(clippy::uninlined_format_args)]

pub mod ai_client;
pub mod anomaly;
pub mod approval;
pub mod context_usage;
pub mod executor_loop;
pub mod feedback;
pub mod gates;
pub mod harness;
pub mod intervention;
pub mod issue_store;
pub mod telemetry;
pub mod verifier;
pub mod watchdog;
pub mod worker_registry;

// Re-export key harness types
pub use harness::{GitCommitInfo, GitManager, HarnessError, HarnessResult};

// Re-export verifier types
pub use verifier::{GateOutcome, GateResult, Verifier, VerifierConfig, VerifierReport};

// Re-export issue store types
pub use issue_store::{
    ClaimOutcome, Dependency, DependencyKind, Issue, IssueEvent, IssueKind, IssueStatus,
    IssueStore, IssueStoreError, ReadyWorkFilter, ReleaseOptions,
};

// Re-export worker registry types
pub use worker_registry::{ProjectLock, RegistryError, WorkerRegistry};

// Re-export AI client types
pub use ai_client::{AiClient, AiClientError, MockAiClient, RetryingAiClient};

// Re-export anomaly analyzer types
pub use anomaly::{AnalysisContext, AnomalyAnalyzer, AnomalyError, AnomalyReport, AnomalySeverity, AnomalyType, RecommendedAction};

// Re-export intervention controller types
pub use intervention::{InterventionController, InterventionError, InterventionRecord};

// Re-export watchdog types
pub use watchdog::{Watchdog, WatchdogConfig, WatchdogHandle};

// Re-export telemetry monitor types
pub use telemetry::{IterationMetrics, TelemetryMonitor};

// Re-export context usage types
pub use context_usage::{ContextUsageDetector, ContextUsageMetrics, UsageSeverity};

// Re-export quality-gate recovery types
pub use gates::recovery::{
    run_pipeline_with_heartbeat, run_with_recovery, GateProgress, ProgressCallback, RecoveryAction,
    RecoveryDecision, RecoveryError, RecoveryOutcome,
};

// Re-export approval gate types
pub use approval::{ApprovalError, ApprovalGate, ApprovalResult};

// Re-export executor loop types
pub use executor_loop::{
    AgentRunner, ExecutorError, ExecutorLoop, ExecutorLoopConfig, IterationOutcome, Sandbox,
};
