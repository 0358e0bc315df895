//! Watchdog: ticks on a resettable timer, asks the Anomaly Analyzer and the
//! Context-Usage Detector for a verdict, and decides — using an
//! accumulation model rather than a single hardcoded threshold — whether to
//! hand the result to the Intervention Controller.

pub mod config;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use config::{ConfigError, WatchdogConfig};

use crate::ai_client::AiClient;
use crate::anomaly::{AnalysisContext, AnomalyAnalyzer, AnomalyReport, AnomalySeverity, AnomalyType, RecommendedAction};
use crate::context_usage::ContextUsageDetector;
use crate::intervention::InterventionController;
use crate::telemetry::TelemetryMonitor;

const TICK_BUDGET: Duration = Duration::from_secs(30);
const STUCK_STATE_CONSECUTIVE_THRESHOLD: u32 = 10;
const STUCK_STATE_DURATION_THRESHOLD: Duration = Duration::from_secs(180);

#[derive(Default)]
struct StuckStateTracker {
    consecutive: u32,
    first_detected_at: Option<tokio::time::Instant>,
    last_detected_at: Option<tokio::time::Instant>,
}

struct MutableState {
    current_interval: Duration,
    consecutive_interventions: u32,
    stuck: StuckStateTracker,
}

/// One watchdog instance supervises a single in-flight issue execution.
pub struct Watchdog<C: AiClient> {
    config: WatchdogConfig,
    analyzer: AnomalyAnalyzer<C>,
    context_detector: Arc<ContextUsageDetector>,
    telemetry: Arc<TelemetryMonitor>,
    intervention: Arc<InterventionController>,
    issue_id: String,
    cancellation: CancellationToken,
    state: Mutex<MutableState>,
}

impl<C: AiClient> Watchdog<C> {
    pub fn new(
        config: WatchdogConfig,
        analyzer: AnomalyAnalyzer<C>,
        context_detector: Arc<ContextUsageDetector>,
        telemetry: Arc<TelemetryMonitor>,
        intervention: Arc<InterventionController>,
        issue_id: impl Into<String>,
    ) -> Self {
        let base_interval = config.check_interval;
        Self {
            config,
            analyzer,
            context_detector,
            telemetry,
            intervention,
            issue_id: issue_id.into(),
            cancellation: CancellationToken::new(),
            state: Mutex::new(MutableState {
                current_interval: base_interval,
                consecutive_interventions: 0,
                stuck: StuckStateTracker::default(),
            }),
        }
    }

    async fn current_interval(&self) -> Duration {
        self.state.lock().await.current_interval
    }

    /// Reset backoff state after a successful agent completion.
    pub async fn reset_on_success(&self) {
        let mut state = self.state.lock().await;
        state.current_interval = self.config.check_interval;
        state.consecutive_interventions = 0;
        state.stuck = StuckStateTracker::default();
    }

    async fn run_detection(&self) -> Result<AnomalyReport, crate::anomaly::AnomalyError> {
        let window = self.telemetry.snapshot();
        let current = self.telemetry.current();
        let context_usage = self.context_detector.metrics();
        let history = self.intervention.history().await;
        let interventions: Vec<String> = history
            .iter()
            .map(|r| format!("{:?} at {}", r.action, r.at.to_rfc3339()))
            .collect();

        self.analyzer
            .detect(AnalysisContext {
                issue_id: &self.issue_id,
                telemetry_window: &window,
                current_execution: current.as_ref(),
                context_usage: Some(&context_usage),
                recent_interventions: &interventions,
            })
            .await
    }

    async fn tick(&self) {
        let usage = self.context_detector.metrics();
        if usage.is_exhausting {
            let synthetic = AnomalyReport {
                detected: true,
                anomaly_type: Some(AnomalyType::ContextExhaustion),
                severity: Some(AnomalySeverity::High),
                recommended_action: Some(RecommendedAction::Checkpoint),
                confidence: (usage.current_pct / 100.0).min(1.0),
                description: format!("context usage at {:.1}%", usage.current_pct),
                reasoning: "context window nearing exhaustion".to_string(),
                affected_issues: vec![self.issue_id.clone()],
                metrics: None,
            };
            self.handle_report(synthetic).await;
        }

        match self.run_detection().await {
            Ok(report) => self.handle_report(report).await,
            Err(e) => tracing::error!(target: "watchdog", issue_id = %self.issue_id, error = %e, "anomaly detection failed"),
        }
    }

    async fn handle_report(&self, report: AnomalyReport) {
        if !report.detected {
            return;
        }

        let should_act = {
            let mut state = self.state.lock().await;
            if matches!(report.anomaly_type, Some(AnomalyType::StuckState)) {
                let current_interval = state.current_interval;
                accumulate_stuck_state(&mut state.stuck, current_interval)
            } else {
                let confidence_ok = report.confidence >= self.config.ai.min_confidence_threshold;
                let severity_ok = report
                    .severity
                    .map(|s| s >= self.config.ai.min_severity_level)
                    .unwrap_or(false);
                confidence_ok && severity_ok
            }
        };
        if !should_act {
            return;
        }

        if matches!(report.recommended_action, Some(RecommendedAction::Backoff)) {
            self.apply_backoff(&report).await;
            return;
        }

        if let Err(e) = self.intervention.intervene(&self.issue_id, &report).await {
            tracing::warn!(target: "watchdog", issue_id = %self.issue_id, error = %e, "intervention failed");
        }
        let mut state = self.state.lock().await;
        state.consecutive_interventions += 1;
    }

    async fn apply_backoff(&self, report: &AnomalyReport) {
        if !self.config.backoff.enabled {
            return;
        }
        let Some(suggested) = report.metrics.as_ref().and_then(|m| m.suggested_interval.as_deref()) else {
            tracing::warn!(target: "watchdog", "backoff recommended without a suggested_interval, ignoring");
            return;
        };
        let parsed = match config::parse_duration(suggested) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(target: "watchdog", error = %e, "could not parse suggested backoff interval");
                return;
            }
        };
        let clamped = parsed.clamp(self.config.backoff.base_interval, self.config.backoff.max_interval);
        let mut state = self.state.lock().await;
        state.current_interval = clamped;
        tracing::info!(target: "watchdog", new_interval_secs = clamped.as_secs(), "applied AI-directed backoff");
    }

    /// Main loop. Runs until `cancellation` fires.
    async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.current_interval().await);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = self.cancellation.cancelled() => {
                    tracing::info!(target: "watchdog", issue_id = %self.issue_id, "watchdog stopped");
                    return;
                }
                _ = interval.tick() => {
                    if tokio::time::timeout(TICK_BUDGET, self.tick()).await.is_err() {
                        tracing::error!(target: "watchdog", issue_id = %self.issue_id, "tick exceeded budget");
                    }
                    let next = self.current_interval().await;
                    interval = tokio::time::interval(next);
                    interval.tick().await;
                }
            }
        }
    }
}

/// Handle to a spawned watchdog loop task.
pub struct WatchdogHandle {
    cancellation: CancellationToken,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl WatchdogHandle {
    /// Cancel the loop and wait for it to exit. Idempotent.
    pub async fn stop(&self) {
        self.cancellation.cancel();
        if let Some(handle) = self.join.lock().await.take() {
            let _ = handle.await;
        }
    }
}

pub fn spawn<C: AiClient + 'static>(watchdog: Arc<Watchdog<C>>) -> WatchdogHandle {
    let cancellation = watchdog.cancellation.clone();
    let join = tokio::spawn(async move { watchdog.run().await });
    WatchdogHandle {
        cancellation,
        join: Mutex::new(Some(join)),
    }
}

fn accumulate_stuck_state(tracker: &mut StuckStateTracker, current_interval: Duration) -> bool {
    let now = tokio::time::Instant::now();
    let gap_limit = current_interval * 2;
    let gap_exceeded = tracker
        .last_detected_at
        .map(|last| now.saturating_duration_since(last) > gap_limit)
        .unwrap_or(false);
    if gap_exceeded {
        tracker.consecutive = 0;
        tracker.first_detected_at = None;
    }

    tracker.consecutive += 1;
    let first = *tracker.first_detected_at.get_or_insert(now);
    tracker.last_detected_at = Some(now);

    tracker.consecutive >= STUCK_STATE_CONSECUTIVE_THRESHOLD
        || now.saturating_duration_since(first) >= STUCK_STATE_DURATION_THRESHOLD
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai_client::MockAiClient;
    use crate::issue_store::memory::InMemoryIssueStore;

    fn harness(responses: Vec<String>) -> Watchdog<MockAiClient> {
        let analyzer = AnomalyAnalyzer::new(MockAiClient::new(responses));
        let context_detector = Arc::new(ContextUsageDetector::default());
        let telemetry = Arc::new(TelemetryMonitor::new(10));
        let store: Arc<dyn crate::issue_store::IssueStore> = Arc::new(InMemoryIssueStore::new());
        let intervention = Arc::new(InterventionController::new(store, "worker-1"));
        Watchdog::new(
            WatchdogConfig::default(),
            analyzer,
            context_detector,
            telemetry,
            intervention,
            "issue-1",
        )
    }

    #[test]
    fn single_stuck_state_detection_does_not_trigger() {
        let mut tracker = StuckStateTracker::default();
        assert!(!accumulate_stuck_state(&mut tracker, Duration::from_secs(30)));
        assert_eq!(tracker.consecutive, 1);
    }

    #[test]
    fn ten_consecutive_detections_trigger() {
        let mut tracker = StuckStateTracker::default();
        let mut triggered = false;
        for _ in 0..10 {
            triggered = accumulate_stuck_state(&mut tracker, Duration::from_secs(30));
        }
        assert!(triggered);
    }

    #[tokio::test]
    async fn low_confidence_non_stuck_anomaly_is_not_acted_on() {
        let watchdog = harness(vec![]);
        let report = AnomalyReport {
            detected: true,
            anomaly_type: Some(AnomalyType::Thrashing),
            severity: Some(AnomalySeverity::High),
            recommended_action: Some(RecommendedAction::StopExecution),
            confidence: 0.1,
            description: "".into(),
            reasoning: "".into(),
            affected_issues: vec![],
            metrics: None,
        };
        watchdog.handle_report(report).await;
        assert_eq!(watchdog.state.lock().await.consecutive_interventions, 0);
    }

    #[tokio::test]
    async fn high_confidence_high_severity_anomaly_is_acted_on() {
        let watchdog = harness(vec![]);
        let report = AnomalyReport {
            detected: true,
            anomaly_type: Some(AnomalyType::Thrashing),
            severity: Some(AnomalySeverity::Critical),
            recommended_action: Some(RecommendedAction::NotifyHuman),
            confidence: 0.95,
            description: "flip-flopping edits".into(),
            reasoning: "".into(),
            affected_issues: vec![],
            metrics: None,
        };
        watchdog.handle_report(report).await;
        assert_eq!(watchdog.state.lock().await.consecutive_interventions, 1);
    }

    #[tokio::test]
    async fn backoff_clamps_to_configured_bounds() {
        let watchdog = harness(vec![]);
        let report = AnomalyReport {
            detected: true,
            anomaly_type: Some(AnomalyType::Other),
            severity: Some(AnomalySeverity::Critical),
            recommended_action: Some(RecommendedAction::Backoff),
            confidence: 0.99,
            description: "".into(),
            reasoning: "".into(),
            affected_issues: vec![],
            metrics: Some(crate::anomaly::AnomalyMetrics {
                suggested_interval: Some("9999s".to_string()),
            }),
        };
        watchdog.handle_report(report).await;
        let interval = watchdog.current_interval().await;
        assert_eq!(interval, watchdog.config.backoff.max_interval);
    }

    #[tokio::test]
    async fn reset_on_success_restores_base_interval() {
        let watchdog = harness(vec![]);
        {
            let mut state = watchdog.state.lock().await;
            state.current_interval = Duration::from_secs(120);
            state.consecutive_interventions = 4;
        }
        watchdog.reset_on_success().await;
        assert_eq!(watchdog.current_interval().await, watchdog.config.check_interval);
        assert_eq!(watchdog.state.lock().await.consecutive_interventions, 0);
    }

    struct CountingAiClient {
        calls: std::sync::atomic::AtomicU32,
    }

    #[async_trait::async_trait]
    impl crate::ai_client::AiClient for CountingAiClient {
        async fn complete(&self, _prompt: &str) -> Result<String, crate::ai_client::AiClientError> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err(crate::ai_client::AiClientError::Transient("no anomaly".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_ticks_on_the_configured_interval() {
        let calls = Arc::new(CountingAiClient {
            calls: std::sync::atomic::AtomicU32::new(0),
        });
        let analyzer = AnomalyAnalyzer::new(calls.clone());
        let context_detector = Arc::new(ContextUsageDetector::default());
        let telemetry = Arc::new(TelemetryMonitor::new(10));
        let store: Arc<dyn crate::issue_store::IssueStore> = Arc::new(InMemoryIssueStore::new());
        let intervention = Arc::new(InterventionController::new(store, "worker-1"));

        let mut config = WatchdogConfig::default();
        config.check_interval = Duration::from_secs(5);

        let watchdog = Arc::new(Watchdog::new(
            config,
            analyzer,
            context_detector,
            telemetry,
            intervention,
            "issue-1",
        ));
        let handle = spawn(watchdog.clone());

        // Paused virtual clock: advancing past three intervals should drive
        // three ticks without any real wall-clock delay.
        tokio::time::advance(Duration::from_secs(16)).await;
        tokio::task::yield_now().await;

        handle.stop().await;
        assert!(calls.calls.load(std::sync::atomic::Ordering::SeqCst) >= 3);
    }
}
