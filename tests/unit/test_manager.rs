//! End-to-end tests for `ErrorHandlingManager::handle`: approach selection,
//! immediate response, the emergency path and outbound events.

use async_trait::async_trait;
use selfmend::analysis::{AnalyzerConfig, RootCauseAnalyzer};
use selfmend::classifier::{requires_immediate_attention, ClassifyError};
use selfmend::config::HealingConfig;
use selfmend::errors::{HealingError, RecoveryError, Result, StoreError};
use selfmend::manager::{
    ErrorHandlingManager, HealingEvent, HealingStack, ManagerConfig, ManagerParts,
    RecoveryApproach,
};
use selfmend::monitor::{Alert, ErrorMonitor, ErrorRecorder, MonitorConfig};
use selfmend::recovery::{
    CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, DegradationConfig,
    DegradationLevel, DegradationManager, LocalRecoveryExecutor, NoopParticipant,
    NoopRecoveryHandler, RecoveryAction, RecoveryConfig, RecoveryCoordinator, RecoveryHandler,
};
use selfmend::store::{InMemoryStore, TracingDispatcher};
use selfmend::types::{
    AgentFailure, ErrorClassification, ErrorContext, ErrorType, ImpactScope, Severity,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

// ============================================================================
// Fixtures
// ============================================================================

/// Returns a fixed verdict for every failure.
struct FixedClassifier {
    error_type: ErrorType,
    severity: Severity,
    scope: ImpactScope,
    retryable: bool,
    delay: Option<Duration>,
}

impl FixedClassifier {
    fn new(error_type: ErrorType, severity: Severity, scope: ImpactScope, retryable: bool) -> Self {
        Self {
            error_type,
            severity,
            scope,
            retryable,
            delay: None,
        }
    }
}

#[async_trait]
impl ClassifyError for FixedClassifier {
    async fn classify(&self, _: &AgentFailure, context: &ErrorContext) -> ErrorClassification {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let mut c = ErrorClassification::fallback(context, "fixed");
        c.error_type = self.error_type;
        c.severity = self.severity;
        c.impact_scope = self.scope;
        c.is_retryable = self.retryable;
        c.confidence_score = 0.9;
        c.requires_immediate_attention =
            requires_immediate_attention(self.severity, self.scope, false);
        c
    }
}

struct PanickingClassifier;

#[async_trait]
impl ClassifyError for PanickingClassifier {
    async fn classify(&self, _: &AgentFailure, _: &ErrorContext) -> ErrorClassification {
        panic!("classifier bug");
    }
}

/// Recorder whose backing store is down.
struct BrokenRecorder;

#[async_trait]
impl ErrorRecorder for BrokenRecorder {
    async fn record(&self, _: &ErrorContext) -> Result<Vec<Alert>> {
        Err(HealingError::Store(StoreError::Unavailable("disk gone".into())))
    }

    async fn annotate(&self, _: &str, _: &ErrorClassification) -> Vec<Alert> {
        Vec::new()
    }

    async fn mark_resolved(&self, _: &str) -> bool {
        false
    }
}

struct SlowHandler(Duration);

#[async_trait]
impl RecoveryHandler for SlowHandler {
    async fn execute(&self, _: &RecoveryAction, _: &ErrorContext) -> std::result::Result<(), RecoveryError> {
        tokio::time::sleep(self.0).await;
        Ok(())
    }
}

struct Harness {
    manager: ErrorHandlingManager,
    monitor: Arc<ErrorMonitor>,
    events: broadcast::Receiver<HealingEvent>,
}

fn recovery_config() -> RecoveryConfig {
    RecoveryConfig {
        backoff_base_ms: 1,
        backoff_max_ms: 2,
        jitter_factor: 0.0,
        ..Default::default()
    }
}

fn harness_with(
    classifier: Arc<dyn ClassifyError>,
    recorder: Option<Arc<dyn ErrorRecorder>>,
    handler: Arc<dyn RecoveryHandler>,
    config: ManagerConfig,
) -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let monitor = Arc::new(ErrorMonitor::new(
        MonitorConfig::default(),
        store.clone(),
        Arc::new(TracingDispatcher),
    ));
    let default_recorder: Arc<dyn ErrorRecorder> = monitor.clone();
    let parts = ManagerParts {
        recorder: recorder.unwrap_or(default_recorder),
        classifier,
        analyzer: Arc::new(RootCauseAnalyzer::new(store, AnalyzerConfig::default())),
        breakers: Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default())),
        degradation: Arc::new(DegradationManager::new(DegradationConfig::default())),
        executor: Arc::new(LocalRecoveryExecutor::new(handler, recovery_config())),
        coordinator: Arc::new(RecoveryCoordinator::new(
            Arc::new(NoopParticipant),
            recovery_config(),
        )),
    };
    let manager = ErrorHandlingManager::new(config, parts);
    let events = manager.subscribe();
    Harness {
        manager,
        monitor,
        events,
    }
}

fn harness(classifier: FixedClassifier) -> Harness {
    harness_with(
        Arc::new(classifier),
        None,
        Arc::new(NoopRecoveryHandler),
        ManagerConfig::default(),
    )
}

fn failure() -> AgentFailure {
    AgentFailure::new("WorkerError", "something went wrong")
}

fn drain(events: &mut broadcast::Receiver<HealingEvent>) -> Vec<HealingEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

// ============================================================================
// Approach selection
// ============================================================================

mod approach_tests {
    use super::*;

    #[tokio::test]
    async fn test_retryable_single_request_recovers_locally() {
        let mut h = harness(FixedClassifier::new(
            ErrorType::NetworkError,
            Severity::Medium,
            ImpactScope::SingleRequest,
            true,
        ));
        let ctx = ErrorContext::new("worker-1", "worker");
        let result = h.manager.handle(&failure(), &ctx).await;

        assert!(result.success());
        assert!(!result.emergency);
        assert_eq!(result.approach, Some(RecoveryApproach::SingleAgent));
        assert_eq!(result.recovery.strategy, "local:reconnect");
        assert!(result.analysis.is_none());
        assert_eq!(result.degradation_level, DegradationLevel::Normal);

        // The breaker for the failing agent saw one successful call.
        let breaker = h.manager.breakers().get("worker-1").unwrap();
        assert_eq!(breaker.metrics().calls_in_window, 1);

        let handled = drain(&mut h.events)
            .into_iter()
            .any(|e| matches!(e, HealingEvent::ErrorHandled { success: true, .. }));
        assert!(handled);
    }

    #[tokio::test]
    async fn test_successful_recovery_analyses_in_background() {
        let mut h = harness(FixedClassifier::new(
            ErrorType::TimeoutError,
            Severity::Low,
            ImpactScope::SingleRequest,
            true,
        ));
        let ctx = ErrorContext::new("worker-1", "worker");
        h.manager.handle(&failure(), &ctx).await;

        let analysed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match h.events.recv().await {
                    Ok(HealingEvent::AnalysisCompleted { result }) => return result,
                    Ok(_) => continue,
                    Err(e) => panic!("event stream closed: {e}"),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(analysed.error_id, ctx.error_id);
    }

    #[tokio::test]
    async fn test_cluster_high_severity_is_coordinated() {
        let h = harness(FixedClassifier::new(
            ErrorType::AgentCoordinationError,
            Severity::High,
            ImpactScope::AgentCluster,
            true,
        ));
        let ctx = ErrorContext::new("worker-1", "worker");
        let result = h.manager.handle(&failure(), &ctx).await;

        assert_ne!(result.approach, Some(RecoveryApproach::SingleAgent));
        assert_eq!(result.approach, Some(RecoveryApproach::Coordinated));
        assert!(result.classification.requires_immediate_attention);
        assert!(result.recovery.strategy.starts_with("coordinated:"));
        assert!(result.success());
        assert_eq!(h.manager.coordinator().sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_system_wide_critical_opens_breakers_and_degrades() {
        let h = harness(FixedClassifier::new(
            ErrorType::SystemError,
            Severity::Critical,
            ImpactScope::SystemWide,
            true,
        ));
        let bystander = h.manager.breakers().get_or_create("other-agent");
        let ctx = ErrorContext::new("worker-1", "worker");
        let result = h.manager.handle(&failure(), &ctx).await;

        assert_eq!(result.approach, Some(RecoveryApproach::Coordinated));
        assert_eq!(bystander.current_state(), CircuitState::Open);
        // Critical climbs two levels; successful recovery clears the
        // condition and steps down one.
        assert!(result.success());
        assert_eq!(result.degradation_level, DegradationLevel::Reduced);
        assert_eq!(h.manager.degradation().history().len(), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_degrades_only() {
        let mut h = harness(FixedClassifier::new(
            ErrorType::DataCorruptionError,
            Severity::Medium,
            ImpactScope::SingleRequest,
            false,
        ));
        let ctx = ErrorContext::new("worker-1", "worker");
        let result = h.manager.handle(&failure(), &ctx).await;

        assert_eq!(result.approach, Some(RecoveryApproach::DegradationOnly));
        assert!(!result.success());
        assert!(!result.recovery.error_resolved);
        assert_eq!(result.recovery.strategy, "degradation_only");
        assert_eq!(result.degradation_level, DegradationLevel::Reduced);
        // Analysis ran synchronously because recovery did not succeed.
        assert!(result.analysis.is_some());

        let events = drain(&mut h.events);
        assert!(events
            .iter()
            .any(|e| matches!(e, HealingEvent::DegradationChanged { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, HealingEvent::AnalysisCompleted { .. })));
    }

    #[tokio::test]
    async fn test_critical_non_retryable_escalates_once() {
        let h = harness(FixedClassifier::new(
            ErrorType::ResourceExhaustion,
            Severity::Critical,
            ImpactScope::SingleAgent,
            false,
        ));
        let ctx = ErrorContext::new("worker-1", "worker");
        let result = h.manager.handle(&failure(), &ctx).await;

        assert!(result.classification.requires_immediate_attention);
        assert_eq!(result.approach, Some(RecoveryApproach::DegradationOnly));
        assert!(!result.emergency);
        assert_eq!(result.degradation_level, DegradationLevel::Minimal);
        assert_eq!(h.manager.degradation().history().len(), 1);
    }

    #[tokio::test]
    async fn test_open_breaker_fails_single_agent_recovery() {
        let h = harness(FixedClassifier::new(
            ErrorType::DatabaseError,
            Severity::Medium,
            ImpactScope::SingleRequest,
            true,
        ));
        h.manager.breakers().get_or_create("db-1").force_open();
        let ctx = ErrorContext::new("db-1", "db");
        let result = h.manager.handle(&failure(), &ctx).await;

        assert!(!result.success());
        assert!(!result.emergency);
        assert!(result.recovery.actions_executed.is_empty());
        assert!(result.recovery.side_effects[0].contains("Circuit breaker open"));
        assert!(result.analysis.is_some());
    }

    #[tokio::test]
    async fn test_successful_recovery_marks_record_resolved() {
        let h = harness(FixedClassifier::new(
            ErrorType::TimeoutError,
            Severity::Low,
            ImpactScope::SingleRequest,
            true,
        ));
        let ctx = ErrorContext::new("worker-1", "worker");
        h.manager.handle(&failure(), &ctx).await;
        let metrics = h.monitor.get_metrics(selfmend::monitor::TimeRange::last(
            chrono::Duration::hours(1),
            chrono::Utc::now(),
        ));
        assert_eq!(metrics.resolved, 1);
        assert_eq!(metrics.by_type["timeout_error"], 1);
    }
}

// ============================================================================
// Emergency path
// ============================================================================

mod emergency_tests {
    use super::*;

    #[tokio::test]
    async fn test_recorder_failure_triggers_emergency() {
        let mut h = harness_with(
            Arc::new(FixedClassifier::new(
                ErrorType::NetworkError,
                Severity::Low,
                ImpactScope::SingleRequest,
                true,
            )),
            Some(Arc::new(BrokenRecorder) as Arc<dyn ErrorRecorder>),
            Arc::new(NoopRecoveryHandler),
            ManagerConfig::default(),
        );
        let existing = h.manager.breakers().get_or_create("worker-9");
        let ctx = ErrorContext::new("worker-1", "worker");
        let result = h.manager.handle(&failure(), &ctx).await;

        assert!(result.emergency);
        assert!(!result.success());
        assert!(result.approach.is_none());
        assert_eq!(result.recovery.strategy, "emergency_fallback");
        assert!(result.recovery.side_effects[0].contains("disk gone"));
        assert_eq!(result.classification.error_type, ErrorType::SystemError);
        assert_eq!(result.degradation_level, DegradationLevel::Emergency);
        assert_eq!(h.manager.degradation().level(), DegradationLevel::Emergency);
        assert_eq!(existing.current_state(), CircuitState::Open);
        assert_eq!(h.manager.stats().emergencies, 1);

        let events = drain(&mut h.events);
        assert!(events
            .iter()
            .any(|e| matches!(e, HealingEvent::EmergencyFallback { error_id, .. } if *error_id == ctx.error_id)));
        assert!(!events
            .iter()
            .any(|e| matches!(e, HealingEvent::ErrorHandled { .. })));
    }

    #[tokio::test]
    async fn test_panicking_classifier_triggers_emergency() {
        let h = harness_with(
            Arc::new(PanickingClassifier),
            None,
            Arc::new(NoopRecoveryHandler),
            ManagerConfig::default(),
        );
        let result = h
            .manager
            .handle(&failure(), &ErrorContext::new("worker-1", "worker"))
            .await;
        assert!(result.emergency);
        assert!(result.recovery.side_effects[0].contains("panic"));
    }

    #[tokio::test]
    async fn test_slow_classification_times_out_into_emergency() {
        let mut classifier = FixedClassifier::new(
            ErrorType::NetworkError,
            Severity::Low,
            ImpactScope::SingleRequest,
            true,
        );
        classifier.delay = Some(Duration::from_millis(500));
        let h = harness_with(
            Arc::new(classifier),
            None,
            Arc::new(NoopRecoveryHandler),
            ManagerConfig {
                handle_timeout_ms: 50,
                ..Default::default()
            },
        );
        let result = h
            .manager
            .handle(&failure(), &ErrorContext::new("worker-1", "worker"))
            .await;
        assert!(result.emergency);
        assert!(result.recovery.side_effects[0].contains("timed out"));
    }

    #[tokio::test]
    async fn test_emergency_severity_recovery_is_not_cut_short() {
        let h = harness_with(
            Arc::new(FixedClassifier::new(
                ErrorType::TimeoutError,
                Severity::Emergency,
                ImpactScope::SingleRequest,
                true,
            )),
            None,
            Arc::new(SlowHandler(Duration::from_millis(150))),
            ManagerConfig {
                handle_timeout_ms: 50,
                ..Default::default()
            },
        );
        let result = h
            .manager
            .handle(&failure(), &ErrorContext::new("worker-1", "worker"))
            .await;
        assert!(!result.emergency);
        assert!(result.success());
        // Emergency conditions are not cleared by a local recovery.
        assert_eq!(result.degradation_level, DegradationLevel::Emergency);
    }
}

// ============================================================================
// Assembled stack
// ============================================================================

#[tokio::test]
async fn test_in_memory_stack_fires_configured_alert() {
    let mut config = HealingConfig::default();
    config.monitor.alert_patterns = vec![selfmend::monitor::AlertPattern::new(
        "burst",
        Severity::High,
    )
    .with_condition(selfmend::monitor::AlertCondition::new(
        selfmend::monitor::AlertMetric::ErrorCount,
        selfmend::monitor::ComparisonOperator::Gte,
        2.0,
        60,
    ))];
    let stack = HealingStack::in_memory(&config).unwrap();
    let mut events = stack.manager.subscribe();
    let failure = AgentFailure::new("TimeoutError", "upstream call timed out");

    let first = stack
        .manager
        .handle(&failure, &ErrorContext::new("api-1", "api"))
        .await;
    assert!(first.alerts.is_empty());
    let second = stack
        .manager
        .handle(&failure, &ErrorContext::new("api-2", "api"))
        .await;
    assert_eq!(second.alerts.len(), 1);
    assert_eq!(second.alerts[0].pattern_name, "burst");

    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, HealingEvent::AlertFired { .. })));
    assert_eq!(stack.manager.stats().handled, 2);
}

#[tokio::test]
async fn test_critical_count_alert_fires_on_the_critical_error() {
    let mut config = HealingConfig::default();
    config.monitor.alert_patterns = vec![selfmend::monitor::AlertPattern::new(
        "critical_seen",
        Severity::Critical,
    )
    .with_condition(selfmend::monitor::AlertCondition::new(
        selfmend::monitor::AlertMetric::CriticalErrorCount,
        selfmend::monitor::ComparisonOperator::Gte,
        1.0,
        300,
    ))];
    let stack = HealingStack::in_memory(&config).unwrap();

    let oom = stack
        .manager
        .handle(
            &AgentFailure::new("OutOfMemoryError", "out of memory: heap allocation failed"),
            &ErrorContext::new("worker-1", "worker"),
        )
        .await;
    assert!(oom.classification.severity >= Severity::Critical);
    assert_eq!(oom.alerts.len(), 1);
    assert_eq!(oom.alerts[0].pattern_name, "critical_seen");

    let minor = stack
        .manager
        .handle(
            &AgentFailure::new("Warning", "minor hiccup"),
            &ErrorContext::new("worker-2", "worker"),
        )
        .await;
    assert!(minor.alerts.is_empty());
}
