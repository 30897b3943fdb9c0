//! Error Handling Manager
//!
//! Orchestrates one failure through the pipeline:
//!
//! ```text
//!  record ─► classify ─► immediate response ─► choose approach ─► recover
//!                                                                   │
//!            recover degradation ◄─ root cause analysis ◄───────────┘
//!                                   (async on success, sync on failure)
//! ```
//!
//! `handle` never fails. Any internal error, panic or timeout lands in the
//! emergency path: maximum degradation, every breaker open, and a failed
//! result.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn, Instrument};

use crate::analysis::{RootCauseAnalysis, RootCauseAnalysisResult, RootCauseAnalyzer};
use crate::classifier::{ClassifyError, ErrorClassifier};
use crate::config::HealingConfig;
use crate::errors::{HealingError, RecoveryError, Result};
use crate::fingerprint::Fingerprint;
use crate::monitor::{Alert, ErrorMonitor, ErrorRecorder};
use crate::recovery::{
    CircuitBreakerError, CircuitBreakerRegistry, DegradationCondition, DegradationLevel,
    DegradationManager, DegradationTransition, LocalRecoveryExecutor, RecoveryCoordinator,
    RecoveryHandler, RecoveryParticipant, RecoveryResult, RecoveryStrategy,
};
use crate::registry::ErrorRegistry;
use crate::store::{AlertDispatcher, ErrorStore};
use crate::telemetry::{handle_span, sanitize_for_log};
use crate::types::{AgentFailure, ErrorClassification, ErrorContext, ErrorType, ImpactScope, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryApproach {
    SingleAgent,
    Coordinated,
    DegradationOnly,
}

impl RecoveryApproach {
    pub fn select(classification: &ErrorClassification) -> Self {
        let cross_agent = matches!(
            classification.impact_scope,
            ImpactScope::SystemWide | ImpactScope::AgentCluster
        );
        let coordination_crisis = classification.severity == Severity::Critical
            && classification.error_type == ErrorType::AgentCoordinationError;
        if cross_agent || coordination_crisis {
            RecoveryApproach::Coordinated
        } else if !classification.is_retryable {
            RecoveryApproach::DegradationOnly
        } else {
            RecoveryApproach::SingleAgent
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryApproach::SingleAgent => "single_agent",
            RecoveryApproach::Coordinated => "coordinated",
            RecoveryApproach::DegradationOnly => "degradation_only",
        }
    }
}

/// Outbound notifications, observed through [`ErrorHandlingManager::subscribe`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HealingEvent {
    ErrorHandled {
        error_id: String,
        approach: RecoveryApproach,
        success: bool,
    },
    AnalysisCompleted {
        result: Box<RootCauseAnalysisResult>,
    },
    AlertFired {
        alert: Alert,
    },
    DegradationChanged {
        transition: DegradationTransition,
    },
    EmergencyFallback {
        error_id: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorHandlingResult {
    pub error_id: String,
    pub classification: ErrorClassification,
    /// `None` on the emergency path.
    pub approach: Option<RecoveryApproach>,
    pub recovery: RecoveryResult,
    /// Present when analysis ran synchronously.
    pub analysis: Option<RootCauseAnalysisResult>,
    pub alerts: Vec<Alert>,
    pub degradation_level: DegradationLevel,
    pub emergency: bool,
    pub duration_ms: u64,
}

impl ErrorHandlingResult {
    pub fn success(&self) -> bool {
        self.recovery.success
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Budget for a whole `handle` call. Emergency-severity errors are
    /// exempt once classified.
    pub handle_timeout_ms: u64,
    pub event_buffer: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            handle_timeout_ms: 30_000,
            event_buffer: 256,
        }
    }
}

#[derive(Debug, Default)]
struct ManagerStats {
    handled: AtomicU64,
    recovered: AtomicU64,
    emergencies: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatsSummary {
    pub handled: u64,
    pub recovered: u64,
    pub emergencies: u64,
    pub degradation_level: DegradationLevel,
}

/// Collaborators the manager composes.
pub struct ManagerParts {
    pub recorder: Arc<dyn ErrorRecorder>,
    pub classifier: Arc<dyn ClassifyError>,
    pub analyzer: Arc<dyn RootCauseAnalysis>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub degradation: Arc<DegradationManager>,
    pub executor: Arc<LocalRecoveryExecutor>,
    pub coordinator: Arc<RecoveryCoordinator>,
}

pub struct ErrorHandlingManager {
    config: ManagerConfig,
    parts: ManagerParts,
    events: broadcast::Sender<HealingEvent>,
    stats: ManagerStats,
}

/// What the pipeline produced before the result is assembled.
struct Handled {
    classification: ErrorClassification,
    approach: RecoveryApproach,
    recovery: RecoveryResult,
    analysis: Option<RootCauseAnalysisResult>,
    alerts: Vec<Alert>,
}

impl ErrorHandlingManager {
    pub fn new(config: ManagerConfig, parts: ManagerParts) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            config,
            parts,
            events,
            stats: ManagerStats::default(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealingEvent> {
        self.events.subscribe()
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.parts.breakers
    }

    pub fn degradation(&self) -> &Arc<DegradationManager> {
        &self.parts.degradation
    }

    pub fn coordinator(&self) -> &Arc<RecoveryCoordinator> {
        &self.parts.coordinator
    }

    pub fn stats(&self) -> ManagerStatsSummary {
        ManagerStatsSummary {
            handled: self.stats.handled.load(Ordering::Relaxed),
            recovered: self.stats.recovered.load(Ordering::Relaxed),
            emergencies: self.stats.emergencies.load(Ordering::Relaxed),
            degradation_level: self.parts.degradation.level(),
        }
    }

    fn emit(&self, event: HealingEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    /// Drive one failure through the pipeline.
    pub async fn handle(&self, failure: &AgentFailure, context: &ErrorContext) -> ErrorHandlingResult {
        let started = Instant::now();
        self.stats.handled.fetch_add(1, Ordering::Relaxed);
        let span = handle_span(&context.error_id, &context.agent_id);
        debug!(
            error_id = %context.error_id,
            failure = %sanitize_for_log(&failure.message),
            "Handling failure"
        );

        let pipeline = AssertUnwindSafe(self.run(failure, context, started))
            .catch_unwind()
            .instrument(span.clone())
            .await;

        let outcome = match pipeline {
            Ok(Ok(handled)) => Ok(handled),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("panic in error handling pipeline".to_string()),
        };

        match outcome {
            Ok(handled) => {
                span.record("approach", handled.approach.as_str());
                span.record("success", handled.recovery.success);
                if handled.recovery.success {
                    self.stats.recovered.fetch_add(1, Ordering::Relaxed);
                }
                self.emit(HealingEvent::ErrorHandled {
                    error_id: context.error_id.clone(),
                    approach: handled.approach,
                    success: handled.recovery.success,
                });
                ErrorHandlingResult {
                    error_id: context.error_id.clone(),
                    classification: handled.classification,
                    approach: Some(handled.approach),
                    recovery: handled.recovery,
                    analysis: handled.analysis,
                    alerts: handled.alerts,
                    degradation_level: self.parts.degradation.level(),
                    emergency: false,
                    duration_ms: started.elapsed().as_millis() as u64,
                }
            }
            Err(reason) => self.emergency(failure, context, &reason, started),
        }
    }

    async fn run(
        &self,
        failure: &AgentFailure,
        context: &ErrorContext,
        started: Instant,
    ) -> Result<Handled> {
        let deadline = tokio::time::Instant::from_std(started)
            + Duration::from_millis(self.config.handle_timeout_ms);
        let timed_out = || HealingError::Timeout {
            operation: "error handling".to_string(),
            millis: self.config.handle_timeout_ms,
        };

        // 1-2: record and classify
        let (alerts, classification) =
            tokio::time::timeout_at(deadline, self.record_and_classify(failure, context))
                .await
                .map_err(|_| timed_out())??;

        // 3-7: the remaining budget does not apply to emergencies
        let exempt = classification.severity == Severity::Emergency;
        let rest = self.respond(failure, context, classification, alerts);
        if exempt {
            Ok(rest.await)
        } else {
            tokio::time::timeout_at(deadline, rest)
                .await
                .map_err(|_| timed_out())
        }
    }

    async fn record_and_classify(
        &self,
        failure: &AgentFailure,
        context: &ErrorContext,
    ) -> Result<(Vec<Alert>, ErrorClassification)> {
        let mut alerts = self.parts.recorder.record(context).await?;
        let classification = self.parts.classifier.classify(failure, context).await;
        alerts.extend(
            self.parts
                .recorder
                .annotate(&context.error_id, &classification)
                .await,
        );
        for alert in &alerts {
            self.emit(HealingEvent::AlertFired {
                alert: alert.clone(),
            });
        }
        Ok((alerts, classification))
    }

    async fn respond(
        &self,
        failure: &AgentFailure,
        context: &ErrorContext,
        classification: ErrorClassification,
        alerts: Vec<Alert>,
    ) -> Handled {
        if classification.requires_immediate_attention {
            self.immediate_response(context, &classification);
        }

        let approach = RecoveryApproach::select(&classification);
        info!(
            error_id = %context.error_id,
            error_type = classification.error_type.as_str(),
            severity = classification.severity.as_str(),
            approach = approach.as_str(),
            "Recovery approach selected"
        );
        let recovery = match approach {
            RecoveryApproach::SingleAgent => self.recover_single_agent(context, &classification).await,
            RecoveryApproach::Coordinated => {
                self.parts.coordinator.coordinate(context, &classification).await
            }
            RecoveryApproach::DegradationOnly => {
                self.escalate(context, &classification);
                RecoveryResult::degraded(self.parts.degradation.level())
            }
        };

        let analysis = if recovery.success {
            self.spawn_analysis(failure, context);
            None
        } else {
            let result = self.parts.analyzer.analyze(failure, context).await;
            self.emit(HealingEvent::AnalysisCompleted {
                result: Box::new(result.clone()),
            });
            Some(result)
        };

        if recovery.success {
            self.parts.recorder.mark_resolved(&context.error_id).await;
            if classification.severity != Severity::Emergency {
                self.parts.degradation.clear_condition(&context.error_id);
                if let Some(transition) = self.parts.degradation.recover() {
                    self.emit(HealingEvent::DegradationChanged { transition });
                }
            }
        }

        Handled {
            classification,
            approach,
            recovery,
            analysis,
            alerts,
        }
    }

    fn immediate_response(&self, context: &ErrorContext, classification: &ErrorClassification) {
        warn!(
            error_id = %context.error_id,
            severity = classification.severity.as_str(),
            scope = ?classification.impact_scope,
            "Error requires immediate attention"
        );
        if matches!(
            classification.impact_scope,
            ImpactScope::SystemWide | ImpactScope::CrossSystem
        ) {
            self.parts.breakers.force_open_all();
        }
        if classification.severity >= Severity::Critical {
            self.escalate(context, classification);
        }
    }

    fn escalate(&self, context: &ErrorContext, classification: &ErrorClassification) {
        let condition = DegradationCondition::new(
            context.error_id.clone(),
            classification.severity,
            format!("{} on {}", classification.error_type.as_str(), context.agent_id),
        );
        if let Some(transition) = self.parts.degradation.escalate(condition) {
            self.emit(HealingEvent::DegradationChanged { transition });
        }
    }

    async fn recover_single_agent(
        &self,
        context: &ErrorContext,
        classification: &ErrorClassification,
    ) -> RecoveryResult {
        let strategy = RecoveryStrategy::for_classification(classification);
        let breaker = self.parts.breakers.get_or_create(&context.agent_id);
        let executor = &self.parts.executor;
        let plan = &strategy;
        let outcome = breaker
            .call(|| async move {
                let result = executor.execute(plan, context).await;
                if result.success {
                    Ok(result)
                } else {
                    Err(result)
                }
            })
            .await;
        match outcome {
            Ok(result) | Err(CircuitBreakerError::OperationFailed(result)) => result,
            Err(CircuitBreakerError::Open { target }) => RecoveryResult::failed(
                format!("local:{}", strategy.name),
                RecoveryError::CircuitOpen { target }.to_string(),
            ),
        }
    }

    fn spawn_analysis(&self, failure: &AgentFailure, context: &ErrorContext) {
        let analyzer = self.parts.analyzer.clone();
        let events = self.events.clone();
        let failure = failure.clone();
        let context = context.clone();
        tokio::spawn(async move {
            let result = analyzer.analyze(&failure, &context).await;
            debug!(error_id = %result.error_id, causes = result.root_causes.len(), "Background analysis finished");
            let _ = events.send(HealingEvent::AnalysisCompleted {
                result: Box::new(result),
            });
        });
    }

    /// Short-circuit everything: maximum degradation, every breaker open,
    /// failed result. Nothing here can fail.
    fn emergency(
        &self,
        failure: &AgentFailure,
        context: &ErrorContext,
        reason: &str,
        started: Instant,
    ) -> ErrorHandlingResult {
        self.stats.emergencies.fetch_add(1, Ordering::Relaxed);
        error!(
            error_id = %context.error_id,
            agent_id = %context.agent_id,
            reason = %sanitize_for_log(reason),
            "Emergency fallback engaged"
        );
        if let Some(transition) = self.parts.degradation.force_emergency(reason) {
            self.emit(HealingEvent::DegradationChanged { transition });
        }
        self.parts.breakers.force_open_all();
        self.emit(HealingEvent::EmergencyFallback {
            error_id: context.error_id.clone(),
            reason: reason.to_string(),
        });

        let fingerprint = Fingerprint::compute(failure, context);
        ErrorHandlingResult {
            error_id: context.error_id.clone(),
            classification: ErrorClassification::fallback(context, fingerprint.similarity_key()),
            approach: None,
            recovery: RecoveryResult::failed("emergency_fallback", reason),
            analysis: None,
            alerts: Vec::new(),
            degradation_level: DegradationLevel::Emergency,
            emergency: true,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

// ============================================================================
// Assembly
// ============================================================================

/// Concrete components wired from a [`HealingConfig`], with handles kept for
/// feedback and inspection.
pub struct HealingStack {
    pub manager: Arc<ErrorHandlingManager>,
    pub monitor: Arc<ErrorMonitor>,
    pub classifier: Arc<ErrorClassifier>,
    pub analyzer: Arc<RootCauseAnalyzer>,
    pub registry: Arc<ErrorRegistry>,
}

impl HealingStack {
    pub fn build(
        config: &HealingConfig,
        store: Arc<dyn ErrorStore>,
        dispatcher: Arc<dyn AlertDispatcher>,
        handler: Arc<dyn RecoveryHandler>,
        participant: Arc<dyn RecoveryParticipant>,
    ) -> Result<Self> {
        let registry = Arc::new(config.registry.build()?);
        let monitor = Arc::new(ErrorMonitor::new(
            config.monitor.clone(),
            store.clone(),
            dispatcher,
        ));
        let classifier = Arc::new(ErrorClassifier::new(
            registry.clone(),
            store.clone(),
            config.classifier.clone(),
        ));
        let analyzer = Arc::new(RootCauseAnalyzer::new(store, config.analyzer.clone()));
        let parts = ManagerParts {
            recorder: monitor.clone(),
            classifier: classifier.clone(),
            analyzer: analyzer.clone(),
            breakers: Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone())),
            degradation: Arc::new(DegradationManager::new(config.degradation.clone())),
            executor: Arc::new(LocalRecoveryExecutor::new(handler, config.recovery.clone())),
            coordinator: Arc::new(RecoveryCoordinator::new(participant, config.recovery.clone())),
        };
        Ok(Self {
            manager: Arc::new(ErrorHandlingManager::new(config.manager.clone(), parts)),
            monitor,
            classifier,
            analyzer,
            registry,
        })
    }

    /// Everything in memory with default collaborators.
    pub fn in_memory(config: &HealingConfig) -> Result<Self> {
        Self::build(
            config,
            Arc::new(crate::store::InMemoryStore::new()),
            Arc::new(crate::store::TracingDispatcher),
            Arc::new(crate::recovery::NoopRecoveryHandler),
            Arc::new(crate::recovery::NoopParticipant),
        )
    }
}
