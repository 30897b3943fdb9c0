//! Recovery subsystem tests: breakers, the local executor, coordinated
//! sessions and the degradation ladder working together.

use async_trait::async_trait;
use parking_lot::Mutex;
use selfmend::errors::RecoveryError;
use selfmend::recovery::{
    AgentTopology, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerRegistry,
    CircuitState, DegradationCondition, DegradationConfig, DegradationLevel, DegradationManager,
    LocalRecoveryExecutor, RecoveryAction, RecoveryActionKind, RecoveryConfig,
    RecoveryCoordinator, RecoveryHandler, RecoveryParticipant, RecoverySession, RecoveryStrategy,
    SessionPhase,
};
use selfmend::types::{ErrorClassification, ErrorContext, ErrorType, ImpactScope, Severity};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

fn fast_config() -> RecoveryConfig {
    RecoveryConfig {
        retry_attempts: 2,
        backoff_base_ms: 1,
        backoff_max_ms: 2,
        jitter_factor: 0.0,
        action_timeout_ms: 200,
        participant_timeout_ms: 100,
        ..Default::default()
    }
}

fn classification(ctx: &ErrorContext, error_type: ErrorType, scope: ImpactScope) -> ErrorClassification {
    let mut c = ErrorClassification::fallback(ctx, "fp");
    c.error_type = error_type;
    c.impact_scope = scope;
    c.is_retryable = true;
    c
}

// ============================================================================
// Circuit breakers
// ============================================================================

mod breaker_tests {
    use super::*;

    #[tokio::test]
    async fn test_registry_shares_breaker_per_target() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            min_throughput: 2,
            error_threshold_pct: 50.0,
            recovery_timeout_ms: 60_000,
            ..Default::default()
        });
        let a = registry.get_or_create("worker-1");
        let b = registry.get_or_create("worker-1");
        assert!(Arc::ptr_eq(&a, &b));

        for _ in 0..2 {
            let _ = a.call(|| async { Err::<(), _>("boom") }).await;
        }
        assert_eq!(b.current_state(), CircuitState::Open);

        let rejected = b.call(|| async { Ok::<_, &str>(1) }).await;
        assert!(matches!(rejected, Err(CircuitBreakerError::Open { .. })));

        // Other targets are unaffected.
        let other = registry.get_or_create("worker-2");
        assert_eq!(other.current_state(), CircuitState::Closed);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_force_open_all_then_reset() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default());
        registry.get_or_create("a");
        registry.get_or_create("b");
        assert_eq!(registry.force_open_all(), 2);
        assert!(registry
            .summaries()
            .iter()
            .all(|m| m.state == CircuitState::Open));

        registry.reset_all();
        assert!(registry
            .summaries()
            .iter()
            .all(|m| m.state == CircuitState::Closed));
    }

    #[tokio::test]
    async fn test_half_open_probe_closes_circuit() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            recovery_timeout_ms: 20,
            ..Default::default()
        });
        let breaker = registry.get_or_create("api");
        breaker.force_open();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(breaker.current_state(), CircuitState::HalfOpen);

        let probe = breaker.call(|| async { Ok::<_, String>("ok") }).await;
        assert_eq!(probe.unwrap(), "ok");
        assert_eq!(breaker.current_state(), CircuitState::Closed);
    }
}

// ============================================================================
// Local executor
// ============================================================================

/// Fails the named actions, records everything it was asked to do.
struct ScriptedHandler {
    failing: HashSet<String>,
    seen: Mutex<Vec<String>>,
}

impl ScriptedHandler {
    fn failing(actions: &[&str]) -> Self {
        Self {
            failing: actions.iter().map(|a| a.to_string()).collect(),
            seen: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl RecoveryHandler for ScriptedHandler {
    async fn execute(&self, action: &RecoveryAction, _: &ErrorContext) -> Result<(), RecoveryError> {
        self.seen.lock().push(action.name().to_string());
        if self.failing.contains(action.name()) {
            return Err(RecoveryError::ActionFailed {
                action: action.name().to_string(),
                message: "refused".to_string(),
            });
        }
        Ok(())
    }
}

mod executor_tests {
    use super::*;

    #[tokio::test]
    async fn test_database_strategy_runs_in_order() {
        let handler = Arc::new(ScriptedHandler::failing(&[]));
        let executor = LocalRecoveryExecutor::new(handler.clone(), fast_config());
        let ctx = ErrorContext::new("db-1", "db");
        let strategy = RecoveryStrategy::for_classification(&classification(
            &ctx,
            ErrorType::DatabaseError,
            ImpactScope::SingleAgent,
        ));

        let result = executor.execute(&strategy, &ctx).await;
        assert!(result.success);
        assert!(result.error_resolved);
        assert_eq!(result.strategy, "local:reset_connections");
        assert_eq!(*handler.seen.lock(), result.actions_executed);
        assert!(result.side_effects.is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_action_stops_and_flags_rollback() {
        let handler = Arc::new(ScriptedHandler::failing(&["clear_cache"]));
        let executor = LocalRecoveryExecutor::new(handler.clone(), fast_config());
        let ctx = ErrorContext::new("w-1", "worker");
        let strategy = RecoveryStrategy::for_classification(&classification(
            &ctx,
            ErrorType::ResourceExhaustion,
            ImpactScope::SingleAgent,
        ));

        let result = executor.execute(&strategy, &ctx).await;
        assert!(!result.success);
        assert!(result.rollback_required);
        assert_eq!(result.actions_executed, vec!["release_resources"]);
        assert_eq!(result.side_effects.len(), 2);
        assert!(result.side_effects[1].contains("attempt 2/2"));
        // restart_agent never ran
        assert!(!handler.seen.lock().iter().any(|a| a == "restart_agent"));
        assert_eq!(executor.summary().failures, 1);
    }

    #[tokio::test]
    async fn test_custom_action_serializes_with_kind_tag() {
        let action = RecoveryAction::new(RecoveryActionKind::Custom {
            name: "drain_queue".into(),
            params: HashMap::from([("queue".to_string(), "ingest".to_string())]),
        })
        .with_timeout_ms(50);
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["kind"], "custom");
        assert_eq!(json["timeout_ms"], 50);
        assert_eq!(action.name(), "drain_queue");
    }
}

// ============================================================================
// Coordinated sessions
// ============================================================================

/// Participant with per-agent behaviour.
#[derive(Default)]
struct FleetParticipant {
    refuse_prepare: HashSet<String>,
    hang_recover: HashSet<String>,
}

#[async_trait]
impl RecoveryParticipant for FleetParticipant {
    async fn prepare(&self, _: &RecoverySession, agent_id: &str) -> Result<(), RecoveryError> {
        if self.refuse_prepare.contains(agent_id) {
            return Err(RecoveryError::ActionFailed {
                action: "prepare".into(),
                message: "busy".into(),
            });
        }
        Ok(())
    }

    async fn recover(&self, session: &RecoverySession, agent_id: &str) -> Result<Vec<String>, RecoveryError> {
        if self.hang_recover.contains(agent_id) {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        Ok(session
            .strategy
            .actions
            .iter()
            .map(|a| a.name().to_string())
            .collect())
    }
}

fn cluster_topology() -> AgentTopology {
    AgentTopology {
        governance_agents: vec!["governor".into()],
        backups: HashMap::from([(
            "worker".to_string(),
            vec!["worker-2".to_string(), "worker-3".to_string()],
        )]),
    }
}

mod coordinator_tests {
    use super::*;

    #[tokio::test]
    async fn test_cluster_session_tolerates_one_slow_peer() {
        let participant = FleetParticipant {
            hang_recover: HashSet::from(["worker-3".to_string()]),
            ..Default::default()
        };
        let coordinator = RecoveryCoordinator::new(
            Arc::new(participant),
            RecoveryConfig {
                topology: cluster_topology(),
                ..fast_config()
            },
        );
        let ctx = ErrorContext::new("worker-1", "worker");
        let result = coordinator
            .coordinate(
                &ctx,
                &classification(&ctx, ErrorType::AgentCoordinationError, ImpactScope::AgentCluster),
            )
            .await;

        assert!(result.success);
        assert_eq!(result.strategy, "coordinated:resync_agents");
        assert!(result.actions_executed.contains(&"worker-1:resync_state".to_string()));
        assert!(result
            .side_effects
            .iter()
            .any(|s| s.contains("worker-3") && s.contains("100ms")));

        let session = &coordinator.sessions()[0];
        assert_eq!(session.participants, vec!["worker-1", "worker-2", "worker-3"]);
        assert_eq!(session.phase, SessionPhase::Completed);
        assert_eq!(session.recovered_count(), 2);
    }

    #[tokio::test]
    async fn test_initiator_refusing_prepare_aborts() {
        let participant = FleetParticipant {
            refuse_prepare: HashSet::from(["worker-1".to_string()]),
            ..Default::default()
        };
        let coordinator = RecoveryCoordinator::new(
            Arc::new(participant),
            RecoveryConfig {
                topology: cluster_topology(),
                ..fast_config()
            },
        );
        let ctx = ErrorContext::new("worker-1", "worker");
        let result = coordinator
            .coordinate(&ctx, &classification(&ctx, ErrorType::SystemError, ImpactScope::SystemWide))
            .await;

        assert!(!result.success);
        assert!(result.actions_executed.is_empty());
        let session = coordinator.sessions().pop().unwrap();
        assert_eq!(session.phase, SessionPhase::Aborted);
        assert_eq!(session.participants, vec!["worker-1", "governor"]);
        assert!(coordinator.session(&session.id).is_some());
    }
}

// ============================================================================
// Degradation ladder
// ============================================================================

mod degradation_tests {
    use super::*;

    #[test]
    fn test_ladder_climbs_and_steps_down_once_clear() {
        let ladder = DegradationManager::new(DegradationConfig::default());
        ladder.escalate(DegradationCondition::new("e-1", Severity::Critical, "oom on worker-1"));
        assert_eq!(ladder.level(), DegradationLevel::Minimal);
        assert!(!ladder.level().allows_non_critical_work());

        // Blocked while the condition is active.
        assert!(ladder.recover().is_none());
        assert!(ladder.clear_condition("e-1"));

        let step = ladder.recover().unwrap();
        assert_eq!(step.from, DegradationLevel::Minimal);
        assert_eq!(step.to, DegradationLevel::Reduced);
        ladder.recover();
        assert_eq!(ladder.level(), DegradationLevel::Normal);
        assert_eq!(ladder.history().len(), 3);
    }

    #[test]
    fn test_force_emergency_sheds_load() {
        let ladder = DegradationManager::new(DegradationConfig::default());
        ladder.force_emergency("store unreachable");
        let summary = ladder.summary();
        assert_eq!(summary.level, DegradationLevel::Emergency);
        assert_eq!(summary.concurrency_factor, 0.1);
        assert!(ladder.recover().is_none());
    }
}
