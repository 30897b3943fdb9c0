//! Local recovery: an ordered action list run through a host-supplied
//! handler, each action under its own timeout with bounded retries.

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{RecoveryConfig, RecoveryResult};
use crate::errors::RecoveryError;
use crate::types::{ErrorClassification, ErrorContext, ErrorType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecoveryActionKind {
    Retry { delay_ms: u64 },
    RestartAgent,
    ClearCache,
    ResetConnections,
    ReleaseResources,
    RefreshCredentials,
    ReloadConfiguration,
    Failover { target: String },
    Throttle { factor: f64 },
    ValidateData,
    ResyncState,
    /// Hand the error to an operator.
    Escalate,
    Custom {
        name: String,
        #[serde(default)]
        params: HashMap<String, String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAction {
    #[serde(flatten)]
    pub kind: RecoveryActionKind,
    /// Overrides the executor's default action timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl RecoveryAction {
    pub fn new(kind: RecoveryActionKind) -> Self {
        Self {
            kind,
            timeout_ms: None,
        }
    }

    pub fn with_timeout_ms(mut self, millis: u64) -> Self {
        self.timeout_ms = Some(millis);
        self
    }

    pub fn name(&self) -> &str {
        match &self.kind {
            RecoveryActionKind::Retry { .. } => "retry",
            RecoveryActionKind::RestartAgent => "restart_agent",
            RecoveryActionKind::ClearCache => "clear_cache",
            RecoveryActionKind::ResetConnections => "reset_connections",
            RecoveryActionKind::ReleaseResources => "release_resources",
            RecoveryActionKind::RefreshCredentials => "refresh_credentials",
            RecoveryActionKind::ReloadConfiguration => "reload_configuration",
            RecoveryActionKind::Failover { .. } => "failover",
            RecoveryActionKind::Throttle { .. } => "throttle",
            RecoveryActionKind::ValidateData => "validate_data",
            RecoveryActionKind::ResyncState => "resync_state",
            RecoveryActionKind::Escalate => "escalate",
            RecoveryActionKind::Custom { name, .. } => name.as_str(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStrategy {
    pub name: String,
    pub description: String,
    pub actions: Vec<RecoveryAction>,
}

impl RecoveryStrategy {
    /// Ordered actions for the classified error type.
    pub fn for_classification(classification: &ErrorClassification) -> Self {
        use RecoveryActionKind::*;
        let retry = |delay_ms| Retry { delay_ms };
        let (name, description, kinds) = match classification.error_type {
            ErrorType::DatabaseError => (
                "reset_connections",
                "Reset database connections and retry",
                vec![ResetConnections, retry(500)],
            ),
            ErrorType::NetworkError => (
                "reconnect",
                "Re-establish network connections and retry",
                vec![ResetConnections, retry(1_000)],
            ),
            ErrorType::ResourceExhaustion => (
                "free_resources",
                "Release resources, clear caches and restart if needed",
                vec![ReleaseResources, ClearCache, RestartAgent],
            ),
            ErrorType::ValidationError => (
                "validate_input",
                "Validate the offending data",
                vec![ValidateData],
            ),
            ErrorType::AuthenticationError => (
                "refresh_credentials",
                "Refresh credentials and retry",
                vec![RefreshCredentials, retry(500)],
            ),
            ErrorType::RateLimitError => (
                "throttle",
                "Throttle outbound requests and retry later",
                vec![Throttle { factor: 0.5 }, retry(5_000)],
            ),
            ErrorType::TimeoutError => ("retry", "Retry the operation", vec![retry(1_000)]),
            ErrorType::DependencyError => (
                "failover",
                "Fail over to the backup dependency",
                vec![
                    Failover {
                        target: "backup".to_string(),
                    },
                    retry(1_000),
                ],
            ),
            ErrorType::ConfigurationError => (
                "reload_configuration",
                "Reload configuration from its source",
                vec![ReloadConfiguration],
            ),
            ErrorType::BusinessLogicError => (
                "escalate",
                "Escalate to an operator",
                vec![Escalate],
            ),
            ErrorType::DataCorruptionError => (
                "repair_data",
                "Validate and resynchronise corrupted state",
                vec![ValidateData, ResyncState],
            ),
            ErrorType::ProtocolError => (
                "reset_protocol",
                "Reset connections to renegotiate the protocol",
                vec![ResetConnections],
            ),
            ErrorType::AgentCoordinationError => (
                "resync_agents",
                "Resynchronise agent state and restart the agent",
                vec![ResyncState, RestartAgent],
            ),
            ErrorType::SystemError => ("restart", "Restart the agent", vec![RestartAgent]),
        };
        Self {
            name: name.to_string(),
            description: description.to_string(),
            actions: kinds.into_iter().map(RecoveryAction::new).collect(),
        }
    }
}

/// Performs recovery actions on behalf of the pipeline.
#[async_trait]
pub trait RecoveryHandler: Send + Sync {
    async fn execute(
        &self,
        action: &RecoveryAction,
        context: &ErrorContext,
    ) -> std::result::Result<(), RecoveryError>;
}

/// Handler that accepts every action. Used when the host registers none.
#[derive(Debug, Default)]
pub struct NoopRecoveryHandler;

#[async_trait]
impl RecoveryHandler for NoopRecoveryHandler {
    async fn execute(
        &self,
        action: &RecoveryAction,
        context: &ErrorContext,
    ) -> std::result::Result<(), RecoveryError> {
        debug!(error_id = %context.error_id, action = action.name(), "No-op recovery action");
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ExecutorStats {
    executions: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSummary {
    pub executions: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    pub success_rate: f64,
}

pub struct LocalRecoveryExecutor {
    handler: Arc<dyn RecoveryHandler>,
    config: RecoveryConfig,
    history: RwLock<VecDeque<RecoveryResult>>,
    stats: ExecutorStats,
}

impl LocalRecoveryExecutor {
    pub fn new(handler: Arc<dyn RecoveryHandler>, config: RecoveryConfig) -> Self {
        Self {
            handler,
            config,
            history: RwLock::new(VecDeque::new()),
            stats: ExecutorStats::default(),
        }
    }

    /// Exponential backoff before retry `attempt` (1-based), capped, plus
    /// random jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = self
            .config
            .backoff_base_ms
            .saturating_mul(1u64 << (attempt - 1).min(20));
        let capped = exp.min(self.config.backoff_max_ms);
        let jitter_range = (capped as f64 * self.config.jitter_factor.clamp(0.0, 1.0)) as u64;
        let jitter = if jitter_range > 0 {
            rand::rng().random_range(0..=jitter_range)
        } else {
            0
        };
        Duration::from_millis(capped + jitter)
    }

    /// Run every action in order. The first action that fails all its
    /// attempts stops the strategy; earlier completed actions then require
    /// rollback.
    pub async fn execute(&self, strategy: &RecoveryStrategy, context: &ErrorContext) -> RecoveryResult {
        let started = Instant::now();
        self.stats.executions.fetch_add(1, Ordering::Relaxed);

        let mut actions_executed = Vec::new();
        let mut side_effects = Vec::new();
        let mut success = true;

        for action in &strategy.actions {
            match self.run_action(action, context, &mut side_effects).await {
                Ok(()) => actions_executed.push(action.name().to_string()),
                Err(e) => {
                    warn!(
                        error_id = %context.error_id,
                        action = action.name(),
                        error = %e,
                        "Recovery action exhausted its attempts"
                    );
                    success = false;
                    break;
                }
            }
        }

        let result = RecoveryResult {
            success,
            strategy: format!("local:{}", strategy.name),
            rollback_required: !success && !actions_executed.is_empty(),
            actions_executed,
            duration_ms: started.elapsed().as_millis() as u64,
            error_resolved: success,
            side_effects,
        };

        if success {
            self.stats.successes.fetch_add(1, Ordering::Relaxed);
            info!(error_id = %context.error_id, strategy = %result.strategy, "Local recovery succeeded");
        } else {
            self.stats.failures.fetch_add(1, Ordering::Relaxed);
        }

        let mut history = self.history.write();
        history.push_back(result.clone());
        while history.len() > self.config.history_limit.max(1) {
            history.pop_front();
        }
        result
    }

    async fn run_action(
        &self,
        action: &RecoveryAction,
        context: &ErrorContext,
        side_effects: &mut Vec<String>,
    ) -> std::result::Result<(), RecoveryError> {
        let attempts = self.config.retry_attempts.max(1);
        let millis = action.timeout_ms.unwrap_or(self.config.action_timeout_ms);
        let timeout = Duration::from_millis(millis);
        let mut last_error = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                self.stats.retries.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(self.backoff_delay(attempt - 1)).await;
            }
            let outcome = match tokio::time::timeout(timeout, self.handler.execute(action, context)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(RecoveryError::ActionTimeout {
                    action: action.name().to_string(),
                    millis,
                }),
            };
            match outcome {
                Ok(()) => return Ok(()),
                Err(e) => {
                    side_effects.push(format!("{} attempt {}/{} failed: {}", action.name(), attempt, attempts, e));
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| RecoveryError::ActionFailed {
            action: action.name().to_string(),
            message: "no attempts made".to_string(),
        }))
    }

    pub fn history(&self) -> Vec<RecoveryResult> {
        self.history.read().iter().cloned().collect()
    }

    pub fn summary(&self) -> ExecutorSummary {
        let executions = self.stats.executions.load(Ordering::Relaxed);
        let successes = self.stats.successes.load(Ordering::Relaxed);
        ExecutorSummary {
            executions,
            successes,
            failures: self.stats.failures.load(Ordering::Relaxed),
            retries: self.stats.retries.load(Ordering::Relaxed),
            success_rate: if executions > 0 {
                successes as f64 / executions as f64
            } else {
                0.0
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Fails the named action a fixed number of times, then succeeds.
    struct FlakyHandler {
        action: &'static str,
        failures_left: Mutex<u32>,
        calls: Mutex<Vec<String>>,
    }

    impl FlakyHandler {
        fn new(action: &'static str, failures: u32) -> Self {
            Self {
                action,
                failures_left: Mutex::new(failures),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RecoveryHandler for FlakyHandler {
        async fn execute(
            &self,
            action: &RecoveryAction,
            _context: &ErrorContext,
        ) -> std::result::Result<(), RecoveryError> {
            self.calls.lock().push(action.name().to_string());
            if action.name() == self.action {
                let mut left = self.failures_left.lock();
                if *left > 0 {
                    *left -= 1;
                    return Err(RecoveryError::ActionFailed {
                        action: action.name().to_string(),
                        message: "pool busy".to_string(),
                    });
                }
            }
            Ok(())
        }
    }

    struct SlowHandler;

    #[async_trait]
    impl RecoveryHandler for SlowHandler {
        async fn execute(
            &self,
            _action: &RecoveryAction,
            _context: &ErrorContext,
        ) -> std::result::Result<(), RecoveryError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
    }

    fn fast_config(retry_attempts: u32) -> RecoveryConfig {
        RecoveryConfig {
            retry_attempts,
            backoff_base_ms: 1,
            backoff_max_ms: 5,
            jitter_factor: 0.0,
            ..RecoveryConfig::default()
        }
    }

    fn classification(error_type: ErrorType) -> ErrorClassification {
        let mut c = ErrorClassification::fallback(&ErrorContext::new("a", "worker"), "fp");
        c.error_type = error_type;
        c
    }

    #[test]
    fn test_strategy_per_error_type() {
        let s = RecoveryStrategy::for_classification(&classification(ErrorType::DatabaseError));
        let names: Vec<_> = s.actions.iter().map(|a| a.name()).collect();
        assert_eq!(names, vec!["reset_connections", "retry"]);

        for ty in ErrorType::ALL {
            assert!(!RecoveryStrategy::for_classification(&classification(ty))
                .actions
                .is_empty());
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let executor = LocalRecoveryExecutor::new(
            Arc::new(NoopRecoveryHandler),
            RecoveryConfig {
                backoff_base_ms: 100,
                backoff_max_ms: 350,
                jitter_factor: 0.0,
                ..RecoveryConfig::default()
            },
        );
        assert_eq!(executor.backoff_delay(0), Duration::ZERO);
        assert_eq!(executor.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(executor.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(executor.backoff_delay(3), Duration::from_millis(350));
        assert_eq!(executor.backoff_delay(40), Duration::from_millis(350));
    }

    #[test]
    fn test_backoff_jitter_bounded() {
        let executor = LocalRecoveryExecutor::new(
            Arc::new(NoopRecoveryHandler),
            RecoveryConfig {
                backoff_base_ms: 100,
                jitter_factor: 0.5,
                ..RecoveryConfig::default()
            },
        );
        for _ in 0..20 {
            let d = executor.backoff_delay(1).as_millis();
            assert!((100..=150).contains(&d));
        }
    }

    #[tokio::test]
    async fn test_retry_then_success_records_side_effects() {
        let handler = Arc::new(FlakyHandler::new("reset_connections", 2));
        let executor = LocalRecoveryExecutor::new(handler.clone(), fast_config(3));
        let strategy = RecoveryStrategy::for_classification(&classification(ErrorType::DatabaseError));
        let result = executor.execute(&strategy, &ErrorContext::new("a", "worker")).await;

        assert!(result.success && result.error_resolved);
        assert_eq!(result.strategy, "local:reset_connections");
        assert_eq!(result.actions_executed, vec!["reset_connections", "retry"]);
        assert_eq!(result.side_effects.len(), 2);
        assert_eq!(handler.calls.lock().len(), 4);
        assert_eq!(executor.summary().retries, 2);
    }

    #[tokio::test]
    async fn test_exhausted_action_stops_and_flags_rollback() {
        let handler = Arc::new(FlakyHandler::new("clear_cache", 10));
        let executor = LocalRecoveryExecutor::new(handler.clone(), fast_config(2));
        let strategy =
            RecoveryStrategy::for_classification(&classification(ErrorType::ResourceExhaustion));
        let result = executor.execute(&strategy, &ErrorContext::new("a", "worker")).await;

        assert!(!result.success);
        assert!(!result.error_resolved);
        assert!(result.rollback_required);
        assert_eq!(result.actions_executed, vec!["release_resources"]);
        assert!(!handler.calls.lock().contains(&"restart_agent".to_string()));
        assert_eq!(executor.summary().failures, 1);
        assert_eq!(executor.history().len(), 1);
    }

    #[tokio::test]
    async fn test_action_timeout_is_a_failure() {
        let executor = LocalRecoveryExecutor::new(Arc::new(SlowHandler), fast_config(1));
        let strategy = RecoveryStrategy {
            name: "slow".into(),
            description: String::new(),
            actions: vec![RecoveryAction::new(RecoveryActionKind::RestartAgent).with_timeout_ms(20)],
        };
        let result = executor.execute(&strategy, &ErrorContext::new("a", "worker")).await;
        assert!(!result.success);
        assert!(!result.rollback_required);
        assert!(result.side_effects[0].contains("timed out after 20ms"));
    }

    #[test]
    fn test_action_serde_shape() {
        let action: RecoveryAction =
            serde_json::from_str(r#"{"kind":"failover","target":"replica","timeout_ms":250}"#).unwrap();
        assert_eq!(action.name(), "failover");
        assert_eq!(action.timeout_ms, Some(250));
    }
}
