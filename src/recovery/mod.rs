//! Recovery Subsystem
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Recovery Subsystem                       │
//! │  ┌───────────────┐  ┌───────────────┐  ┌───────────────┐    │
//! │  │ Circuit       │  │ Local         │  │ Recovery      │    │
//! │  │ Breakers      │─►│ Executor      │  │ Coordinator   │    │
//! │  │ (per target)  │  │ (actions)     │  │ (sessions)    │    │
//! │  └───────────────┘  └───────────────┘  └───────────────┘    │
//! │                  ┌───────────────────┐                      │
//! │                  │ Degradation Ladder│                      │
//! │                  └───────────────────┘                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Breakers and the ladder are plain values owned by whoever builds the
//! manager; nothing here is process-global.

pub mod circuit_breaker;
pub mod coordinator;
pub mod degradation;
pub mod executor;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerMetrics,
    CircuitBreakerRegistry, CircuitState,
};
pub use coordinator::{
    AgentTopology, NoopParticipant, ParticipantOutcome, RecoveryCoordinator, RecoveryParticipant,
    RecoverySession, SessionPhase,
};
pub use degradation::{
    DegradationCondition, DegradationConfig, DegradationLevel, DegradationManager,
    DegradationSummary, DegradationTransition,
};
pub use executor::{
    LocalRecoveryExecutor, NoopRecoveryHandler, RecoveryAction, RecoveryActionKind,
    RecoveryHandler, RecoveryStrategy,
};

use serde::{Deserialize, Serialize};

/// Outcome of any recovery approach.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryResult {
    pub success: bool,
    /// Strategy descriptor, e.g. `local:reset_connections` or `coordinated`.
    pub strategy: String,
    /// Executed actions in order.
    pub actions_executed: Vec<String>,
    pub duration_ms: u64,
    pub error_resolved: bool,
    pub side_effects: Vec<String>,
    pub rollback_required: bool,
}

impl RecoveryResult {
    pub fn failed(strategy: impl Into<String>, side_effect: impl Into<String>) -> Self {
        Self {
            success: false,
            strategy: strategy.into(),
            actions_executed: Vec::new(),
            duration_ms: 0,
            error_resolved: false,
            side_effects: vec![side_effect.into()],
            rollback_required: false,
        }
    }

    /// The system was degraded but the error itself is not resolved.
    pub fn degraded(level: DegradationLevel) -> Self {
        Self {
            success: false,
            strategy: "degradation_only".to_string(),
            actions_executed: vec![format!("escalate_degradation:{}", level.as_str())],
            duration_ms: 0,
            error_resolved: false,
            side_effects: vec![format!("system degraded to {}", level.as_str())],
            rollback_required: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Attempts per action before it counts as failed
    pub retry_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Random extra delay as a fraction of the backoff, in [0,1]
    pub jitter_factor: f64,
    /// Per-action timeout unless the action carries its own
    pub action_timeout_ms: u64,
    pub participant_timeout_ms: u64,
    pub history_limit: usize,
    pub topology: AgentTopology,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            backoff_base_ms: 100,
            backoff_max_ms: 5_000,
            jitter_factor: 0.1,
            action_timeout_ms: 5_000,
            participant_timeout_ms: 5_000,
            history_limit: 100,
            topology: AgentTopology::default(),
        }
    }
}
