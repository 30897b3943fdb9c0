//! Coordinated multi-agent recovery.
//!
//! A session moves through two fan-out phases. Every participant is asked to
//! prepare; those that prepared are asked to recover. Each call is bounded by
//! the participant timeout, and a slow or failing participant never blocks
//! the others.
//!
//! The session succeeds when the failing agent recovered and a strict
//! majority of participants recovered.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

use super::executor::RecoveryStrategy;
use super::{RecoveryConfig, RecoveryResult};
use crate::errors::RecoveryError;
use crate::types::{ErrorClassification, ErrorContext, ImpactScope};

/// Which agents join a coordinated recovery.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentTopology {
    /// Top-level agents brought in for system-wide failures
    pub governance_agents: Vec<String>,
    /// Backups and peers keyed by agent id or agent type
    pub backups: HashMap<String, Vec<String>>,
}

impl AgentTopology {
    /// The failing agent first, then scope-dependent additions, without
    /// duplicates.
    pub fn participants(&self, context: &ErrorContext, scope: ImpactScope) -> Vec<String> {
        let mut participants = vec![context.agent_id.clone()];
        let extra: Vec<&String> = match scope {
            ImpactScope::SystemWide => self.governance_agents.iter().collect(),
            ImpactScope::AgentCluster => self
                .backups
                .get(&context.agent_id)
                .or_else(|| self.backups.get(&context.agent_type))
                .map(|peers| peers.iter().collect())
                .unwrap_or_default(),
            _ => Vec::new(),
        };
        for agent in extra {
            if !participants.contains(agent) {
                participants.push(agent.clone());
            }
        }
        participants
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Preparing,
    Executing,
    Completed,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantOutcome {
    pub agent_id: String,
    pub prepared: bool,
    pub recovered: bool,
    pub actions: Vec<String>,
    pub error: Option<String>,
}

impl ParticipantOutcome {
    fn new(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            prepared: false,
            recovered: false,
            actions: Vec::new(),
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoverySession {
    pub id: String,
    pub error_id: String,
    /// The failing agent
    pub initiator: String,
    pub participants: Vec<String>,
    pub strategy: RecoveryStrategy,
    pub phase: SessionPhase,
    pub outcomes: Vec<ParticipantOutcome>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RecoverySession {
    pub fn recovered_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.recovered).count()
    }

    fn outcome_mut(&mut self, agent_id: &str) -> Option<&mut ParticipantOutcome> {
        self.outcomes.iter_mut().find(|o| o.agent_id == agent_id)
    }
}

/// An agent taking part in coordinated recovery.
#[async_trait]
pub trait RecoveryParticipant: Send + Sync {
    /// Quiesce and confirm readiness.
    async fn prepare(
        &self,
        session: &RecoverySession,
        agent_id: &str,
    ) -> std::result::Result<(), RecoveryError>;

    /// Run the session strategy. Returns the actions performed.
    async fn recover(
        &self,
        session: &RecoverySession,
        agent_id: &str,
    ) -> std::result::Result<Vec<String>, RecoveryError>;
}

/// Participant that agrees to everything and performs the strategy's
/// actions nominally.
#[derive(Debug, Default)]
pub struct NoopParticipant;

#[async_trait]
impl RecoveryParticipant for NoopParticipant {
    async fn prepare(&self, _: &RecoverySession, _: &str) -> std::result::Result<(), RecoveryError> {
        Ok(())
    }

    async fn recover(
        &self,
        session: &RecoverySession,
        _: &str,
    ) -> std::result::Result<Vec<String>, RecoveryError> {
        Ok(session
            .strategy
            .actions
            .iter()
            .map(|a| a.name().to_string())
            .collect())
    }
}

pub struct RecoveryCoordinator {
    participant: Arc<dyn RecoveryParticipant>,
    config: RecoveryConfig,
    sessions: RwLock<VecDeque<RecoverySession>>,
}

impl RecoveryCoordinator {
    pub fn new(participant: Arc<dyn RecoveryParticipant>, config: RecoveryConfig) -> Self {
        Self {
            participant,
            config,
            sessions: RwLock::new(VecDeque::new()),
        }
    }

    pub fn topology(&self) -> &AgentTopology {
        &self.config.topology
    }

    pub async fn coordinate(
        &self,
        context: &ErrorContext,
        classification: &ErrorClassification,
    ) -> RecoveryResult {
        let started = Instant::now();
        let participants = self
            .config
            .topology
            .participants(context, classification.impact_scope);
        let mut session = RecoverySession {
            id: Uuid::new_v4().to_string(),
            error_id: context.error_id.clone(),
            initiator: context.agent_id.clone(),
            outcomes: participants.iter().map(|p| ParticipantOutcome::new(p)).collect(),
            participants,
            strategy: RecoveryStrategy::for_classification(classification),
            phase: SessionPhase::Preparing,
            started_at: Utc::now(),
            completed_at: None,
        };
        info!(
            session_id = %session.id,
            error_id = %session.error_id,
            participants = session.participants.len(),
            "Coordinated recovery session opened"
        );

        let mut side_effects = Vec::new();
        self.prepare_phase(&mut session, &mut side_effects).await;

        let initiator_prepared = session
            .outcomes
            .first()
            .map(|o| o.prepared)
            .unwrap_or(false);
        if initiator_prepared {
            session.phase = SessionPhase::Executing;
            self.execute_phase(&mut session, &mut side_effects).await;
        } else {
            let err = RecoveryError::SessionAborted {
                session_id: session.id.clone(),
                reason: format!("failing agent {} did not prepare", session.initiator),
            };
            warn!(session_id = %session.id, error = %err, "Coordinated recovery aborted");
            side_effects.push(err.to_string());
        }

        let initiator_recovered = session
            .outcomes
            .first()
            .map(|o| o.recovered)
            .unwrap_or(false);
        let majority = session.recovered_count() * 2 > session.participants.len();
        let success = initiator_prepared && initiator_recovered && majority;
        session.phase = if initiator_prepared {
            SessionPhase::Completed
        } else {
            SessionPhase::Aborted
        };
        session.completed_at = Some(Utc::now());

        let actions_executed = session
            .outcomes
            .iter()
            .flat_map(|o| o.actions.iter().map(move |a| format!("{}:{}", o.agent_id, a)))
            .collect();
        let result = RecoveryResult {
            success,
            strategy: format!("coordinated:{}", session.strategy.name),
            actions_executed,
            duration_ms: started.elapsed().as_millis() as u64,
            error_resolved: success,
            rollback_required: !success && session.recovered_count() > 0,
            side_effects,
        };
        info!(
            session_id = %session.id,
            success,
            recovered = session.recovered_count(),
            participants = session.participants.len(),
            "Coordinated recovery session closed"
        );

        let mut sessions = self.sessions.write();
        sessions.push_back(session);
        while sessions.len() > self.config.history_limit.max(1) {
            sessions.pop_front();
        }
        result
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.participant_timeout_ms)
    }

    async fn prepare_phase(&self, session: &mut RecoverySession, side_effects: &mut Vec<String>) {
        let snapshot = session.clone();
        let calls = snapshot.participants.iter().map(|agent| {
            let snapshot = &snapshot;
            async move {
                let outcome = tokio::time::timeout(
                    self.timeout(),
                    self.participant.prepare(snapshot, agent),
                )
                .await;
                (agent.clone(), self.flatten(agent, outcome))
            }
        });
        for (agent, outcome) in join_all(calls).await {
            let Some(slot) = session.outcome_mut(&agent) else {
                continue;
            };
            match outcome {
                Ok(()) => slot.prepared = true,
                Err(e) => {
                    side_effects.push(format!("{agent} failed to prepare: {e}"));
                    slot.error = Some(e.to_string());
                }
            }
        }
    }

    async fn execute_phase(&self, session: &mut RecoverySession, side_effects: &mut Vec<String>) {
        let snapshot = session.clone();
        let ready: Vec<&String> = snapshot
            .outcomes
            .iter()
            .filter(|o| o.prepared)
            .map(|o| &o.agent_id)
            .collect();
        let calls = ready.into_iter().map(|agent| {
            let snapshot = &snapshot;
            async move {
                let outcome = tokio::time::timeout(
                    self.timeout(),
                    self.participant.recover(snapshot, agent),
                )
                .await;
                (agent.clone(), self.flatten(agent, outcome))
            }
        });
        for (agent, outcome) in join_all(calls).await {
            let Some(slot) = session.outcome_mut(&agent) else {
                continue;
            };
            match outcome {
                Ok(actions) => {
                    slot.recovered = true;
                    slot.actions = actions;
                }
                Err(e) => {
                    side_effects.push(format!("{agent} failed to recover: {e}"));
                    slot.error = Some(e.to_string());
                }
            }
        }
    }

    fn flatten<T>(
        &self,
        agent: &str,
        outcome: std::result::Result<std::result::Result<T, RecoveryError>, tokio::time::error::Elapsed>,
    ) -> std::result::Result<T, RecoveryError> {
        match outcome {
            Ok(inner) => inner,
            Err(_) => Err(RecoveryError::ParticipantTimeout {
                agent_id: agent.to_string(),
                millis: self.config.participant_timeout_ms,
            }),
        }
    }

    /// Most recent sessions, oldest first.
    pub fn sessions(&self) -> Vec<RecoverySession> {
        self.sessions.read().iter().cloned().collect()
    }

    pub fn session(&self, id: &str) -> Option<RecoverySession> {
        self.sessions.read().iter().find(|s| s.id == id).cloned()
    }
}
