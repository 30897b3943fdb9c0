//! Evidence collection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AgentFailure, ErrorContext, Severity, SystemEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    ErrorMessage,
    LogEntry,
    MetricAnomaly,
    StackTrace,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub id: String,
    pub kind: EvidenceKind,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    /// Relevance to the analysed error in [0,1].
    pub relevance: f64,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub severity: Option<Severity>,
    #[serde(default)]
    pub event_type: Option<String>,
}

impl Evidence {
    pub fn is_event(&self) -> bool {
        self.kind == EvidenceKind::LogEntry
    }
}

/// Thresholds above which an environment reading counts as an anomaly.
pub const MEMORY_ANOMALY_PCT: f64 = 85.0;
pub const CPU_ANOMALY_PCT: f64 = 85.0;
pub const CONNECTION_ANOMALY: u32 = 900;
pub const RESPONSE_ANOMALY_MS: f64 = 5_000.0;

const SAME_AGENT_BONUS: f64 = 0.2;

/// Whether an event belongs to the analysed error itself.
pub fn is_own_event(event: &SystemEvent, context: &ErrorContext) -> bool {
    event.id == context.error_id
        || event
            .metadata
            .get("error_id")
            .and_then(|v| v.as_str())
            .map(|id| id == context.error_id)
            .unwrap_or(false)
}

/// Turn nearby problem events into evidence. `before_secs` and
/// `after_secs` are the window sides used for relevance decay.
pub fn from_events(
    events: &[SystemEvent],
    context: &ErrorContext,
    before_secs: u64,
    after_secs: u64,
) -> Vec<Evidence> {
    events
        .iter()
        .filter(|e| !is_own_event(e, context))
        .filter(|e| e.level.is_problem() || e.message.to_lowercase().contains("error"))
        .map(|e| {
            let dt = (e.timestamp - context.timestamp).num_milliseconds() as f64 / 1000.0;
            let side = (if dt < 0.0 { before_secs } else { after_secs }) as f64;
            let proximity = if side > 0.0 {
                (1.0 - dt.abs() / side).max(0.0)
            } else {
                0.0
            };
            let bonus = if e.agent_id == context.agent_id {
                SAME_AGENT_BONUS
            } else {
                0.0
            };
            Evidence {
                id: e.id.clone(),
                kind: EvidenceKind::LogEntry,
                description: e.message.clone(),
                timestamp: e.timestamp,
                relevance: (proximity + bonus).clamp(0.0, 1.0),
                agent_id: Some(e.agent_id.clone()),
                severity: Some(e.severity),
                event_type: Some(e.event_type.clone()),
            }
        })
        .collect()
}

/// Evidence derived from the failure itself and the environment snapshot.
pub fn from_context(failure: &AgentFailure, context: &ErrorContext) -> Vec<Evidence> {
    let env = &context.environment;
    let mut evidence = vec![Evidence {
        id: format!("{}:message", context.error_id),
        kind: EvidenceKind::ErrorMessage,
        description: format!("{}: {}", failure.name, failure.message),
        timestamp: context.timestamp,
        relevance: 1.0,
        agent_id: Some(context.agent_id.clone()),
        severity: None,
        event_type: None,
    }];

    let mut metric = |name: &str, description: String, relevance: f64| {
        evidence.push(Evidence {
            id: format!("{}:{}", context.error_id, name),
            kind: EvidenceKind::MetricAnomaly,
            description,
            timestamp: context.timestamp,
            relevance,
            agent_id: Some(context.agent_id.clone()),
            severity: None,
            event_type: Some(name.to_string()),
        });
    };
    if env.memory_usage > MEMORY_ANOMALY_PCT {
        metric(
            "memory_usage",
            format!("High memory usage: {:.1}%", env.memory_usage),
            0.9,
        );
    }
    if env.cpu_usage > CPU_ANOMALY_PCT {
        metric(
            "cpu_usage",
            format!("High CPU usage: {:.1}%", env.cpu_usage),
            0.8,
        );
    }
    if env.active_connections > CONNECTION_ANOMALY {
        metric(
            "active_connections",
            format!("High connection count: {}", env.active_connections),
            0.7,
        );
    }
    if env.response_time_ms > RESPONSE_ANOMALY_MS {
        metric(
            "response_time",
            format!("Slow responses: {:.0}ms", env.response_time_ms),
            0.6,
        );
    }

    if let Some(stack) = context.stack_trace.as_deref().filter(|s| !s.trim().is_empty()) {
        evidence.push(Evidence {
            id: format!("{}:stack", context.error_id),
            kind: EvidenceKind::StackTrace,
            description: stack.to_string(),
            timestamp: context.timestamp,
            relevance: 0.7,
            agent_id: Some(context.agent_id.clone()),
            severity: None,
            event_type: None,
        });
    }
    evidence
}
