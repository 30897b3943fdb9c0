//! Time-ordered event timeline around an error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::evidence::{is_own_event, Evidence};
use crate::types::{AgentFailure, ErrorContext, Severity, SystemEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineSource {
    /// The analysed error itself.
    Error,
    Evidence,
    Related,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub agent_id: String,
    pub event_type: String,
    pub severity: Severity,
    pub description: String,
    pub source: TimelineSource,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventTimeline {
    pub events: Vec<TimelineEvent>,
}

impl EventTimeline {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn start(&self) -> Option<DateTime<Utc>> {
        self.events.first().map(|e| e.timestamp)
    }

    pub fn end(&self) -> Option<DateTime<Utc>> {
        self.events.last().map(|e| e.timestamp)
    }

    pub fn error_event(&self) -> Option<&TimelineEvent> {
        self.events.iter().find(|e| e.source == TimelineSource::Error)
    }

    /// Every event other than the analysed error.
    pub fn others(&self) -> impl Iterator<Item = &TimelineEvent> {
        self.events
            .iter()
            .filter(|e| e.source != TimelineSource::Error)
    }
}

/// Merge the error, evidence events and related events into one sequence
/// sorted by time. When over `max_events`, the events nearest the error
/// are kept.
pub fn build(
    failure: &AgentFailure,
    context: &ErrorContext,
    evidence: &[Evidence],
    related: &[SystemEvent],
    max_events: usize,
) -> EventTimeline {
    let mut seen: HashSet<String> = HashSet::new();
    let mut events = vec![TimelineEvent {
        id: context.error_id.clone(),
        timestamp: context.timestamp,
        agent_id: context.agent_id.clone(),
        event_type: "error".to_string(),
        severity: Severity::Medium,
        description: format!("{}: {}", failure.name, failure.message),
        source: TimelineSource::Error,
    }];
    seen.insert(context.error_id.clone());

    for item in evidence.iter().filter(|e| e.is_event()) {
        if !seen.insert(item.id.clone()) {
            continue;
        }
        events.push(TimelineEvent {
            id: item.id.clone(),
            timestamp: item.timestamp,
            agent_id: item.agent_id.clone().unwrap_or_default(),
            event_type: item.event_type.clone().unwrap_or_else(|| "log".to_string()),
            severity: item.severity.unwrap_or(Severity::Low),
            description: item.description.clone(),
            source: TimelineSource::Evidence,
        });
    }

    for event in related.iter().filter(|e| !is_own_event(e, context)) {
        if !seen.insert(event.id.clone()) {
            continue;
        }
        events.push(TimelineEvent {
            id: event.id.clone(),
            timestamp: event.timestamp,
            agent_id: event.agent_id.clone(),
            event_type: event.event_type.clone(),
            severity: event.severity,
            description: event.message.clone(),
            source: TimelineSource::Related,
        });
    }

    if events.len() > max_events.max(1) {
        events.sort_by_key(|e| {
            (
                e.source != TimelineSource::Error,
                (e.timestamp - context.timestamp).num_milliseconds().abs(),
            )
        });
        events.truncate(max_events.max(1));
    }
    events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
    EventTimeline { events }
}
