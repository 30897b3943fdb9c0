//! Event correlation.
//!
//! Strengths are in [0,1]. Anything above [`CAUSAL_THRESHOLD`] is labelled
//! causal, everything else coincidental.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::timeline::{EventTimeline, TimelineEvent};
use crate::types::Severity;

pub const TEMPORAL_WINDOW_SECS: f64 = 30.0;
pub const PAIRWISE_WINDOW_SECS: f64 = 300.0;
pub const CAUSAL_THRESHOLD: f64 = 0.7;
pub const PAIRWISE_MIN_STRENGTH: f64 = 0.5;
/// Correlations above this feed root-cause identification.
pub const STRONG_THRESHOLD: f64 = 0.8;
const MAX_PAIRWISE_EVENTS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationType {
    Temporal,
    AgentBased,
    PatternBased,
    Pairwise,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationResult {
    pub kind: CorrelationType,
    pub event_ids: Vec<String>,
    pub strength: f64,
    pub causal: bool,
    pub description: String,
    /// Agent the correlation centres on, if any.
    #[serde(default)]
    pub agent_id: Option<String>,
}

impl CorrelationResult {
    fn new(kind: CorrelationType, event_ids: Vec<String>, strength: f64, description: String) -> Self {
        let strength = strength.clamp(0.0, 1.0);
        Self {
            kind,
            event_ids,
            strength,
            causal: strength > CAUSAL_THRESHOLD,
            description,
            agent_id: None,
        }
    }

    pub fn is_strong(&self) -> bool {
        self.strength > STRONG_THRESHOLD
    }
}

pub fn analyze(timeline: &EventTimeline) -> Vec<CorrelationResult> {
    let mut results = Vec::new();
    results.extend(temporal(timeline));
    results.extend(agent_based(timeline));
    results.extend(pattern_based(timeline));
    results.extend(pairwise(timeline));
    results
}

fn gap_secs(a: &TimelineEvent, b: &TimelineEvent) -> f64 {
    (a.timestamp - b.timestamp).num_milliseconds().abs() as f64 / 1000.0
}

/// Events within 30s of the error, strength falling linearly with the gap.
pub fn temporal(timeline: &EventTimeline) -> Vec<CorrelationResult> {
    let Some(error) = timeline.error_event() else {
        return Vec::new();
    };
    timeline
        .others()
        .filter_map(|event| {
            let gap = gap_secs(event, error);
            (gap <= TEMPORAL_WINDOW_SECS).then(|| {
                let mut r = CorrelationResult::new(
                    CorrelationType::Temporal,
                    vec![event.id.clone(), error.id.clone()],
                    1.0 - gap / TEMPORAL_WINDOW_SECS,
                    format!("'{}' occurred {:.0}s from the error", event.event_type, gap),
                );
                r.agent_id = Some(event.agent_id.clone());
                r
            })
        })
        .collect()
}

/// Three or more events from one agent suggest a cascade from that agent.
pub fn agent_based(timeline: &EventTimeline) -> Vec<CorrelationResult> {
    let mut by_agent: BTreeMap<&str, Vec<&TimelineEvent>> = BTreeMap::new();
    for event in &timeline.events {
        by_agent.entry(event.agent_id.as_str()).or_default().push(event);
    }
    by_agent
        .into_iter()
        .filter(|(_, events)| events.len() >= 3)
        .map(|(agent, events)| {
            let n = events.len();
            let mut r = CorrelationResult::new(
                CorrelationType::AgentBased,
                events.iter().map(|e| e.id.clone()).collect(),
                (0.5 + 0.1 * n as f64).min(1.0),
                format!("{n} events from agent {agent} suggest a cascading failure"),
            );
            r.agent_id = Some(agent.to_string());
            r
        })
        .collect()
}

/// Two or more high-severity events suggest a cascade.
pub fn pattern_based(timeline: &EventTimeline) -> Vec<CorrelationResult> {
    let severe: Vec<&TimelineEvent> = timeline
        .others()
        .filter(|e| e.severity >= Severity::High)
        .collect();
    if severe.len() < 2 {
        return Vec::new();
    }
    let n = severe.len();
    vec![CorrelationResult::new(
        CorrelationType::PatternBased,
        severe.iter().map(|e| e.id.clone()).collect(),
        (0.4 + 0.15 * n as f64).min(1.0),
        format!("{n} high-severity events suggest a cascading failure"),
    )]
}

/// Score of two events being related.
pub fn pair_strength(a: &TimelineEvent, b: &TimelineEvent) -> f64 {
    let time = (1.0 - gap_secs(a, b) / PAIRWISE_WINDOW_SECS).max(0.0);
    let same = |cond: bool| if cond { 1.0 } else { 0.0 };
    0.4 * time
        + 0.3 * same(a.agent_id == b.agent_id)
        + 0.2 * same(a.severity == b.severity)
        + 0.1 * same(a.event_type == b.event_type)
}

pub fn pairwise(timeline: &EventTimeline) -> Vec<CorrelationResult> {
    let events: Vec<&TimelineEvent> = match timeline.error_event() {
        Some(error) if timeline.len() > MAX_PAIRWISE_EVENTS => {
            let mut nearest: Vec<&TimelineEvent> = timeline.events.iter().collect();
            nearest.sort_by_key(|e| (e.timestamp - error.timestamp).num_milliseconds().abs());
            nearest.truncate(MAX_PAIRWISE_EVENTS);
            nearest
        }
        _ => timeline.events.iter().collect(),
    };

    let mut results = Vec::new();
    for (i, a) in events.iter().enumerate() {
        for b in events.iter().skip(i + 1) {
            let strength = pair_strength(a, b);
            if strength < PAIRWISE_MIN_STRENGTH {
                continue;
            }
            let r = CorrelationResult::new(
                CorrelationType::Pairwise,
                vec![a.id.clone(), b.id.clone()],
                strength,
                format!(
                    "'{}' and '{}' are {}",
                    a.event_type,
                    b.event_type,
                    if strength > CAUSAL_THRESHOLD {
                        "causally related"
                    } else {
                        "coincidental"
                    }
                ),
            );
            results.push(r);
        }
    }
    results
}
