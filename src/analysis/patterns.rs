//! Root-cause identification.
//!
//! Four sources feed the candidate list: the known-pattern library, strong
//! correlations, keyword evidence buckets and cascading-timeline detection.

use chrono::{Datelike, Duration as ChronoDuration, Timelike, Weekday};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

use super::correlation::{CorrelationResult, CorrelationType};
use super::evidence::{Evidence, EvidenceKind};
use super::timeline::EventTimeline;
use super::{ContributingFactor, RootCause, RootCauseCategory};
use crate::types::{AgentFailure, EnvironmentSnapshot, ErrorContext, Severity};

/// Known patterns scoring below this are discarded.
pub const MIN_PATTERN_SCORE: f64 = 0.3;
const CASCADE_WINDOW_SECS: i64 = 300;

pub struct KnownPattern {
    pub id: &'static str,
    pub description: &'static str,
    pub category: RootCauseCategory,
    pub severity_impact: f64,
    regex: Regex,
    keywords: &'static [&'static str],
    env_match: fn(&EnvironmentSnapshot) -> bool,
}

static KNOWN_PATTERNS: Lazy<Vec<KnownPattern>> = Lazy::new(|| {
    let mut patterns = Vec::new();

    if let Ok(regex) = Regex::new(r"(?i)heap|alloc|out ?of ?memory|\boom\b|memory") {
        patterns.push(KnownPattern {
            id: "memory_leak",
            description: "Memory leak or unbounded growth exhausting available memory",
            category: RootCauseCategory::ResourceExhaustion,
            severity_impact: 0.8,
            regex,
            keywords: &["memory", "heap", "oom", "allocation", "leak", "gc"],
            env_match: |env| env.memory_usage > 85.0,
        });
    }

    if let Ok(regex) = Regex::new(r"(?i)deadlock|lock wait|serializ\w* failure|could not obtain lock") {
        patterns.push(KnownPattern {
            id: "database_deadlock",
            description: "Conflicting transactions deadlocking in the database",
            category: RootCauseCategory::CodeDefect,
            severity_impact: 0.7,
            regex,
            keywords: &["deadlock", "lock", "transaction", "database", "rollback"],
            env_match: |env| env.response_time_ms > 5_000.0,
        });
    }

    if let Ok(regex) =
        Regex::new(r"(?i)econnrefused|econnreset|connection (refused|reset)|socket|dns|unreachable")
    {
        patterns.push(KnownPattern {
            id: "network_connectivity",
            description: "Network connectivity loss between the agent and its peers or services",
            category: RootCauseCategory::InfrastructureFailure,
            severity_impact: 0.7,
            regex,
            keywords: &["connection", "network", "socket", "refused", "timeout", "dns"],
            env_match: |env| env.active_connections > 900 || env.response_time_ms > 5_000.0,
        });
    }

    if let Ok(regex) =
        Regex::new(r"(?i)config|missing (key|setting|env)|invalid (value|setting)|not configured")
    {
        patterns.push(KnownPattern {
            id: "configuration_mismatch",
            description: "Configuration mismatch between deployed settings and expectations",
            category: RootCauseCategory::ConfigurationIssue,
            severity_impact: 0.5,
            regex,
            keywords: &["config", "configuration", "setting", "missing", "invalid", "env"],
            env_match: |_| false,
        });
    }

    patterns
});

pub fn known_pattern_ids() -> Vec<&'static str> {
    KNOWN_PATTERNS.iter().map(|p| p.id).collect()
}

fn corpus(failure: &AgentFailure, evidence: &[Evidence]) -> String {
    let mut text = failure.search_text();
    for item in evidence {
        text.push('\n');
        text.push_str(&item.description.to_lowercase());
    }
    text
}

/// Score every known pattern: 0.4 for a regex hit on the stack or message,
/// 0.3 times the keyword fraction, 0.3 for an environment match, scaled by
/// the learned weight.
pub fn match_known_patterns(
    failure: &AgentFailure,
    context: &ErrorContext,
    evidence: &[Evidence],
    weights: &HashMap<String, f64>,
) -> Vec<RootCause> {
    let text = corpus(failure, evidence);
    let direct = format!("{} {}", failure.search_text(), context.stack_text());

    KNOWN_PATTERNS
        .iter()
        .filter_map(|pattern| {
            let regex_hit = pattern.regex.is_match(&direct);
            let found = pattern.keywords.iter().filter(|k| text.contains(*k)).count();
            let keyword_fraction = found as f64 / pattern.keywords.len().max(1) as f64;
            let env_hit = (pattern.env_match)(&context.environment);

            let raw = 0.4 * if regex_hit { 1.0 } else { 0.0 }
                + 0.3 * keyword_fraction
                + 0.3 * if env_hit { 1.0 } else { 0.0 };
            let weight = weights.get(pattern.id).copied().unwrap_or(1.0);
            let score = (raw * weight).clamp(0.0, 1.0);
            if score < MIN_PATTERN_SCORE {
                return None;
            }

            let supporting = evidence
                .iter()
                .filter(|e| {
                    let d = e.description.to_lowercase();
                    pattern.regex.is_match(&d) || pattern.keywords.iter().any(|k| d.contains(k))
                })
                .cloned()
                .collect();
            Some(RootCause {
                id: pattern.id.to_string(),
                description: pattern.description.to_string(),
                evidence: supporting,
                confidence: score,
                severity_impact: pattern.severity_impact,
                probability: pattern.category.probability(),
                category: pattern.category,
            })
        })
        .collect()
}

fn supporting_events(evidence: &[Evidence], ids: &[String]) -> Vec<Evidence> {
    evidence
        .iter()
        .filter(|e| ids.contains(&e.id))
        .cloned()
        .collect()
}

/// Causes implied by correlations stronger than the strong threshold.
pub fn from_correlations(
    correlations: &[CorrelationResult],
    evidence: &[Evidence],
    error_id: &str,
) -> Vec<RootCause> {
    correlations
        .iter()
        .filter(|c| c.is_strong())
        .map(|c| {
            let (id, description, category, severity_impact) = match c.kind {
                CorrelationType::AgentBased => {
                    let agent = c.agent_id.clone().unwrap_or_default();
                    (
                        format!("agent_instability:{agent}"),
                        format!("Agent {agent} is failing repeatedly and destabilising peers"),
                        RootCauseCategory::CodeDefect,
                        0.6,
                    )
                }
                CorrelationType::PatternBased => (
                    "cascading_failure".to_string(),
                    "Cascading failure across multiple high-severity events".to_string(),
                    RootCauseCategory::InfrastructureFailure,
                    0.8,
                ),
                CorrelationType::Temporal | CorrelationType::Pairwise => {
                    let other = c
                        .event_ids
                        .iter()
                        .find(|id| id.as_str() != error_id)
                        .cloned()
                        .unwrap_or_default();
                    (
                        format!("correlated:{other}"),
                        c.description.clone(),
                        RootCauseCategory::Unknown,
                        0.5,
                    )
                }
            };
            RootCause {
                id,
                description,
                evidence: supporting_events(evidence, &c.event_ids),
                confidence: c.strength,
                severity_impact,
                probability: category.probability(),
                category,
            }
        })
        .collect()
}

const KEYWORD_BUCKETS: &[(&str, &str, RootCauseCategory, f64, &[&str])] = &[
    (
        "database_issue",
        "Database errors recurring around the failure",
        RootCauseCategory::InfrastructureFailure,
        0.7,
        &["database", "sql", "query", "deadlock", "connection pool"],
    ),
    (
        "memory_pressure",
        "Memory pressure reported around the failure",
        RootCauseCategory::ResourceExhaustion,
        0.8,
        &["memory", "heap", "oom", "allocation"],
    ),
    (
        "configuration_error",
        "Configuration problems reported around the failure",
        RootCauseCategory::ConfigurationIssue,
        0.5,
        &["config", "setting", "environment variable", "missing key"],
    ),
];

/// One cause per keyword bucket with at least one matching evidence item.
pub fn from_keyword_buckets(evidence: &[Evidence]) -> Vec<RootCause> {
    KEYWORD_BUCKETS
        .iter()
        .filter_map(|(id, description, category, severity_impact, keywords)| {
            let matching: Vec<Evidence> = evidence
                .iter()
                .filter(|e| {
                    let d = e.description.to_lowercase();
                    keywords.iter().any(|k| d.contains(k))
                })
                .cloned()
                .collect();
            if matching.is_empty() {
                return None;
            }
            let n = matching.len() as f64;
            Some(RootCause {
                id: id.to_string(),
                description: description.to_string(),
                evidence: matching,
                confidence: (0.3 + 0.1 * n).min(0.9),
                severity_impact: *severity_impact,
                probability: category.probability(),
                category: *category,
            })
        })
        .collect()
}

/// High-severity events in the five minutes before the error.
pub fn from_cascade(timeline: &EventTimeline, evidence: &[Evidence]) -> Option<RootCause> {
    let error = timeline.error_event()?;
    let start = error.timestamp - ChronoDuration::seconds(CASCADE_WINDOW_SECS);
    let preceding: Vec<String> = timeline
        .others()
        .filter(|e| e.severity >= Severity::High)
        .filter(|e| e.timestamp >= start && e.timestamp < error.timestamp)
        .map(|e| e.id.clone())
        .collect();
    if preceding.len() < 2 {
        return None;
    }
    let n = preceding.len() as f64;
    let category = RootCauseCategory::InfrastructureFailure;
    Some(RootCause {
        id: "cascading_failure".to_string(),
        description: format!(
            "{} high-severity events in the {} minutes before the failure",
            preceding.len(),
            CASCADE_WINDOW_SECS / 60
        ),
        evidence: supporting_events(evidence, &preceding),
        confidence: (0.4 + 0.1 * n).min(0.9),
        severity_impact: 0.8,
        probability: category.probability(),
        category,
    })
}

/// Keep the highest-confidence instance of each id, then rank by
/// confidence × severity impact × probability.
pub fn dedupe_and_rank(causes: Vec<RootCause>) -> Vec<RootCause> {
    let mut unique: HashMap<String, RootCause> = HashMap::new();
    for cause in causes {
        match unique.get(&cause.id) {
            Some(existing) if existing.confidence >= cause.confidence => {}
            _ => {
                unique.insert(cause.id.clone(), cause);
            }
        }
    }
    let mut ranked: Vec<RootCause> = unique.into_values().collect();
    ranked.sort_by(|a, b| {
        b.rank_score()
            .total_cmp(&a.rank_score())
            .then_with(|| a.id.cmp(&b.id))
    });
    ranked
}

fn evidence_of(evidence: &[Evidence], metric: &str) -> Vec<Evidence> {
    evidence
        .iter()
        .filter(|e| e.kind == EvidenceKind::MetricAnomaly && e.event_type.as_deref() == Some(metric))
        .cloned()
        .collect()
}

pub fn contributing_factors(context: &ErrorContext, evidence: &[Evidence]) -> Vec<ContributingFactor> {
    let env = &context.environment;
    let mut factors = Vec::new();
    if env.memory_usage > 80.0 {
        factors.push(ContributingFactor {
            id: "high_memory_usage".to_string(),
            description: format!("Memory usage at {:.1}%", env.memory_usage),
            weight: 0.3,
            evidence: evidence_of(evidence, "memory_usage"),
        });
    }
    if env.cpu_usage > 80.0 {
        factors.push(ContributingFactor {
            id: "high_cpu_usage".to_string(),
            description: format!("CPU usage at {:.1}%", env.cpu_usage),
            weight: 0.25,
            evidence: evidence_of(evidence, "cpu_usage"),
        });
    }
    if env.active_connections > 800 {
        factors.push(ContributingFactor {
            id: "high_connection_count".to_string(),
            description: format!("{} active connections", env.active_connections),
            weight: 0.2,
            evidence: evidence_of(evidence, "active_connections"),
        });
    }
    let ts = context.timestamp;
    let weekday = !matches!(ts.weekday(), Weekday::Sat | Weekday::Sun);
    if weekday && (9..17).contains(&ts.hour()) {
        factors.push(ContributingFactor {
            id: "business_hours".to_string(),
            description: "Occurred during business hours under peak load".to_string(),
            weight: 0.1,
            evidence: Vec::new(),
        });
    }
    factors
}
