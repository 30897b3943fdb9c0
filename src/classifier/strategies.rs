//! The four classification strategies.
//!
//! Each strategy inspects the failure from one angle and returns a
//! [`PartialClassification`]: the fields it has an opinion on, a confidence
//! used as its vote weight, and the evidence behind it.

use chrono::{Duration as ChronoDuration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::hash::Hash;

use crate::errors::Result;
use crate::fingerprint::Fingerprint;
use crate::registry::ErrorRegistry;
use crate::store::{ClassificationQuery, ErrorStore};
use crate::types::{
    AgentFailure, ErrorCategory, ErrorClassification, ErrorContext, ErrorType, ImpactScope,
    Severity,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    RuleBased,
    PatternBased,
    ContextBased,
    Historical,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::RuleBased => "rule_based",
            Strategy::PatternBased => "pattern_based",
            Strategy::ContextBased => "context_based",
            Strategy::Historical => "historical",
        }
    }
}

/// One strategy's opinion. `None` fields abstain from the vote.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialClassification {
    pub strategy: Strategy,
    pub error_type: Option<ErrorType>,
    pub severity: Option<Severity>,
    pub category: Option<ErrorCategory>,
    pub impact_scope: Option<ImpactScope>,
    pub is_retryable: Option<bool>,
    pub is_transient: Option<bool>,
    pub estimated_recovery_ms: Option<u64>,
    pub confidence: f64,
    pub evidence: Vec<String>,
}

impl PartialClassification {
    pub fn empty(strategy: Strategy, confidence: f64) -> Self {
        Self {
            strategy,
            error_type: None,
            severity: None,
            category: None,
            impact_scope: None,
            is_retryable: None,
            is_transient: None,
            estimated_recovery_ms: None,
            confidence,
            evidence: Vec::new(),
        }
    }

    fn with_type(mut self, error_type: ErrorType) -> Self {
        self.error_type = Some(error_type);
        self.category = Some(error_type.default_category());
        self.is_retryable = Some(error_type.default_retryable());
        self.is_transient = Some(error_type.default_transient());
        self
    }
}

// ============================================================================
// Rule-based
// ============================================================================

pub const RULE_CONFIDENCE_FACTOR: f64 = 0.8;

pub fn rule_based(registry: &ErrorRegistry, failure: &AgentFailure) -> Result<PartialClassification> {
    let text = format!("{} {}", failure.name, failure.message);
    let Some(matched) = registry.find_match(&text) else {
        return Ok(PartialClassification::empty(Strategy::RuleBased, 0.0));
    };
    let rule = matched.rule;
    let mut partial = PartialClassification::empty(
        Strategy::RuleBased,
        rule.confidence * RULE_CONFIDENCE_FACTOR,
    )
    .with_type(rule.error_type);
    partial.severity = Some(rule.severity);
    partial.is_retryable = Some(rule.is_retryable);
    if let Some(category) = rule.category {
        partial.category = Some(category);
    }
    if let Some(transient) = rule.is_transient {
        partial.is_transient = Some(transient);
    }
    partial.impact_scope = rule.impact_scope;
    partial.estimated_recovery_ms = rule.estimated_recovery_ms;
    partial.evidence.push(format!("rule:{}", rule.id));
    Ok(partial)
}

// ============================================================================
// Pattern-based
// ============================================================================

pub const PATTERN_CONFIDENCE: f64 = 0.7;
pub const PATTERN_NO_MATCH_CONFIDENCE: f64 = 0.2;

fn compile_all<T: Copy>(table: &[(&str, T)]) -> Vec<(Regex, T)> {
    table
        .iter()
        .filter_map(|(pattern, value)| Regex::new(pattern).ok().map(|re| (re, *value)))
        .collect()
}

static TYPE_PATTERNS: Lazy<Vec<(Regex, ErrorType)>> = Lazy::new(|| {
    compile_all(&[
        (r"(?i)\b(sql|database|postgres|mysql|sqlite|query|transaction)\b", ErrorType::DatabaseError),
        (r"(?i)\b(out of memory|oom|heap|memory|disk full|no space)\b", ErrorType::ResourceExhaustion),
        (r"(?i)\b(rate.?limit(ed)?|throttl\w*|too many requests|quota)\b", ErrorType::RateLimitError),
        (r"(?i)\b(timeout|timed out|deadline)\b", ErrorType::TimeoutError),
        (r"(?i)\b(unauthori[sz]ed|forbidden|auth\w*|credential\w*|token expired)\b", ErrorType::AuthenticationError),
        (r"(?i)\b(socket|dns|network|connection|unreachable|econn\w+)\b", ErrorType::NetworkError),
        (r"(?i)\b(invalid|validation|malformed input|required field|schema)\b", ErrorType::ValidationError),
        (r"(?i)\b(config\w*|env var|setting)\b", ErrorType::ConfigurationError),
        (r"(?i)\b(upstream|dependency|service unavailable|bad gateway)\b", ErrorType::DependencyError),
        (r"(?i)\b(corrupt\w*|checksum|integrity)\b", ErrorType::DataCorruptionError),
        (r"(?i)\b(protocol|handshake|framing|unexpected message)\b", ErrorType::ProtocolError),
        (r"(?i)\b(consensus|handoff|coordinat\w*|heartbeat|peer)\b", ErrorType::AgentCoordinationError),
        (r"(?i)\b(business rule|policy|insufficient)\b", ErrorType::BusinessLogicError),
    ])
});

static SEVERITY_PATTERNS: Lazy<Vec<(Regex, Severity)>> = Lazy::new(|| {
    compile_all(&[
        (r"(?i)\b(fatal|panic\w*|crash\w*|corrupt\w*|critical|emergency)\b", Severity::Critical),
        (r"(?i)\b(degraded|slow|unstable|unavailable|overload\w*|outage|severe)\b", Severity::High),
        (r"(?i)\b(fail\w*|error|exception|refused|denied)\b", Severity::Medium),
        (r"(?i)\b(warn\w*|retrying|deprecated)\b", Severity::Low),
    ])
});

static SCOPE_PATTERNS: Lazy<Vec<(Regex, ImpactScope)>> = Lazy::new(|| {
    compile_all(&[
        (r"(?i)(all agents|system.?wide|global|entire system|every agent)", ImpactScope::SystemWide),
        (r"(?i)\b(downstream|upstream|external|third.?party)\b", ImpactScope::CrossSystem),
        (r"(?i)\b(cluster|peers|replicas|quorum)\b", ImpactScope::AgentCluster),
        (r"(?i)\b(agent|worker|process)\b", ImpactScope::SingleAgent),
    ])
});

fn first_match<T: Copy>(table: &[(Regex, T)], text: &str) -> Option<(T, String)> {
    table
        .iter()
        .find_map(|(re, value)| re.find(text).map(|m| (*value, m.as_str().to_lowercase())))
}

pub fn pattern_based(failure: &AgentFailure) -> Result<PartialClassification> {
    let text = format!("{} {}", failure.name, failure.message);

    let mut partial = match first_match(&TYPE_PATTERNS, &text) {
        Some((ty, keyword)) => {
            let mut p =
                PartialClassification::empty(Strategy::PatternBased, PATTERN_CONFIDENCE).with_type(ty);
            p.evidence.push(format!("keyword:{keyword}"));
            p
        }
        None => PartialClassification::empty(Strategy::PatternBased, PATTERN_NO_MATCH_CONFIDENCE),
    };

    partial.severity = Some(
        first_match(&SEVERITY_PATTERNS, &text)
            .map(|(s, _)| s)
            .unwrap_or(Severity::Medium),
    );
    partial.impact_scope = Some(
        first_match(&SCOPE_PATTERNS, &text)
            .map(|(s, _)| s)
            .unwrap_or(ImpactScope::SingleRequest),
    );
    Ok(partial)
}

// ============================================================================
// Context-based
// ============================================================================

pub const CONTEXT_CONFIDENCE: f64 = 0.6;

const STACK_BUCKETS: &[(&[&str], ErrorType)] = &[
    (&["heap", "alloc", "oom", "outofmemory", "memory"], ErrorType::ResourceExhaustion),
    (&["sql", "database", "postgres", "mysql", "query", "db::", "db."], ErrorType::DatabaseError),
    (&["socket", "tcp", "http", "connect", "dns", "net::"], ErrorType::NetworkError),
    (&["validate", "validation", "parse", "schema", "deserializ"], ErrorType::ValidationError),
];

pub fn context_based(context: &ErrorContext) -> Result<PartialClassification> {
    let mut partial = PartialClassification::empty(Strategy::ContextBased, CONTEXT_CONFIDENCE);
    let env = &context.environment;

    if env.memory_usage > 90.0 {
        partial = partial.with_type(ErrorType::ResourceExhaustion);
        partial.severity = Some(Severity::Critical);
        partial.is_retryable = Some(false);
        partial
            .evidence
            .push(format!("memory_usage:{:.1}", env.memory_usage));
    } else if env.cpu_usage > 95.0 {
        partial = partial.with_type(ErrorType::ResourceExhaustion);
        partial.severity = Some(Severity::High);
        partial.evidence.push(format!("cpu_usage:{:.1}", env.cpu_usage));
    } else if env.active_connections > 1000 {
        partial = partial.with_type(ErrorType::NetworkError);
        partial
            .evidence
            .push(format!("active_connections:{}", env.active_connections));
    }

    let stack = context.stack_text().to_lowercase();
    if !stack.is_empty() {
        let bucket = STACK_BUCKETS
            .iter()
            .find(|(keywords, _)| keywords.iter().any(|k| stack.contains(k)));
        if let Some((_, ty)) = bucket {
            if partial.error_type.is_none() {
                partial = partial.with_type(*ty);
            }
            partial.evidence.push(format!("stack:{}", ty.as_str()));
        }
    }

    if context.is_security_related() {
        partial.category = Some(ErrorCategory::Security);
        partial.evidence.push("security_flag".to_string());
    }
    Ok(partial)
}

// ============================================================================
// Historical similarity
// ============================================================================

pub const HISTORY_EXACT_CONFIDENCE: f64 = 0.8;
pub const HISTORY_AGENT_TYPE_CONFIDENCE: f64 = 0.3;
pub const HISTORY_EMPTY_CONFIDENCE: f64 = 0.1;

/// Look up prior classifications with the same similarity key, falling
/// back to the same agent type.
pub async fn historical(
    store: &dyn ErrorStore,
    fingerprint: &Fingerprint,
    context: &ErrorContext,
    window_days: i64,
    limit: usize,
) -> Result<PartialClassification> {
    let since = Utc::now() - ChronoDuration::days(window_days);

    let exact = store
        .find_classifications(&ClassificationQuery {
            fingerprint: Some(fingerprint.similarity_key().to_string()),
            agent_type: None,
            since: Some(since),
            limit: Some(limit),
        })
        .await?;
    let exact: Vec<_> = exact
        .into_iter()
        .filter(|c| c.error_id != context.error_id)
        .collect();
    if !exact.is_empty() {
        return Ok(summarize(&exact, HISTORY_EXACT_CONFIDENCE, "similar"));
    }

    let by_agent = store
        .find_classifications(&ClassificationQuery {
            fingerprint: None,
            agent_type: Some(context.agent_type.clone()),
            since: Some(since),
            limit: Some(limit),
        })
        .await?;
    let by_agent: Vec<_> = by_agent
        .into_iter()
        .filter(|c| c.error_id != context.error_id)
        .collect();
    if !by_agent.is_empty() {
        return Ok(summarize(&by_agent, HISTORY_AGENT_TYPE_CONFIDENCE, "agent_type"));
    }

    Ok(PartialClassification::empty(
        Strategy::Historical,
        HISTORY_EMPTY_CONFIDENCE,
    ))
}

/// Statistical mode, ties broken by first occurrence.
pub fn mode<T: Copy + Eq + Hash>(values: impl IntoIterator<Item = T>) -> Option<T> {
    let mut counts: HashMap<T, (usize, usize)> = HashMap::new();
    for (i, v) in values.into_iter().enumerate() {
        let entry = counts.entry(v).or_insert((0, i));
        entry.0 += 1;
    }
    counts
        .into_iter()
        .max_by(|a, b| (a.1).0.cmp(&(b.1).0).then((b.1).1.cmp(&(a.1).1)))
        .map(|(v, _)| v)
}

fn summarize(history: &[ErrorClassification], confidence: f64, label: &str) -> PartialClassification {
    let mut partial = PartialClassification::empty(Strategy::Historical, confidence);
    partial.error_type = mode(history.iter().map(|c| c.error_type));
    partial.severity = mode(history.iter().map(|c| c.severity));
    partial.category = mode(history.iter().map(|c| c.category));
    partial.impact_scope = mode(history.iter().map(|c| c.impact_scope));
    partial.is_retryable = mode(history.iter().map(|c| c.is_retryable));
    partial.is_transient = mode(history.iter().map(|c| c.is_transient));
    let total: u64 = history.iter().map(|c| c.estimated_recovery_time_ms).sum();
    partial.estimated_recovery_ms = Some(total / history.len().max(1) as u64);
    partial
        .evidence
        .push(format!("history:{label}:{}", history.len()));
    partial
}
