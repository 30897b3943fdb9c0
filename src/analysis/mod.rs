//! Root Cause Analyzer
//!
//! # Pipeline
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Root Cause Analyzer                       │
//! │  ┌───────────────┐  ┌───────────────┐  ┌───────────────┐    │
//! │  │ Evidence      │─►│ Timeline      │─►│ Correlation   │    │
//! │  │ (-30m, +5m)   │  │ (merged)      │  │ (4 kinds)     │    │
//! │  └───────────────┘  └───────────────┘  └───────────────┘    │
//! │           │                                   │             │
//! │  ┌───────────────┐  ┌───────────────┐  ┌───────────────┐    │
//! │  │ Contributing  │  │ Root causes   │◄─│ Known         │    │
//! │  │ factors       │  │ (ranked)      │  │ patterns      │    │
//! │  └───────────────┘  └───────────────┘  └───────────────┘    │
//! │                             │                               │
//! │                     ┌───────────────┐                       │
//! │                     │Recommendations│                       │
//! │                     └───────────────┘                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! `analyze` never fails: internal errors and timeouts yield an empty,
//! zero-confidence result.

pub mod correlation;
pub mod evidence;
pub mod patterns;
pub mod recommendations;
pub mod timeline;

pub use correlation::{CorrelationResult, CorrelationType};
pub use evidence::{Evidence, EvidenceKind};
pub use recommendations::{Effort, Priority, Recommendation};
pub use timeline::{EventTimeline, TimelineEvent, TimelineSource};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::errors::{HealingError, Result};
use crate::store::{ErrorStore, EventQuery};
use crate::types::{AgentFailure, ErrorContext, Severity};

/// Analysis seam used by the manager.
#[async_trait]
pub trait RootCauseAnalysis: Send + Sync {
    async fn analyze(&self, failure: &AgentFailure, context: &ErrorContext)
        -> RootCauseAnalysisResult;
}

// ============================================================================
// Result types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootCauseCategory {
    ResourceExhaustion,
    InfrastructureFailure,
    ConfigurationIssue,
    CodeDefect,
    ExternalDependency,
    DataIssue,
    Unknown,
}

impl RootCauseCategory {
    /// Prior probability that a cause of this category is the real one.
    pub fn probability(&self) -> f64 {
        match self {
            RootCauseCategory::ResourceExhaustion => 0.9,
            RootCauseCategory::CodeDefect => 0.8,
            RootCauseCategory::InfrastructureFailure => 0.7,
            RootCauseCategory::ConfigurationIssue
            | RootCauseCategory::ExternalDependency
            | RootCauseCategory::DataIssue => 0.6,
            RootCauseCategory::Unknown => 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootCause {
    pub id: String,
    pub description: String,
    pub evidence: Vec<Evidence>,
    pub confidence: f64,
    pub severity_impact: f64,
    pub probability: f64,
    pub category: RootCauseCategory,
}

impl RootCause {
    pub fn rank_score(&self) -> f64 {
        self.confidence * self.severity_impact * self.probability
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContributingFactor {
    pub id: String,
    pub description: String,
    pub weight: f64,
    pub evidence: Vec<Evidence>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootCauseAnalysisResult {
    pub error_id: String,
    pub agent_id: String,
    /// Ranked, best first.
    pub root_causes: Vec<RootCause>,
    pub contributing_factors: Vec<ContributingFactor>,
    pub correlations: Vec<CorrelationResult>,
    pub timeline: EventTimeline,
    pub recommendations: Vec<Recommendation>,
    pub confidence: f64,
    pub evidence_count: usize,
    pub analyzed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl RootCauseAnalysisResult {
    pub fn empty(context: &ErrorContext) -> Self {
        Self {
            error_id: context.error_id.clone(),
            agent_id: context.agent_id.clone(),
            root_causes: Vec::new(),
            contributing_factors: Vec::new(),
            correlations: Vec::new(),
            timeline: EventTimeline::default(),
            recommendations: Vec::new(),
            confidence: 0.0,
            evidence_count: 0,
            analyzed_at: Utc::now(),
            duration_ms: 0,
        }
    }

    pub fn top_cause(&self) -> Option<&RootCause> {
        self.root_causes.first()
    }

    pub fn is_empty(&self) -> bool {
        self.root_causes.is_empty()
    }
}

/// Overall confidence: best cause, plus bounded bonuses for evidence
/// volume and strong correlations.
pub fn overall_confidence(
    causes: &[RootCause],
    evidence_count: usize,
    strong_correlations: usize,
) -> f64 {
    let Some(best) = causes.iter().map(|c| c.confidence).reduce(f64::max) else {
        return 0.0;
    };
    let evidence_bonus = (0.02 * evidence_count as f64).min(0.2);
    let correlation_bonus = (0.05 * strong_correlations as f64).min(0.1);
    (best + evidence_bonus + correlation_bonus).clamp(0.0, 1.0)
}

/// Post-hoc verdict on an analysis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisFeedback {
    pub error_id: String,
    /// Operator-rated accuracy in [0,1].
    pub accuracy_score: f64,
    #[serde(default)]
    pub useful_causes: Vec<String>,
    #[serde(default)]
    pub missed_causes: Vec<String>,
    #[serde(default)]
    pub false_positives: Vec<String>,
}

// ============================================================================
// Configuration & statistics
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub timeout_ms: u64,
    pub evidence_before_secs: u64,
    pub evidence_after_secs: u64,
    /// Look-back for independently queried related events.
    pub related_window_secs: u64,
    pub max_timeline_events: usize,
    pub cache_capacity: usize,
    pub cache_ttl_secs: u64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            evidence_before_secs: 30 * 60,
            evidence_after_secs: 5 * 60,
            related_window_secs: 5 * 60,
            max_timeline_events: 500,
            cache_capacity: 256,
            cache_ttl_secs: 600,
        }
    }
}

const WEIGHT_MIN: f64 = 0.3;
const WEIGHT_MAX: f64 = 1.5;

#[derive(Debug, Default)]
struct AnalyzerStats {
    analyses: AtomicU64,
    cache_hits: AtomicU64,
    failures: AtomicU64,
    feedback_received: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyzerStatsSummary {
    pub analyses: u64,
    pub cache_hits: u64,
    pub failures: u64,
    pub feedback_received: u64,
    pub mean_feedback_accuracy: f64,
    pub pattern_weights: HashMap<String, f64>,
}

// ============================================================================
// Analyzer
// ============================================================================

pub struct RootCauseAnalyzer {
    store: Arc<dyn ErrorStore>,
    config: AnalyzerConfig,
    cache: Mutex<LruCache<String, (RootCauseAnalysisResult, Instant)>>,
    weights: RwLock<HashMap<String, f64>>,
    accuracy_total: Mutex<f64>,
    stats: AnalyzerStats,
}

impl RootCauseAnalyzer {
    pub fn new(store: Arc<dyn ErrorStore>, config: AnalyzerConfig) -> Self {
        let capacity = NonZeroUsize::new(config.cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            config,
            cache: Mutex::new(LruCache::new(capacity)),
            weights: RwLock::new(HashMap::new()),
            accuracy_total: Mutex::new(0.0),
            stats: AnalyzerStats::default(),
        }
    }

    /// Agent type, stack prefix and resource-pressure buckets.
    pub fn cache_key(context: &ErrorContext) -> String {
        let stack: String = context.stack_text().chars().take(100).collect();
        format!(
            "{}|{}|m{}|c{}",
            context.agent_type,
            stack,
            context.environment.memory_bucket(),
            context.environment.cpu_bucket()
        )
    }

    pub async fn analyze(
        &self,
        failure: &AgentFailure,
        context: &ErrorContext,
    ) -> RootCauseAnalysisResult {
        self.stats.analyses.fetch_add(1, Ordering::Relaxed);
        let key = Self::cache_key(context);
        if let Some(hit) = self.cached(&key, context) {
            return hit;
        }

        let timeout = Duration::from_millis(self.config.timeout_ms);
        let outcome = match tokio::time::timeout(timeout, self.try_analyze(failure, context)).await
        {
            Ok(result) => result,
            Err(_) => Err(HealingError::Timeout {
                operation: "root cause analysis".to_string(),
                millis: self.config.timeout_ms,
            }),
        };

        match outcome {
            Ok(result) => {
                if let Err(e) = self.store.store_analysis(&result).await {
                    warn!(error_id = %context.error_id, error = %e, "Failed to persist analysis");
                }
                self.cache
                    .lock()
                    .put(key, (result.clone(), Instant::now()));
                result
            }
            Err(e) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                warn!(error_id = %context.error_id, error = %e, "Root cause analysis failed");
                RootCauseAnalysisResult::empty(context)
            }
        }
    }

    fn cached(&self, key: &str, context: &ErrorContext) -> Option<RootCauseAnalysisResult> {
        let ttl = Duration::from_secs(self.config.cache_ttl_secs);
        let mut cache = self.cache.lock();
        let found = cache
            .get(key)
            .map(|(result, at)| (result.clone(), at.elapsed() < ttl));
        match found {
            Some((mut result, true)) => {
                self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                debug!(error_id = %context.error_id, "Analysis cache hit");
                result.error_id = context.error_id.clone();
                result.agent_id = context.agent_id.clone();
                Some(result)
            }
            Some((_, false)) => {
                cache.pop(key);
                None
            }
            None => None,
        }
    }

    async fn try_analyze(
        &self,
        failure: &AgentFailure,
        context: &ErrorContext,
    ) -> Result<RootCauseAnalysisResult> {
        let started = Instant::now();
        let ts = context.timestamp;

        let window = EventQuery::between(
            ts - ChronoDuration::seconds(self.config.evidence_before_secs as i64),
            ts + ChronoDuration::seconds(self.config.evidence_after_secs as i64),
        );
        let nearby = self.store.query_events(&window).await?;
        let mut evidence = evidence::from_context(failure, context);
        evidence.extend(evidence::from_events(
            &nearby,
            context,
            self.config.evidence_before_secs,
            self.config.evidence_after_secs,
        ));

        let related: Vec<_> = self
            .store
            .query_events(&EventQuery::between(
                ts - ChronoDuration::seconds(self.config.related_window_secs as i64),
                ts,
            ))
            .await?
            .into_iter()
            .filter(|e| e.agent_id == context.agent_id || e.severity >= Severity::High)
            .collect();

        let timeline = timeline::build(
            failure,
            context,
            &evidence,
            &related,
            self.config.max_timeline_events,
        );
        let correlations = correlation::analyze(&timeline);

        let weights = self.weights.read().clone();
        let mut causes = patterns::match_known_patterns(failure, context, &evidence, &weights);
        causes.extend(patterns::from_correlations(
            &correlations,
            &evidence,
            &context.error_id,
        ));
        causes.extend(patterns::from_keyword_buckets(&evidence));
        causes.extend(patterns::from_cascade(&timeline, &evidence));
        let root_causes = patterns::dedupe_and_rank(causes);

        let contributing_factors = patterns::contributing_factors(context, &evidence);
        let recommendations = recommendations::generate(&root_causes);
        let strong = correlations.iter().filter(|c| c.is_strong()).count();
        let confidence = overall_confidence(&root_causes, evidence.len(), strong);

        let result = RootCauseAnalysisResult {
            error_id: context.error_id.clone(),
            agent_id: context.agent_id.clone(),
            root_causes,
            contributing_factors,
            correlations,
            timeline,
            recommendations,
            confidence,
            evidence_count: evidence.len(),
            analyzed_at: Utc::now(),
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            error_id = %result.error_id,
            causes = result.root_causes.len(),
            top_cause = result.top_cause().map(|c| c.id.as_str()).unwrap_or("none"),
            confidence = result.confidence,
            "Root cause analysis complete"
        );
        Ok(result)
    }

    /// Apply operator feedback: the cache is cleared and known-pattern
    /// weights move toward useful and missed causes and away from false
    /// positives.
    pub fn submit_feedback(&self, feedback: &AnalysisFeedback) {
        self.cache.lock().clear();
        self.stats.feedback_received.fetch_add(1, Ordering::Relaxed);
        *self.accuracy_total.lock() += feedback.accuracy_score.clamp(0.0, 1.0);

        let known = patterns::known_pattern_ids();
        let mut weights = self.weights.write();
        let mut adjust = |ids: &[String], delta: f64| {
            for id in ids.iter().filter(|id| known.contains(&id.as_str())) {
                let w = weights.entry(id.clone()).or_insert(1.0);
                *w = (*w + delta).clamp(WEIGHT_MIN, WEIGHT_MAX);
            }
        };
        adjust(&feedback.useful_causes, 0.05);
        adjust(&feedback.missed_causes, 0.1);
        adjust(&feedback.false_positives, -0.1);
        debug!(error_id = %feedback.error_id, accuracy = feedback.accuracy_score, "Analysis feedback applied");
    }

    pub fn pattern_weight(&self, pattern_id: &str) -> f64 {
        self.weights.read().get(pattern_id).copied().unwrap_or(1.0)
    }

    pub fn stats(&self) -> AnalyzerStatsSummary {
        let received = self.stats.feedback_received.load(Ordering::Relaxed);
        AnalyzerStatsSummary {
            analyses: self.stats.analyses.load(Ordering::Relaxed),
            cache_hits: self.stats.cache_hits.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
            feedback_received: received,
            mean_feedback_accuracy: if received > 0 {
                *self.accuracy_total.lock() / received as f64
            } else {
                0.0
            },
            pattern_weights: self.weights.read().clone(),
        }
    }
}

#[async_trait]
impl RootCauseAnalysis for RootCauseAnalyzer {
    async fn analyze(
        &self,
        failure: &AgentFailure,
        context: &ErrorContext,
    ) -> RootCauseAnalysisResult {
        RootCauseAnalyzer::analyze(self, failure, context).await
    }
}
