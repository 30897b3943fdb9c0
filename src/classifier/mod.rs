//! Error Classifier
//!
//! Four independent strategies run concurrently and are combined by a
//! confidence-weighted vote:
//!
//! ```text
//!                 ┌── rule-based (registry) ──────┐
//! failure + ctx ──┼── pattern-based (keywords) ───┼──► weighted vote ──► classification
//!                 ├── context-based (stack, env) ─┤        ▲
//!                 └── historical (store) ─────────┘        │
//!                                               pattern learner adjustment
//! ```
//!
//! `classify` never fails. Internal errors produce the low-confidence
//! fallback classification.

mod learning;
mod strategies;

pub use learning::{ObservedClassification, PatternLearner, PatternSnapshot};
pub use strategies::{PartialClassification, Strategy};

use async_trait::async_trait;
use chrono::Utc;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::errors::{HealingError, Result};
use crate::fingerprint::Fingerprint;
use crate::registry::ErrorRegistry;
use crate::store::ErrorStore;
use crate::telemetry::sanitize_for_log;
use crate::types::{
    AgentFailure, ErrorCategory, ErrorClassification, ErrorContext, ErrorType, ImpactScope,
    Severity,
};

/// Classification seam used by the manager.
#[async_trait]
pub trait ClassifyError: Send + Sync {
    async fn classify(&self, failure: &AgentFailure, context: &ErrorContext)
        -> ErrorClassification;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub cache_capacity: usize,
    pub cache_ttl_secs: u64,
    pub history_window_days: i64,
    pub history_limit: usize,
    /// Upper bound on the historical lookup.
    pub history_timeout_ms: u64,
    pub learning_half_life_days: f64,
    /// Observations a pattern needs before learning adjusts confidence.
    pub learning_min_observations: u64,
    pub tracked_errors: usize,
    /// Distinct learning keys kept; the least recently seen is evicted.
    pub learned_patterns_capacity: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 1024,
            cache_ttl_secs: 300,
            history_window_days: 30,
            history_limit: 200,
            history_timeout_ms: 2_000,
            learning_half_life_days: 30.0,
            learning_min_observations: 3,
            tracked_errors: 10_000,
            learned_patterns_capacity: 10_000,
        }
    }
}

/// Operator verdict on a past classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationFeedback {
    pub error_id: String,
    pub was_correct: bool,
    #[serde(default)]
    pub correct_type: Option<ErrorType>,
}

/// Whether a classification needs escalation before recovery.
pub fn requires_immediate_attention(
    severity: Severity,
    impact_scope: ImpactScope,
    security_related: bool,
) -> bool {
    severity >= Severity::Critical
        || impact_scope >= ImpactScope::SystemWide
        || (severity == Severity::High && impact_scope == ImpactScope::AgentCluster)
        || security_related
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Default)]
pub struct ClassifierStats {
    classifications: AtomicU64,
    cache_hits: AtomicU64,
    fallbacks: AtomicU64,
    strategy_failures: AtomicU64,
    feedback_received: AtomicU64,
    feedback_correct: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassifierStatsSummary {
    pub classifications: u64,
    pub cache_hits: u64,
    pub fallbacks: u64,
    pub strategy_failures: u64,
    pub feedback_received: u64,
    pub feedback_accuracy: f64,
    pub learned_patterns: usize,
}

// ============================================================================
// Classifier
// ============================================================================

pub struct ErrorClassifier {
    registry: Arc<ErrorRegistry>,
    store: Arc<dyn ErrorStore>,
    cache: Mutex<LruCache<String, (ErrorClassification, Instant)>>,
    learner: PatternLearner,
    config: ClassifierConfig,
    stats: ClassifierStats,
}

impl ErrorClassifier {
    pub fn new(
        registry: Arc<ErrorRegistry>,
        store: Arc<dyn ErrorStore>,
        config: ClassifierConfig,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            registry,
            store,
            cache: Mutex::new(LruCache::new(capacity)),
            learner: PatternLearner::new(
                config.learning_half_life_days,
                config.learning_min_observations,
                config.tracked_errors,
                config.learned_patterns_capacity,
            ),
            config,
            stats: ClassifierStats::default(),
        }
    }

    pub fn registry(&self) -> &Arc<ErrorRegistry> {
        &self.registry
    }

    pub fn learner(&self) -> &PatternLearner {
        &self.learner
    }

    /// Classify a failure. Never fails; see the module docs.
    pub async fn classify(
        &self,
        failure: &AgentFailure,
        context: &ErrorContext,
    ) -> ErrorClassification {
        self.stats.classifications.fetch_add(1, Ordering::Relaxed);
        let fingerprint = Fingerprint::compute(failure, context);

        if let Some(hit) = self.cached(&fingerprint, context).await {
            return hit;
        }

        match self.try_classify(failure, context, &fingerprint).await {
            Ok(classification) => classification,
            Err(e) => {
                self.stats.fallbacks.fetch_add(1, Ordering::Relaxed);
                warn!(
                    error_id = %context.error_id,
                    error = %e,
                    message = %sanitize_for_log(&failure.message),
                    "Classification failed, using fallback"
                );
                ErrorClassification::fallback(context, fingerprint.similarity_key())
            }
        }
    }

    async fn cached(
        &self,
        fingerprint: &Fingerprint,
        context: &ErrorContext,
    ) -> Option<ErrorClassification> {
        let key = fingerprint.cache_key();
        let ttl = Duration::from_secs(self.config.cache_ttl_secs);
        let entry = {
            let mut cache = self.cache.lock();
            let found = cache
                .get(&key)
                .map(|(classification, at)| (classification.clone(), at.elapsed() < ttl));
            match found {
                Some((classification, true)) => Some(classification),
                Some((_, false)) => {
                    cache.pop(&key);
                    None
                }
                None => None,
            }
        }?;

        self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
        debug!(error_id = %context.error_id, cache_key = %key, "Classification cache hit");
        if entry.error_id == context.error_id {
            return Some(entry);
        }

        let mut classification = entry;
        classification.error_id = context.error_id.clone();
        classification.version = 0;
        classification.requires_immediate_attention = requires_immediate_attention(
            classification.severity,
            classification.impact_scope,
            context.is_security_related(),
        );
        self.persist_and_learn(&mut classification, fingerprint).await;
        Some(classification)
    }

    async fn try_classify(
        &self,
        failure: &AgentFailure,
        context: &ErrorContext,
        fingerprint: &Fingerprint,
    ) -> Result<ErrorClassification> {
        let history_timeout = Duration::from_millis(self.config.history_timeout_ms);
        let history = async {
            match tokio::time::timeout(
                history_timeout,
                strategies::historical(
                    self.store.as_ref(),
                    fingerprint,
                    context,
                    self.config.history_window_days,
                    self.config.history_limit,
                ),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(HealingError::Timeout {
                    operation: "historical lookup".to_string(),
                    millis: self.config.history_timeout_ms,
                }),
            }
        };

        let (rule, pattern, ctx, hist) = tokio::join!(
            async { strategies::rule_based(&self.registry, failure) },
            async { strategies::pattern_based(failure) },
            async { strategies::context_based(context) },
            history,
        );

        let mut partials = Vec::with_capacity(4);
        for (strategy, result) in [
            (Strategy::RuleBased, rule),
            (Strategy::PatternBased, pattern),
            (Strategy::ContextBased, ctx),
            (Strategy::Historical, hist),
        ] {
            match result {
                Ok(partial) => partials.push(partial),
                Err(e) => {
                    self.stats.strategy_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        error_id = %context.error_id,
                        strategy = strategy.as_str(),
                        error = %e,
                        "Classification strategy failed"
                    );
                }
            }
        }
        if partials.is_empty() {
            return Err(HealingError::Classification(
                "every strategy failed".to_string(),
            ));
        }

        let adjustment = self
            .learner
            .confidence_adjustment(&fingerprint.learning_key(), Utc::now());
        let mut classification = combine(&partials, failure, context, fingerprint, adjustment);
        self.persist_and_learn(&mut classification, fingerprint).await;

        self.cache.lock().put(
            fingerprint.cache_key(),
            (classification.clone(), Instant::now()),
        );
        debug!(
            error_id = %classification.error_id,
            error_type = %classification.error_type,
            severity = %classification.severity,
            confidence = classification.confidence_score,
            "Error classified"
        );
        Ok(classification)
    }

    async fn persist_and_learn(
        &self,
        classification: &mut ErrorClassification,
        fingerprint: &Fingerprint,
    ) {
        match self.store.store_classification(classification).await {
            Ok(version) => classification.version = version,
            Err(e) => {
                warn!(error_id = %classification.error_id, error = %e, "Failed to persist classification");
            }
        }
        self.learner.observe(
            &classification.error_id,
            ObservedClassification {
                learning_key: fingerprint.learning_key(),
                cache_key: fingerprint.cache_key(),
                error_type: classification.error_type,
            },
            Utc::now(),
        );
    }

    /// Apply operator feedback. A correction supersedes the stored
    /// classification and evicts the cached one. Returns false when the
    /// error id was never classified here.
    pub async fn submit_feedback(&self, feedback: ClassificationFeedback) -> bool {
        let now = Utc::now();
        let Some(observed) = self.learner.lookup(&feedback.error_id) else {
            debug!(error_id = %feedback.error_id, "Feedback for unknown classification");
            return false;
        };
        self.learner.record_feedback(
            &feedback.error_id,
            feedback.was_correct,
            feedback.correct_type,
            now,
        );
        self.stats.feedback_received.fetch_add(1, Ordering::Relaxed);
        if feedback.was_correct {
            self.stats.feedback_correct.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        self.cache.lock().pop(&observed.cache_key);
        let Some(correct_type) = feedback.correct_type else {
            return true;
        };
        if correct_type == observed.error_type {
            return true;
        }
        match self.store.current_classification(&feedback.error_id).await {
            Ok(Some(mut current)) => {
                current.error_type = correct_type;
                current.category = correct_type.default_category();
                current.subcategory = correct_type.default_subcategory().to_string();
                current.is_retryable = correct_type.default_retryable();
                current.is_transient = correct_type.default_transient();
                current.confidence_score = 1.0;
                current.classified_at = now;
                if let Err(e) = self.store.store_classification(&current).await {
                    warn!(error_id = %feedback.error_id, error = %e, "Failed to store corrected classification");
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error_id = %feedback.error_id, error = %e, "Failed to load classification for correction");
            }
        }
        true
    }

    pub fn stats(&self) -> ClassifierStatsSummary {
        let received = self.stats.feedback_received.load(Ordering::Relaxed);
        let correct = self.stats.feedback_correct.load(Ordering::Relaxed);
        ClassifierStatsSummary {
            classifications: self.stats.classifications.load(Ordering::Relaxed),
            cache_hits: self.stats.cache_hits.load(Ordering::Relaxed),
            fallbacks: self.stats.fallbacks.load(Ordering::Relaxed),
            strategy_failures: self.stats.strategy_failures.load(Ordering::Relaxed),
            feedback_received: received,
            feedback_accuracy: if received > 0 {
                correct as f64 / received as f64
            } else {
                0.0
            },
            learned_patterns: self.learner.pattern_count(),
        }
    }

    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }
}

#[async_trait]
impl ClassifyError for ErrorClassifier {
    async fn classify(
        &self,
        failure: &AgentFailure,
        context: &ErrorContext,
    ) -> ErrorClassification {
        ErrorClassifier::classify(self, failure, context).await
    }
}

// ============================================================================
// Weighted vote
// ============================================================================

/// Confidence-weighted vote. Ties resolve to the value seen first, which
/// follows strategy order.
fn vote<T: Copy + PartialEq>(
    partials: &[PartialClassification],
    field: impl Fn(&PartialClassification) -> Option<T>,
) -> Option<T> {
    let mut tally: Vec<(T, f64)> = Vec::new();
    for partial in partials {
        let Some(value) = field(partial) else {
            continue;
        };
        match tally.iter_mut().find(|(v, _)| *v == value) {
            Some((_, weight)) => *weight += partial.confidence,
            None => tally.push((value, partial.confidence)),
        }
    }
    let mut best: Option<(T, f64)> = None;
    for (value, weight) in tally {
        if best.map(|(_, w)| weight > w).unwrap_or(true) {
            best = Some((value, weight));
        }
    }
    best.map(|(v, _)| v)
}

/// True when more than half of the strategies asserting a value assert true.
fn majority(partials: &[PartialClassification], field: impl Fn(&PartialClassification) -> Option<bool>) -> Option<bool> {
    let asserted: Vec<bool> = partials.iter().filter_map(field).collect();
    if asserted.is_empty() {
        return None;
    }
    let yes = asserted.iter().filter(|v| **v).count();
    Some(yes * 2 > asserted.len())
}

fn resolve_subcategory(error_type: ErrorType, failure: &AgentFailure, context: &ErrorContext) -> String {
    let text = format!("{} {}", failure.search_text(), context.stack_text().to_lowercase());
    let candidates = error_type.subcategories();
    candidates
        .iter()
        .find(|c| text.contains(&c.replace('_', " ")) || text.contains(*c))
        .or_else(|| candidates.first())
        .map(|c| c.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn combine(
    partials: &[PartialClassification],
    failure: &AgentFailure,
    context: &ErrorContext,
    fingerprint: &Fingerprint,
    learned_adjustment: f64,
) -> ErrorClassification {
    let error_type = vote(partials, |p| p.error_type).unwrap_or(ErrorType::SystemError);
    let severity = vote(partials, |p| p.severity).unwrap_or(Severity::Medium);
    let category: ErrorCategory =
        vote(partials, |p| p.category).unwrap_or_else(|| error_type.default_category());
    let impact_scope = vote(partials, |p| p.impact_scope).unwrap_or(ImpactScope::SingleRequest);
    let is_retryable =
        majority(partials, |p| p.is_retryable).unwrap_or_else(|| error_type.default_retryable());
    let is_transient =
        majority(partials, |p| p.is_transient).unwrap_or_else(|| error_type.default_transient());

    let estimated_recovery_time_ms = {
        let (sum, weight) = partials
            .iter()
            .filter_map(|p| p.estimated_recovery_ms.map(|ms| (ms as f64, p.confidence)))
            .fold((0.0, 0.0), |(s, w), (ms, c)| (s + ms * c, w + c));
        if weight > 0.0 {
            (sum / weight).round() as u64
        } else {
            error_type.default_recovery_ms()
        }
    };

    let agreeing: Vec<&PartialClassification> = partials
        .iter()
        .filter(|p| p.error_type == Some(error_type))
        .collect();
    let base = if agreeing.is_empty() {
        0.1
    } else {
        agreeing.iter().map(|p| p.confidence).sum::<f64>() / agreeing.len() as f64
    };
    let evidence_count: usize = partials.iter().map(|p| p.evidence.len()).sum();
    let evidence_bonus = (0.02 * evidence_count as f64).min(0.1);
    let agreement_bonus = match agreeing.len() {
        n if n >= 3 => 0.1,
        2 => 0.05,
        _ => 0.0,
    };
    let confidence_score = (base + evidence_bonus + agreement_bonus + learned_adjustment).clamp(0.0, 1.0);

    let security = context.is_security_related();
    ErrorClassification {
        error_id: context.error_id.clone(),
        agent_type: context.agent_type.clone(),
        fingerprint: fingerprint.similarity_key().to_string(),
        error_type,
        severity,
        category,
        subcategory: resolve_subcategory(error_type, failure, context),
        is_retryable,
        is_transient,
        requires_immediate_attention: requires_immediate_attention(severity, impact_scope, security),
        estimated_recovery_time_ms,
        impact_scope,
        confidence_score,
        classified_at: Utc::now(),
        version: 0,
    }
}
