//! Frequency-table pattern learner.
//!
//! Every classification is observed under its learning key. Feedback turns
//! observations into a per-pattern accuracy which nudges future confidence,
//! fading with a configurable half-life.

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroUsize;

use crate::types::ErrorType;

const MAX_ADJUSTMENT: f64 = 0.2;

#[derive(Debug, Clone, Default)]
struct PatternStats {
    observations: u64,
    feedback: u64,
    correct: u64,
    type_counts: HashMap<ErrorType, u64>,
    last_updated: Option<DateTime<Utc>>,
}

impl PatternStats {
    /// Feedback accuracy when any exists, else how consistently the pattern
    /// has been assigned the same type.
    fn accuracy(&self) -> f64 {
        if self.feedback > 0 {
            return self.correct as f64 / self.feedback as f64;
        }
        if self.observations == 0 {
            return 0.5;
        }
        let dominant = self.type_counts.values().copied().max().unwrap_or(0);
        dominant as f64 / self.observations as f64
    }
}

/// What the learner remembers about a classified error id.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedClassification {
    pub learning_key: String,
    pub cache_key: String,
    pub error_type: ErrorType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PatternSnapshot {
    pub observations: u64,
    pub feedback: u64,
    pub accuracy: f64,
    pub dominant_type: Option<ErrorType>,
}

pub struct PatternLearner {
    patterns: Mutex<LruCache<String, PatternStats>>,
    by_error: Mutex<LruCache<String, ObservedClassification>>,
    half_life_days: f64,
    min_observations: u64,
}

impl PatternLearner {
    pub fn new(
        half_life_days: f64,
        min_observations: u64,
        tracked_errors: usize,
        pattern_capacity: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(tracked_errors).unwrap_or(NonZeroUsize::MIN);
        let pattern_capacity = NonZeroUsize::new(pattern_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            patterns: Mutex::new(LruCache::new(pattern_capacity)),
            by_error: Mutex::new(LruCache::new(capacity)),
            half_life_days: half_life_days.max(f64::EPSILON),
            min_observations,
        }
    }

    pub fn observe(&self, error_id: &str, observed: ObservedClassification, now: DateTime<Utc>) {
        {
            let mut patterns = self.patterns.lock();
            let stats = patterns
                .get_or_insert_mut(observed.learning_key.clone(), PatternStats::default);
            stats.observations += 1;
            *stats.type_counts.entry(observed.error_type).or_default() += 1;
            stats.last_updated = Some(now);
        }
        self.by_error.lock().put(error_id.to_string(), observed);
    }

    pub fn lookup(&self, error_id: &str) -> Option<ObservedClassification> {
        self.by_error.lock().get(error_id).cloned()
    }

    /// Record operator feedback. Returns false for unknown error ids.
    pub fn record_feedback(
        &self,
        error_id: &str,
        was_correct: bool,
        correct_type: Option<ErrorType>,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(observed) = self.lookup(error_id) else {
            return false;
        };
        let mut patterns = self.patterns.lock();
        let stats = patterns.get_or_insert_mut(observed.learning_key, PatternStats::default);
        stats.feedback += 1;
        if was_correct {
            stats.correct += 1;
        } else if let Some(ty) = correct_type {
            *stats.type_counts.entry(ty).or_default() += 1;
        }
        stats.last_updated = Some(now);
        true
    }

    /// Confidence adjustment in [-0.1, 0.1] for a pattern, or zero when
    /// the pattern has too few observations.
    pub fn confidence_adjustment(&self, learning_key: &str, now: DateTime<Utc>) -> f64 {
        let patterns = self.patterns.lock();
        let Some(stats) = patterns.peek(learning_key) else {
            return 0.0;
        };
        if stats.observations < self.min_observations {
            return 0.0;
        }
        let age_days = stats
            .last_updated
            .map(|t| (now - t).num_seconds().max(0) as f64 / 86_400.0)
            .unwrap_or(0.0);
        let decay = 0.5f64.powf(age_days / self.half_life_days);
        (stats.accuracy() - 0.5) * MAX_ADJUSTMENT * decay
    }

    pub fn snapshot(&self, learning_key: &str) -> Option<PatternSnapshot> {
        let patterns = self.patterns.lock();
        patterns.peek(learning_key).map(|s| PatternSnapshot {
            observations: s.observations,
            feedback: s.feedback,
            accuracy: s.accuracy(),
            dominant_type: s
                .type_counts
                .iter()
                .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
                .map(|(t, _)| *t),
        })
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.lock().len()
    }
}
