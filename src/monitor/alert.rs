//! Alert patterns and fired alerts.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::HealingError;
use crate::types::Severity;

/// Metric an [`AlertCondition`] is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertMetric {
    /// Errors per minute over the window.
    ErrorRate,
    ErrorCount,
    /// Errors annotated with severity critical or emergency.
    CriticalErrorCount,
    /// Mean response time in milliseconds.
    ResponseTime,
    /// Mean memory usage percentage.
    MemoryUsage,
    /// Mean CPU usage percentage.
    CpuUsage,
}

impl AlertMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertMetric::ErrorRate => "error_rate",
            AlertMetric::ErrorCount => "error_count",
            AlertMetric::CriticalErrorCount => "critical_error_count",
            AlertMetric::ResponseTime => "response_time",
            AlertMetric::MemoryUsage => "memory_usage",
            AlertMetric::CpuUsage => "cpu_usage",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOperator {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
}

impl ComparisonOperator {
    pub fn compare(&self, value: f64, threshold: f64) -> bool {
        match self {
            ComparisonOperator::Gt => value > threshold,
            ComparisonOperator::Gte => value >= threshold,
            ComparisonOperator::Lt => value < threshold,
            ComparisonOperator::Lte => value <= threshold,
            ComparisonOperator::Eq => (value - threshold).abs() < f64::EPSILON,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertCondition {
    pub metric: AlertMetric,
    pub operator: ComparisonOperator,
    pub threshold: f64,
    /// Sliding window the metric is computed over.
    pub window_secs: u64,
}

impl AlertCondition {
    pub fn new(
        metric: AlertMetric,
        operator: ComparisonOperator,
        threshold: f64,
        window_secs: u64,
    ) -> Self {
        Self {
            metric,
            operator,
            threshold,
            window_secs,
        }
    }
}

/// Named set of AND-combined conditions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertPattern {
    pub name: String,
    pub conditions: Vec<AlertCondition>,
    pub severity: Severity,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_cooldown_secs() -> u64 {
    300
}

/// Longest condition window or cooldown a pattern may declare (30 days).
pub const MAX_WINDOW_SECS: u64 = 30 * 24 * 60 * 60;

/// Seconds as a chrono duration, clamped to [`MAX_WINDOW_SECS`].
pub(crate) fn bounded_secs(secs: u64) -> ChronoDuration {
    ChronoDuration::seconds(secs.min(MAX_WINDOW_SECS) as i64)
}

impl AlertPattern {
    pub fn new(name: impl Into<String>, severity: Severity) -> Self {
        Self {
            name: name.into(),
            conditions: Vec::new(),
            severity,
            channels: Vec::new(),
            cooldown_secs: default_cooldown_secs(),
        }
    }

    pub fn with_condition(mut self, condition: AlertCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channels.push(channel.into());
        self
    }

    pub fn with_cooldown_secs(mut self, secs: u64) -> Self {
        self.cooldown_secs = secs;
        self
    }

    pub fn validate(&self) -> Result<(), HealingError> {
        let invalid = |reason: &str| HealingError::InvalidAlertPattern {
            name: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if self.conditions.is_empty() {
            return Err(invalid("at least one condition is required"));
        }
        if self.cooldown_secs > MAX_WINDOW_SECS {
            return Err(invalid("cooldown must not exceed 30 days"));
        }
        for condition in &self.conditions {
            if condition.window_secs == 0 {
                return Err(invalid("condition window must be positive"));
            }
            if condition.window_secs > MAX_WINDOW_SECS {
                return Err(invalid("condition window must not exceed 30 days"));
            }
            if !condition.threshold.is_finite() {
                return Err(invalid("condition threshold must be finite"));
            }
        }
        Ok(())
    }
}

/// A fired alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub pattern_name: String,
    pub severity: Severity,
    pub message: String,
    pub channels: Vec<String>,
    pub fired_at: DateTime<Utc>,
    /// Metric values observed when the alert fired, keyed by metric name.
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

impl Alert {
    pub fn new(
        pattern_name: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
        channels: Vec<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            pattern_name: pattern_name.into(),
            severity,
            message: message.into(),
            channels,
            fired_at: Utc::now(),
            metrics: BTreeMap::new(),
        }
    }

    pub fn at(mut self, fired_at: DateTime<Utc>) -> Self {
        self.fired_at = fired_at;
        self
    }

    pub fn with_metric(mut self, metric: AlertMetric, value: f64) -> Self {
        self.metrics.insert(metric.as_str().to_string(), value);
        self
    }
}
