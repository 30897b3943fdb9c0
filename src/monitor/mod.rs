//! Error Monitor
//!
//! Records every error occurrence, computes rolling metrics and hourly
//! trends, evaluates configured alert patterns under a cooldown and runs a
//! periodic sweep for cooldown expiry, retention and system-wide spikes.
//!
//! ```text
//! record_error ──► occurrence log ──► evaluate patterns ──► dispatch + persist
//!                        ▲                                         │
//!   annotate / resolve ──┘                 cooldown until t0 + C ◄─┘
//!
//! sweep (interval) ──► expire cooldowns ──► spike check ──► prune retention
//! ```

mod alert;

pub use alert::{
    Alert, AlertCondition, AlertMetric, AlertPattern, ComparisonOperator, MAX_WINDOW_SECS,
};

use alert::bounded_secs;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::errors::Result;
use crate::store::{dispatch_to_channels, AlertDispatcher, ErrorStore};
use crate::types::{
    ErrorClassification, ErrorContext, ErrorType, LogLevel, Severity, SystemEvent,
};

/// Pattern name used for the built-in spike signal.
pub const SPIKE_PATTERN_NAME: &str = "system_error_spike";

/// Longest retention the sweep honours (one year).
pub const MAX_RETENTION_SECS: u64 = 365 * 24 * 60 * 60;

/// Occurrence-recording seam used by the manager.
#[async_trait]
pub trait ErrorRecorder: Send + Sync {
    /// Record an occurrence; returns the alerts it caused to fire.
    async fn record(&self, context: &ErrorContext) -> Result<Vec<Alert>>;

    /// Attach the classification to a recorded occurrence; returns the
    /// alerts that fire once its severity and type are known.
    async fn annotate(&self, error_id: &str, classification: &ErrorClassification) -> Vec<Alert>;

    async fn mark_resolved(&self, error_id: &str) -> bool;
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Errors within the spike window that trigger the spike signal.
    pub spike_threshold: usize,
    pub spike_window_secs: u64,
    pub spike_cooldown_secs: u64,
    pub spike_channels: Vec<String>,
    pub retention_secs: u64,
    pub sweep_interval_secs: u64,
    /// Hard cap on the in-memory occurrence log.
    pub max_records: usize,
    pub alert_patterns: Vec<AlertPattern>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            spike_threshold: 100,
            spike_window_secs: 300,
            spike_cooldown_secs: 300,
            spike_channels: vec!["ops".to_string()],
            retention_secs: 24 * 3600,
            sweep_interval_secs: 60,
            max_records: 100_000,
            alert_patterns: Vec::new(),
        }
    }
}

// ============================================================================
// Records, metrics, trends
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorRecord {
    pub error_id: String,
    pub agent_id: String,
    pub agent_type: String,
    pub timestamp: DateTime<Utc>,
    pub error_type: Option<ErrorType>,
    pub severity: Option<Severity>,
    pub response_time_ms: f64,
    pub memory_usage: f64,
    pub cpu_usage: f64,
    pub resolved: bool,
}

impl ErrorRecord {
    fn from_context(context: &ErrorContext) -> Self {
        Self {
            error_id: context.error_id.clone(),
            agent_id: context.agent_id.clone(),
            agent_type: context.agent_type.clone(),
            timestamp: context.timestamp,
            error_type: None,
            severity: None,
            response_time_ms: context.environment.response_time_ms,
            memory_usage: context.environment.memory_usage,
            cpu_usage: context.environment.cpu_usage,
            resolved: false,
        }
    }

    fn is_critical(&self) -> bool {
        self.severity.map(|s| s >= Severity::Critical).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The `duration` ending at `now`.
    pub fn last(duration: ChronoDuration, now: DateTime<Utc>) -> Self {
        Self {
            start: now - duration,
            end: now,
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts <= self.end
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub range: TimeRange,
    pub total_errors: u64,
    pub by_type: BTreeMap<String, u64>,
    pub by_severity: BTreeMap<String, u64>,
    pub by_agent: BTreeMap<String, u64>,
    pub resolved: u64,
    /// Resolved fraction in [0,1]; zero when nothing was recorded.
    pub resolution_rate: f64,
    pub errors_per_minute: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Increasing,
    Decreasing,
    Stable,
}

/// One hourly bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorTrend {
    pub hour_start: DateTime<Utc>,
    pub error_count: u64,
    pub critical_count: u64,
    pub top_error_type: Option<ErrorType>,
    pub direction: TrendDirection,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub expired_cooldowns: usize,
    pub pruned_records: usize,
    pub spike: Option<Alert>,
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Default)]
pub struct MonitorStats {
    errors_recorded: AtomicU64,
    alerts_fired: AtomicU64,
    spikes_detected: AtomicU64,
    dispatch_failures: AtomicU64,
    store_failures: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatsSummary {
    pub errors_recorded: u64,
    pub alerts_fired: u64,
    pub spikes_detected: u64,
    pub dispatch_failures: u64,
    pub store_failures: u64,
}

impl MonitorStats {
    pub fn summary(&self) -> MonitorStatsSummary {
        MonitorStatsSummary {
            errors_recorded: self.errors_recorded.load(Ordering::Relaxed),
            alerts_fired: self.alerts_fired.load(Ordering::Relaxed),
            spikes_detected: self.spikes_detected.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Monitor
// ============================================================================

#[derive(Default)]
struct MonitorState {
    records: VecDeque<ErrorRecord>,
    patterns: Vec<AlertPattern>,
    /// Pattern name -> instant the cooldown ends.
    cooldowns: HashMap<String, DateTime<Utc>>,
}

pub struct ErrorMonitor {
    config: MonitorConfig,
    store: Arc<dyn ErrorStore>,
    dispatcher: Arc<dyn AlertDispatcher>,
    state: RwLock<MonitorState>,
    stats: MonitorStats,
}

impl ErrorMonitor {
    /// Create a monitor. Patterns from the config that fail validation are
    /// skipped with a warning.
    pub fn new(
        config: MonitorConfig,
        store: Arc<dyn ErrorStore>,
        dispatcher: Arc<dyn AlertDispatcher>,
    ) -> Self {
        let patterns = config
            .alert_patterns
            .iter()
            .filter(|p| match p.validate() {
                Ok(()) => true,
                Err(e) => {
                    warn!(pattern = %p.name, error = %e, "Skipping invalid alert pattern");
                    false
                }
            })
            .cloned()
            .collect();
        Self {
            config,
            store,
            dispatcher,
            state: RwLock::new(MonitorState {
                patterns,
                ..Default::default()
            }),
            stats: MonitorStats::default(),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn stats(&self) -> MonitorStatsSummary {
        self.stats.summary()
    }

    pub fn record_count(&self) -> usize {
        self.state.read().records.len()
    }

    pub fn patterns(&self) -> Vec<AlertPattern> {
        self.state.read().patterns.clone()
    }

    /// Whether the named pattern is cooling down at `now`.
    pub fn in_cooldown(&self, pattern_name: &str, now: DateTime<Utc>) -> bool {
        self.state
            .read()
            .cooldowns
            .get(pattern_name)
            .map(|until| *until > now)
            .unwrap_or(false)
    }

    /// Store the occurrence and re-evaluate every alert pattern.
    pub async fn record_error(&self, context: &ErrorContext) -> Vec<Alert> {
        if let Err(e) = self.store.store_context(context).await {
            self.stats.store_failures.fetch_add(1, Ordering::Relaxed);
            warn!(error_id = %context.error_id, error = %e, "Failed to persist error context");
        }

        {
            let mut state = self.state.write();
            state.records.push_back(ErrorRecord::from_context(context));
            while state.records.len() > self.config.max_records {
                state.records.pop_front();
            }
        }
        self.stats.errors_recorded.fetch_add(1, Ordering::Relaxed);
        debug!(error_id = %context.error_id, agent_id = %context.agent_id, "Error recorded");

        self.evaluate_alerts_at(Utc::now()).await
    }

    /// Replace the configured alert patterns. Every pattern is validated
    /// before any is installed.
    pub async fn configure_alerts(&self, patterns: Vec<AlertPattern>) -> Result<()> {
        for pattern in &patterns {
            pattern.validate()?;
        }
        for pattern in &patterns {
            if let Err(e) = self.store.store_alert_pattern(pattern).await {
                self.stats.store_failures.fetch_add(1, Ordering::Relaxed);
                warn!(pattern = %pattern.name, error = %e, "Failed to persist alert pattern");
            }
        }
        let count = patterns.len();
        let mut state = self.state.write();
        let names: Vec<&str> = patterns.iter().map(|p| p.name.as_str()).collect();
        state
            .cooldowns
            .retain(|name, _| name == SPIKE_PATTERN_NAME || names.contains(&name.as_str()));
        state.patterns = patterns;
        info!(patterns = count, "Alert patterns configured");
        Ok(())
    }

    /// Evaluate every pattern not in cooldown against the occurrence log
    /// as of `now`, firing those whose conditions all hold.
    pub async fn evaluate_alerts_at(&self, now: DateTime<Utc>) -> Vec<Alert> {
        let to_fire: Vec<Alert> = {
            let mut state = self.state.write();
            let mut fired = Vec::new();
            let candidates: Vec<AlertPattern> = state
                .patterns
                .iter()
                .filter(|p| {
                    state
                        .cooldowns
                        .get(&p.name)
                        .map(|until| *until <= now)
                        .unwrap_or(true)
                })
                .cloned()
                .collect();

            for pattern in candidates {
                let mut values = Vec::with_capacity(pattern.conditions.len());
                let holds = pattern.conditions.iter().all(|c| {
                    let value = metric_value(&state.records, c.metric, c.window_secs, now);
                    values.push((c.metric, value));
                    c.operator.compare(value, c.threshold)
                });
                if !holds {
                    continue;
                }
                let cooldown = bounded_secs(pattern.cooldown_secs);
                state.cooldowns.insert(pattern.name.clone(), now + cooldown);

                let summary = values
                    .iter()
                    .map(|(m, v)| format!("{}={:.2}", m.as_str(), v))
                    .collect::<Vec<_>>()
                    .join(", ");
                let mut alert = Alert::new(
                    pattern.name.clone(),
                    pattern.severity,
                    format!("Alert '{}' triggered ({})", pattern.name, summary),
                    pattern.channels.clone(),
                )
                .at(now);
                for (metric, value) in values {
                    alert = alert.with_metric(metric, value);
                }
                fired.push(alert);
            }
            fired
        };

        for alert in &to_fire {
            self.deliver(alert).await;
        }
        to_fire
    }

    async fn deliver(&self, alert: &Alert) {
        warn!(
            alert_id = %alert.id,
            pattern = %alert.pattern_name,
            severity = %alert.severity,
            "Alert fired"
        );
        self.stats.alerts_fired.fetch_add(1, Ordering::Relaxed);
        let delivered =
            dispatch_to_channels(self.dispatcher.as_ref(), alert, &alert.channels).await;
        let failed = alert.channels.len().saturating_sub(delivered.len());
        self.stats
            .dispatch_failures
            .fetch_add(failed as u64, Ordering::Relaxed);
        if let Err(e) = self.store.store_alert(alert).await {
            self.stats.store_failures.fetch_add(1, Ordering::Relaxed);
            warn!(alert_id = %alert.id, error = %e, "Failed to persist alert");
        }
    }

    /// Attach a classification to a recorded occurrence and log it as a
    /// system event. Patterns are re-evaluated because severity-based
    /// metrics only count the occurrence from here on.
    pub async fn annotate(&self, error_id: &str, classification: &ErrorClassification) -> Vec<Alert> {
        let found = {
            let mut state = self.state.write();
            state
                .records
                .iter_mut()
                .rev()
                .find(|r| r.error_id == error_id)
                .map(|record| {
                    record.error_type = Some(classification.error_type);
                    record.severity = Some(classification.severity);
                    (record.agent_id.clone(), record.timestamp)
                })
        };
        let Some((agent_id, timestamp)) = found else {
            debug!(error_id = %error_id, "Annotating unknown error record");
            return Vec::new();
        };

        let mut event = SystemEvent::new(
            agent_id.clone(),
            "error_classified",
            LogLevel::Error,
            classification.severity,
            format!(
                "{} error in agent {}",
                classification.error_type, agent_id
            ),
        )
        .at(timestamp);
        event
            .metadata
            .insert("error_id".to_string(), serde_json::json!(error_id));
        event.metadata.insert(
            "error_type".to_string(),
            serde_json::json!(classification.error_type.as_str()),
        );
        if let Err(e) = self.store.append_event(&event).await {
            self.stats.store_failures.fetch_add(1, Ordering::Relaxed);
            warn!(error_id = %error_id, error = %e, "Failed to append system event");
        }

        self.evaluate_alerts_at(Utc::now()).await
    }

    pub fn mark_resolved(&self, error_id: &str) -> bool {
        let mut state = self.state.write();
        match state.records.iter_mut().rev().find(|r| r.error_id == error_id) {
            Some(record) => {
                record.resolved = true;
                true
            }
            None => false,
        }
    }

    pub fn get_metrics(&self, range: TimeRange) -> ErrorMetrics {
        let state = self.state.read();
        let mut metrics = ErrorMetrics {
            range,
            total_errors: 0,
            by_type: BTreeMap::new(),
            by_severity: BTreeMap::new(),
            by_agent: BTreeMap::new(),
            resolved: 0,
            resolution_rate: 0.0,
            errors_per_minute: 0.0,
        };

        for record in state.records.iter().filter(|r| range.contains(r.timestamp)) {
            metrics.total_errors += 1;
            let ty = record
                .error_type
                .map(|t| t.as_str())
                .unwrap_or("unclassified");
            *metrics.by_type.entry(ty.to_string()).or_default() += 1;
            let sev = record
                .severity
                .map(|s| s.as_str())
                .unwrap_or("unclassified");
            *metrics.by_severity.entry(sev.to_string()).or_default() += 1;
            *metrics.by_agent.entry(record.agent_id.clone()).or_default() += 1;
            if record.resolved {
                metrics.resolved += 1;
            }
        }

        if metrics.total_errors > 0 {
            metrics.resolution_rate = metrics.resolved as f64 / metrics.total_errors as f64;
        }
        let minutes = (range.end - range.start).num_seconds() as f64 / 60.0;
        if minutes > 0.0 {
            metrics.errors_per_minute = metrics.total_errors as f64 / minutes;
        }
        metrics
    }

    pub fn get_trends(&self, agent_id: Option<&str>) -> Vec<ErrorTrend> {
        self.get_trends_at(agent_id, Utc::now())
    }

    /// 24 hourly buckets ending with the hour containing `now`, oldest first.
    pub fn get_trends_at(&self, agent_id: Option<&str>, now: DateTime<Utc>) -> Vec<ErrorTrend> {
        let current_hour = now
            .with_minute(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(now);
        let first_hour = current_hour - ChronoDuration::hours(23);

        let mut buckets: Vec<(u64, u64, BTreeMap<ErrorType, u64>)> =
            vec![(0, 0, BTreeMap::new()); 24];
        {
            let state = self.state.read();
            for record in state.records.iter() {
                if agent_id.map(|a| a != record.agent_id).unwrap_or(false) {
                    continue;
                }
                if record.timestamp < first_hour || record.timestamp > now {
                    continue;
                }
                let idx = (record.timestamp - first_hour).num_hours() as usize;
                let Some(bucket) = buckets.get_mut(idx) else {
                    continue;
                };
                bucket.0 += 1;
                if record.is_critical() {
                    bucket.1 += 1;
                }
                if let Some(ty) = record.error_type {
                    *bucket.2.entry(ty).or_default() += 1;
                }
            }
        }

        let mut trends = Vec::with_capacity(24);
        let mut previous: Option<u64> = None;
        for (i, (count, critical, types)) in buckets.into_iter().enumerate() {
            let direction = match previous {
                Some(prev) if count > prev => TrendDirection::Increasing,
                Some(prev) if count < prev => TrendDirection::Decreasing,
                _ => TrendDirection::Stable,
            };
            // Ties resolve to the lowest type in enum order.
            let top_error_type = types
                .iter()
                .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
                .map(|(ty, _)| *ty);
            trends.push(ErrorTrend {
                hour_start: first_hour + ChronoDuration::hours(i as i64),
                error_count: count,
                critical_count: critical,
                top_error_type,
                direction,
            });
            previous = Some(count);
        }
        trends
    }

    /// One sweep pass: expire cooldowns, check for a system-wide spike and
    /// prune records past the retention window.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        let spike = {
            let mut state = self.state.write();
            let before = state.cooldowns.len();
            state.cooldowns.retain(|_, until| *until > now);
            report.expired_cooldowns = before - state.cooldowns.len();

            let window_start = now - bounded_secs(self.config.spike_window_secs);
            let count = state
                .records
                .iter()
                .filter(|r| r.timestamp > window_start && r.timestamp <= now)
                .count();

            let spike = if count > self.config.spike_threshold
                && !state.cooldowns.contains_key(SPIKE_PATTERN_NAME)
            {
                let cooldown = bounded_secs(self.config.spike_cooldown_secs);
                state
                    .cooldowns
                    .insert(SPIKE_PATTERN_NAME.to_string(), now + cooldown);
                Some(
                    Alert::new(
                        SPIKE_PATTERN_NAME,
                        Severity::Critical,
                        format!(
                            "System-wide error spike: {} errors in the last {}s (threshold {})",
                            count, self.config.spike_window_secs, self.config.spike_threshold
                        ),
                        self.config.spike_channels.clone(),
                    )
                    .at(now)
                    .with_metric(AlertMetric::ErrorCount, count as f64),
                )
            } else {
                None
            };

            let cutoff = now - ChronoDuration::seconds(self.config.retention_secs.min(MAX_RETENTION_SECS) as i64);
            let before = state.records.len();
            state.records.retain(|r| r.timestamp >= cutoff);
            report.pruned_records = before - state.records.len();
            spike
        };

        if let Some(alert) = spike {
            self.stats.spikes_detected.fetch_add(1, Ordering::Relaxed);
            self.deliver(&alert).await;
            report.spike = Some(alert);
        }
        if report.pruned_records > 0 || report.expired_cooldowns > 0 {
            debug!(
                pruned = report.pruned_records,
                expired_cooldowns = report.expired_cooldowns,
                "Monitor sweep"
            );
        }
        report
    }

    /// Run [`Self::sweep_at`] on a fixed interval until the task is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        let period = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                monitor.sweep_at(Utc::now()).await;
            }
        })
    }
}

#[async_trait]
impl ErrorRecorder for ErrorMonitor {
    async fn record(&self, context: &ErrorContext) -> Result<Vec<Alert>> {
        Ok(self.record_error(context).await)
    }

    async fn annotate(&self, error_id: &str, classification: &ErrorClassification) -> Vec<Alert> {
        ErrorMonitor::annotate(self, error_id, classification).await
    }

    async fn mark_resolved(&self, error_id: &str) -> bool {
        ErrorMonitor::mark_resolved(self, error_id)
    }
}

fn metric_value(
    records: &VecDeque<ErrorRecord>,
    metric: AlertMetric,
    window_secs: u64,
    now: DateTime<Utc>,
) -> f64 {
    let start = now - bounded_secs(window_secs);
    let in_window = || {
        records
            .iter()
            .filter(move |r| r.timestamp > start && r.timestamp <= now)
    };
    let mean = |f: fn(&ErrorRecord) -> f64| {
        let (sum, n) = in_window().fold((0.0, 0usize), |(s, n), r| (s + f(r), n + 1));
        if n == 0 {
            0.0
        } else {
            sum / n as f64
        }
    };

    match metric {
        AlertMetric::ErrorCount => in_window().count() as f64,
        AlertMetric::ErrorRate => {
            let minutes = window_secs as f64 / 60.0;
            if minutes > 0.0 {
                in_window().count() as f64 / minutes
            } else {
                0.0
            }
        }
        AlertMetric::CriticalErrorCount => in_window().filter(|r| r.is_critical()).count() as f64,
        AlertMetric::ResponseTime => mean(|r| r.response_time_ms),
        AlertMetric::MemoryUsage => mean(|r| r.memory_usage),
        AlertMetric::CpuUsage => mean(|r| r.cpu_usage),
    }
}
