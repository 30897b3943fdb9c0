//! Monitor tests: alert delivery, cooldowns, spike sweeps and metrics.

use chrono::{Duration as ChronoDuration, Utc};
use selfmend::monitor::{
    AlertCondition, AlertMetric, AlertPattern, ComparisonOperator, ErrorMonitor, MonitorConfig,
    TimeRange, SPIKE_PATTERN_NAME,
};
use selfmend::store::{ChannelDispatcher, ErrorStore, InMemoryStore, TracingDispatcher};
use selfmend::types::{ErrorClassification, ErrorContext, ErrorType, Severity};
use std::sync::Arc;

fn count_pattern(name: &str, threshold: f64) -> AlertPattern {
    AlertPattern::new(name, Severity::High)
        .with_condition(AlertCondition::new(
            AlertMetric::ErrorCount,
            ComparisonOperator::Gte,
            threshold,
            60,
        ))
        .with_channel("ops")
}

fn classification_for(ctx: &ErrorContext, error_type: ErrorType, severity: Severity) -> ErrorClassification {
    let mut c = ErrorClassification::fallback(ctx, "fp");
    c.error_type = error_type;
    c.severity = severity;
    c
}

#[tokio::test]
async fn test_alert_delivered_to_registered_channel() {
    let store = Arc::new(InMemoryStore::new());
    let mut dispatcher = ChannelDispatcher::new();
    let mut ops = dispatcher.register("ops", 8);
    let config = MonitorConfig {
        alert_patterns: vec![count_pattern("burst", 2.0)],
        ..Default::default()
    };
    let monitor = ErrorMonitor::new(config, store.clone(), Arc::new(dispatcher));

    assert!(monitor
        .record_error(&ErrorContext::new("a", "worker"))
        .await
        .is_empty());
    let fired = monitor.record_error(&ErrorContext::new("b", "worker")).await;
    assert_eq!(fired.len(), 1);

    let delivered = ops.try_recv().unwrap();
    assert_eq!(delivered.pattern_name, "burst");
    assert_eq!(delivered.metrics["error_count"], 2.0);
    assert_eq!(store.alerts().len(), 1);
    assert_eq!(monitor.stats().dispatch_failures, 0);
}

#[tokio::test]
async fn test_unknown_channel_counts_as_dispatch_failure() {
    let store = Arc::new(InMemoryStore::new());
    let config = MonitorConfig {
        alert_patterns: vec![count_pattern("burst", 1.0).with_channel("pager")],
        ..Default::default()
    };
    let monitor = ErrorMonitor::new(config, store.clone(), Arc::new(ChannelDispatcher::new()));
    let fired = monitor.record_error(&ErrorContext::new("a", "worker")).await;
    assert_eq!(fired.len(), 1);
    assert_eq!(monitor.stats().dispatch_failures, 2);
    // Still persisted even though nobody received it.
    assert_eq!(store.alerts().len(), 1);
}

#[tokio::test]
async fn test_cooldown_suppresses_refire() {
    let monitor = ErrorMonitor::new(
        MonitorConfig {
            alert_patterns: vec![count_pattern("burst", 1.0).with_cooldown_secs(600)],
            ..Default::default()
        },
        Arc::new(InMemoryStore::new()),
        Arc::new(TracingDispatcher),
    );
    assert_eq!(monitor.record_error(&ErrorContext::new("a", "w")).await.len(), 1);
    assert!(monitor.record_error(&ErrorContext::new("a", "w")).await.is_empty());
    assert!(monitor.in_cooldown("burst", Utc::now()));

    let later = Utc::now() + ChronoDuration::seconds(601);
    assert!(!monitor.in_cooldown("burst", later));
}

#[tokio::test]
async fn test_configure_alerts_rejects_invalid_pattern() {
    let monitor = ErrorMonitor::new(
        MonitorConfig::default(),
        Arc::new(InMemoryStore::new()),
        Arc::new(TracingDispatcher),
    );
    let empty = AlertPattern::new("no_conditions", Severity::Low);
    assert!(monitor
        .configure_alerts(vec![count_pattern("ok", 5.0), empty])
        .await
        .is_err());
    assert!(monitor.patterns().is_empty());
}

#[tokio::test]
async fn test_sweep_detects_spike_once() {
    let monitor = ErrorMonitor::new(
        MonitorConfig {
            spike_threshold: 3,
            ..Default::default()
        },
        Arc::new(InMemoryStore::new()),
        Arc::new(TracingDispatcher),
    );
    for _ in 0..4 {
        monitor.record_error(&ErrorContext::new("a", "worker")).await;
    }
    let now = Utc::now();
    let report = monitor.sweep_at(now).await;
    let spike = report.spike.unwrap();
    assert_eq!(spike.pattern_name, SPIKE_PATTERN_NAME);
    assert_eq!(spike.severity, Severity::Critical);

    assert!(monitor.sweep_at(now).await.spike.is_none());
    assert_eq!(monitor.stats().spikes_detected, 1);
}

#[tokio::test]
async fn test_sweep_prunes_past_retention() {
    let monitor = ErrorMonitor::new(
        MonitorConfig {
            retention_secs: 60,
            ..Default::default()
        },
        Arc::new(InMemoryStore::new()),
        Arc::new(TracingDispatcher),
    );
    let old = ErrorContext::new("a", "w").with_timestamp(Utc::now() - ChronoDuration::hours(2));
    monitor.record_error(&old).await;
    monitor.record_error(&ErrorContext::new("a", "w")).await;
    let report = monitor.sweep_at(Utc::now()).await;
    assert_eq!(report.pruned_records, 1);
    assert_eq!(monitor.record_count(), 1);
}

#[tokio::test]
async fn test_metrics_and_resolution_rate() {
    let store = Arc::new(InMemoryStore::new());
    let monitor = ErrorMonitor::new(MonitorConfig::default(), store.clone(), Arc::new(TracingDispatcher));

    let db = ErrorContext::new("db-1", "db");
    let net = ErrorContext::new("api-1", "api");
    monitor.record_error(&db).await;
    monitor.record_error(&net).await;
    monitor
        .annotate(&db.error_id, &classification_for(&db, ErrorType::DatabaseError, Severity::High))
        .await;
    assert!(monitor.mark_resolved(&db.error_id));
    assert!(!monitor.mark_resolved("missing"));

    let metrics = monitor.get_metrics(TimeRange::last(ChronoDuration::hours(1), Utc::now()));
    assert_eq!(metrics.total_errors, 2);
    assert_eq!(metrics.by_type["database_error"], 1);
    assert_eq!(metrics.by_type["unclassified"], 1);
    assert_eq!(metrics.by_agent["api-1"], 1);
    assert_eq!(metrics.resolution_rate, 0.5);

    // Annotation is mirrored into the event log for correlation.
    let stored = store.get_context(&db.error_id).await.unwrap();
    assert!(stored.is_some());
    assert_eq!(store.event_count(), 1);
}

#[tokio::test]
async fn test_trends_cover_a_day() {
    let monitor = ErrorMonitor::new(
        MonitorConfig::default(),
        Arc::new(InMemoryStore::new()),
        Arc::new(TracingDispatcher),
    );
    let ctx = ErrorContext::new("a", "w");
    monitor.record_error(&ctx).await;
    monitor
        .annotate(&ctx.error_id, &classification_for(&ctx, ErrorType::TimeoutError, Severity::Critical))
        .await;

    let trends = monitor.get_trends(Some("a"));
    assert_eq!(trends.len(), 24);
    let hit: Vec<_> = trends.iter().filter(|t| t.error_count > 0).collect();
    assert_eq!(hit.len(), 1);
    assert_eq!(hit[0].critical_count, 1);
    assert_eq!(hit[0].top_error_type, Some(ErrorType::TimeoutError));

    assert!(monitor
        .get_trends(Some("other"))
        .iter()
        .all(|t| t.error_count == 0));
}

#[tokio::test]
async fn test_annotation_reevaluates_severity_patterns() {
    let monitor = ErrorMonitor::new(
        MonitorConfig {
            alert_patterns: vec![AlertPattern::new("critical_seen", Severity::Critical)
                .with_condition(AlertCondition::new(
                    AlertMetric::CriticalErrorCount,
                    ComparisonOperator::Gte,
                    1.0,
                    300,
                ))],
            ..Default::default()
        },
        Arc::new(InMemoryStore::new()),
        Arc::new(TracingDispatcher),
    );
    let ctx = ErrorContext::new("worker-1", "worker");

    // Severity is unknown until the occurrence is classified.
    assert!(monitor.record_error(&ctx).await.is_empty());
    let fired = monitor
        .annotate(
            &ctx.error_id,
            &classification_for(&ctx, ErrorType::ResourceExhaustion, Severity::Critical),
        )
        .await;
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].pattern_name, "critical_seen");

    // Cooling down: an unrelated occurrence does not refire it.
    assert!(monitor
        .record_error(&ErrorContext::new("worker-2", "worker"))
        .await
        .is_empty());
}
