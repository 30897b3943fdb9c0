//! Root cause analysis scenarios, alone and alongside the classifier.

use chrono::Duration as ChronoDuration;
use selfmend::analysis::{AnalyzerConfig, RootCauseAnalyzer, RootCauseCategory};
use selfmend::config::HealingConfig;
use selfmend::manager::HealingStack;
use selfmend::store::{ErrorStore, InMemoryStore};
use selfmend::types::{
    AgentFailure, EnvironmentSnapshot, ErrorContext, ErrorType, LogLevel, Severity, SystemEvent,
};
use std::collections::HashSet;
use std::sync::Arc;

fn analyzer() -> (RootCauseAnalyzer, Arc<InMemoryStore>) {
    let store = Arc::new(InMemoryStore::new());
    (
        RootCauseAnalyzer::new(store.clone(), AnalyzerConfig::default()),
        store,
    )
}

#[tokio::test]
async fn test_memory_pressure_scenario_end_to_end() {
    let mut config = HealingConfig::default();
    config.registry.use_defaults = false;
    let stack = HealingStack::in_memory(&config).unwrap();

    let failure = AgentFailure::new("AllocError", "allocation failed");
    let ctx = ErrorContext::new("worker-1", "worker-1")
        .with_stack_trace("at heap::grow\nat worker::run")
        .with_environment(EnvironmentSnapshot {
            memory_usage: 95.0,
            ..Default::default()
        });

    let classification = stack.classifier.classify(&failure, &ctx).await;
    assert_eq!(classification.error_type, ErrorType::ResourceExhaustion);
    assert!(classification.severity >= Severity::High);
    assert!(!classification.is_retryable);

    let analysis = stack.analyzer.analyze(&failure, &ctx).await;
    let leak = analysis
        .root_causes
        .iter()
        .find(|c| c.id == "memory_leak")
        .unwrap();
    assert!(leak.confidence > 0.5);
    assert!(analysis
        .contributing_factors
        .iter()
        .any(|f| f.id == "high_memory_usage"));
}

#[tokio::test]
async fn test_deadlock_points_at_code_defect() {
    let (analyzer, _) = analyzer();
    let ctx = ErrorContext::new("orders-1", "orders").with_environment(EnvironmentSnapshot {
        response_time_ms: 6_000.0,
        ..Default::default()
    });
    let result = analyzer
        .analyze(
            &AgentFailure::new("DbError", "deadlock detected on table orders"),
            &ctx,
        )
        .await;

    let deadlock = result
        .root_causes
        .iter()
        .find(|c| c.id == "database_deadlock")
        .unwrap();
    assert!(deadlock.confidence > 0.7);
    assert_eq!(deadlock.category, RootCauseCategory::CodeDefect);
    assert!(result
        .recommendations
        .iter()
        .any(|r| r.id == "fix_and_redeploy" && !r.steps.is_empty()));
    assert!(result.confidence >= deadlock.confidence);
}

#[tokio::test]
async fn test_timeline_merges_store_events_in_order() {
    let (analyzer, store) = analyzer();
    let ctx = ErrorContext::new("api-1", "api");
    let early = SystemEvent::new("api-1", "log", LogLevel::Warning, Severity::Medium, "slow query warning")
        .at(ctx.timestamp - ChronoDuration::seconds(600));
    let late = SystemEvent::new("api-1", "log", LogLevel::Error, Severity::Medium, "request error")
        .at(ctx.timestamp - ChronoDuration::seconds(10));
    store.append_event(&late).await.unwrap();
    store.append_event(&early).await.unwrap();

    let result = analyzer
        .analyze(&AgentFailure::new("HttpError", "500 returned"), &ctx)
        .await;

    let timeline = &result.timeline;
    assert!(timeline.len() >= 3);
    assert!(timeline
        .events
        .windows(2)
        .all(|w| w[0].timestamp <= w[1].timestamp));
    assert_eq!(timeline.error_event().unwrap().id, ctx.error_id);
    assert_eq!(timeline.start(), Some(early.timestamp));
}

#[tokio::test]
async fn test_ranking_follows_rank_score() {
    let (analyzer, _) = analyzer();
    let ctx = ErrorContext::new("w-1", "worker")
        .with_stack_trace("at config::load\nat heap::grow")
        .with_environment(EnvironmentSnapshot {
            memory_usage: 92.0,
            ..Default::default()
        });
    let result = analyzer
        .analyze(
            &AgentFailure::new("ConfigError", "missing key while allocating memory pool"),
            &ctx,
        )
        .await;

    assert!(result.root_causes.len() >= 2);
    assert!(result
        .root_causes
        .windows(2)
        .all(|w| w[0].rank_score() >= w[1].rank_score()));
    let ids: HashSet<_> = result.root_causes.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids.len(), result.root_causes.len());
}
