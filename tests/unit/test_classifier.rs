//! Classifier behaviour through the public API: rule registry, history,
//! caching and operator feedback.

use selfmend::classifier::{ClassificationFeedback, ClassifierConfig, ErrorClassifier};
use selfmend::registry::{ClassificationRule, ErrorRegistry, StaticRuleSource};
use selfmend::store::{ErrorStore, InMemoryStore};
use selfmend::types::{AgentFailure, EnvironmentSnapshot, ErrorContext, ErrorType, Severity};
use std::sync::Arc;

fn classifier_with(registry: ErrorRegistry) -> (ErrorClassifier, Arc<InMemoryStore>) {
    let store = Arc::new(InMemoryStore::new());
    let classifier = ErrorClassifier::new(
        Arc::new(registry),
        store.clone(),
        ClassifierConfig::default(),
    );
    (classifier, store)
}

// ============================================================================
// Strategies
// ============================================================================

mod strategy_tests {
    use super::*;

    #[tokio::test]
    async fn test_database_connection_refused() {
        let (classifier, _) = classifier_with(ErrorRegistry::with_defaults());
        let ctx = ErrorContext::new("ingest-1", "ingest");
        let c = classifier
            .classify(
                &AgentFailure::new("DatabaseError", "database connection refused"),
                &ctx,
            )
            .await;
        assert_eq!(c.error_type, ErrorType::DatabaseError);
        assert_eq!(c.error_id, ctx.error_id);
        assert!(c.confidence_score > 0.5 && c.confidence_score <= 1.0);
    }

    #[tokio::test]
    async fn test_unmatched_failure_still_classifies() {
        let (classifier, _) = classifier_with(ErrorRegistry::empty());
        let ctx = ErrorContext::new("a", "worker");
        let c = classifier
            .classify(&AgentFailure::new("Weird", "zzz qqq"), &ctx)
            .await;
        assert_eq!(c.error_type, ErrorType::SystemError);
        assert!((0.0..=1.0).contains(&c.confidence_score));
        assert_eq!(c.fingerprint.len(), 32);
    }

    #[tokio::test]
    async fn test_memory_pressure_overrides_vague_message() {
        let (classifier, _) = classifier_with(ErrorRegistry::empty());
        let ctx = ErrorContext::new("a", "worker").with_environment(EnvironmentSnapshot {
            memory_usage: 97.0,
            ..Default::default()
        });
        let c = classifier
            .classify(&AgentFailure::new("Error", "allocation of buffer"), &ctx)
            .await;
        assert_eq!(c.error_type, ErrorType::ResourceExhaustion);
        assert!(!c.is_retryable);
    }

    #[tokio::test]
    async fn test_security_flag_requires_attention() {
        let (classifier, _) = classifier_with(ErrorRegistry::with_defaults());
        let ctx = ErrorContext::new("a", "worker")
            .with_metadata("security_related", serde_json::json!(true));
        let c = classifier
            .classify(&AgentFailure::new("Error", "invalid input field"), &ctx)
            .await;
        assert!(c.requires_immediate_attention);
    }
}

// ============================================================================
// Registry
// ============================================================================

mod registry_tests {
    use super::*;

    #[tokio::test]
    async fn test_custom_rule_from_source() {
        let registry = ErrorRegistry::with_defaults();
        let source = StaticRuleSource(vec![ClassificationRule::new(
            "ledger",
            r"(?i)ledger imbalance",
            ErrorType::BusinessLogicError,
            Severity::High,
        )
        .retryable(false)]);
        assert_eq!(registry.extend_from(&source).unwrap(), 1);

        let (classifier, _) = classifier_with(registry);
        let c = classifier
            .classify(
                &AgentFailure::new("LedgerError", "ledger imbalance after posting"),
                &ErrorContext::new("books-1", "books"),
            )
            .await;
        assert_eq!(c.error_type, ErrorType::BusinessLogicError);
    }

    #[test]
    fn test_bad_rule_leaves_registry_untouched() {
        let registry = ErrorRegistry::with_defaults();
        let before = registry.len();
        let source = StaticRuleSource(vec![ClassificationRule::new(
            "bad",
            "(",
            ErrorType::SystemError,
            Severity::Low,
        )]);
        assert!(registry.extend_from(&source).is_err());
        assert_eq!(registry.len(), before);
    }
}

// ============================================================================
// History, cache and feedback
// ============================================================================

mod history_tests {
    use super::*;

    #[tokio::test]
    async fn test_repeat_failure_is_cached_and_versioned() {
        let (classifier, store) = classifier_with(ErrorRegistry::with_defaults());
        let failure = AgentFailure::new("TimeoutError", "request timed out after 30s");
        let first_ctx = ErrorContext::new("w-1", "worker");
        let second_ctx = ErrorContext::new("w-1", "worker");

        let first = classifier.classify(&failure, &first_ctx).await;
        let second = classifier.classify(&failure, &second_ctx).await;

        assert_eq!(first.error_type, second.error_type);
        assert_eq!(second.error_id, second_ctx.error_id);
        assert_eq!(classifier.stats().cache_hits, 1);
        assert!(store
            .current_classification(&second_ctx.error_id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_feedback_for_unknown_error_is_rejected() {
        let (classifier, _) = classifier_with(ErrorRegistry::with_defaults());
        let accepted = classifier
            .submit_feedback(ClassificationFeedback {
                error_id: "never-seen".into(),
                was_correct: false,
                correct_type: Some(ErrorType::NetworkError),
            })
            .await;
        assert!(!accepted);
        assert_eq!(classifier.stats().feedback_received, 0);
    }

    #[tokio::test]
    async fn test_feedback_correction_is_stored_as_new_version() {
        let (classifier, store) = classifier_with(ErrorRegistry::with_defaults());
        let ctx = ErrorContext::new("w-1", "worker");
        let original = classifier
            .classify(&AgentFailure::new("Error", "request timed out"), &ctx)
            .await;
        assert_eq!(original.error_type, ErrorType::TimeoutError);

        let accepted = classifier
            .submit_feedback(ClassificationFeedback {
                error_id: ctx.error_id.clone(),
                was_correct: false,
                correct_type: Some(ErrorType::DependencyError),
            })
            .await;
        assert!(accepted);

        let current = store
            .current_classification(&ctx.error_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.error_type, ErrorType::DependencyError);
        assert_eq!(current.confidence_score, 1.0);
        assert!(current.version > original.version);
        assert_eq!(classifier.stats().feedback_accuracy, 0.0);
    }
}
