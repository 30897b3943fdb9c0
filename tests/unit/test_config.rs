//! Configuration tests: file loading, exit codes and building a stack from
//! a config.

use selfmend::config::HealingConfig;
use selfmend::errors::{get_exit_code, EXIT_CONFIG_ERROR};
use selfmend::manager::HealingStack;
use selfmend::types::{AgentFailure, ErrorContext, ErrorType};
use std::io::Write;

fn write_config(body: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(body.as_bytes()).unwrap();
    file
}

#[test]
fn test_malformed_toml_is_config_error() {
    let file = write_config("[monitor\nspike_threshold = ");
    let err = HealingConfig::load(file.path().to_str()).unwrap_err();
    assert_eq!(get_exit_code(&err), EXIT_CONFIG_ERROR);
}

#[test]
fn test_invalid_alert_pattern_is_config_error() {
    let file = write_config(
        r#"
        [[monitor.alert_patterns]]
        name = "empty"
        severity = "low"
        conditions = []
        "#,
    );
    let err = HealingConfig::load(file.path().to_str()).unwrap_err();
    assert_eq!(get_exit_code(&err), EXIT_CONFIG_ERROR);
}

#[test]
fn test_missing_keys_fall_back_to_defaults() {
    let file = write_config(
        r#"
        [recovery]
        retry_attempts = 4

        [manager]
        handle_timeout_ms = 2000
        "#,
    );
    let config = HealingConfig::load(file.path().to_str()).unwrap();
    assert_eq!(config.recovery.retry_attempts, 4);
    assert_eq!(config.recovery.backoff_base_ms, 100);
    assert_eq!(config.manager.handle_timeout_ms, 2000);
    assert_eq!(config.manager.event_buffer, 256);
}

#[tokio::test]
async fn test_stack_uses_configured_rules_only() {
    let file = write_config(
        r#"
        [registry]
        use_defaults = false

        [[registry.rules]]
        id = "quota"
        pattern = "(?i)quota of \\d+ exhausted"
        error_type = "rate_limit_error"
        severity = "low"
        is_retryable = true
        "#,
    );
    let config = HealingConfig::load(file.path().to_str()).unwrap();
    let stack = HealingStack::in_memory(&config).unwrap();
    assert_eq!(stack.registry.len(), 1);

    let c = stack
        .classifier
        .classify(
            &AgentFailure::new("ApiError", "quota of 500 exhausted"),
            &ErrorContext::new("crawler-1", "crawler"),
        )
        .await;
    assert_eq!(c.error_type, ErrorType::RateLimitError);
    assert!(c.is_retryable);
}

#[test]
fn test_oversized_alert_cooldown_is_config_error() {
    let file = write_config(
        r#"
        [[monitor.alert_patterns]]
        name = "forever"
        severity = "high"
        cooldown_secs = 9223372036854775807

        [[monitor.alert_patterns.conditions]]
        metric = "error_count"
        operator = "gte"
        threshold = 5.0
        window_secs = 60
        "#,
    );
    let err = HealingConfig::load(file.path().to_str()).unwrap_err();
    assert_eq!(get_exit_code(&err), EXIT_CONFIG_ERROR);
}
