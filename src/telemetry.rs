//! Telemetry
//!
//! Structured logging setup for the healing pipeline:
//! - Filter from `SELFMEND_LOG`, then `RUST_LOG`
//! - Compact or JSON output, always on stderr
//! - Sanitising and secret redaction for agent-supplied text

use regex::Regex;
use std::sync::{Once, OnceLock};
use tracing::{info_span, Span};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Initialize tracing from the environment. Stays silent unless a filter
/// is set so CLI output is not polluted.
pub fn init_tracing() {
    if let Some(filter) = env_filter() {
        init_tracing_with_filter(&filter);
    }
}

fn env_filter() -> Option<String> {
    std::env::var("SELFMEND_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
}

/// Initialize with a custom filter string. Later calls are no-ops.
pub fn init_tracing_with_filter(filter: &str) {
    INIT.call_once(|| {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .with_level(true)
            .compact()
            .with_writer(std::io::stderr);

        let filter_layer = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("warn"));

        let _ = tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .try_init();
    });
}

/// JSON lines on stderr, for log shippers.
pub fn init_tracing_json(filter: &str) {
    INIT.call_once(|| {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(std::io::stderr);

        let filter_layer = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("warn"));

        let _ = tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .try_init();
    });
}

/// Span wrapping one `handle` invocation.
pub fn handle_span(error_id: &str, agent_id: &str) -> Span {
    info_span!(
        "handle_error",
        error_id = %error_id,
        agent_id = %agent_id,
        approach = tracing::field::Empty,
        success = tracing::field::Empty,
    )
}

/// Escape control characters so agent text cannot forge log lines.
pub fn sanitize_for_log(s: &str) -> String {
    let redacted = redact_secrets(s);
    let mut out = String::with_capacity(redacted.len());
    for c in redacted.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\x1b' => out.push_str("\\e"),
            '\x00' => out.push_str("\\0"),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            _ => out.push(c),
        }
    }
    out
}

static SECRET_PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();

fn secret_patterns() -> &'static [Regex] {
    SECRET_PATTERNS.get_or_init(|| {
        [
            r"(?i)(sk-|key-|token-)[A-Za-z0-9_\-]{8,}",
            r"(?i)Bearer\s+[A-Za-z0-9_\-\.]{8,}",
            r"(?i)(password|passwd|pwd)\s*=\s*\S+",
            r"(?i)(postgres|mysql|redis|amqp)://[^:\s]+:[^@\s]+@",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// Replace API keys, bearer tokens and connection-string passwords with
/// `[REDACTED]`.
pub fn redact_secrets(input: &str) -> String {
    let mut result = input.to_string();
    for pattern in secret_patterns() {
        result = pattern.replace_all(&result, "[REDACTED]").to_string();
    }
    result
}
