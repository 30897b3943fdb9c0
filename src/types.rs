//! Core data model shared by every stage of the healing pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Metadata key carrying the security-related flag.
pub const SECURITY_FLAG: &str = "security_related";

// ============================================================================
// Failure & Context
// ============================================================================

/// The raised error itself: a type name and a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentFailure {
    pub name: String,
    pub message: String,
}

impl AgentFailure {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Capture any std error, using its type name as the failure name.
    pub fn from_error<E: std::error::Error>(err: &E) -> Self {
        let full = std::any::type_name::<E>();
        let name = full.rsplit("::").next().unwrap_or(full);
        Self::new(name, err.to_string())
    }

    /// Message and name lowercased, for keyword matching.
    pub fn search_text(&self) -> String {
        format!("{} {}", self.name, self.message).to_lowercase()
    }
}

/// Environment snapshot captured at the moment of failure.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    /// CPU usage percentage (0-100)
    pub cpu_usage: f64,
    /// Memory usage percentage (0-100)
    pub memory_usage: f64,
    pub active_connections: u32,
    pub response_time_ms: f64,
}

impl EnvironmentSnapshot {
    /// Decile bucket for memory usage, used by cache keys.
    pub fn memory_bucket(&self) -> u8 {
        bucket(self.memory_usage)
    }

    pub fn cpu_bucket(&self) -> u8 {
        bucket(self.cpu_usage)
    }
}

fn bucket(pct: f64) -> u8 {
    if pct.is_nan() {
        return 0;
    }
    (pct.clamp(0.0, 100.0) / 10.0).floor() as u8
}

/// Immutable record of one failure occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub error_id: String,
    pub agent_id: String,
    pub agent_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub stack_trace: Option<String>,
    #[serde(default)]
    pub environment: EnvironmentSnapshot,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ErrorContext {
    pub fn new(agent_id: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            error_id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            agent_type: agent_type.into(),
            timestamp: Utc::now(),
            session_id: None,
            task_id: None,
            request_id: None,
            correlation_id: None,
            stack_trace: None,
            environment: EnvironmentSnapshot::default(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_error_id(mut self, id: impl Into<String>) -> Self {
        self.error_id = id.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_stack_trace(mut self, trace: impl Into<String>) -> Self {
        self.stack_trace = Some(trace.into());
        self
    }

    pub fn with_environment(mut self, environment: EnvironmentSnapshot) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// Whether the reporter flagged this failure as security related.
    pub fn is_security_related(&self) -> bool {
        match self.metadata.get(SECURITY_FLAG) {
            Some(serde_json::Value::Bool(flag)) => *flag,
            Some(serde_json::Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    pub fn stack_text(&self) -> &str {
        self.stack_trace.as_deref().unwrap_or("")
    }
}

// ============================================================================
// Classification enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    DatabaseError,
    NetworkError,
    ResourceExhaustion,
    ValidationError,
    AuthenticationError,
    RateLimitError,
    TimeoutError,
    DependencyError,
    ConfigurationError,
    BusinessLogicError,
    DataCorruptionError,
    ProtocolError,
    AgentCoordinationError,
    SystemError,
}

impl ErrorType {
    pub const ALL: [ErrorType; 14] = [
        ErrorType::DatabaseError,
        ErrorType::NetworkError,
        ErrorType::ResourceExhaustion,
        ErrorType::ValidationError,
        ErrorType::AuthenticationError,
        ErrorType::RateLimitError,
        ErrorType::TimeoutError,
        ErrorType::DependencyError,
        ErrorType::ConfigurationError,
        ErrorType::BusinessLogicError,
        ErrorType::DataCorruptionError,
        ErrorType::ProtocolError,
        ErrorType::AgentCoordinationError,
        ErrorType::SystemError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::DatabaseError => "database_error",
            ErrorType::NetworkError => "network_error",
            ErrorType::ResourceExhaustion => "resource_exhaustion",
            ErrorType::ValidationError => "validation_error",
            ErrorType::AuthenticationError => "authentication_error",
            ErrorType::RateLimitError => "rate_limit_error",
            ErrorType::TimeoutError => "timeout_error",
            ErrorType::DependencyError => "dependency_error",
            ErrorType::ConfigurationError => "configuration_error",
            ErrorType::BusinessLogicError => "business_logic_error",
            ErrorType::DataCorruptionError => "data_corruption_error",
            ErrorType::ProtocolError => "protocol_error",
            ErrorType::AgentCoordinationError => "agent_coordination_error",
            ErrorType::SystemError => "system_error",
        }
    }

    /// Category an error type belongs to when no stronger signal exists.
    pub fn default_category(&self) -> ErrorCategory {
        match self {
            ErrorType::DatabaseError
            | ErrorType::NetworkError
            | ErrorType::ResourceExhaustion
            | ErrorType::TimeoutError => ErrorCategory::Infrastructure,
            ErrorType::ValidationError | ErrorType::BusinessLogicError => {
                ErrorCategory::Application
            }
            ErrorType::AuthenticationError => ErrorCategory::Security,
            ErrorType::RateLimitError | ErrorType::DependencyError | ErrorType::ProtocolError => {
                ErrorCategory::Integration
            }
            ErrorType::ConfigurationError => ErrorCategory::Configuration,
            ErrorType::DataCorruptionError => ErrorCategory::Data,
            ErrorType::AgentCoordinationError => ErrorCategory::Coordination,
            ErrorType::SystemError => ErrorCategory::System,
        }
    }

    pub fn default_retryable(&self) -> bool {
        matches!(
            self,
            ErrorType::DatabaseError
                | ErrorType::NetworkError
                | ErrorType::RateLimitError
                | ErrorType::TimeoutError
                | ErrorType::DependencyError
                | ErrorType::AgentCoordinationError
        )
    }

    pub fn default_transient(&self) -> bool {
        matches!(
            self,
            ErrorType::NetworkError
                | ErrorType::RateLimitError
                | ErrorType::TimeoutError
                | ErrorType::DependencyError
                | ErrorType::ResourceExhaustion
        )
    }

    /// Typical time to recover, in milliseconds.
    pub fn default_recovery_ms(&self) -> u64 {
        match self {
            ErrorType::RateLimitError => 60_000,
            ErrorType::TimeoutError | ErrorType::NetworkError => 5_000,
            ErrorType::DatabaseError | ErrorType::DependencyError => 30_000,
            ErrorType::ResourceExhaustion => 120_000,
            ErrorType::AgentCoordinationError => 45_000,
            ErrorType::ConfigurationError | ErrorType::DataCorruptionError => 600_000,
            _ => 10_000,
        }
    }

    /// Subcategory vocabulary; the first entry is the default.
    pub fn default_subcategory(&self) -> &'static str {
        self.subcategories().first().copied().unwrap_or("unknown")
    }

    pub fn subcategories(&self) -> &'static [&'static str] {
        match self {
            ErrorType::DatabaseError => &[
                "connection_failure",
                "query_failure",
                "deadlock",
                "constraint_violation",
            ],
            ErrorType::NetworkError => &[
                "connection_refused",
                "connection_reset",
                "dns_resolution",
                "unreachable",
            ],
            ErrorType::ResourceExhaustion => &["memory", "cpu", "disk", "file_descriptors"],
            ErrorType::ValidationError => &["schema", "format", "range", "required_field"],
            ErrorType::AuthenticationError => &["invalid_credentials", "expired_token", "forbidden"],
            ErrorType::RateLimitError => &["quota_exceeded", "throttled"],
            ErrorType::TimeoutError => &["request_timeout", "deadline_exceeded", "idle_timeout"],
            ErrorType::DependencyError => &["service_unavailable", "bad_gateway", "version_mismatch"],
            ErrorType::ConfigurationError => &["missing_setting", "invalid_setting", "environment"],
            ErrorType::BusinessLogicError => &["invariant_violation", "state_conflict", "policy"],
            ErrorType::DataCorruptionError => &["checksum_mismatch", "truncated", "encoding"],
            ErrorType::ProtocolError => &["malformed_message", "version", "handshake"],
            ErrorType::AgentCoordinationError => &["handoff", "consensus", "heartbeat", "deadlock"],
            ErrorType::SystemError => &["unknown", "panic", "io"],
        }
    }
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
    Emergency,
}

impl Severity {
    /// Impact weight in [0,1] used when ranking root causes.
    pub fn impact(&self) -> f64 {
        match self {
            Severity::Low => 0.2,
            Severity::Medium => 0.4,
            Severity::High => 0.7,
            Severity::Critical => 0.9,
            Severity::Emergency => 1.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
            Severity::Emergency => "emergency",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Infrastructure,
    Application,
    Security,
    Integration,
    Configuration,
    Data,
    Coordination,
    System,
}

/// Blast radius of a failure. The ordering is total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpactScope {
    SingleRequest,
    SingleAgent,
    AgentCluster,
    CrossSystem,
    SystemWide,
}

// ============================================================================
// Classification
// ============================================================================

/// Judgement about one [`ErrorContext`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorClassification {
    pub error_id: String,
    pub agent_type: String,
    /// Canonical similarity key, see [`crate::fingerprint`].
    pub fingerprint: String,
    pub error_type: ErrorType,
    pub severity: Severity,
    pub category: ErrorCategory,
    pub subcategory: String,
    pub is_retryable: bool,
    pub is_transient: bool,
    pub requires_immediate_attention: bool,
    pub estimated_recovery_time_ms: u64,
    pub impact_scope: ImpactScope,
    pub confidence_score: f64,
    pub classified_at: DateTime<Utc>,
    /// Incremented each time a classification of the same error supersedes
    /// the previous one.
    #[serde(default)]
    pub version: u32,
}

impl ErrorClassification {
    /// Low-confidence default returned when classification itself fails.
    pub fn fallback(context: &ErrorContext, fingerprint: &str) -> Self {
        let error_type = ErrorType::SystemError;
        Self {
            error_id: context.error_id.clone(),
            agent_type: context.agent_type.clone(),
            fingerprint: fingerprint.to_string(),
            error_type,
            severity: Severity::Medium,
            category: error_type.default_category(),
            subcategory: error_type.default_subcategory().to_string(),
            is_retryable: false,
            is_transient: false,
            requires_immediate_attention: context.is_security_related(),
            estimated_recovery_time_ms: error_type.default_recovery_ms(),
            impact_scope: ImpactScope::SingleRequest,
            confidence_score: 0.1,
            classified_at: context.timestamp,
            version: 0,
        }
    }
}

// ============================================================================
// System events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn is_problem(&self) -> bool {
        matches!(self, LogLevel::Warning | LogLevel::Error)
    }
}

/// A log-like entry or notable happening recorded by some agent or service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub agent_id: String,
    pub event_type: String,
    pub level: LogLevel,
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl SystemEvent {
    pub fn new(
        agent_id: impl Into<String>,
        event_type: impl Into<String>,
        level: LogLevel,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            agent_id: agent_id.into(),
            event_type: event_type.into(),
            level,
            severity,
            message: message.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}
