//! Error Registry
//!
//! Rule table mapping message patterns to an error type, severity and
//! retryability. Rules can be replaced at runtime from any [`RuleSource`].

use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::HealingError;
use crate::types::{ErrorCategory, ErrorType, ImpactScope, Severity};

/// A configured classification rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationRule {
    pub id: String,
    /// Regex matched against `"<name> <message>"`.
    pub pattern: String,
    pub error_type: ErrorType,
    pub severity: Severity,
    #[serde(default)]
    pub category: Option<ErrorCategory>,
    #[serde(default)]
    pub impact_scope: Option<ImpactScope>,
    #[serde(default)]
    pub is_retryable: bool,
    #[serde(default)]
    pub is_transient: Option<bool>,
    #[serde(default)]
    pub estimated_recovery_ms: Option<u64>,
    /// Rule confidence in [0,1].
    #[serde(default = "default_rule_confidence")]
    pub confidence: f64,
}

fn default_rule_confidence() -> f64 {
    0.9
}

impl ClassificationRule {
    pub fn new(id: &str, pattern: &str, error_type: ErrorType, severity: Severity) -> Self {
        Self {
            id: id.to_string(),
            pattern: pattern.to_string(),
            error_type,
            severity,
            category: None,
            impact_scope: None,
            is_retryable: error_type.default_retryable(),
            is_transient: None,
            estimated_recovery_ms: None,
            confidence: default_rule_confidence(),
        }
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.is_retryable = retryable;
        self
    }

    pub fn scope(mut self, scope: ImpactScope) -> Self {
        self.impact_scope = Some(scope);
        self
    }
}

/// Supplies rule sets at runtime.
pub trait RuleSource: Send + Sync {
    fn rules(&self) -> Vec<ClassificationRule>;
}

/// A fixed list of rules, e.g. loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticRuleSource(pub Vec<ClassificationRule>);

impl RuleSource for StaticRuleSource {
    fn rules(&self) -> Vec<ClassificationRule> {
        self.0.clone()
    }
}

struct CompiledRule {
    rule: ClassificationRule,
    regex: Regex,
}

/// The winning rule for a piece of text.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleMatch {
    pub rule: ClassificationRule,
    /// Length of the matched text; longer is more specific.
    pub specificity: usize,
}

pub struct ErrorRegistry {
    rules: RwLock<Vec<CompiledRule>>,
}

impl ErrorRegistry {
    /// Empty registry.
    pub fn empty() -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
        }
    }

    /// Registry preloaded with the built-in rules.
    pub fn with_defaults() -> Self {
        let registry = Self::empty();
        for rule in default_rules() {
            // Built-in patterns are known to compile.
            let _ = registry.upsert_rule(rule);
        }
        registry
    }

    fn compile(rule: ClassificationRule) -> Result<CompiledRule, HealingError> {
        if !(0.0..=1.0).contains(&rule.confidence) {
            return Err(HealingError::InvalidRule {
                id: rule.id,
                reason: "confidence must be within [0, 1]".to_string(),
            });
        }
        let regex = Regex::new(&rule.pattern).map_err(|e| HealingError::InvalidRule {
            id: rule.id.clone(),
            reason: e.to_string(),
        })?;
        Ok(CompiledRule { rule, regex })
    }

    /// Insert or replace a rule by id.
    pub fn upsert_rule(&self, rule: ClassificationRule) -> Result<(), HealingError> {
        let compiled = Self::compile(rule)?;
        let mut rules = self.rules.write();
        if let Some(existing) = rules.iter_mut().find(|r| r.rule.id == compiled.rule.id) {
            *existing = compiled;
        } else {
            rules.push(compiled);
        }
        Ok(())
    }

    pub fn remove_rule(&self, id: &str) -> bool {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|r| r.rule.id != id);
        rules.len() != before
    }

    /// Replace the whole table from a source. The table is left untouched
    /// if any rule fails to compile.
    pub fn reload(&self, source: &dyn RuleSource) -> Result<usize, HealingError> {
        let compiled = source
            .rules()
            .into_iter()
            .map(Self::compile)
            .collect::<Result<Vec<_>, _>>()?;
        let count = compiled.len();
        *self.rules.write() = compiled;
        info!(rules = count, "Classification rules reloaded");
        Ok(count)
    }

    /// Merge rules from a source into the current table, replacing rules
    /// with the same id. Nothing is merged if any rule fails to compile.
    pub fn extend_from(&self, source: &dyn RuleSource) -> Result<usize, HealingError> {
        let compiled = source
            .rules()
            .into_iter()
            .map(Self::compile)
            .collect::<Result<Vec<_>, _>>()?;
        let count = compiled.len();
        let mut rules = self.rules.write();
        for rule in compiled {
            match rules.iter_mut().find(|r| r.rule.id == rule.rule.id) {
                Some(existing) => *existing = rule,
                None => rules.push(rule),
            }
        }
        Ok(count)
    }

    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }

    pub fn rules(&self) -> Vec<ClassificationRule> {
        self.rules.read().iter().map(|r| r.rule.clone()).collect()
    }

    /// Most specific matching rule: longest matched text, then longest
    /// pattern, then earliest registered.
    pub fn find_match(&self, text: &str) -> Option<RuleMatch> {
        let rules = self.rules.read();
        let mut best: Option<(usize, usize, &CompiledRule)> = None;
        for compiled in rules.iter() {
            let Some(m) = compiled.regex.find(text) else {
                continue;
            };
            let specificity = m.end() - m.start();
            let pattern_len = compiled.rule.pattern.len();
            let better = match best {
                None => true,
                Some((s, p, _)) => specificity > s || (specificity == s && pattern_len > p),
            };
            if better {
                best = Some((specificity, pattern_len, compiled));
            }
        }
        best.map(|(specificity, _, compiled)| {
            debug!(rule = %compiled.rule.id, specificity, "Registry rule matched");
            RuleMatch {
                rule: compiled.rule.clone(),
                specificity,
            }
        })
    }
}

impl Default for ErrorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn default_rules() -> Vec<ClassificationRule> {
    vec![
        ClassificationRule::new(
            "db_deadlock",
            r"(?i)deadlock detected|lock wait timeout",
            ErrorType::DatabaseError,
            Severity::High,
        ),
        ClassificationRule::new(
            "db_connection",
            r"(?i)(database|postgres|mysql|sql)[^\n]{0,40}(connection|refused|unavailable)",
            ErrorType::DatabaseError,
            Severity::High,
        ),
        ClassificationRule::new(
            "connection_refused",
            r"(?i)econnrefused|connection refused|connection reset|econnreset",
            ErrorType::NetworkError,
            Severity::Medium,
        ),
        ClassificationRule::new(
            "timeout",
            r"(?i)timed? ?out|deadline exceeded|etimedout",
            ErrorType::TimeoutError,
            Severity::Medium,
        ),
        ClassificationRule::new(
            "rate_limit",
            r"(?i)rate limit|too many requests|\b429\b|quota exceeded",
            ErrorType::RateLimitError,
            Severity::Low,
        ),
        ClassificationRule::new(
            "auth",
            r"(?i)unauthori[sz]ed|\b401\b|\b403\b|invalid (api )?token|authentication failed|forbidden",
            ErrorType::AuthenticationError,
            Severity::High,
        )
        .retryable(false),
        ClassificationRule::new(
            "out_of_memory",
            r"(?i)out of memory|\boom\b|heap (space|exhausted)|memory exhausted|allocation failed",
            ErrorType::ResourceExhaustion,
            Severity::Critical,
        )
        .retryable(false)
        .scope(ImpactScope::SingleAgent),
        ClassificationRule::new(
            "disk_full",
            r"(?i)no space left|disk full|enospc",
            ErrorType::ResourceExhaustion,
            Severity::Critical,
        )
        .retryable(false),
        ClassificationRule::new(
            "validation",
            r"(?i)validation failed|invalid (input|argument|field|request)|schema violation",
            ErrorType::ValidationError,
            Severity::Low,
        ),
        ClassificationRule::new(
            "configuration",
            r"(?i)missing (config|configuration|env(ironment)? var)|invalid configuration|config(uration)? not found",
            ErrorType::ConfigurationError,
            Severity::High,
        ),
        ClassificationRule::new(
            "dependency",
            r"(?i)service unavailable|\b503\b|bad gateway|\b502\b|upstream",
            ErrorType::DependencyError,
            Severity::Medium,
        ),
        ClassificationRule::new(
            "data_corruption",
            r"(?i)checksum mismatch|corrupt(ed|ion)|truncated record",
            ErrorType::DataCorruptionError,
            Severity::Critical,
        )
        .retryable(false),
        ClassificationRule::new(
            "protocol",
            r"(?i)protocol (error|violation)|malformed (message|frame|packet)|handshake failed",
            ErrorType::ProtocolError,
            Severity::Medium,
        ),
        ClassificationRule::new(
            "coordination",
            r"(?i)coordination (failure|error)|consensus (failed|lost)|handoff failed|heartbeat missed",
            ErrorType::AgentCoordinationError,
            Severity::High,
        )
        .scope(ImpactScope::AgentCluster),
        ClassificationRule::new(
            "business_rule",
            r"(?i)business rule|insufficient (funds|balance)|policy violation",
            ErrorType::BusinessLogicError,
            Severity::Low,
        )
        .retryable(false),
    ]
}
