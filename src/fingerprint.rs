//! Canonical error fingerprinting.
//!
//! Every key the pipeline derives from a failure starts from one
//! similarity signature:
//!
//! ```text
//! similarity_key = sha256(lower(name) | normalized(message)[..120] | agent_type)
//! cache_key      = similarity_key | memory decile | cpu decile
//! learning_key   = similarity_key | keyword set | environment flags | stack signature
//! ```
//!
//! The historical lookup uses `similarity_key`, the classification cache
//! uses `cache_key` and the pattern learner uses `learning_key`, so the
//! three can never disagree about which failures are "the same".

use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

use crate::types::{AgentFailure, ErrorContext};

const MESSAGE_PREFIX_CHARS: usize = 120;
const STACK_SIGNATURE_LINES: usize = 3;

/// Vocabulary recognised when extracting a failure's keyword set.
pub const KEYWORDS: &[&str] = &[
    "timeout",
    "connection",
    "refused",
    "reset",
    "memory",
    "heap",
    "disk",
    "database",
    "query",
    "deadlock",
    "lock",
    "auth",
    "token",
    "permission",
    "invalid",
    "validation",
    "config",
    "rate",
    "limit",
    "quota",
    "corrupt",
    "checksum",
    "protocol",
    "agent",
    "consensus",
    "dependency",
    "unavailable",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    similarity: String,
    memory_bucket: u8,
    cpu_bucket: u8,
    keywords: Vec<String>,
    env_flags: Vec<&'static str>,
    stack_signature: String,
}

impl Fingerprint {
    pub fn compute(failure: &AgentFailure, context: &ErrorContext) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(failure.name.to_lowercase().as_bytes());
        hasher.update(b"|");
        hasher.update(normalize_message(&failure.message).as_bytes());
        hasher.update(b"|");
        hasher.update(context.agent_type.as_bytes());
        let similarity = hex::encode(&hasher.finalize()[..16]);

        Self {
            similarity,
            memory_bucket: context.environment.memory_bucket(),
            cpu_bucket: context.environment.cpu_bucket(),
            keywords: extract_keywords(&failure.search_text()),
            env_flags: environment_flags(context),
            stack_signature: stack_signature(context.stack_text()),
        }
    }

    pub fn similarity_key(&self) -> &str {
        &self.similarity
    }

    pub fn cache_key(&self) -> String {
        format!(
            "{}:m{}:c{}",
            self.similarity, self.memory_bucket, self.cpu_bucket
        )
    }

    pub fn learning_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.similarity,
            self.keywords.join(","),
            self.env_flags.join(","),
            self.stack_signature
        )
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }
}

/// Lowercase, collapse digit runs to `#`, truncate.
pub fn normalize_message(message: &str) -> String {
    let mut out = String::with_capacity(message.len().min(MESSAGE_PREFIX_CHARS));
    let mut in_digits = false;
    for c in message.chars() {
        if c.is_ascii_digit() {
            if !in_digits {
                out.push('#');
            }
            in_digits = true;
        } else {
            in_digits = false;
            out.extend(c.to_lowercase());
        }
        if out.chars().count() >= MESSAGE_PREFIX_CHARS {
            break;
        }
    }
    out.trim().to_string()
}

pub fn extract_keywords(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    let set: BTreeSet<&str> = KEYWORDS
        .iter()
        .copied()
        .filter(|k| lower.contains(k))
        .collect();
    set.into_iter().map(String::from).collect()
}

fn environment_flags(context: &ErrorContext) -> Vec<&'static str> {
    let env = &context.environment;
    let mut flags = Vec::new();
    if env.memory_usage > 90.0 {
        flags.push("mem_high");
    }
    if env.cpu_usage > 95.0 {
        flags.push("cpu_high");
    }
    if env.active_connections > 1000 {
        flags.push("conn_high");
    }
    if context.is_security_related() {
        flags.push("security");
    }
    flags
}

/// Short hash of the first frames of a stack trace, with line numbers removed.
pub fn stack_signature(stack: &str) -> String {
    let frames: Vec<String> = stack
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .take(STACK_SIGNATURE_LINES)
        .map(|l| l.chars().filter(|c| !c.is_ascii_digit()).collect())
        .collect();
    if frames.is_empty() {
        return "none".to_string();
    }
    let mut hasher = Sha256::new();
    hasher.update(frames.join("\n").as_bytes());
    hex::encode(&hasher.finalize()[..6])
}
