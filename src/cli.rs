//! Command-line front end.
//!
//! `classify` runs one failure through the classifier only, `handle` feeds a
//! JSON-lines file through the full pipeline, `check-config` loads and
//! validates the configuration.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, info};

use crate::config::HealingConfig;
use crate::manager::HealingStack;
use crate::telemetry::{init_tracing, init_tracing_json};
use crate::types::{AgentFailure, EnvironmentSnapshot, ErrorContext};

#[derive(Parser)]
#[command(name = "selfmend")]
#[command(about = "Classify agent failures, find root causes, and heal")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<String>,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    json_logs: bool,

    /// Output format
    #[arg(long, value_enum, default_value = "json", global = true)]
    format: OutputFormat,
}

/// Output format for results written to stdout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// One compact JSON document per result (default)
    #[default]
    Json,
    /// Indented JSON
    Pretty,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify a single failure without recovering from it
    Classify {
        /// Failure type name, e.g. ConnectionRefusedError
        #[arg(long, default_value = "Error")]
        name: String,

        /// Failure message
        message: String,

        /// Agent that raised the failure
        #[arg(long, default_value = "cli")]
        agent: String,

        /// Agent type
        #[arg(long, default_value = "worker")]
        agent_type: String,

        /// Stack trace text
        #[arg(long)]
        stack: Option<String>,
    },

    /// Run every failure in a JSON-lines file through the full pipeline
    Handle {
        /// JSON-lines input, or `-` for stdin
        #[arg(short, long, value_name = "FILE")]
        input: String,
    },

    /// Load and validate the configuration, then print it
    CheckConfig,
}

/// One line of `handle` input. Only `agent_id` and `message` are required.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub agent_id: String,
    #[serde(default = "default_agent_type")]
    pub agent_type: String,
    #[serde(default = "default_failure_name")]
    pub name: String,
    pub message: String,
    #[serde(default)]
    pub error_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub stack_trace: Option<String>,
    #[serde(default)]
    pub environment: EnvironmentSnapshot,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

fn default_agent_type() -> String {
    "worker".to_string()
}

fn default_failure_name() -> String {
    "Error".to_string()
}

impl FailureRecord {
    pub fn into_parts(self) -> (AgentFailure, ErrorContext) {
        let failure = AgentFailure::new(self.name, self.message);
        let mut context =
            ErrorContext::new(self.agent_id, self.agent_type).with_environment(self.environment);
        if let Some(id) = self.error_id {
            context = context.with_error_id(id);
        }
        if let Some(ts) = self.timestamp {
            context = context.with_timestamp(ts);
        }
        if let Some(session) = self.session_id {
            context = context.with_session(session);
        }
        if let Some(correlation) = self.correlation_id {
            context = context.with_correlation(correlation);
        }
        if let Some(trace) = self.stack_trace {
            context = context.with_stack_trace(trace);
        }
        context.metadata = self.metadata;
        (failure, context)
    }
}

/// Parse one input line. Blank lines yield `None`.
pub fn parse_failure_line(line: &str, line_no: usize) -> Result<Option<FailureRecord>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let record = serde_json::from_str(trimmed)
        .with_context(|| format!("Invalid failure record on line {}", line_no))?;
    Ok(Some(record))
}

fn render<T: Serialize>(value: &T, format: OutputFormat) -> Result<String> {
    Ok(match format {
        OutputFormat::Json => serde_json::to_string(value)?,
        OutputFormat::Pretty => serde_json::to_string_pretty(value)?,
    })
}

async fn open_input(input: &str) -> Result<Box<dyn AsyncRead + Unpin + Send>> {
    if input == "-" {
        return Ok(Box::new(tokio::io::stdin()));
    }
    let file = tokio::fs::File::open(input)
        .await
        .with_context(|| format!("Cannot open input file '{}'", input))?;
    Ok(Box::new(file))
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    if cli.json_logs {
        init_tracing_json(
            &std::env::var("SELFMEND_LOG").unwrap_or_else(|_| "info".to_string()),
        );
    } else {
        init_tracing();
    }

    let config = HealingConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Classify {
            name,
            message,
            agent,
            agent_type,
            stack,
        } => {
            let record = FailureRecord {
                agent_id: agent,
                agent_type,
                name,
                message,
                error_id: None,
                timestamp: None,
                session_id: None,
                correlation_id: None,
                stack_trace: stack,
                environment: EnvironmentSnapshot::default(),
                metadata: HashMap::new(),
            };
            let (failure, context) = record.into_parts();
            let stack = HealingStack::in_memory(&config)?;
            let classification = stack.classifier.classify(&failure, &context).await;
            println!("{}", render(&classification, cli.format)?);
        }

        Commands::Handle { input } => {
            let stack = HealingStack::in_memory(&config)?;
            let mut lines = BufReader::new(open_input(&input).await?).lines();
            let mut line_no = 0usize;
            let mut handled = 0usize;
            let mut failed = 0usize;

            while let Some(line) = lines
                .next_line()
                .await
                .with_context(|| format!("Failed to read line {}", line_no + 1))?
            {
                line_no += 1;
                let Some(record) = parse_failure_line(&line, line_no)? else {
                    continue;
                };
                let (failure, context) = record.into_parts();
                let result = stack.manager.handle(&failure, &context).await;
                if !result.success() {
                    failed += 1;
                }
                handled += 1;
                println!("{}", render(&result, cli.format)?);
            }

            let stats = stack.manager.stats();
            info!(handled, failed, emergencies = stats.emergencies, "Input processed");
            debug!(stats = ?stats, "Manager stats");
        }

        Commands::CheckConfig => {
            println!("{}", toml::to_string_pretty(&config)?);
            eprintln!("Configuration OK");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{get_exit_code, EXIT_INPUT_ERROR};

    #[test]
    fn test_cli_parses_handle() {
        let cli = Cli::try_parse_from(["selfmend", "handle", "--input", "errors.jsonl"]).unwrap();
        assert!(matches!(cli.command, Commands::Handle { ref input } if input == "errors.jsonl"));
        assert_eq!(cli.format, OutputFormat::Json);
    }

    #[test]
    fn test_cli_parses_classify_with_global_flags() {
        let cli = Cli::try_parse_from([
            "selfmend",
            "classify",
            "connection refused",
            "--name",
            "ConnectionError",
            "--config",
            "custom.toml",
            "--json-logs",
        ])
        .unwrap();
        assert_eq!(cli.config.as_deref(), Some("custom.toml"));
        assert!(cli.json_logs);
        match cli.command {
            Commands::Classify { name, message, agent, .. } => {
                assert_eq!(name, "ConnectionError");
                assert_eq!(message, "connection refused");
                assert_eq!(agent, "cli");
            }
            _ => panic!("expected classify"),
        }
    }

    #[test]
    fn test_parse_failure_line_defaults() {
        let record = parse_failure_line(r#"{"agent_id":"w-1","message":"timeout"}"#, 1)
            .unwrap()
            .unwrap();
        assert_eq!(record.agent_type, "worker");
        assert_eq!(record.name, "Error");

        let (failure, context) = record.into_parts();
        assert_eq!(failure.message, "timeout");
        assert_eq!(context.agent_id, "w-1");
        assert!(!context.error_id.is_empty());
    }

    #[test]
    fn test_parse_failure_line_keeps_ids() {
        let line = r#"{"agent_id":"w-1","message":"x","error_id":"e-42",
            "timestamp":"2026-01-01T00:00:00Z","metadata":{"security_related":true}}"#;
        let (_, context) = parse_failure_line(line, 3).unwrap().unwrap().into_parts();
        assert_eq!(context.error_id, "e-42");
        assert_eq!(context.timestamp.to_rfc3339(), "2026-01-01T00:00:00+00:00");
        assert!(context.is_security_related());
    }

    #[test]
    fn test_blank_line_is_skipped() {
        assert!(parse_failure_line("   ", 1).unwrap().is_none());
    }

    #[test]
    fn test_bad_line_maps_to_input_exit_code() {
        let err = parse_failure_line("{not json", 7).unwrap_err();
        assert!(err.to_string().contains("line 7"));
        assert_eq!(get_exit_code(&err), EXIT_INPUT_ERROR);
    }
}
