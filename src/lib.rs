//! Selfmend - self-healing for agent fleets
//!
//! Classifies agent failures, records them for alerting, finds probable
//! root causes, and drives recovery through circuit breakers, a local
//! action executor, multi-agent recovery sessions and a degradation ladder.
//!
//! - **Classification**: regex rules, keyword heuristics, history and a
//!   learned pattern table, combined into one confidence-weighted verdict
//! - **Monitoring**: spike detection, alert patterns with cooldowns, trends
//! - **Analysis**: evidence, timeline, correlations and ranked root causes
//! - **Recovery**: breakers per agent, bounded retries, coordinated sessions,
//!   graceful degradation
//!
//! # Quick Start
//!
//! ```ignore
//! use selfmend::{AgentFailure, ErrorContext, HealingConfig, HealingStack};
//!
//! let config = HealingConfig::load(None)?;
//! let stack = HealingStack::in_memory(&config)?;
//! let failure = AgentFailure::new("ConnectionError", "connection refused");
//! let result = stack.manager.handle(&failure, &ErrorContext::new("worker-1", "worker")).await;
//! ```

// ─── Core ──────────────────────────────────────────────────────────
pub mod config;
pub mod errors;
pub mod telemetry;
pub mod types;

// ─── Pipeline stages ───────────────────────────────────────────────
pub mod analysis;
pub mod classifier;
pub mod fingerprint;
pub mod monitor;
pub mod recovery;
pub mod registry;
pub mod store;

// ─── Orchestration & front end ─────────────────────────────────────
pub mod cli;
pub mod manager;

pub use analysis::{RootCauseAnalysis, RootCauseAnalysisResult, RootCauseAnalyzer};
pub use classifier::{ClassifyError, ErrorClassifier};
pub use config::HealingConfig;
pub use errors::{HealingError, Result};
pub use manager::{ErrorHandlingManager, ErrorHandlingResult, HealingEvent, HealingStack};
pub use monitor::{ErrorMonitor, ErrorRecorder};
pub use recovery::{CircuitBreaker, DegradationLevel, DegradationManager, RecoveryResult};
pub use registry::ErrorRegistry;
pub use store::{AlertDispatcher, ErrorStore, InMemoryStore};
pub use types::{
    AgentFailure, ErrorClassification, ErrorContext, ErrorType, ImpactScope, Severity,
    SystemEvent,
};
