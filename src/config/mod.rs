//! Configuration
//!
//! One TOML file with a section per component. Every section is optional;
//! missing keys take their defaults.
//!
//! ```toml
//! [monitor]
//! spike_threshold = 50
//!
//! [[monitor.alert_patterns]]
//! name = "db_storm"
//! severity = "high"
//! channels = ["ops"]
//! conditions = [{ metric = "error_count", operator = "gte", threshold = 20, window_secs = 60 }]
//!
//! [[registry.rules]]
//! id = "ledger_lock"
//! pattern = "(?i)ledger lock"
//! error_type = "database_error"
//! severity = "high"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info};

use crate::analysis::AnalyzerConfig;
use crate::classifier::ClassifierConfig;
use crate::errors::HealingError;
use crate::manager::ManagerConfig;
use crate::monitor::{MonitorConfig, MAX_RETENTION_SECS, MAX_WINDOW_SECS};
use crate::recovery::{CircuitBreakerConfig, DegradationConfig, RecoveryConfig};
use crate::registry::{ClassificationRule, ErrorRegistry, RuleSource};

pub const CONFIG_FILE_NAME: &str = "selfmend.toml";

/// Rules layered over (or replacing) the built-in table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Start from the built-in rule table.
    pub use_defaults: bool,
    pub rules: Vec<ClassificationRule>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            use_defaults: true,
            rules: Vec::new(),
        }
    }
}

impl RuleSource for RegistryConfig {
    fn rules(&self) -> Vec<ClassificationRule> {
        self.rules.clone()
    }
}

impl RegistryConfig {
    pub fn build(&self) -> std::result::Result<ErrorRegistry, HealingError> {
        let registry = if self.use_defaults {
            ErrorRegistry::with_defaults()
        } else {
            ErrorRegistry::empty()
        };
        registry.extend_from(self)?;
        Ok(registry)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealingConfig {
    pub classifier: ClassifierConfig,
    pub monitor: MonitorConfig,
    pub analyzer: AnalyzerConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub degradation: DegradationConfig,
    pub recovery: RecoveryConfig,
    pub manager: ManagerConfig,
    pub registry: RegistryConfig,
}

impl HealingConfig {
    /// Load from `path`, else `./selfmend.toml`, else the user config
    /// directory, else defaults. Environment overrides apply last, then the
    /// result is validated.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(&PathBuf::from(p))?,
            None => {
                let mut loaded = None;
                for candidate in Self::default_paths() {
                    if candidate.is_file() {
                        loaded = Some(Self::from_file(&candidate)?);
                        break;
                    }
                }
                loaded.unwrap_or_else(|| {
                    debug!("No config file found, using defaults");
                    Self::default()
                })
            }
        };

        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn default_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(CONFIG_FILE_NAME)];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("selfmend").join("config.toml"));
        }
        paths
    }

    fn from_file(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Apply `SELFMEND_*` overrides. Unparseable values are ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(n) = lookup("SELFMEND_SPIKE_THRESHOLD").and_then(|v| v.parse().ok()) {
            self.monitor.spike_threshold = n;
        }
        if let Some(n) = lookup("SELFMEND_HANDLE_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.manager.handle_timeout_ms = n;
        }
        if let Some(n) = lookup("SELFMEND_RETRY_ATTEMPTS").and_then(|v| v.parse().ok()) {
            self.recovery.retry_attempts = n;
        }
        if let Some(n) = lookup("SELFMEND_ERROR_THRESHOLD_PCT").and_then(|v| v.parse().ok()) {
            self.circuit_breaker.error_threshold_pct = n;
        }
    }

    pub fn validate(&self) -> std::result::Result<(), HealingError> {
        let fail = |msg: &str| Err(HealingError::Config(msg.to_string()));

        if self.classifier.history_window_days <= 0 {
            return fail("classifier.history_window_days must be positive");
        }
        if self.classifier.learning_half_life_days.is_nan()
            || self.classifier.learning_half_life_days <= 0.0
        {
            return fail("classifier.learning_half_life_days must be positive");
        }
        if self.classifier.learned_patterns_capacity == 0 {
            return fail("classifier.learned_patterns_capacity must be positive");
        }
        if self.monitor.spike_window_secs == 0 || self.monitor.sweep_interval_secs == 0 {
            return fail("monitor windows and sweep interval must be positive");
        }
        if self.monitor.spike_window_secs > MAX_WINDOW_SECS
            || self.monitor.spike_cooldown_secs > MAX_WINDOW_SECS
        {
            return fail("monitor spike window and cooldown must not exceed 30 days");
        }
        if self.monitor.retention_secs > MAX_RETENTION_SECS {
            return fail("monitor.retention_secs must not exceed one year");
        }
        for pattern in &self.monitor.alert_patterns {
            pattern.validate()?;
        }
        if self.analyzer.timeout_ms == 0 {
            return fail("analyzer.timeout_ms must be positive");
        }
        let pct = self.circuit_breaker.error_threshold_pct;
        if pct.is_nan() || pct <= 0.0 || pct > 100.0 {
            return fail("circuit_breaker.error_threshold_pct must be in (0, 100]");
        }
        if self.circuit_breaker.window_secs == 0 {
            return fail("circuit_breaker.window_secs must be positive");
        }
        if self.recovery.retry_attempts == 0 {
            return fail("recovery.retry_attempts must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.recovery.jitter_factor) {
            return fail("recovery.jitter_factor must be in [0, 1]");
        }
        if self.manager.handle_timeout_ms == 0 {
            return fail("manager.handle_timeout_ms must be positive");
        }
        self.registry.build().map(|_| ())
    }
}
