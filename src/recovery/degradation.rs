//! Degradation ladder
//!
//! System-wide operating modes used to shed load under stress:
//!
//! ```text
//!  Normal ──► Reduced ──► Minimal ──► Emergency
//!     ◄──────────◄────────────◄   (one step per recover, no active conditions)
//! ```
//!
//! Escalation is driven by conditions. Each condition blocks recovery until
//! it is cleared or its TTL expires.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::{info, warn};

use crate::types::Severity;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DegradationConfig {
    /// Seconds after which an uncleared condition stops blocking recovery
    pub condition_ttl_secs: u64,
    pub history_limit: usize,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            condition_ttl_secs: 600,
            history_limit: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationLevel {
    Normal,
    Reduced,
    Minimal,
    Emergency,
}

impl DegradationLevel {
    const LADDER: [DegradationLevel; 4] = [
        DegradationLevel::Normal,
        DegradationLevel::Reduced,
        DegradationLevel::Minimal,
        DegradationLevel::Emergency,
    ];

    fn rank(self) -> usize {
        self as usize
    }

    fn from_rank(rank: usize) -> Self {
        Self::LADDER[rank.min(Self::LADDER.len() - 1)]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DegradationLevel::Normal => "normal",
            DegradationLevel::Reduced => "reduced",
            DegradationLevel::Minimal => "minimal",
            DegradationLevel::Emergency => "emergency",
        }
    }

    /// Share of normal concurrency hosts should allow at this level.
    pub fn concurrency_factor(&self) -> f64 {
        match self {
            DegradationLevel::Normal => 1.0,
            DegradationLevel::Reduced => 0.75,
            DegradationLevel::Minimal => 0.5,
            DegradationLevel::Emergency => 0.1,
        }
    }

    pub fn allows_non_critical_work(&self) -> bool {
        matches!(self, DegradationLevel::Normal | DegradationLevel::Reduced)
    }
}

/// A reason to degrade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradationCondition {
    pub id: String,
    pub severity: Severity,
    pub reason: String,
    pub raised_at: DateTime<Utc>,
}

impl DegradationCondition {
    pub fn new(id: impl Into<String>, severity: Severity, reason: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            severity,
            reason: reason.into(),
            raised_at: Utc::now(),
        }
    }

    /// Levels to climb for this condition.
    fn steps(&self) -> usize {
        match self.severity {
            Severity::Low | Severity::Medium | Severity::High => 1,
            Severity::Critical => 2,
            Severity::Emergency => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradationTransition {
    pub from: DegradationLevel,
    pub to: DegradationLevel,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DegradationSummary {
    pub level: DegradationLevel,
    pub active_conditions: Vec<String>,
    pub transitions: usize,
    pub concurrency_factor: f64,
}

#[derive(Debug)]
struct LadderState {
    level: DegradationLevel,
    conditions: HashMap<String, DegradationCondition>,
    history: VecDeque<DegradationTransition>,
    transitions: usize,
}

pub struct DegradationManager {
    config: DegradationConfig,
    state: Mutex<LadderState>,
}

impl DegradationManager {
    pub fn new(config: DegradationConfig) -> Self {
        Self {
            config,
            state: Mutex::new(LadderState {
                level: DegradationLevel::Normal,
                conditions: HashMap::new(),
                history: VecDeque::new(),
                transitions: 0,
            }),
        }
    }

    pub fn level(&self) -> DegradationLevel {
        self.state.lock().level
    }

    /// Record the condition and climb by its severity. Returns the
    /// transition when the level changed.
    ///
    /// A condition id that is already active only climbs by the extra
    /// steps a higher severity adds, so re-raising the same error is
    /// idempotent.
    pub fn escalate(&self, condition: DegradationCondition) -> Option<DegradationTransition> {
        let mut state = self.state.lock();
        let already = state
            .conditions
            .get(&condition.id)
            .map(|c| c.steps())
            .unwrap_or(0);
        let steps = condition.steps().saturating_sub(already);
        if steps == 0 {
            if let Some(existing) = state.conditions.get_mut(&condition.id) {
                existing.raised_at = condition.raised_at;
            }
            return None;
        }
        let target = DegradationLevel::from_rank(state.level.rank() + steps);
        let reason = format!("{} ({})", condition.reason, condition.severity.as_str());
        state.conditions.insert(condition.id.clone(), condition);
        self.move_to(&mut state, target, reason)
    }

    /// Drop a condition, e.g. once its error has been recovered.
    pub fn clear_condition(&self, id: &str) -> bool {
        self.state.lock().conditions.remove(id).is_some()
    }

    /// Step down one level if no condition blocks it.
    pub fn recover(&self) -> Option<DegradationTransition> {
        self.recover_at(Utc::now())
    }

    pub fn recover_at(&self, now: DateTime<Utc>) -> Option<DegradationTransition> {
        let mut state = self.state.lock();
        self.expire_conditions(&mut state, now);
        if state.level == DegradationLevel::Normal {
            return None;
        }
        if !state.conditions.is_empty() {
            info!(
                level = state.level.as_str(),
                blocking = state.conditions.len(),
                "Degradation recovery blocked by active conditions"
            );
            return None;
        }
        let target = DegradationLevel::from_rank(state.level.rank() - 1);
        self.move_to(&mut state, target, "conditions cleared".to_string())
    }

    /// Jump straight to the top of the ladder.
    pub fn force_emergency(&self, reason: &str) -> Option<DegradationTransition> {
        let mut state = self.state.lock();
        state.conditions.insert(
            "emergency".to_string(),
            DegradationCondition::new("emergency", Severity::Emergency, reason),
        );
        self.move_to(&mut state, DegradationLevel::Emergency, reason.to_string())
    }

    fn expire_conditions(&self, state: &mut LadderState, now: DateTime<Utc>) {
        let ttl = ChronoDuration::seconds(self.config.condition_ttl_secs as i64);
        state.conditions.retain(|_, c| now - c.raised_at < ttl);
    }

    fn move_to(
        &self,
        state: &mut LadderState,
        target: DegradationLevel,
        reason: String,
    ) -> Option<DegradationTransition> {
        if target == state.level {
            return None;
        }
        let transition = DegradationTransition {
            from: state.level,
            to: target,
            reason,
            at: Utc::now(),
        };
        if target > state.level {
            warn!(from = transition.from.as_str(), to = target.as_str(), reason = %transition.reason, "Degradation escalated");
        } else {
            info!(from = transition.from.as_str(), to = target.as_str(), "Degradation recovered");
        }
        state.level = target;
        state.transitions += 1;
        state.history.push_back(transition.clone());
        while state.history.len() > self.config.history_limit.max(1) {
            state.history.pop_front();
        }
        Some(transition)
    }

    pub fn history(&self) -> Vec<DegradationTransition> {
        self.state.lock().history.iter().cloned().collect()
    }

    pub fn summary(&self) -> DegradationSummary {
        let state = self.state.lock();
        let mut active_conditions: Vec<String> = state.conditions.keys().cloned().collect();
        active_conditions.sort();
        DegradationSummary {
            level: state.level,
            active_conditions,
            transitions: state.transitions,
            concurrency_factor: state.level.concurrency_factor(),
        }
    }
}

impl Default for DegradationManager {
    fn default() -> Self {
        Self::new(DegradationConfig::default())
    }
}
