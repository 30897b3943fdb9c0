//! Circuit breaker for recovery targets
//!
//! ```text
//!            failure rate > threshold
//!  Closed ─────────────────────────────► Open
//!    ▲                                    │
//!    │ probe successes                    │ recovery timeout
//!    │                                    ▼
//!    └──────────────────────────────── HalfOpen ──► Open (any probe failure)
//! ```
//!
//! Every transition happens under one mutex per breaker. The lock is taken
//! to admit a call and again to record its outcome; the protected future
//! itself runs unlocked.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failure percentage over the rolling window above which the circuit opens
    pub error_threshold_pct: f64,
    /// Calls required in the window before the rate is considered
    pub min_throughput: u32,
    pub window_secs: u64,
    /// Time spent open before probing
    pub recovery_timeout_ms: u64,
    /// Concurrent probes admitted while half-open
    pub half_open_max_probes: u32,
    /// Probe successes needed to close
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            error_threshold_pct: 50.0,
            min_throughput: 5,
            window_secs: 60,
            recovery_timeout_ms: 30_000,
            half_open_max_probes: 1,
            success_threshold: 1,
        }
    }
}

impl CircuitBreakerConfig {
    fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

/// Circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Circuit breaker error
#[derive(Debug, Clone)]
pub enum CircuitBreakerError<E> {
    /// Call rejected without running
    Open { target: String },
    /// Call ran and failed
    OperationFailed(E),
}

impl<E: std::fmt::Display> std::fmt::Display for CircuitBreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open { target } => write!(f, "Circuit breaker for '{}' is open", target),
            Self::OperationFailed(e) => write!(f, "Operation failed: {}", e),
        }
    }
}

impl<E: std::fmt::Debug + std::fmt::Display> std::error::Error for CircuitBreakerError<E> {}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    /// (completed at, succeeded) for closed-state calls
    window: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    probes_in_flight: u32,
    probe_successes: u32,
}

impl BreakerState {
    fn prune(&mut self, window: Duration, now: Instant) {
        while let Some((at, _)) = self.window.front() {
            if now.duration_since(*at) > window {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn failures(&self) -> usize {
        self.window.iter().filter(|(_, ok)| !ok).count()
    }
}

/// How a call was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Probe,
}

/// Records a cancelled call as a failure so a half-open probe slot is
/// never leaked.
struct Pending<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    settled: bool,
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.record(self.admission, false);
        }
    }
}

/// Circuit breaker guarding a single recovery target
pub struct CircuitBreaker {
    target: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    rejected: AtomicU64,
    times_opened: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(target: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            target: target.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                window: VecDeque::new(),
                opened_at: None,
                probes_in_flight: 0,
                probe_successes: 0,
            }),
            rejected: AtomicU64::new(0),
            times_opened: AtomicU64::new(0),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Current state, promoting Open to HalfOpen once the recovery timeout
    /// has elapsed.
    pub fn current_state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.maybe_half_open(&mut inner, Instant::now());
        inner.state
    }

    /// Execute `operation` under breaker protection
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let admission = match self.admit() {
            Some(admission) => admission,
            None => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(target_id = %self.target, "Circuit breaker open, rejecting call");
                return Err(CircuitBreakerError::Open {
                    target: self.target.clone(),
                });
            }
        };

        let mut pending = Pending {
            breaker: self,
            admission,
            settled: false,
        };
        let outcome = operation().await;
        pending.settled = true;
        self.record(admission, outcome.is_ok());
        outcome.map_err(CircuitBreakerError::OperationFailed)
    }

    fn admit(&self) -> Option<Admission> {
        let mut inner = self.inner.lock();
        self.maybe_half_open(&mut inner, Instant::now());
        match inner.state {
            CircuitState::Closed => Some(Admission::Normal),
            CircuitState::Open => None,
            CircuitState::HalfOpen => {
                if inner.probes_in_flight >= self.config.half_open_max_probes.max(1) {
                    None
                } else {
                    inner.probes_in_flight += 1;
                    Some(Admission::Probe)
                }
            }
        }
    }

    fn record(&self, admission: Admission, success: bool) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        match (admission, inner.state) {
            (Admission::Probe, CircuitState::HalfOpen) => {
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
                if !success {
                    info!(target_id = %self.target, "Probe failed, reopening circuit");
                    self.transition(&mut inner, CircuitState::Open, now);
                    return;
                }
                inner.probe_successes += 1;
                debug!(target_id = %self.target, successes = inner.probe_successes, "Probe succeeded");
                if inner.probe_successes >= self.config.success_threshold.max(1) {
                    self.transition(&mut inner, CircuitState::Closed, now);
                }
            }
            (Admission::Normal, CircuitState::Closed) => {
                inner.window.push_back((now, success));
                inner.prune(self.config.window(), now);
                if success {
                    return;
                }
                let calls = inner.window.len();
                let failures = inner.failures();
                let rate = failures as f64 * 100.0 / calls as f64;
                if calls >= self.config.min_throughput as usize
                    && rate > self.config.error_threshold_pct
                {
                    info!(
                        target_id = %self.target,
                        calls,
                        failures,
                        failure_rate_pct = rate,
                        "Failure threshold reached, opening circuit"
                    );
                    self.transition(&mut inner, CircuitState::Open, now);
                }
            }
            // Outcome of a call admitted before a transition; the new state
            // has already been decided without it.
            _ => {}
        }
    }

    fn maybe_half_open(&self, inner: &mut BreakerState, now: Instant) {
        if inner.state != CircuitState::Open {
            return;
        }
        let elapsed = inner
            .opened_at
            .map(|at| now.duration_since(at))
            .unwrap_or_default();
        if elapsed >= self.config.recovery_timeout() {
            self.transition(inner, CircuitState::HalfOpen, now);
        }
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState, now: Instant) {
        let from = inner.state;
        if from == to {
            if to == CircuitState::Open {
                inner.opened_at = Some(now);
            }
            return;
        }
        inner.state = to;
        inner.probes_in_flight = 0;
        inner.probe_successes = 0;
        match to {
            CircuitState::Open => {
                inner.opened_at = Some(now);
                self.times_opened.fetch_add(1, Ordering::Relaxed);
            }
            CircuitState::Closed => {
                inner.window.clear();
                inner.opened_at = None;
            }
            CircuitState::HalfOpen => {}
        }
        info!(target_id = %self.target, from = ?from, to = ?to, "Circuit breaker state changed");
    }

    /// Open the circuit immediately. It half-opens after the normal
    /// recovery timeout.
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitState::Open, Instant::now());
    }

    /// Close the circuit and forget the window.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitState::Closed, Instant::now());
        inner.window.clear();
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.maybe_half_open(&mut inner, now);
        inner.prune(self.config.window(), now);
        let calls = inner.window.len();
        let failures = inner.failures();
        CircuitBreakerMetrics {
            target: self.target.clone(),
            state: inner.state,
            calls_in_window: calls,
            failures_in_window: failures,
            failure_rate_pct: if calls > 0 {
                failures as f64 * 100.0 / calls as f64
            } else {
                0.0
            },
            rejected: self.rejected.load(Ordering::Relaxed),
            times_opened: self.times_opened.load(Ordering::Relaxed),
        }
    }
}

/// Circuit breaker metrics
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerMetrics {
    pub target: String,
    pub state: CircuitState,
    pub calls_in_window: usize,
    pub failures_in_window: usize,
    pub failure_rate_pct: f64,
    pub rejected: u64,
    pub times_opened: u64,
}

// ============================================================================
// Registry
// ============================================================================

/// Per-target breakers, created on first use.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, target: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(target).cloned()
    }

    pub fn get_or_create(&self, target: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.get(target) {
            return breaker;
        }
        self.breakers
            .write()
            .entry(target.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(target, self.config.clone())))
            .clone()
    }

    /// Emergency measure: open every known breaker. Returns how many.
    pub fn force_open_all(&self) -> usize {
        let breakers = self.breakers.read();
        for breaker in breakers.values() {
            breaker.force_open();
        }
        warn!(count = breakers.len(), "Forced all circuit breakers open");
        breakers.len()
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.read().values() {
            breaker.reset();
        }
    }

    pub fn len(&self) -> usize {
        self.breakers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.read().is_empty()
    }

    /// Metrics for every breaker, sorted by target.
    pub fn summaries(&self) -> Vec<CircuitBreakerMetrics> {
        let mut all: Vec<_> = self.breakers.read().values().map(|b| b.metrics()).collect();
        all.sort_by(|a, b| a.target.cmp(&b.target));
        all
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
