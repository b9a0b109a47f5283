//! Per-key circuit breakers
//!
//! Each key owns a small state machine:
//!
//! - `Closed`: calls pass, failures accumulate within the monitor window
//! - `Open`: calls fail fast with `CIRCUIT_BREAKER_OPEN` until the reset timeout elapses
//! - `HalfOpen`: exactly one probe is admitted; its outcome closes or reopens the circuit
//!
//! State lives in a registry keyed by string. Callers sharing a key serialize on
//! that key's lock only.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditSink};
use crate::classifier::{normalize, AppError};
use crate::clock::{elapsed_between, Clock};
use crate::error::{ResilienceError, ResilienceResult};

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Thresholds for one breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failures within one monitor window that open the circuit
    pub failure_threshold: u32,
    /// Time after the last failure before a probe is admitted
    pub reset_timeout: Duration,
    /// Failure counter is cleared once this much time has passed since the window started
    pub monitor_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            monitor_window: Duration::from_secs(300),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            failure_threshold,
            ..Default::default()
        }
    }

    pub fn reset_timeout(mut self, reset_timeout: Duration) -> Self {
        self.reset_timeout = reset_timeout;
        self
    }

    pub fn monitor_window(mut self, monitor_window: Duration) -> Self {
        self.monitor_window = monitor_window;
        self
    }

    pub fn validate(&self) -> ResilienceResult<()> {
        if self.failure_threshold == 0 {
            return Err(ResilienceError::invalid_config(
                "circuit breaker failure_threshold must be at least 1",
            ));
        }
        if self.monitor_window.is_zero() {
            return Err(ResilienceError::invalid_config(
                "circuit breaker monitor_window must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Snapshot of one breaker for monitoring
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerStats {
    pub key: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub window_start: DateTime<Utc>,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
    pub total_successes: u64,
    pub total_failures: u64,
    pub rejected_calls: u64,
    pub times_opened: u64,
}

/// Admission granted by [`CircuitBreakerRegistry::check`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitPermit {
    /// Whether this call is the half-open probe
    pub probe: bool,
}

#[derive(Debug)]
struct BreakerState {
    config: CircuitBreakerConfig,
    state: CircuitState,
    failure_count: u32,
    window_start: DateTime<Utc>,
    last_failure_time: Option<DateTime<Utc>>,
    last_success_time: Option<DateTime<Utc>>,
    probe_started: Option<DateTime<Utc>>,
    total_successes: u64,
    total_failures: u64,
    rejected_calls: u64,
    times_opened: u64,
}

impl BreakerState {
    fn new(config: CircuitBreakerConfig, now: DateTime<Utc>) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            window_start: now,
            last_failure_time: None,
            last_success_time: None,
            probe_started: None,
            total_successes: 0,
            total_failures: 0,
            rejected_calls: 0,
            times_opened: 0,
        }
    }

    /// Clear the failure counter once the monitor window has elapsed
    fn roll_window(&mut self, now: DateTime<Utc>) {
        if elapsed_between(self.window_start, now) > self.config.monitor_window {
            self.failure_count = 0;
            self.window_start = now;
        }
    }

    fn transition(&mut self, to: CircuitState) -> Option<(CircuitState, CircuitState)> {
        if self.state == to {
            return None;
        }
        let from = self.state;
        self.state = to;
        if to == CircuitState::Open {
            self.times_opened += 1;
        }
        if to != CircuitState::HalfOpen {
            self.probe_started = None;
        }
        Some((from, to))
    }

    fn reset_elapsed(&self, now: DateTime<Utc>) -> bool {
        match self.last_failure_time {
            Some(last) => elapsed_between(last, now) > self.config.reset_timeout,
            None => true,
        }
    }

    fn stats(&self, key: &str) -> CircuitBreakerStats {
        CircuitBreakerStats {
            key: key.to_string(),
            state: self.state,
            failure_count: self.failure_count,
            failure_threshold: self.config.failure_threshold,
            window_start: self.window_start,
            last_failure_time: self.last_failure_time,
            last_success_time: self.last_success_time,
            total_successes: self.total_successes,
            total_failures: self.total_failures,
            rejected_calls: self.rejected_calls,
            times_opened: self.times_opened,
        }
    }
}

/// Registry of circuit breakers keyed by dependency name
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    overrides: DashMap<String, CircuitBreakerConfig>,
    breakers: DashMap<String, Arc<Mutex<BreakerState>>>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
}

impl CircuitBreakerRegistry {
    pub fn new(
        default_config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            default_config,
            overrides: DashMap::new(),
            breakers: DashMap::new(),
            clock,
            audit,
        }
    }

    /// Use a dedicated configuration for one key
    ///
    /// Applies to breakers created after the call; an existing breaker picks
    /// it up immediately as well.
    pub fn set_config(&self, key: impl Into<String>, config: CircuitBreakerConfig) {
        let key = key.into();
        if let Some(entry) = self.breakers.get(&key) {
            entry.lock().config = config.clone();
        }
        self.overrides.insert(key, config);
    }

    fn config_for(&self, key: &str) -> CircuitBreakerConfig {
        self.overrides
            .get(key)
            .map(|c| c.clone())
            .unwrap_or_else(|| self.default_config.clone())
    }

    fn breaker(&self, key: &str) -> Arc<Mutex<BreakerState>> {
        if let Some(existing) = self.breakers.get(key) {
            return existing.clone();
        }
        let config = self.config_for(key);
        let now = self.clock.now();
        self.breakers
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(BreakerState::new(config, now))))
            .clone()
    }

    fn emit_transition(&self, key: &str, transition: Option<(CircuitState, CircuitState)>) {
        if let Some((from, to)) = transition {
            match to {
                CircuitState::Open => warn!(circuit_breaker = key, from = %from, "Circuit breaker opened"),
                CircuitState::HalfOpen => info!(circuit_breaker = key, "Circuit breaker half-open"),
                CircuitState::Closed => info!(circuit_breaker = key, from = %from, "Circuit breaker closed"),
            }
            self.audit.record(AuditEvent::CircuitTransition {
                key: key.to_string(),
                from,
                to,
            });
        }
    }

    /// Ask for permission to call the dependency behind `key`
    ///
    /// Returns `CIRCUIT_BREAKER_OPEN` while the circuit is open, or while a
    /// half-open probe is already in flight.
    pub fn check(&self, key: &str) -> Result<CircuitPermit, AppError> {
        let breaker = self.breaker(key);
        let now = self.clock.now();

        let (outcome, transition) = {
            let mut state = breaker.lock();
            state.roll_window(now);

            let mut transition = None;
            if state.state == CircuitState::Open && state.reset_elapsed(now) {
                transition = state.transition(CircuitState::HalfOpen);
            }

            let current = state.state;
            let outcome = match current {
                CircuitState::Closed => Ok(CircuitPermit { probe: false }),
                CircuitState::HalfOpen => {
                    // A probe that never reported back is abandoned after another reset timeout
                    let probe_busy = state
                        .probe_started
                        .map(|started| elapsed_between(started, now) <= state.config.reset_timeout)
                        .unwrap_or(false);
                    if probe_busy {
                        state.rejected_calls += 1;
                        Err(AppError::circuit_breaker_open(key))
                    } else {
                        state.probe_started = Some(now);
                        Ok(CircuitPermit { probe: true })
                    }
                }
                CircuitState::Open => {
                    state.rejected_calls += 1;
                    Err(AppError::circuit_breaker_open(key))
                }
            };
            (outcome, transition)
        };

        self.emit_transition(key, transition);
        if outcome.is_err() {
            debug!(circuit_breaker = key, "Call rejected by open circuit");
        }
        outcome
    }

    /// Hand back a probe permit whose call never ran
    pub fn release_probe(&self, key: &str) {
        let breaker = self.breaker(key);
        let mut state = breaker.lock();
        if state.state == CircuitState::HalfOpen {
            state.probe_started = None;
        }
    }

    /// Record a successful call
    pub fn record_success(&self, key: &str) {
        let breaker = self.breaker(key);
        let now = self.clock.now();

        let transition = {
            let mut state = breaker.lock();
            state.roll_window(now);
            state.total_successes += 1;
            state.last_success_time = Some(now);
            // Closed keeps counting until the monitor window rolls over
            let current = state.state;
            match current {
                CircuitState::HalfOpen => {
                    state.failure_count = 0;
                    state.window_start = now;
                    state.transition(CircuitState::Closed)
                }
                _ => None,
            }
        };

        self.emit_transition(key, transition);
    }

    /// Record a failed call
    pub fn record_failure(&self, key: &str) {
        let breaker = self.breaker(key);
        let now = self.clock.now();

        let transition = {
            let mut state = breaker.lock();
            state.roll_window(now);
            state.total_failures += 1;
            state.failure_count = state.failure_count.saturating_add(1);
            state.last_failure_time = Some(now);

            let current = state.state;
            match current {
                CircuitState::HalfOpen => state.transition(CircuitState::Open),
                CircuitState::Closed if state.failure_count >= state.config.failure_threshold => {
                    state.transition(CircuitState::Open)
                }
                _ => None,
            }
        };

        self.emit_transition(key, transition);
    }

    /// Run `operation` under the breaker for `key`
    ///
    /// The operation is not invoked when the circuit rejects the call.
    pub async fn execute<F, Fut, T, E>(&self, key: &str, operation: F) -> Result<T, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.check(key)?;

        match operation().await {
            Ok(value) => {
                self.record_success(key);
                Ok(value)
            }
            Err(error) => {
                self.record_failure(key);
                Err(normalize(&error, None))
            }
        }
    }

    /// Current state, `Closed` for keys never seen
    pub fn state(&self, key: &str) -> CircuitState {
        self.breakers
            .get(key)
            .map(|b| b.lock().state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn stats(&self, key: &str) -> Option<CircuitBreakerStats> {
        self.breakers.get(key).map(|b| b.lock().stats(key))
    }

    pub fn all_stats(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| entry.value().lock().stats(entry.key()))
            .collect();
        stats.sort_by(|a, b| a.key.cmp(&b.key));
        stats
    }

    /// Keys whose circuit is currently open
    pub fn open_circuits(&self) -> Vec<String> {
        let mut keys: Vec<_> = self
            .breakers
            .iter()
            .filter(|entry| entry.value().lock().state == CircuitState::Open)
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Open the circuit regardless of failures
    pub fn force_open(&self, key: &str) {
        let breaker = self.breaker(key);
        let now = self.clock.now();
        let transition = {
            let mut state = breaker.lock();
            state.last_failure_time = Some(now);
            state.transition(CircuitState::Open)
        };
        self.emit_transition(key, transition);
    }

    /// Close the circuit and clear its failure counter
    pub fn force_close(&self, key: &str) {
        let breaker = self.breaker(key);
        let now = self.clock.now();
        let transition = {
            let mut state = breaker.lock();
            state.failure_count = 0;
            state.window_start = now;
            state.transition(CircuitState::Closed)
        };
        self.emit_transition(key, transition);
    }

    /// Forget everything about `key`
    pub fn reset(&self, key: &str) -> bool {
        self.breakers.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
