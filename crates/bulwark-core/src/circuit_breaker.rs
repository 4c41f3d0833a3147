//! Circuit breaker to isolate a failing dependency.
//!
//! # States
//! - Closed: calls run, consecutive failures are counted
//! - Open: calls fail fast until the recovery timeout elapses
//! - HalfOpen: trial calls decide whether the dependency recovered
//!
//! # State Transitions
//! ```text
//! Closed   → Open:     failure_count >= failure_threshold
//! Open     → HalfOpen: first call at or after next_attempt_time
//! HalfOpen → Closed:   success_count >= success_threshold
//! HalfOpen → Open:     any failed trial
//! ```
//!
//! `failure_count` is not reset on entry to HalfOpen, so a single failed
//! trial re-opens the breaker. Concurrent callers may all observe HalfOpen
//! and issue overlapping trials; that overlap is accepted.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::ResilienceError;

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,

    /// Time the circuit stays open before a trial call is allowed
    #[serde(with = "crate::serde_duration")]
    pub recovery_timeout: Duration,

    /// Successful trials needed to close the circuit
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 3,
        }
    }
}

/// Fault-isolation mode of a breaker.
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

/// Point-in-time view of a breaker, for health and metrics reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
}

/// All fields touched by a transition live behind one lock.
#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
    next_attempt_time: Option<Instant>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            next_attempt_time: None,
        }
    }
}

/// Circuit breaker for one downstream dependency.
///
/// Share it by reference (`Arc<CircuitBreaker>`, usually obtained from a
/// [`CircuitBreakerRegistry`](crate::CircuitBreakerRegistry)) so that every
/// call site of the same dependency sees the same fault state.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a new closed breaker.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `op` under breaker protection.
    ///
    /// Fails with [`ResilienceError::CircuitOpen`] without invoking `op`
    /// while the circuit is open. Otherwise the operation's own result is
    /// returned unchanged. A cancelled operation is not counted either way.
    pub async fn call<F, Fut, T>(&self, op: F) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        self.before_call()?;

        let result = op().await;
        match &result {
            Ok(_) => self.on_success(),
            Err(ResilienceError::Cancelled) => {}
            Err(_) => self.on_failure(),
        }
        result
    }

    /// Current state. Does not perform the Open → HalfOpen transition.
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.state.lock().failure_count
    }

    pub fn success_count(&self) -> u32 {
        self.state.lock().success_count
    }

    /// Time of the most recent counted failure.
    pub fn last_failure_time(&self) -> Option<Instant> {
        self.state.lock().last_failure_time
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let state = self.state.lock();
        CircuitBreakerStats {
            name: self.name.clone(),
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
        }
    }

    /// Force the breaker back to Closed with cleared counters.
    pub fn reset(&self) {
        *self.state.lock() = BreakerState::new();
        tracing::info!(breaker = %self.name, "Circuit breaker reset");
    }

    fn before_call(&self) -> Result<(), ResilienceError> {
        let mut state = self.state.lock();
        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let now = Instant::now();
                match state.next_attempt_time {
                    Some(next) if now < next => Err(ResilienceError::CircuitOpen {
                        name: self.name.clone(),
                        state: CircuitState::Open,
                    }),
                    _ => {
                        state.state = CircuitState::HalfOpen;
                        state.success_count = 0;
                        tracing::info!(
                            breaker = %self.name,
                            failures = state.failure_count,
                            "Circuit half-open, allowing trial call"
                        );
                        Ok(())
                    }
                }
            }
        }
    }

    fn on_success(&self) {
        let mut state = self.state.lock();
        match state.state {
            CircuitState::Closed => {
                state.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    state.state = CircuitState::Closed;
                    state.failure_count = 0;
                    state.success_count = 0;
                    state.next_attempt_time = None;
                    tracing::info!(breaker = %self.name, "Circuit closed after successful recovery");
                }
            }
            // A call admitted before the circuit opened; keep the open state intact.
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut state = self.state.lock();
        let now = Instant::now();
        state.failure_count = state.failure_count.saturating_add(1);
        state.success_count = 0;
        state.last_failure_time = Some(now);

        match state.state {
            CircuitState::Closed => {
                if state.failure_count >= self.config.failure_threshold {
                    self.trip(&mut state, now);
                    tracing::warn!(
                        breaker = %self.name,
                        failures = state.failure_count,
                        "Circuit opened after repeated failures"
                    );
                }
            }
            CircuitState::HalfOpen => {
                self.trip(&mut state, now);
                tracing::warn!(breaker = %self.name, "Circuit reopened after failed trial call");
            }
            CircuitState::Open => {}
        }
    }

    fn trip(&self, state: &mut BreakerState, now: Instant) {
        state.state = CircuitState::Open;
        state.next_attempt_time = Some(now + self.config.recovery_timeout);
    }
}
