//! Retry executor with exponential backoff.
//!
//! # Algorithm
//! ```text
//! for attempt in 0..max_attempts:
//!     cancelled?            → Cancelled
//!     run operation
//!     Ok                    → return
//!     not retryable         → return error
//!     last attempt          → return error
//!     sleep(backoff(attempt)), interruptible by cancellation
//! ```
//!
//! `max_attempts` counts total tries, not retries. Circuit-open errors are
//! never retried, whatever the configured predicate says.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::backoff::BackoffPolicy;
use crate::error::ResilienceError;

/// Decides whether a failed attempt may be retried.
pub type RetryPredicate = Arc<dyn Fn(&ResilienceError) -> bool + Send + Sync>;

fn default_predicate() -> RetryPredicate {
    Arc::new(ResilienceError::is_retryable)
}

/// Retry configuration.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    pub max_attempts: u32,

    #[serde(with = "crate::serde_duration")]
    pub initial_delay: Duration,

    #[serde(with = "crate::serde_duration")]
    pub max_delay: Duration,

    pub backoff_factor: f64,

    /// Add up to 10% random extra delay
    pub jitter_enabled: bool,

    /// Retryability predicate; defaults to [`ResilienceError::is_retryable`]
    #[serde(skip, default = "default_predicate")]
    pub retryable_errors: RetryPredicate,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter_enabled: true,
            retryable_errors: default_predicate(),
        }
    }
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_factor", &self.backoff_factor)
            .field("jitter_enabled", &self.jitter_enabled)
            .finish_non_exhaustive()
    }
}

impl RetryConfig {
    /// Few quick retries for latency-sensitive reads.
    pub fn fast() -> Self {
        Self {
            max_attempts: 2,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            backoff_factor: 1.5,
            ..Self::default()
        }
    }

    pub fn standard() -> Self {
        Self::default()
    }

    /// Patient retries for heavily rate-limited APIs.
    pub fn slow() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            ..Self::default()
        }
    }

    /// Replace the retryability predicate.
    pub fn with_retryable<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ResilienceError) -> bool + Send + Sync + 'static,
    {
        self.retryable_errors = Arc::new(predicate);
        self
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            self.initial_delay,
            self.max_delay,
            self.backoff_factor,
            self.jitter_enabled,
        )
    }
}

/// Named retry presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    Fast,
    #[default]
    Standard,
    Slow,
}

impl RetryPolicy {
    pub fn config(self) -> RetryConfig {
        match self {
            RetryPolicy::Fast => RetryConfig::fast(),
            RetryPolicy::Standard => RetryConfig::standard(),
            RetryPolicy::Slow => RetryConfig::slow(),
        }
    }
}

impl fmt::Display for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryPolicy::Fast => write!(f, "fast"),
            RetryPolicy::Standard => write!(f, "standard"),
            RetryPolicy::Slow => write!(f, "slow"),
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
///
/// Cancellation is checked before every attempt, races the running
/// attempt, and interrupts the backoff sleep; it always yields
/// [`ResilienceError::Cancelled`].
pub async fn execute<F, Fut, T>(
    token: &CancellationToken,
    config: &RetryConfig,
    mut op: F,
) -> Result<T, ResilienceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ResilienceError>>,
{
    let max_attempts = config.max_attempts.max(1);
    let backoff = config.backoff();
    let mut attempt = 0u32;

    loop {
        if token.is_cancelled() {
            return Err(ResilienceError::Cancelled);
        }

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(ResilienceError::Cancelled),
            result = op() => result,
        };

        let err = match result {
            Ok(value) => {
                if attempt > 0 {
                    tracing::debug!(attempts = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if err.is_cancelled() || err.is_circuit_open() || !(config.retryable_errors)(&err) {
            tracing::debug!(attempt = attempt + 1, error = %err, "Non-retryable failure");
            return Err(err);
        }

        if attempt + 1 >= max_attempts {
            tracing::warn!(attempts = max_attempts, error = %err, "Retry attempts exhausted");
            return Err(err);
        }

        let delay = backoff.delay(attempt);
        tracing::debug!(
            attempt = attempt + 1,
            max_attempts,
            delay = ?delay,
            error = %err,
            "Attempt failed, retrying"
        );

        tokio::select! {
            biased;
            _ = token.cancelled() => return Err(ResilienceError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

/// Maps service names to retry policies. Unknown services get `standard`.
#[derive(Debug, Default)]
pub struct RetryManager {
    policies: RwLock<HashMap<String, RetryConfig>>,
}

impl RetryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign a named preset to `service`.
    pub fn register(&self, service: &str, policy: RetryPolicy) {
        self.register_config(service, policy.config());
    }

    /// Assign a custom configuration to `service`.
    pub fn register_config(&self, service: &str, config: RetryConfig) {
        self.policies.write().insert(service.to_string(), config);
    }

    /// Retry configuration for `service`.
    pub fn policy_for(&self, service: &str) -> RetryConfig {
        self.policies
            .read()
            .get(service)
            .cloned()
            .unwrap_or_else(RetryConfig::standard)
    }

    /// [`execute`] with the policy registered for `service`.
    pub async fn execute<F, Fut, T>(
        &self,
        token: &CancellationToken,
        service: &str,
        op: F,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        let config = self.policy_for(service);
        execute(token, &config, op).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn quick(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            jitter_enabled: false,
            ..RetryConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let token = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result = execute(&token, &quick(3), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ResilienceError::Transport("reset".to_string()))
            } else {
                Ok("done")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_never_exceed_max() {
        let token = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = execute(&token, &quick(4), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ResilienceError::Transport("down".to_string()))
        })
        .await;

        assert!(matches!(result, Err(ResilienceError::Transport(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_delays_between_attempts() {
        let token = CancellationToken::new();
        let start = Instant::now();

        let _: Result<(), _> = execute(&token, &quick(3), || async {
            Err(ResilienceError::Timeout(Duration::from_secs(1)))
        })
        .await;

        // 10ms after the first attempt, 20ms after the second
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(30));
        assert!(elapsed < Duration::from_millis(40));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_makes_one_attempt() {
        let token = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let config = quick(5).with_retryable(|_| false);

        let result: Result<(), _> = execute(&token, &config, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ResilienceError::operation("bad request"))
        })
        .await;

        assert!(matches!(result, Err(ResilienceError::Operation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_open_is_never_retried() {
        let token = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let config = quick(5).with_retryable(|_| true);

        let result: Result<(), _> = execute(&token, &config, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ResilienceError::CircuitOpen {
                name: "github".to_string(),
                state: CircuitState::Open,
            })
        })
        .await;

        assert!(matches!(result, Err(ResilienceError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_first_attempt() {
        let token = CancellationToken::new();
        token.cancel();
        let calls = AtomicU32::new(0);

        let result = execute(&token, &quick(3), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(ResilienceError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_backoff_sleep() {
        let token = CancellationToken::new();
        let config = RetryConfig {
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
            jitter_enabled: false,
            ..RetryConfig::default()
        };

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let start = Instant::now();
        let result: Result<(), _> = execute(&token, &config, || async {
            Err(ResilienceError::Transport("down".to_string()))
        })
        .await;

        assert!(matches!(result, Err(ResilienceError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(60));
    }

    #[test]
    fn test_named_policies() {
        let fast = RetryPolicy::Fast.config();
        let slow = RetryPolicy::Slow.config();
        assert!(fast.max_attempts < slow.max_attempts);
        assert!(fast.initial_delay < slow.initial_delay);
        assert_eq!(RetryPolicy::default(), RetryPolicy::Standard);
        assert_eq!(RetryPolicy::Standard.config().max_attempts, 3);
    }

    #[test]
    fn test_manager_defaults_to_standard() {
        let manager = RetryManager::new();
        manager.register("x", RetryPolicy::Slow);

        assert_eq!(manager.policy_for("x").max_attempts, 5);
        assert_eq!(manager.policy_for("unknown").max_attempts, 3);
        assert_eq!(
            manager.policy_for("unknown").initial_delay,
            Duration::from_millis(100)
        );
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: RetryConfig =
            serde_json::from_str(r#"{"max_attempts": 4, "initial_delay": "250ms"}"#).unwrap();
        assert_eq!(config.max_attempts, 4);
        assert_eq!(config.initial_delay, Duration::from_millis(250));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert!(config.jitter_enabled);
        assert!((config.retryable_errors)(&ResilienceError::Transport("x".into())));
    }
}
