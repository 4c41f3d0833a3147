//! # bulwark-core
//!
//! Fault-tolerance primitives for calls to unreliable, rate-limited
//! external services.
//!
//! This crate is transport-agnostic. It provides:
//! - [`CircuitBreaker`] and [`CircuitBreakerRegistry`] for fault isolation
//! - [`retry::execute`] with exponential backoff, jitter and cancellation
//! - [`DegradationManager`] for error-rate based graceful degradation
//!
//! The HTTP connection pool and the composition of all pieces live in
//! `bulwark-runtime`.
//!
//! ## Key Guarantees
//!
//! 1. **Shared state is explicit**: breakers, managers and registries are
//!    constructed by the caller and passed by reference
//! 2. **Concurrency-safe**: every type can be used from many tasks at once
//! 3. **Cancellable**: every blocking wait honours a `CancellationToken`
//! 4. **In-memory**: nothing survives a process restart
//!
//! ## Example
//!
//! ```rust,ignore
//! use bulwark_core::{CircuitBreakerRegistry, RetryConfig, retry};
//! use tokio_util::sync::CancellationToken;
//!
//! let registry = CircuitBreakerRegistry::default();
//! let breaker = registry.get_or_create_default("github");
//! let token = CancellationToken::new();
//!
//! let body = retry::execute(&token, &RetryConfig::standard(), || {
//!     breaker.call(|| fetch_profile("octocat"))
//! })
//! .await?;
//! ```

pub mod backoff;
pub mod circuit_breaker;
pub mod degradation;
pub mod error;
pub mod registry;
pub mod retry;
pub mod serde_duration;

pub use backoff::BackoffPolicy;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use degradation::{
    health_check_fn, DegradationConfig, DegradationLevel, DegradationManager, HealthCheck,
    ServiceHealth,
};
pub use error::{is_retryable_status, ResilienceError, RETRYABLE_STATUS_CODES};
pub use registry::CircuitBreakerRegistry;
pub use retry::{RetryConfig, RetryManager, RetryPolicy, RetryPredicate};

/// Re-exported so callers do not need a direct `tokio-util` dependency.
pub use tokio_util::sync::CancellationToken;
