//! # bulwark-runtime
//!
//! HTTP-facing half of bulwark: a bounded [`ConnectionPool`] per
//! dependency, the [`execute_http`] retry variant, configuration loading,
//! and the [`Toolkit`] that composes breaker, retry, pool and degradation
//! into one guarded `fetch`.
//!
//! ```rust,ignore
//! use bulwark_runtime::{Toolkit, ToolkitConfig};
//!
//! let toolkit = Toolkit::new(ToolkitConfig::from_file("bulwark.yaml")?)?;
//! let _checks = toolkit.start_health_checks(shutdown.clone());
//!
//! let response = toolkit
//!     .fetch(&shutdown, "github", Method::GET, "https://api.github.com/zen", &HeaderMap::new())
//!     .await?;
//! ```

pub mod config;
pub mod http;
pub mod pool;
pub mod toolkit;

use bulwark_core::ResilienceError;
use thiserror::Error;

pub use config::{ConfigError, DependencyConfig, ToolkitConfig};
pub use http::{error_for_status, execute_http};
pub use pool::{ConnectionPool, PoolConfig, PoolStats, PooledClient};
pub use toolkit::{Toolkit, ToolkitStats};

/// Errors surfaced by [`Toolkit`].
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("service '{service}' is unavailable")]
    ServiceUnavailable { service: String },

    #[error("request to '{service}' throttled (throttle factor {factor})")]
    Throttled { service: String, factor: f64 },

    #[error("unknown dependency '{0}'")]
    UnknownDependency(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Resilience(#[from] ResilienceError),
}

impl RuntimeError {
    /// The underlying resilience error, if any.
    pub fn resilience(&self) -> Option<&ResilienceError> {
        match self {
            Self::Resilience(err) => Some(err),
            _ => None,
        }
    }
}
