//! Toolkit configuration loaded from YAML or JSON.
//!
//! Every section falls back to its defaults, so an empty document is a
//! valid configuration. Durations use humantime notation (`30s`, `5m`).
//!
//! ```yaml
//! circuit_breaker:
//!   failure_threshold: 5
//!   recovery_timeout: 30s
//! degradation:
//!   degraded_threshold: 0.1
//! dependencies:
//!   - name: github
//!     retry_policy: fast
//!     health_check_url: https://api.github.com/zen
//! ```

use bulwark_core::{CircuitBreakerConfig, DegradationConfig, RetryConfig, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

use crate::pool::PoolConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Validation(String),
}

/// One downstream dependency guarded by the toolkit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyConfig {
    pub name: String,

    /// Named retry policy; falls back to the top-level `retry` section
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,

    /// Requested with GET by the background health checks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_url: Option<String>,
}

impl DependencyConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            retry_policy: None,
            health_check_url: None,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_health_check_url(mut self, url: impl Into<String>) -> Self {
        self.health_check_url = Some(url.into());
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolkitConfig {
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    pub pool: PoolConfig,
    pub degradation: DegradationConfig,
    pub dependencies: Vec<DependencyConfig>,
}

impl ToolkitConfig {
    pub fn from_yaml(source: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(source)?)
    }

    pub fn from_json(source: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(source)?)
    }

    /// Load from disk. `.json` files are parsed as JSON, anything else as YAML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;
        let config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json(&source)?,
            _ => Self::from_yaml(&source)?,
        };
        tracing::debug!(path = %path.display(), dependencies = config.dependencies.len(), "Loaded config");
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Reject settings the primitives cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let breaker = &self.circuit_breaker;
        if breaker.failure_threshold == 0 {
            return invalid("circuit_breaker.failure_threshold must be at least 1");
        }
        if breaker.success_threshold == 0 {
            return invalid("circuit_breaker.success_threshold must be at least 1");
        }

        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1");
        }
        if !(self.retry.backoff_factor >= 1.0) {
            return invalid("retry.backoff_factor must be >= 1.0");
        }
        if self.retry.initial_delay > self.retry.max_delay {
            return invalid("retry.initial_delay must not exceed retry.max_delay");
        }

        if self.pool.max_active == 0 {
            return invalid("pool.max_active must be at least 1");
        }
        if self.pool.max_idle > self.pool.max_active {
            return invalid("pool.max_idle must not exceed pool.max_active");
        }

        let d = &self.degradation;
        let ordered = 0.0 < d.degraded_threshold
            && d.degraded_threshold < d.critical_threshold
            && d.critical_threshold < d.emergency_threshold
            && d.emergency_threshold <= 1.0;
        if !ordered {
            return invalid(
                "degradation thresholds must satisfy 0 < degraded < critical < emergency <= 1",
            );
        }
        if d.health_check_interval.is_zero() {
            return invalid("degradation.health_check_interval must be positive");
        }

        let mut seen = HashSet::new();
        for dep in &self.dependencies {
            if dep.name.trim().is_empty() {
                return invalid("dependency name must not be empty");
            }
            if !seen.insert(dep.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate dependency '{}'",
                    dep.name
                )));
            }
            if let Some(url) = &dep.health_check_url {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    return Err(ConfigError::Validation(format!(
                        "dependency '{}': health_check_url must start with http:// or https://",
                        dep.name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Retry settings for one dependency.
    pub fn retry_for(&self, dep: &DependencyConfig) -> RetryConfig {
        match dep.retry_policy {
            Some(policy) => policy.config(),
            None => self.retry.clone(),
        }
    }
}

fn invalid(msg: &str) -> Result<(), ConfigError> {
    Err(ConfigError::Validation(msg.to_string()))
}
