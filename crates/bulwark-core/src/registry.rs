//! Named lookup of circuit breakers, one per downstream dependency.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats};

/// Registry of shared circuit breakers.
///
/// Constructed explicitly and passed by reference; there is no
/// process-wide default instance.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    default_config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    /// Create a registry whose `get_or_create_default` uses `default_config`.
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            default_config,
        }
    }

    /// Return the breaker registered under `name`, creating it with
    /// `config` on first use. Later calls ignore `config`.
    pub fn get_or_create(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(name) {
            return Arc::clone(breaker);
        }

        let mut breakers = self.breakers.write();
        let breaker = breakers.entry(name.to_string()).or_insert_with(|| {
            tracing::debug!(breaker = %name, "Registering circuit breaker");
            Arc::new(CircuitBreaker::new(name, config))
        });
        Arc::clone(breaker)
    }

    /// Same as [`get_or_create`](Self::get_or_create) with the registry default config.
    pub fn get_or_create_default(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create(name, self.default_config.clone())
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(name).cloned()
    }

    /// Registered breaker names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.breakers.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.breakers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.read().is_empty()
    }

    /// Reset every registered breaker to Closed.
    pub fn reset_all(&self) {
        for breaker in self.breakers.read().values() {
            breaker.reset();
        }
    }

    /// Snapshot of every breaker keyed by name.
    pub fn stats(&self) -> BTreeMap<String, CircuitBreakerStats> {
        self.breakers
            .read()
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.stats()))
            .collect()
    }
}
