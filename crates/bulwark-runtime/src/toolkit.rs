//! Composition root tying the primitives together per dependency.
//!
//! # Data Flow
//! ```text
//! fetch(service)
//!   → degradation: unavailable?         → ServiceUnavailable
//!   → degradation: throttled?           → admit with probability = factor
//!   → retry (policy for service)
//!       → pool.do_request
//!           → breaker (shared per service)
//!               → reqwest
//!   → record outcome in degradation manager
//! ```
//!
//! # Design Decisions
//! - One breaker per dependency, shared by its pool and every caller
//! - Circuit-open and cancelled outcomes are not recorded as service
//!   errors; they never reached the service
//! - 5xx responses that survive the retry loop count as errors, 4xx do not

use async_trait::async_trait;
use bulwark_core::{
    CancellationToken, CircuitBreakerRegistry, CircuitBreakerStats, DegradationManager,
    HealthCheck, ResilienceError, RetryManager, ServiceHealth,
};
use parking_lot::RwLock;
use rand::Rng;
use reqwest::header::HeaderMap;
use reqwest::{Method, Response};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::config::{DependencyConfig, ToolkitConfig};
use crate::http;
use crate::pool::{ConnectionPool, PoolStats};
use crate::RuntimeError;

/// Snapshot of every breaker, pool and service record.
#[derive(Debug, Clone, Serialize)]
pub struct ToolkitStats {
    pub breakers: BTreeMap<String, CircuitBreakerStats>,
    pub pools: BTreeMap<String, PoolStats>,
    pub services: BTreeMap<String, ServiceHealth>,
}

/// Guards outbound HTTP calls to a set of named dependencies.
pub struct Toolkit {
    config: ToolkitConfig,
    breakers: Arc<CircuitBreakerRegistry>,
    degradation: Arc<DegradationManager>,
    retries: RetryManager,
    pools: RwLock<HashMap<String, Arc<ConnectionPool>>>,
}

impl Toolkit {
    /// Validate `config` and register every dependency it lists.
    pub fn new(config: ToolkitConfig) -> Result<Self, RuntimeError> {
        config.validate()?;

        let toolkit = Self {
            breakers: Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone())),
            degradation: Arc::new(DegradationManager::new(config.degradation.clone())),
            retries: RetryManager::new(),
            pools: RwLock::new(HashMap::new()),
            config,
        };

        let dependencies = toolkit.config.dependencies.clone();
        for dep in &dependencies {
            toolkit.register_dependency(dep);
        }

        tracing::info!(dependencies = dependencies.len(), "Toolkit initialised");
        Ok(toolkit)
    }

    /// Wire a breaker, pool, retry policy and health record for `dep`.
    ///
    /// Registering an existing name keeps its breaker and pool.
    pub fn register_dependency(&self, dep: &DependencyConfig) -> Arc<ConnectionPool> {
        let breaker = self
            .breakers
            .get_or_create(&dep.name, self.config.circuit_breaker.clone());

        let pool = {
            let mut pools = self.pools.write();
            let pool = pools.entry(dep.name.clone()).or_insert_with(|| {
                Arc::new(ConnectionPool::new(
                    dep.name.clone(),
                    self.config.pool.clone(),
                    breaker,
                ))
            });
            Arc::clone(pool)
        };

        self.retries
            .register_config(&dep.name, self.config.retry_for(dep));

        let check = dep.health_check_url.as_ref().map(|url| {
            Arc::new(HttpHealthCheck {
                pool: Arc::clone(&pool),
                url: url.clone(),
            }) as Arc<dyn HealthCheck>
        });
        self.degradation.register_service(&dep.name, check);

        tracing::debug!(
            dependency = %dep.name,
            retry_policy = ?dep.retry_policy,
            health_check = dep.health_check_url.is_some(),
            "Dependency registered"
        );
        pool
    }

    /// Send one request to `service` through every protection layer.
    pub async fn fetch(
        &self,
        token: &CancellationToken,
        service: &str,
        method: Method,
        url: &str,
        headers: &HeaderMap,
    ) -> Result<Response, RuntimeError> {
        let pool = self
            .pool(service)
            .ok_or_else(|| RuntimeError::UnknownDependency(service.to_string()))?;

        let level = self.degradation.level(service);
        if !level.is_available() {
            tracing::warn!(service = %service, level = %level, "Rejecting request to unavailable service");
            return Err(RuntimeError::ServiceUnavailable {
                service: service.to_string(),
            });
        }
        if level.should_throttle() {
            let factor = level.throttle_factor();
            if !admit(factor) {
                tracing::debug!(service = %service, factor, "Request throttled");
                return Err(RuntimeError::Throttled {
                    service: service.to_string(),
                    factor,
                });
            }
        }

        let retry = self.retries.policy_for(service);
        let result = http::execute_http(token, &retry, || {
            pool.do_request(token, method.clone(), url, headers)
        })
        .await;

        match &result {
            Ok(response) => {
                self.degradation
                    .record_request(service, !response.status().is_server_error());
            }
            Err(err) if err.is_cancelled() || err.is_circuit_open() => {}
            Err(err) => self.degradation.record_error(service, err),
        }

        Ok(result?)
    }

    /// Spawn the background health checks. They stop when `token` is cancelled.
    pub fn start_health_checks(&self, token: CancellationToken) -> Vec<JoinHandle<()>> {
        self.degradation.start_health_checks(token)
    }

    pub fn pool(&self, service: &str) -> Option<Arc<ConnectionPool>> {
        self.pools.read().get(service).cloned()
    }

    /// Registered dependency names, sorted.
    pub fn dependencies(&self) -> Vec<String> {
        let mut names: Vec<_> = self.pools.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn degradation(&self) -> &Arc<DegradationManager> {
        &self.degradation
    }

    pub fn retries(&self) -> &RetryManager {
        &self.retries
    }

    pub fn config(&self) -> &ToolkitConfig {
        &self.config
    }

    pub fn stats(&self) -> ToolkitStats {
        ToolkitStats {
            breakers: self.breakers.stats(),
            pools: self
                .pools
                .read()
                .iter()
                .map(|(name, pool)| (name.clone(), pool.stats()))
                .collect(),
            services: self.degradation.all_health(),
        }
    }

    /// Close every pool.
    pub fn close(&self) -> Result<(), RuntimeError> {
        for pool in self.pools.read().values() {
            pool.close()?;
        }
        Ok(())
    }
}

fn admit(factor: f64) -> bool {
    rand::thread_rng().gen_bool(factor.clamp(0.0, 1.0))
}

/// GET check that borrows a pooled client but bypasses the breaker, so a
/// recovering service is noticed while its circuit is still open.
struct HttpHealthCheck {
    pool: Arc<ConnectionPool>,
    url: String,
}

#[async_trait]
impl HealthCheck for HttpHealthCheck {
    async fn check(&self) -> Result<(), ResilienceError> {
        // Released on drop, also when the manager's timeout abandons us
        let client = self.pool.get_client()?;
        let response = self
            .pool
            .send(
                &CancellationToken::new(),
                &client,
                Method::GET,
                &self.url,
                &HeaderMap::new(),
            )
            .await?;
        http::error_for_status(response).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_core::{DegradationLevel, RetryPolicy};

    fn toolkit() -> Toolkit {
        let mut config = ToolkitConfig::default();
        config.dependencies = vec![
            DependencyConfig::new("github").with_retry_policy(RetryPolicy::Fast),
            DependencyConfig::new("billing"),
        ];
        Toolkit::new(config).unwrap()
    }

    #[test]
    fn test_dependencies_are_wired() {
        let toolkit = toolkit();
        assert_eq!(toolkit.dependencies(), vec!["billing", "github"]);
        assert_eq!(toolkit.breakers().names(), vec!["billing", "github"]);
        assert_eq!(toolkit.retries().policy_for("github").max_attempts, 2);
        assert_eq!(toolkit.retries().policy_for("billing").max_attempts, 3);

        let pool = toolkit.pool("github").unwrap();
        let shared = toolkit.breakers().get("github").unwrap();
        assert!(Arc::ptr_eq(pool.breaker(), &shared));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = ToolkitConfig::default();
        config.pool.max_active = 0;
        assert!(matches!(Toolkit::new(config), Err(RuntimeError::Config(_))));
    }

    #[tokio::test]
    async fn test_unknown_dependency() {
        let toolkit = toolkit();
        let err = toolkit
            .fetch(
                &CancellationToken::new(),
                "gitlab",
                Method::GET,
                "http://127.0.0.1:9/",
                &HeaderMap::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::UnknownDependency(name) if name == "gitlab"));
    }

    #[tokio::test]
    async fn test_emergency_service_is_rejected() {
        let toolkit = toolkit();
        for _ in 0..10 {
            toolkit.degradation().record_request("billing", false);
        }
        assert_eq!(toolkit.degradation().level("billing"), DegradationLevel::Emergency);

        let err = toolkit
            .fetch(
                &CancellationToken::new(),
                "billing",
                Method::GET,
                "http://127.0.0.1:9/",
                &HeaderMap::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::ServiceUnavailable { .. }));
        assert_eq!(toolkit.pool("billing").unwrap().stats().active, 0);
    }

    #[test]
    fn test_admission_bounds() {
        assert!(admit(1.0));
        assert!(!admit(0.0));
    }

    #[test]
    fn test_stats_cover_every_dependency() {
        let toolkit = toolkit();
        let stats = toolkit.stats();
        assert_eq!(stats.breakers.len(), 2);
        assert_eq!(stats.pools["github"].max_active, 20);
        assert_eq!(stats.services["billing"].level, DegradationLevel::Normal);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["breakers"]["github"]["state"], "closed");
    }
}
