//! Graceful degradation tracking per named service.
//!
//! # Data Flow
//! ```text
//! record_request / record_error / periodic health check
//!     → update counters (serialized per service)
//!     → error_rate = error_count / total_requests
//!     → level by thresholds, highest wins
//!     → Degraded for longer than max_degraded_duration → Emergency
//!
//! Callers read:
//!     is_service_available   false at Emergency
//!     should_throttle        true at Critical / Emergency
//!     throttle_factor        1.0 / 0.7 / 0.3 / 0.1
//! ```
//!
//! # Design Decisions
//! - Counters are lifetime totals; `recovery_time_window` acts as a quiet
//!   period. Once the last error is that old the counters are reset, on
//!   the next read or record, so a service refused at Emergency is
//!   readmitted without needing traffic to recover
//! - The manager only recommends a throttle factor, callers enforce it
//! - Health checks run outside any lock; only their outcome is recorded

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::ResilienceError;

/// Degradation manager configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DegradationConfig {
    /// Interval between background health checks
    #[serde(with = "crate::serde_duration")]
    pub health_check_interval: Duration,

    /// Error rate at which a service becomes Degraded
    pub degraded_threshold: f64,

    /// Error rate at which a service becomes Critical
    pub critical_threshold: f64,

    /// Error rate at which a service becomes Emergency
    pub emergency_threshold: f64,

    /// Quiet period after the last error before counters are reset
    #[serde(with = "crate::serde_duration")]
    pub recovery_time_window: Duration,

    /// Per-check timeout for background health checks
    #[serde(with = "crate::serde_duration")]
    pub health_check_timeout: Duration,

    /// Time a service may stay Degraded before it is treated as Emergency
    #[serde(with = "crate::serde_duration")]
    pub max_degraded_duration: Duration,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(30),
            degraded_threshold: 0.10,
            critical_threshold: 0.25,
            emergency_threshold: 0.50,
            recovery_time_window: Duration::from_secs(5 * 60),
            health_check_timeout: Duration::from_secs(10),
            max_degraded_duration: Duration::from_secs(10 * 60),
        }
    }
}

/// Severity classification, ordered from healthy to failed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DegradationLevel {
    #[default]
    Normal,
    Degraded,
    Critical,
    Emergency,
}

impl DegradationLevel {
    /// Level for a raw error rate against the configured thresholds.
    pub fn from_error_rate(error_rate: f64, config: &DegradationConfig) -> Self {
        if error_rate >= config.emergency_threshold {
            DegradationLevel::Emergency
        } else if error_rate >= config.critical_threshold {
            DegradationLevel::Critical
        } else if error_rate >= config.degraded_threshold {
            DegradationLevel::Degraded
        } else {
            DegradationLevel::Normal
        }
    }

    /// Recommended fraction of normal request volume.
    pub fn throttle_factor(self) -> f64 {
        match self {
            DegradationLevel::Normal => 1.0,
            DegradationLevel::Degraded => 0.7,
            DegradationLevel::Critical => 0.3,
            DegradationLevel::Emergency => 0.1,
        }
    }

    pub fn is_available(self) -> bool {
        self != DegradationLevel::Emergency
    }

    pub fn should_throttle(self) -> bool {
        self >= DegradationLevel::Critical
    }
}

impl fmt::Display for DegradationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DegradationLevel::Normal => write!(f, "normal"),
            DegradationLevel::Degraded => write!(f, "degraded"),
            DegradationLevel::Critical => write!(f, "critical"),
            DegradationLevel::Emergency => write!(f, "emergency"),
        }
    }
}

/// Health record of one service. Returned to callers as a copy.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub name: String,
    pub level: DegradationLevel,
    pub total_requests: u64,
    pub error_count: u64,
    pub error_rate: f64,

    /// Set while the raw error rate sits in the Degraded band
    #[serde(skip)]
    pub degraded_since: Option<Instant>,

    #[serde(skip)]
    pub last_error_at: Option<Instant>,

    /// Message of the most recent recorded error
    pub last_error: Option<String>,

    /// Completion time of the most recent background health check
    pub last_check: Option<DateTime<Utc>>,
}

impl ServiceHealth {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            level: DegradationLevel::Normal,
            total_requests: 0,
            error_count: 0,
            error_rate: 0.0,
            degraded_since: None,
            last_error_at: None,
            last_error: None,
            last_check: None,
        }
    }

    fn clear_counters(&mut self) {
        self.total_requests = 0;
        self.error_count = 0;
        self.error_rate = 0.0;
        self.degraded_since = None;
        self.last_error_at = None;
    }
}

/// Active check of a service's health.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self) -> Result<(), ResilienceError>;
}

struct FnHealthCheck<F>(F);

#[async_trait]
impl<F, Fut> HealthCheck for FnHealthCheck<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ResilienceError>> + Send,
{
    async fn check(&self) -> Result<(), ResilienceError> {
        (self.0)().await
    }
}

/// Adapt an async closure into a [`HealthCheck`].
pub fn health_check_fn<F, Fut>(f: F) -> Arc<dyn HealthCheck>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ResilienceError>> + Send + 'static,
{
    Arc::new(FnHealthCheck(f))
}

struct ServiceEntry {
    health: Mutex<ServiceHealth>,
    check: RwLock<Option<Arc<dyn HealthCheck>>>,
}

impl ServiceEntry {
    fn check(&self) -> Option<Arc<dyn HealthCheck>> {
        self.check.read().clone()
    }
}

/// Tracks error rate and degradation level per registered service.
pub struct DegradationManager {
    config: DegradationConfig,
    services: RwLock<HashMap<String, Arc<ServiceEntry>>>,
}

impl fmt::Debug for DegradationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DegradationManager")
            .field("config", &self.config)
            .field("services", &self.services.read().len())
            .finish()
    }
}

impl Default for DegradationManager {
    fn default() -> Self {
        Self::new(DegradationConfig::default())
    }
}

impl DegradationManager {
    pub fn new(config: DegradationConfig) -> Self {
        Self {
            config,
            services: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &DegradationConfig {
        &self.config
    }

    /// Register `name`, optionally with an active health check.
    ///
    /// Re-registering keeps the entry and its counters and replaces only
    /// the check, so outcomes from in-flight callers are not lost.
    pub fn register_service(&self, name: &str, check: Option<Arc<dyn HealthCheck>>) {
        let mut services = self.services.write();
        match services.get(name) {
            Some(existing) => {
                *existing.check.write() = check;
                tracing::debug!(service = %name, "Service re-registered, health check replaced");
            }
            None => {
                services.insert(
                    name.to_string(),
                    Arc::new(ServiceEntry {
                        health: Mutex::new(ServiceHealth::new(name)),
                        check: RwLock::new(check),
                    }),
                );
                tracing::debug!(service = %name, "Service registered for degradation tracking");
            }
        }
    }

    /// Record the outcome of one request to `name`.
    pub fn record_request(&self, name: &str, success: bool) {
        let error = (!success).then(|| "request failed".to_string());
        self.record(name, success, error);
    }

    /// Record a failed request to `name` with its error.
    pub fn record_error<E>(&self, name: &str, err: &E)
    where
        E: fmt::Display + ?Sized,
    {
        self.record(name, false, Some(err.to_string()));
    }

    /// Copy of the health record for `name`.
    pub fn get_service_health(&self, name: &str) -> Option<ServiceHealth> {
        self.entry(name).map(|entry| self.snapshot(&entry))
    }

    /// Copies of every health record keyed by service name.
    pub fn all_health(&self) -> BTreeMap<String, ServiceHealth> {
        self.services
            .read()
            .iter()
            .map(|(name, entry)| (name.clone(), self.snapshot(entry)))
            .collect()
    }

    /// Current level; unknown services are reported Normal.
    pub fn level(&self, name: &str) -> DegradationLevel {
        self.entry(name)
            .map(|entry| {
                let mut health = entry.health.lock();
                self.expire_quiet_period(&mut health, Instant::now());
                health.level
            })
            .unwrap_or_default()
    }

    pub fn is_service_available(&self, name: &str) -> bool {
        self.level(name).is_available()
    }

    pub fn should_throttle_requests(&self, name: &str) -> bool {
        self.level(name).should_throttle()
    }

    pub fn get_throttle_factor(&self, name: &str) -> f64 {
        self.level(name).throttle_factor()
    }

    /// Clear counters and return `name` to Normal.
    pub fn reset_service(&self, name: &str) {
        if let Some(entry) = self.entry(name) {
            let mut health = entry.health.lock();
            health.clear_counters();
            health.last_error = None;
            health.level = DegradationLevel::Normal;
            tracing::info!(service = %name, "Service health reset");
        }
    }

    /// Spawn one periodic health-check task per service that has a check.
    ///
    /// Checks for different services run independently, so a hung check
    /// only delays its own service. Tasks stop when `token` is cancelled.
    /// Services registered afterwards are not picked up. Each tick runs the
    /// check currently registered, so re-registering swaps it in place.
    pub fn start_health_checks(self: &Arc<Self>, token: CancellationToken) -> Vec<JoinHandle<()>> {
        let checks: Vec<(String, Arc<ServiceEntry>)> = self
            .services
            .read()
            .iter()
            .filter(|(_, entry)| entry.check().is_some())
            .map(|(name, entry)| (name.clone(), Arc::clone(entry)))
            .collect();

        tracing::info!(
            services = checks.len(),
            interval = ?self.config.health_check_interval,
            "Starting background health checks"
        );

        checks
            .into_iter()
            .map(|(name, entry)| {
                let manager = Arc::clone(self);
                let token = token.clone();
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(manager.config.health_check_interval);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = ticker.tick() => {
                                if let Some(check) = entry.check() {
                                    manager.run_check(&name, check.as_ref(), &token).await;
                                }
                            }
                        }
                    }
                    tracing::debug!(service = %name, "Health check loop stopped");
                })
            })
            .collect()
    }

    /// Run the registered check for `name` once and record the outcome.
    ///
    /// Returns false when the service is unknown or has no check.
    pub async fn check_now(&self, name: &str) -> bool {
        let Some(check) = self.entry(name).and_then(|entry| entry.check()) else {
            return false;
        };
        self.run_check(name, check.as_ref(), &CancellationToken::new())
            .await;
        true
    }

    async fn run_check(&self, name: &str, check: &dyn HealthCheck, token: &CancellationToken) {
        let timeout = self.config.health_check_timeout;
        let outcome = tokio::select! {
            _ = token.cancelled() => return,
            outcome = tokio::time::timeout(timeout, check.check()) => outcome,
        };

        match outcome {
            Ok(Ok(())) => self.record_request(name, true),
            Ok(Err(err)) => {
                tracing::warn!(service = %name, error = %err, "Health check failed");
                self.record_error(name, &err);
            }
            Err(_) => {
                tracing::warn!(service = %name, timeout = ?timeout, "Health check timed out");
                self.record_error(name, &ResilienceError::Timeout(timeout));
            }
        }

        if let Some(entry) = self.entry(name) {
            entry.health.lock().last_check = Some(Utc::now());
        }
    }

    fn entry(&self, name: &str) -> Option<Arc<ServiceEntry>> {
        self.services.read().get(name).cloned()
    }

    fn record(&self, name: &str, success: bool, error: Option<String>) {
        let Some(entry) = self.entry(name) else {
            tracing::debug!(service = %name, "Outcome recorded for unregistered service, ignoring");
            return;
        };

        let now = Instant::now();
        let mut health = entry.health.lock();

        self.expire_quiet_period(&mut health, now);

        health.total_requests += 1;
        if !success {
            health.error_count += 1;
            health.last_error_at = Some(now);
            health.last_error = error;
        }

        self.update_level(&mut health, now);
    }

    fn snapshot(&self, entry: &ServiceEntry) -> ServiceHealth {
        let mut health = entry.health.lock();
        self.expire_quiet_period(&mut health, Instant::now());
        health.clone()
    }

    /// Reset the counters once the last error is `recovery_time_window` old.
    fn expire_quiet_period(&self, health: &mut ServiceHealth, now: Instant) {
        let Some(last_error_at) = health.last_error_at else {
            return;
        };
        if now.duration_since(last_error_at) < self.config.recovery_time_window {
            return;
        }
        tracing::debug!(service = %health.name, "Quiet period elapsed, resetting counters");
        health.clear_counters();
        self.update_level(health, now);
    }

    fn update_level(&self, health: &mut ServiceHealth, now: Instant) {
        health.error_rate = if health.total_requests == 0 {
            0.0
        } else {
            health.error_count as f64 / health.total_requests as f64
        };

        let raw = DegradationLevel::from_error_rate(health.error_rate, &self.config);
        let mut level = raw;

        if raw == DegradationLevel::Degraded {
            match health.degraded_since {
                None => health.degraded_since = Some(now),
                Some(since) if now.duration_since(since) > self.config.max_degraded_duration => {
                    level = DegradationLevel::Emergency;
                }
                Some(_) => {}
            }
        } else {
            health.degraded_since = None;
        }

        if level == health.level {
            return;
        }

        let previous = health.level;
        health.level = level;
        if level > previous {
            tracing::warn!(
                service = %health.name,
                from = %previous,
                to = %level,
                error_rate = health.error_rate,
                "Service degradation escalated"
            );
        } else {
            tracing::info!(
                service = %health.name,
                from = %previous,
                to = %level,
                error_rate = health.error_rate,
                "Service degradation recovered"
            );
        }
    }
}
