//! Bounded pool of HTTP clients for one downstream dependency.
//!
//! # Responsibilities
//! - Hand out clients up to `max_active`, reusing idle ones first
//! - Evict idle clients after `idle_timeout`
//! - Keep at most `max_idle` returned clients
//! - Run requests through the dependency's shared circuit breaker
//!
//! # Design Decisions
//! - Every client is a handle onto one shared `reqwest` transport, so
//!   TCP/TLS connections are reused across clients
//! - All bookkeeping happens under one short, non-async critical section
//! - A checked-out client is an RAII guard; its slot is released on drop,
//!   including when the request future holding it is cancelled
//! - A completed exchange is a breaker success whatever its status code;
//!   status-level retries belong to the retry executor

use bulwark_core::{CancellationToken, CircuitBreaker, ResilienceError};
use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use reqwest::{Method, Response};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Connection pool configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Returned clients kept for reuse
    pub max_idle: usize,

    /// Clients checked out at the same time
    pub max_active: usize,

    /// Idle clients older than this are evicted
    #[serde(with = "bulwark_core::serde_duration")]
    pub idle_timeout: Duration,

    /// Idle keep-alive connections per host in the shared transport
    pub max_idle_per_host: usize,

    /// TCP connect plus TLS handshake timeout
    #[serde(with = "bulwark_core::serde_duration")]
    pub connect_timeout: Duration,

    /// Deadline for a full request, response headers included
    #[serde(with = "bulwark_core::serde_duration")]
    pub request_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: 10,
            max_active: 20,
            idle_timeout: Duration::from_secs(90),
            max_idle_per_host: 10,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Occupancy snapshot of a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub dependency: String,
    pub active: usize,
    pub idle: usize,
    pub max_active: usize,
    pub max_idle: usize,
}

/// A client checked out of a [`ConnectionPool`].
///
/// Move-only guard: dropping it, or passing it to
/// [`ConnectionPool::return_client`], gives the slot back to the pool.
/// A request future that is cancelled or timed out mid-flight therefore
/// never leaks a slot.
pub struct PooledClient {
    id: u64,
    generation: u64,
    client: reqwest::Client,
    shared: Arc<PoolShared>,
}

impl PooledClient {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }
}

impl fmt::Debug for PooledClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledClient")
            .field("dependency", &self.shared.dependency)
            .field("id", &self.id)
            .field("generation", &self.generation)
            .finish()
    }
}

impl Drop for PooledClient {
    fn drop(&mut self) {
        self.shared
            .release(self.id, self.generation, self.client.clone());
    }
}

#[derive(Debug)]
struct IdleEntry {
    id: u64,
    client: reqwest::Client,
    last_used: Instant,
}

#[derive(Debug)]
struct PoolState {
    idle: Vec<IdleEntry>,
    active_count: usize,
    transport: Option<reqwest::Client>,
    next_id: u64,
    /// Bumped by `close`; clients from older generations are discarded
    generation: u64,
}

impl PoolState {
    fn new() -> Self {
        Self {
            idle: Vec::new(),
            active_count: 0,
            transport: None,
            next_id: 0,
            generation: 0,
        }
    }
}

/// State shared between the pool and its outstanding guards.
#[derive(Debug)]
struct PoolShared {
    dependency: String,
    config: PoolConfig,
    state: Mutex<PoolState>,
}

impl PoolShared {
    fn release(&self, id: u64, generation: u64, client: reqwest::Client) {
        let mut state = self.state.lock();

        if generation != state.generation {
            tracing::debug!(dependency = %self.dependency, "Discarding client from closed pool");
            return;
        }

        state.active_count = state.active_count.saturating_sub(1);
        if state.idle.len() < self.config.max_idle {
            state.idle.push(IdleEntry {
                id,
                client,
                last_used: Instant::now(),
            });
        } else {
            tracing::trace!(dependency = %self.dependency, "Idle pool full, dropping client");
        }
    }
}

/// Bounded set of reusable HTTP clients guarded by a shared breaker.
#[derive(Debug)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
    breaker: Arc<CircuitBreaker>,
}

impl ConnectionPool {
    /// Create an empty pool. Clients are created lazily.
    pub fn new(dependency: impl Into<String>, config: PoolConfig, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                dependency: dependency.into(),
                config,
                state: Mutex::new(PoolState::new()),
            }),
            breaker,
        }
    }

    pub fn dependency(&self) -> &str {
        &self.shared.dependency
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Check out a client, reusing an idle one when possible.
    pub fn get_client(&self) -> Result<PooledClient, ResilienceError> {
        let shared = &self.shared;
        let config = &shared.config;
        let mut state = shared.state.lock();
        let now = Instant::now();
        let idle_timeout = config.idle_timeout;

        let before = state.idle.len();
        state
            .idle
            .retain(|entry| now.duration_since(entry.last_used) <= idle_timeout);
        let evicted = before - state.idle.len();
        if evicted > 0 {
            tracing::debug!(dependency = %shared.dependency, evicted, "Evicted idle clients");
        }

        if let Some(entry) = state.idle.pop() {
            state.active_count += 1;
            return Ok(PooledClient {
                id: entry.id,
                generation: state.generation,
                client: entry.client,
                shared: Arc::clone(shared),
            });
        }

        if state.active_count >= config.max_active {
            tracing::warn!(
                dependency = %shared.dependency,
                active = state.active_count,
                max = config.max_active,
                "Connection pool exhausted"
            );
            return Err(ResilienceError::PoolExhausted {
                active: state.active_count,
                max: config.max_active,
            });
        }

        let transport = match state.transport.clone() {
            Some(transport) => transport,
            None => {
                let transport = build_transport(config)?;
                state.transport = Some(transport.clone());
                transport
            }
        };

        state.next_id += 1;
        state.active_count += 1;
        Ok(PooledClient {
            id: state.next_id,
            generation: state.generation,
            client: transport,
            shared: Arc::clone(shared),
        })
    }

    /// Give a client back. Excess clients beyond `max_idle` are dropped.
    pub fn return_client(&self, client: PooledClient) {
        drop(client);
    }

    /// Execute one request through the dependency's circuit breaker.
    ///
    /// Client acquisition and transport failures count against the
    /// breaker; any completed exchange counts as a success.
    pub async fn do_request(
        &self,
        token: &CancellationToken,
        method: Method,
        url: &str,
        headers: &HeaderMap,
    ) -> Result<Response, ResilienceError> {
        self.breaker
            .call(|| async {
                let client = self.get_client()?;
                self.send(token, &client, method, url, headers).await
            })
            .await
    }

    /// Send on a checked-out client, bypassing the breaker.
    pub(crate) async fn send(
        &self,
        token: &CancellationToken,
        client: &PooledClient,
        method: Method,
        url: &str,
        headers: &HeaderMap,
    ) -> Result<Response, ResilienceError> {
        let request = client.client().request(method, url).headers(headers.clone());
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(ResilienceError::Cancelled),
            response = request.send() => {
                response.map_err(|e| transport_error(e, self.shared.config.request_timeout))
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            dependency: self.shared.dependency.clone(),
            active: state.active_count,
            idle: state.idle.len(),
            max_active: self.shared.config.max_active,
            max_idle: self.shared.config.max_idle,
        }
    }

    /// Drop every idle client and the shared transport, and zero the
    /// active count. The pool stays usable afterwards.
    pub fn close(&self) -> Result<(), ResilienceError> {
        let mut state = self.shared.state.lock();
        let dropped = state.idle.len();
        state.idle.clear();
        state.active_count = 0;
        state.transport = None;
        state.generation += 1;
        tracing::info!(dependency = %self.shared.dependency, dropped, "Connection pool closed");
        Ok(())
    }
}

fn build_transport(config: &PoolConfig) -> Result<reqwest::Client, ResilienceError> {
    reqwest::Client::builder()
        .pool_max_idle_per_host(config.max_idle_per_host)
        .pool_idle_timeout(config.idle_timeout)
        .connect_timeout(config.connect_timeout)
        .timeout(config.request_timeout)
        .user_agent(concat!("bulwark/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| ResilienceError::Transport(format!("failed to build HTTP client: {e}")))
}

fn transport_error(err: reqwest::Error, timeout: Duration) -> ResilienceError {
    if err.is_timeout() {
        ResilienceError::Timeout(timeout)
    } else {
        ResilienceError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_core::{CircuitBreakerConfig, CircuitState};

    fn pool(max_idle: usize, max_active: usize) -> ConnectionPool {
        let breaker = Arc::new(CircuitBreaker::new("github", CircuitBreakerConfig::default()));
        ConnectionPool::new(
            "github",
            PoolConfig {
                max_idle,
                max_active,
                idle_timeout: Duration::from_secs(60),
                ..PoolConfig::default()
            },
            breaker,
        )
    }

    #[test]
    fn test_exhausted_at_max_active() {
        let pool = pool(2, 2);
        let _a = pool.get_client().unwrap();
        let _b = pool.get_client().unwrap();

        let err = pool.get_client().unwrap_err();
        assert!(matches!(err, ResilienceError::PoolExhausted { active: 2, max: 2 }));
        assert_eq!(pool.stats().active, 2);
    }

    #[test]
    fn test_returned_client_is_reused() {
        let pool = pool(2, 2);
        let client = pool.get_client().unwrap();
        let id = client.id();
        pool.return_client(client);
        assert_eq!(pool.stats().idle, 1);
        assert_eq!(pool.stats().active, 0);

        let again = pool.get_client().unwrap();
        assert_eq!(again.id(), id);
        assert_eq!(pool.stats().idle, 0);
    }

    #[test]
    fn test_excess_returns_are_dropped() {
        let pool = pool(1, 3);
        let clients: Vec<_> = (0..3).map(|_| pool.get_client().unwrap()).collect();
        for client in clients {
            pool.return_client(client);
        }

        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.active, 0);
    }

    #[test]
    fn test_dropped_client_releases_slot() {
        let pool = pool(2, 1);
        let client = pool.get_client().unwrap();
        assert!(pool.get_client().is_err());

        drop(client);
        let stats = pool.stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.idle, 1);
        assert!(pool.get_client().is_ok());
    }

    #[tokio::test]
    async fn test_abandoned_request_releases_slot() {
        // Accepts connections in the kernel backlog but never answers
        let silent = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/", silent.local_addr().unwrap());
        let pool = pool(1, 1);
        let token = CancellationToken::new();

        let outcome = tokio::time::timeout(
            Duration::from_millis(100),
            pool.do_request(&token, Method::GET, &url, &HeaderMap::new()),
        )
        .await;
        assert!(outcome.is_err());

        assert_eq!(pool.stats().active, 0);
        assert!(pool.get_client().is_ok());
        assert_eq!(pool.breaker().failure_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checkouts_respect_max_active() {
        let pool = Arc::new(pool(2, 4));

        let tasks = (0..16).map(|_| {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.get_client() })
        });
        let results: Vec<_> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        let granted = results.iter().filter(|r| r.is_ok()).count();
        let refused = results
            .iter()
            .filter(|r| matches!(r, Err(ResilienceError::PoolExhausted { max: 4, .. })))
            .count();
        assert_eq!(granted, 4);
        assert_eq!(refused, 12);
        assert_eq!(pool.stats().active, 4);

        drop(results);
        let stats = pool.stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.idle, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_clients_are_evicted() {
        let pool = pool(2, 2);
        let client = pool.get_client().unwrap();
        let id = client.id();
        pool.return_client(client);

        tokio::time::advance(Duration::from_secs(61)).await;

        let fresh = pool.get_client().unwrap();
        assert_ne!(fresh.id(), id);
        assert_eq!(pool.stats().idle, 0);
    }

    #[test]
    fn test_close_resets_pool() {
        let pool = pool(2, 2);
        let stale = pool.get_client().unwrap();
        let returned = pool.get_client().unwrap();
        pool.return_client(returned);

        pool.close().unwrap();
        assert_eq!(pool.stats().active, 0);
        assert_eq!(pool.stats().idle, 0);

        // Clients handed out before close are not re-admitted
        pool.return_client(stale);
        assert_eq!(pool.stats().idle, 0);

        let _a = pool.get_client().unwrap();
        let _b = pool.get_client().unwrap();
        assert!(pool.get_client().is_err());
    }

    #[tokio::test]
    async fn test_exhaustion_counts_against_breaker() {
        let breaker = Arc::new(CircuitBreaker::new(
            "x",
            CircuitBreakerConfig {
                failure_threshold: 1,
                ..CircuitBreakerConfig::default()
            },
        ));
        let pool = ConnectionPool::new(
            "x",
            PoolConfig {
                max_active: 1,
                ..PoolConfig::default()
            },
            Arc::clone(&breaker),
        );
        let _held = pool.get_client().unwrap();

        let token = CancellationToken::new();
        let result = pool
            .do_request(&token, Method::GET, "http://127.0.0.1:9/", &HeaderMap::new())
            .await;
        assert!(matches!(result, Err(ResilienceError::PoolExhausted { .. })));
        assert_eq!(breaker.state(), CircuitState::Open);
    }
}
