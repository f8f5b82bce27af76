//! Circuit breaker protecting outbound webhook endpoints.
//!
//! Breakers are keyed per endpoint and owned by an injected
//! [`BreakerRegistry`]; there is no process-global registry. State
//! machine: `Closed -> Open` after consecutive failures, `Open ->
//! HalfOpen` once the open timeout elapses, `HalfOpen -> Closed` after
//! consecutive successes (any half-open failure reopens immediately).

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::sync::Mutex;

/// Breaker tuning knobs.
#[derive(Clone, Copy, Debug)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker open.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again.
    pub success_threshold: u32,
    /// How long the breaker stays open before probing.
    pub open_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            open_timeout: Duration::from_secs(60),
        }
    }
}

/// Current breaker state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Cumulative call statistics for one breaker.
#[derive(Clone, Debug, Default)]
pub struct BreakerStats {
    pub total_calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejected: u64,
    pub last_transition: Option<DateTime<Utc>>,
}

/// Errors surfaced by guarded calls.
#[derive(Debug, Error, Diagnostic)]
pub enum BreakerError {
    /// Call rejected without execution because the breaker is open.
    #[error("circuit open for '{endpoint}'")]
    #[diagnostic(
        code(chatloom::breaker::open),
        help("The endpoint failed repeatedly; calls resume after the open timeout.")
    )]
    Open { endpoint: String },

    /// The guarded operation itself failed.
    #[error("call failed: {message}")]
    #[diagnostic(code(chatloom::breaker::call))]
    Call { message: String },
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    stats: BreakerStats,
}

/// A single endpoint's circuit breaker.
pub struct CircuitBreaker {
    endpoint: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(endpoint: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            endpoint: endpoint.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
                stats: BreakerStats::default(),
            }),
        }
    }

    pub async fn state(&self) -> BreakerState {
        self.inner.lock().await.state
    }

    pub async fn stats(&self) -> BreakerStats {
        self.inner.lock().await.stats.clone()
    }

    /// Execute `op` under breaker protection.
    ///
    /// When open and the timeout has not elapsed, rejects with
    /// [`BreakerError::Open`] without running `op`. The first call
    /// after the timeout probes in half-open state.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, BreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        {
            let mut inner = self.inner.lock().await;
            inner.stats.total_calls += 1;
            match inner.state {
                BreakerState::Open => {
                    let elapsed = inner
                        .opened_at
                        .map(|t| t.elapsed())
                        .unwrap_or(Duration::ZERO);
                    if elapsed < self.config.open_timeout {
                        inner.stats.rejected += 1;
                        return Err(BreakerError::Open {
                            endpoint: self.endpoint.clone(),
                        });
                    }
                    transition(&mut inner, BreakerState::HalfOpen);
                    tracing::info!(endpoint = %self.endpoint, "circuit half-open, probing");
                }
                BreakerState::Closed | BreakerState::HalfOpen => {}
            }
        }

        match op().await {
            Ok(value) => {
                self.on_success().await;
                Ok(value)
            }
            Err(e) => {
                self.on_failure().await;
                Err(BreakerError::Call {
                    message: e.to_string(),
                })
            }
        }
    }

    /// Like [`call`](Self::call), but substitutes `fallback` when the
    /// breaker rejects or the operation fails.
    pub async fn call_or<F, Fut, T, E>(&self, fallback: T, op: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.call(op).await.unwrap_or(fallback)
    }

    async fn on_success(&self) {
        let mut inner = self.inner.lock().await;
        inner.stats.successes += 1;
        inner.consecutive_failures = 0;
        if inner.state == BreakerState::HalfOpen {
            inner.consecutive_successes += 1;
            if inner.consecutive_successes >= self.config.success_threshold {
                transition(&mut inner, BreakerState::Closed);
                tracing::info!(endpoint = %self.endpoint, "circuit closed");
            }
        }
    }

    async fn on_failure(&self) {
        let mut inner = self.inner.lock().await;
        inner.stats.failures += 1;
        inner.consecutive_successes = 0;
        match inner.state {
            BreakerState::HalfOpen => {
                transition(&mut inner, BreakerState::Open);
                inner.opened_at = Some(Instant::now());
                tracing::warn!(endpoint = %self.endpoint, "probe failed, circuit reopened");
            }
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    transition(&mut inner, BreakerState::Open);
                    inner.opened_at = Some(Instant::now());
                    tracing::warn!(
                        endpoint = %self.endpoint,
                        failures = inner.consecutive_failures,
                        "circuit opened"
                    );
                }
            }
            BreakerState::Open => {}
        }
    }
}

fn transition(inner: &mut BreakerInner, to: BreakerState) {
    inner.state = to;
    inner.consecutive_failures = 0;
    inner.consecutive_successes = 0;
    inner.stats.last_transition = Some(Utc::now());
    if to != BreakerState::Open {
        inner.opened_at = None;
    }
}

/// Registry handing out one breaker per endpoint key.
///
/// Cloneable handle; clones share the same breaker set.
#[derive(Clone)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: Arc<Mutex<FxHashMap<String, Arc<CircuitBreaker>>>>,
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

impl BreakerRegistry {
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Arc::new(Mutex::new(FxHashMap::default())),
        }
    }

    /// Fetch or create the breaker for an endpoint key.
    pub async fn breaker(&self, endpoint: &str) -> Arc<CircuitBreaker> {
        let mut map = self.breakers.lock().await;
        map.entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(endpoint, self.config)))
            .clone()
    }
}
