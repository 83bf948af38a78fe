use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{ShoalError, ShoalResult};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Requests flow normally
    Closed,
    /// Requests are blocked
    Open,
    /// Probing whether the backend has recovered
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "CLOSED"),
            BreakerState::Open => write!(f, "OPEN"),
            BreakerState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for the per-instance circuit breaker
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures tolerated; the breaker opens on the failure
    /// after this many
    pub max_consecutive_failures: u32,
    /// How long the breaker stays open before probing half-open
    pub timeout: Duration,
    /// Closed-state counting window; counts reset when it elapses
    pub interval: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 3,
            timeout: Duration::from_secs(5),
            interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Instant,
    window_start: Instant,
}

/// Per-instance circuit breaker.
///
/// Trips open after a run of consecutive failures, blocks calls while open,
/// lets a probe through after `timeout` and closes again on a half-open
/// success. A failure while half-open reopens immediately.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: RwLock<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let now = Instant::now();
        Self {
            name: name.into(),
            config,
            inner: RwLock::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: now,
                window_start: now,
            }),
        }
    }

    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, BreakerConfig::default())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute `f` under breaker protection.
    ///
    /// Returns `ShoalError::BreakerOpen` without invoking `f` when the
    /// circuit is open. Only errors classified by
    /// [`ShoalError::should_trip_breaker`] count as failures.
    pub async fn call<F, Fut, T>(&self, f: F) -> ShoalResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = ShoalResult<T>>,
    {
        if !self.can_execute().await {
            return Err(ShoalError::breaker_open(&self.name));
        }

        let result = f().await;

        match &result {
            Ok(_) => self.record_success().await,
            Err(err) => {
                if err.should_trip_breaker() {
                    self.record_failure().await;
                }
            }
        }

        result
    }

    pub async fn state(&self) -> BreakerState {
        self.inner.read().await.state
    }

    pub async fn can_execute(&self) -> bool {
        let mut inner = self.inner.write().await;
        let now = Instant::now();

        match inner.state {
            BreakerState::Closed => {
                if now.saturating_duration_since(inner.window_start) >= self.config.interval {
                    inner.consecutive_failures = 0;
                    inner.window_start = now;
                }
                true
            }
            BreakerState::Open => {
                if now.saturating_duration_since(inner.opened_at) >= self.config.timeout {
                    inner.state = BreakerState::HalfOpen;
                    info!(breaker = %self.name, "Circuit breaker transitioned to HALF_OPEN");
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => true,
        }
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.write().await;
        inner.consecutive_failures = 0;

        if inner.state == BreakerState::HalfOpen {
            inner.state = BreakerState::Closed;
            inner.window_start = Instant::now();
            info!(breaker = %self.name, "Circuit breaker closed after successful probe");
        }
    }

    pub async fn record_failure(&self) {
        let mut inner = self.inner.write().await;

        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                debug!(
                    breaker = %self.name,
                    consecutive_failures = inner.consecutive_failures,
                    threshold = self.config.max_consecutive_failures,
                    "Circuit breaker recorded failure"
                );
                if inner.consecutive_failures > self.config.max_consecutive_failures {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Instant::now();
                    warn!(
                        breaker = %self.name,
                        failures = inner.consecutive_failures,
                        "Circuit breaker opened due to consecutive failures"
                    );
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Instant::now();
                warn!(breaker = %self.name, "Circuit breaker reopened after half-open failure");
            }
            BreakerState::Open => {}
        }
    }
}
