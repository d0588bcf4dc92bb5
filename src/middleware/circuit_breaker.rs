use parking_lot::RwLock;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::core::errors::{VisionError, VisionResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Calls fail fast until the cool-down elapses
    Open,
    /// Probing whether the remote side recovered
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive transient failures that open the circuit
    pub failure_threshold: usize,
    /// Cool-down before a half-open probe is allowed
    pub open_duration: Duration,
    /// Consecutive half-open successes that close the circuit again
    pub success_threshold: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

/// Fail-fast guard around the remote vision service.
///
/// Only transient failures (network errors, 5xx, 429) trip the breaker; a
/// rejected image or a malformed request says nothing about the health of
/// the remote side.
#[derive(Clone)]
pub struct CircuitBreaker {
    state: Arc<RwLock<BreakerState>>,
    config: CircuitBreakerConfig,
}

struct BreakerState {
    state: CircuitState,
    consecutive_failures: usize,
    consecutive_successes: usize,
    opened_at: Option<Instant>,
    total_failures: u64,
    total_successes: u64,
    rejected_calls: u64,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::with_config(CircuitBreakerConfig::default())
    }

    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            state: Arc::new(RwLock::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
                total_failures: 0,
                total_successes: 0,
                rejected_calls: 0,
            })),
            config,
        }
    }

    /// Run `f` unless the circuit is open, recording its outcome.
    pub async fn call<F, Fut, T>(&self, f: F) -> VisionResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = VisionResult<T>>,
    {
        if !self.allow_request() {
            return Err(VisionError::CircuitOpen);
        }

        let result = f().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(e) if e.is_transient() => self.record_failure(),
            Err(_) => self.record_success(),
        }
        result
    }

    pub fn allow_request(&self) -> bool {
        let mut s = self.state.write();
        match s.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooled_down = s
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.open_duration)
                    .unwrap_or(true);
                if cooled_down {
                    info!("Circuit breaker half-open, probing remote service");
                    s.state = CircuitState::HalfOpen;
                    s.consecutive_successes = 0;
                    true
                } else {
                    s.rejected_calls += 1;
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut s = self.state.write();
        s.total_successes += 1;
        s.consecutive_failures = 0;

        if s.state != CircuitState::Closed {
            s.consecutive_successes += 1;
            if s.consecutive_successes >= self.config.success_threshold {
                info!("Circuit breaker closed");
                s.state = CircuitState::Closed;
                s.consecutive_successes = 0;
                s.opened_at = None;
            } else {
                s.state = CircuitState::HalfOpen;
            }
        }
    }

    pub fn record_failure(&self) {
        let mut s = self.state.write();
        s.total_failures += 1;
        s.consecutive_successes = 0;
        s.consecutive_failures += 1;

        let trip = match s.state {
            CircuitState::Closed => s.consecutive_failures >= self.config.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        if trip {
            warn!(
                "Circuit breaker opened after {} consecutive failures",
                s.consecutive_failures
            );
            s.state = CircuitState::Open;
            s.opened_at = Some(Instant::now());
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state.read().state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let s = self.state.read();
        CircuitBreakerStats {
            state: s.state,
            consecutive_failures: s.consecutive_failures,
            total_failures: s.total_failures,
            total_successes: s.total_successes,
            rejected_calls: s.rejected_calls,
        }
    }

    pub fn reset(&self) {
        let mut s = self.state.write();
        s.state = CircuitState::Closed;
        s.consecutive_failures = 0;
        s.consecutive_successes = 0;
        s.opened_at = None;
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub consecutive_failures: usize,
    pub total_failures: u64,
    pub total_successes: u64,
    pub rejected_calls: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn breaker(failures: usize, open_ms: u64, successes: usize) -> CircuitBreaker {
        CircuitBreaker::with_config(CircuitBreakerConfig {
            failure_threshold: failures,
            open_duration: Duration::from_millis(open_ms),
            success_threshold: successes,
        })
    }

    async fn unavailable() -> VisionResult<()> {
        Err(VisionError::Unavailable("503".into()))
    }

    #[tokio::test]
    async fn test_opens_after_consecutive_transient_failures() {
        let breaker = breaker(3, 60_000, 1);

        for _ in 0..3 {
            assert!(breaker.call(unavailable).await.is_err());
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let invoked = AtomicBool::new(false);
        let result = breaker
            .call(|| async {
                invoked.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(VisionError::CircuitOpen)));
        assert!(!invoked.load(Ordering::SeqCst));
        assert_eq!(breaker.stats().rejected_calls, 1);
    }

    #[tokio::test]
    async fn test_non_transient_errors_do_not_trip() {
        let breaker = breaker(2, 60_000, 1);
        for _ in 0..5 {
            let result: VisionResult<()> = breaker
                .call(|| async { Err(VisionError::InvalidResponse("bad json".into())) })
                .await;
            assert!(result.is_err());
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_recovers_through_half_open() {
        let breaker = breaker(2, 50, 2);
        let _ = breaker.call(unavailable).await;
        let _ = breaker.call(unavailable).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(breaker.call(|| async { Ok(()) }).await.is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.call(|| async { Ok(()) }).await.is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = breaker(1, 50, 2);
        let _ = breaker.call(unavailable).await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
