//! Circuit breaker for external service calls.
//!
//! Three-state guard:
//!
//! ```text
//! closed    -> open       when consecutive failures reach the threshold
//! open      -> half_open  when the recovery timeout elapses (lazy, on read)
//! half_open -> closed     when a probe succeeds
//! half_open -> open       when a probe fails
//! ```
//!
//! Callers [`admit`](CircuitBreaker::admit) before each external call and
//! record the outcome on the returned permit. An open circuit fails fast
//! with [`CircuitOpen`] instead of hammering a down service.

use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Semaphore, SemaphorePermit};

/// Current state of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// Error returned when a call is rejected because the circuit is open.
#[derive(Debug, Clone, thiserror::Error)]
#[error("circuit breaker '{name}' is open, retry after {retry_after:.1}s")]
pub struct CircuitOpen {
    pub name: String,
    pub retry_after: f64,
}

/// Snapshot of breaker counters for observability.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u64,
    pub failure_threshold: u32,
    pub recovery_timeout: f64,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u64,
    last_failure_at: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<Inner>,
    /// Bounds concurrent probes while half-open; excess probes fail fast.
    probes: Semaphore,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        failure_threshold: u32,
        recovery_timeout: Duration,
        half_open_max: usize,
    ) -> Self {
        Self {
            name: name.into(),
            failure_threshold,
            recovery_timeout,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_at: None,
            }),
            probes: Semaphore::new(half_open_max),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state. May transition `open -> half_open` when the recovery
    /// timeout has elapsed.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        self.maybe_half_open(&mut inner);
        inner.state
    }

    fn maybe_half_open(&self, inner: &mut Inner) {
        if inner.state == CircuitState::Open {
            let elapsed = inner
                .last_failure_at
                .map(|t| t.elapsed())
                .unwrap_or(Duration::MAX);
            if elapsed >= self.recovery_timeout {
                inner.state = CircuitState::HalfOpen;
                tracing::info!(
                    breaker = %self.name,
                    "circuit breaker open -> half_open (recovery timeout elapsed)"
                );
            }
        }
    }

    /// Admit one call, or fail fast with [`CircuitOpen`].
    ///
    /// The returned permit must be resolved with
    /// [`success`](BreakerPermit::success) or
    /// [`failure`](BreakerPermit::failure); dropping it unresolved releases
    /// any probe slot without touching the counters.
    pub fn admit(&self) -> Result<BreakerPermit<'_>, CircuitOpen> {
        let state = {
            let mut inner = self.inner.lock().expect("breaker lock poisoned");
            self.maybe_half_open(&mut inner);

            if inner.state == CircuitState::Open {
                let elapsed = inner
                    .last_failure_at
                    .map(|t| t.elapsed())
                    .unwrap_or_default();
                let retry_after =
                    (self.recovery_timeout.saturating_sub(elapsed)).as_secs_f64();
                return Err(CircuitOpen {
                    name: self.name.clone(),
                    retry_after: retry_after.max(0.0),
                });
            }
            inner.state
        };

        let probe = if state == CircuitState::HalfOpen {
            match self.probes.try_acquire() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    return Err(CircuitOpen {
                        name: self.name.clone(),
                        retry_after: 1.0,
                    });
                }
            }
        } else {
            None
        };

        Ok(BreakerPermit {
            breaker: self,
            _probe: probe,
        })
    }

    /// Manually restore the closed state with a zero failure counter.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        tracing::info!(breaker = %self.name, "circuit breaker manually reset to closed");
    }

    pub fn stats(&self) -> BreakerStats {
        let state = self.state();
        let inner = self.inner.lock().expect("breaker lock poisoned");
        BreakerStats {
            name: self.name.clone(),
            state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            failure_threshold: self.failure_threshold,
            recovery_timeout: self.recovery_timeout.as_secs_f64(),
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.success_count += 1;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                tracing::info!(
                    breaker = %self.name,
                    "circuit breaker half_open -> closed (probe succeeded)"
                );
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.failure_count += 1;
        inner.last_failure_at = Some(Instant::now());
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                tracing::warn!(
                    breaker = %self.name,
                    "circuit breaker half_open -> open (probe failed)"
                );
            }
            CircuitState::Closed if inner.failure_count >= self.failure_threshold => {
                inner.state = CircuitState::Open;
                tracing::warn!(
                    breaker = %self.name,
                    failures = inner.failure_count,
                    threshold = self.failure_threshold,
                    "circuit breaker closed -> open"
                );
            }
            _ => {}
        }
    }
}

/// One admitted call. Resolve with the call's outcome.
#[derive(Debug)]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    _probe: Option<SemaphorePermit<'a>>,
}

impl BreakerPermit<'_> {
    pub fn success(self) {
        self.breaker.record_success();
    }

    pub fn failure(self) {
        self.breaker.record_failure();
    }
}

// ---------------------------------------------------------------------------
// Process-wide instances
// ---------------------------------------------------------------------------

/// The two breakers guarding the external services.
///
/// Constructed once at startup and dependency-injected into the executor so
/// tests can substitute their own instances.
#[derive(Clone)]
pub struct ServiceBreakers {
    pub llm: std::sync::Arc<CircuitBreaker>,
    pub browser: std::sync::Arc<CircuitBreaker>,
}

impl ServiceBreakers {
    pub fn new() -> Self {
        Self {
            llm: std::sync::Arc::new(CircuitBreaker::new(
                "llm",
                5,
                Duration::from_secs(30),
                1,
            )),
            browser: std::sync::Arc::new(CircuitBreaker::new(
                "browser",
                3,
                Duration::from_secs(60),
                1,
            )),
        }
    }
}

impl Default for ServiceBreakers {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new("test", 3, Duration::from_millis(200), 1)
    }

    fn trip(b: &CircuitBreaker) {
        for _ in 0..3 {
            b.admit().expect("should admit while closed").failure();
        }
    }

    #[test]
    fn starts_closed() {
        assert_eq!(breaker().state(), CircuitState::Closed);
    }

    #[test]
    fn success_keeps_closed() {
        let b = breaker();
        b.admit().unwrap().success();
        assert_eq!(b.state(), CircuitState::Closed);
        let stats = b.stats();
        assert_eq!(stats.failure_count, 0);
        assert_eq!(stats.success_count, 1);
    }

    #[test]
    fn opens_exactly_at_threshold() {
        let b = breaker();
        b.admit().unwrap().failure();
        b.admit().unwrap().failure();
        assert_eq!(b.state(), CircuitState::Closed, "2 of 3 failures should not trip");
        b.admit().unwrap().failure();
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn open_circuit_rejects_immediately() {
        let b = breaker();
        trip(&b);

        let started = Instant::now();
        let err = b.admit().expect_err("open circuit should reject");
        assert!(started.elapsed() < Duration::from_millis(1));
        assert_eq!(err.name, "test");
        assert!(err.retry_after > 0.0);
        assert!(err.to_string().contains("test"));
    }

    #[tokio::test]
    async fn transitions_to_half_open_after_timeout() {
        let b = breaker();
        trip(&b);
        assert_eq!(b.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(b.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn half_open_success_closes_circuit() {
        let b = breaker();
        trip(&b);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(b.state(), CircuitState::HalfOpen);

        b.admit().expect("probe should be admitted").success();
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.stats().failure_count, 0);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let b = breaker();
        trip(&b);
        tokio::time::sleep(Duration::from_millis(300)).await;

        b.admit().expect("probe should be admitted").failure();
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn half_open_bounds_concurrent_probes() {
        let b = breaker();
        trip(&b);
        tokio::time::sleep(Duration::from_millis(300)).await;

        let first = b.admit().expect("first probe admitted");
        let second = b.admit();
        assert!(second.is_err(), "second concurrent probe should fail fast");
        assert_eq!(second.unwrap_err().retry_after, 1.0);

        first.success();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn success_resets_failure_count() {
        let b = breaker();
        b.admit().unwrap().failure();
        b.admit().unwrap().failure();
        assert_eq!(b.state(), CircuitState::Closed);

        b.admit().unwrap().success();
        assert_eq!(b.stats().failure_count, 0);

        // Two more failures should NOT trip after the reset.
        b.admit().unwrap().failure();
        b.admit().unwrap().failure();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn manual_reset() {
        let b = breaker();
        trip(&b);
        assert_eq!(b.state(), CircuitState::Open);

        b.reset();
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.stats().failure_count, 0);
    }

    #[test]
    fn stats_output() {
        let b = breaker();
        let stats = b.stats();
        assert_eq!(stats.name, "test");
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failure_threshold, 3);
        assert!((stats.recovery_timeout - 0.2).abs() < 1e-9);
    }

    #[test]
    fn dropping_unresolved_permit_is_neutral() {
        let b = breaker();
        drop(b.admit().unwrap());
        let stats = b.stats();
        assert_eq!(stats.failure_count, 0);
        assert_eq!(stats.success_count, 0);
    }

    #[test]
    fn default_service_breakers() {
        let breakers = ServiceBreakers::new();
        assert_eq!(breakers.llm.stats().failure_threshold, 5);
        assert_eq!(breakers.browser.stats().failure_threshold, 3);
        assert!((breakers.llm.stats().recovery_timeout - 30.0).abs() < 1e-9);
        assert!((breakers.browser.stats().recovery_timeout - 60.0).abs() < 1e-9);
    }
}
