//! Per-adapter circuit breaker
//!
//! A fallback chain keeps one breaker per entry. After `threshold` consecutive
//! failures the adapter is skipped (reported as `unavailable`) until the
//! cooldown elapses. After that calls go through again, and the next failure
//! reopens the circuit.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::types::ErrorCategory;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls allowed
    Closed,
    /// Adapter skipped
    Open,
    /// Cooldown elapsed; next call is a probe
    HalfOpen,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Consecutive-failure circuit breaker
///
/// ```
/// use cadence_agent::{CircuitBreaker, ErrorCategory};
///
/// let cb = CircuitBreaker::new(2, 60);
/// cb.record(Some(ErrorCategory::RateLimit));
/// cb.record(Some(ErrorCategory::RateLimit));
/// assert!(!cb.can_execute());
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_count: AtomicU32,
    last_failure: AtomicU64, // Unix timestamp millis
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    /// `threshold` consecutive failures open the circuit for `cooldown_secs`
    pub fn new(threshold: u32, cooldown_secs: u64) -> Self {
        Self {
            failure_count: AtomicU32::new(0),
            last_failure: AtomicU64::new(0),
            threshold: threshold.max(1),
            cooldown: Duration::from_secs(cooldown_secs),
        }
    }

    pub fn state(&self) -> CircuitState {
        if self.failure_count.load(Ordering::Relaxed) < self.threshold {
            return CircuitState::Closed;
        }

        let elapsed = now_millis().saturating_sub(self.last_failure.load(Ordering::Relaxed));
        if elapsed >= self.cooldown.as_millis() as u64 {
            CircuitState::HalfOpen
        } else {
            CircuitState::Open
        }
    }

    pub fn record_success(&self) {
        self.failure_count.store(0, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        self.last_failure.store(now_millis(), Ordering::Relaxed);
    }

    /// Record a call outcome; `None` means success. Failures that say nothing
    /// about the backend (cancellation, skipped calls) are ignored.
    pub fn record(&self, failure: Option<ErrorCategory>) {
        match failure {
            None => self.record_success(),
            Some(category) if category.trips_breaker() => self.record_failure(),
            Some(_) => {}
        }
    }

    pub fn can_execute(&self) -> bool {
        self.state() != CircuitState::Open
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Relaxed)
    }

    /// Milliseconds until a probe is allowed, 0 if not open
    pub fn time_until_retry(&self) -> u64 {
        match self.state() {
            CircuitState::Open => {
                let elapsed =
                    now_millis().saturating_sub(self.last_failure.load(Ordering::Relaxed));
                (self.cooldown.as_millis() as u64).saturating_sub(elapsed)
            }
            _ => 0,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(3, 60)
    }
}
