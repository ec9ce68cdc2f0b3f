//! Circuit breaker guarding the cache tier.
//!
//! Tri-state guard wrapping every fast-path operation:
//!
//! - **Closed**: calls pass through; consecutive failures are counted.
//! - **Open**: calls are rejected immediately until the cooldown elapses.
//! - **HalfOpen**: exactly one trial call is let through; its outcome
//!   decides whether the circuit closes again or re-opens.
//!
//! Each resilience boundary (message write, message read, metadata) owns its
//! own instance so a failing read path cannot take down write availability.
//! State is kept in atomics; reads that are stale by a few milliseconds are
//! fine given the cooldown granularity.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::time::Duration;

use chrono::Utc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

pub struct CircuitBreaker {
    name: &'static str,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    opened_at_ms: AtomicI64,
    /// Taken by the single thread allowed to probe while half-open.
    probing: AtomicBool,
    failure_threshold: u32,
    cooldown_ms: i64,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            name,
            state: AtomicU8::new(CircuitState::Closed as u8),
            consecutive_failures: AtomicU32::new(0),
            opened_at_ms: AtomicI64::new(0),
            probing: AtomicBool::new(false),
            failure_threshold: failure_threshold.max(1),
            cooldown_ms: cooldown.as_millis() as i64,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state.load(Ordering::Acquire).into()
    }

    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Whether a fast-path call should be rejected right now.
    ///
    /// Once the cooldown has elapsed the circuit moves to half-open and one
    /// caller wins the probe slot (`false`); everyone else keeps failing
    /// fast until that probe reports back.
    pub fn is_open(&self) -> bool {
        match self.state() {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let opened_at = self.opened_at_ms.load(Ordering::Acquire);
                if now_ms() - opened_at < self.cooldown_ms {
                    return true;
                }
                if self
                    .probing
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.state
                        .store(CircuitState::HalfOpen as u8, Ordering::Release);
                    tracing::info!(breaker = self.name, "cooldown elapsed, allowing one probe");
                    false
                } else {
                    true
                }
            }
            CircuitState::HalfOpen => self
                .probing
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err(),
        }
    }

    pub fn record_success(&self) {
        match self.state() {
            CircuitState::Closed => {
                self.consecutive_failures.store(0, Ordering::Release);
                self.probing.store(false, Ordering::Release);
            }
            CircuitState::Open | CircuitState::HalfOpen => self.reset(),
        }
    }

    pub fn record_failure(&self, error: &dyn std::fmt::Display) {
        match self.state() {
            CircuitState::HalfOpen => {
                tracing::warn!(breaker = self.name, %error, "probe failed, re-opening");
                self.trip();
            }
            CircuitState::Closed => {
                let count = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                tracing::warn!(
                    breaker = self.name,
                    %error,
                    count,
                    threshold = self.failure_threshold,
                    "fast-path failure"
                );
                if count >= self.failure_threshold {
                    self.trip();
                }
            }
            // Already open; the cooldown clock keeps running.
            CircuitState::Open => {}
        }
    }

    /// Opens the circuit without waiting for the failure threshold.
    ///
    /// Used for definitive connectivity failures (connection refused,
    /// unreachable host): one such failure is near-certain to be followed by
    /// more, so there is no point paying the I/O cost several more times.
    pub fn trip_immediately(&self) {
        tracing::warn!(breaker = self.name, "connectivity failure, tripping immediately");
        self.consecutive_failures
            .store(self.failure_threshold, Ordering::Release);
        self.trip();
    }

    /// Feeds a cache-tier outcome into the breaker: definitive connectivity
    /// loss trips immediately, timeouts count toward the threshold, and
    /// corrupt payloads are ignored (data defects say nothing about the
    /// backend's health).
    pub fn observe<T>(&self, result: &Result<T, crate::cache::CacheError>) {
        match result {
            Ok(_) => self.record_success(),
            Err(e) if e.is_definitive() => self.trip_immediately(),
            Err(e) if e.is_connectivity() => self.record_failure(e),
            Err(_) => {}
        }
    }

    fn trip(&self) {
        let prev = self.state.swap(CircuitState::Open as u8, Ordering::AcqRel);
        self.opened_at_ms.store(now_ms(), Ordering::Release);
        self.probing.store(false, Ordering::Release);
        if prev != CircuitState::Open as u8 {
            tracing::error!(breaker = self.name, "circuit OPEN, entering fallback");
        }
    }

    fn reset(&self) {
        let prev = self.state.swap(CircuitState::Closed as u8, Ordering::AcqRel);
        self.consecutive_failures.store(0, Ordering::Release);
        self.probing.store(false, Ordering::Release);
        if prev != CircuitState::Closed as u8 {
            tracing::info!(breaker = self.name, "circuit CLOSED, resuming normal operation");
        }
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown: Duration) -> CircuitBreaker {
        CircuitBreaker::new("test", threshold, cooldown)
    }

    #[test]
    fn starts_closed() {
        let cb = breaker(3, Duration::from_secs(30));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(!cb.is_open());
    }

    #[test]
    fn opens_after_threshold_failures() {
        let cb = breaker(3, Duration::from_secs(30));

        cb.record_failure(&"timeout");
        cb.record_failure(&"timeout");
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure(&"timeout");
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.is_open());
        assert!(cb.is_open());
    }

    #[test]
    fn success_resets_the_failure_count() {
        let cb = breaker(3, Duration::from_secs(30));

        cb.record_failure(&"timeout");
        cb.record_failure(&"timeout");
        assert_eq!(cb.failure_count(), 2);

        cb.record_success();
        assert_eq!(cb.failure_count(), 0);

        cb.record_failure(&"timeout");
        cb.record_failure(&"timeout");
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn trip_immediately_skips_the_threshold() {
        let cb = breaker(5, Duration::from_secs(30));
        cb.trip_immediately();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.is_open());
    }

    #[test]
    fn cooldown_allows_a_single_probe() {
        let cb = breaker(1, Duration::from_millis(10));
        cb.record_failure(&"refused");
        assert!(cb.is_open());

        std::thread::sleep(Duration::from_millis(20));

        // First caller after the cooldown wins the probe slot.
        assert!(!cb.is_open());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        // Everyone else keeps failing fast until the probe reports.
        assert!(cb.is_open());
        assert!(cb.is_open());
    }

    #[test]
    fn probe_success_closes_the_circuit() {
        let cb = breaker(1, Duration::from_millis(10));
        cb.record_failure(&"refused");
        std::thread::sleep(Duration::from_millis(20));
        assert!(!cb.is_open());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(!cb.is_open());
    }

    #[test]
    fn probe_failure_reopens_and_restarts_the_cooldown() {
        let cb = breaker(1, Duration::from_millis(40));
        cb.record_failure(&"refused");
        std::thread::sleep(Duration::from_millis(50));
        assert!(!cb.is_open());

        cb.record_failure(&"still down");
        assert_eq!(cb.state(), CircuitState::Open);
        // Cooldown restarted; the next probe slot is not yet available.
        assert!(cb.is_open());
    }

    #[test]
    fn threshold_and_cooldown_round_trip() {
        // Threshold failures open the circuit; cooldown plus one successful
        // trial closes it again.
        let cb = breaker(2, Duration::from_millis(10));
        cb.record_failure(&"timeout");
        cb.record_failure(&"timeout");
        assert!(cb.is_open());

        std::thread::sleep(Duration::from_millis(20));
        assert!(!cb.is_open());
        cb.record_success();
        assert!(!cb.is_open());
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
