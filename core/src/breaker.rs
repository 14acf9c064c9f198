//! Circuit breaker gating all calls into the synthesis worker.
//!
//! Three states:
//! - `Closed`: normal operation, every call admitted.
//! - `Open`: worker is known unhealthy; calls rejected until `next_attempt_at`.
//! - `HalfOpen`: probation after the open delay elapses; a run of successes
//!   closes the breaker, a single failure reopens it.
//!
//! The breaker only sees success/failure reports from the supervisor. Local
//! validation errors (empty text, bad speed) never reach it.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Clone, Debug)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker open.
    pub failure_threshold: u32,
    /// Consecutive half-open successes required to close again.
    pub success_threshold: u32,
    /// First open delay; doubles per consecutive failure.
    pub base_delay: Duration,
    /// Upper bound on the open delay.
    pub max_delay: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    next_attempt_at: Option<Instant>,
}

/// Shared failure governor for one worker process.
#[derive(Debug)]
pub struct CircuitBreaker {
    cfg: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(cfg: BreakerConfig) -> Self {
        Self {
            cfg,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                next_attempt_at: None,
            }),
        }
    }

    fn locked(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a call may proceed right now.
    ///
    /// While `Open`, the first check at or after `next_attempt_at` flips the
    /// breaker to `HalfOpen` and is admitted; earlier checks are rejected.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.locked();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let due = inner
                    .next_attempt_at
                    .map(|at| Instant::now() >= at)
                    .unwrap_or(true);
                if due {
                    info!("circuit breaker entering half-open probation");
                    inner.state = BreakerState::HalfOpen;
                    inner.consecutive_successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.locked();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
            }
            BreakerState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.cfg.success_threshold {
                    info!("circuit breaker closed after successful probation");
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes = 0;
                    inner.next_attempt_at = None;
                }
            }
            // A success report while open can only come from a call admitted
            // before the breaker tripped; it does not shorten the open delay.
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.locked();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.cfg.failure_threshold {
                    let delay = self.compute_delay(inner.consecutive_failures);
                    warn!(
                        failures = inner.consecutive_failures,
                        ?delay,
                        "circuit breaker opened"
                    );
                    inner.state = BreakerState::Open;
                    inner.next_attempt_at = Some(Instant::now() + delay);
                }
            }
            BreakerState::HalfOpen => {
                // One probation failure reopens immediately.
                inner.consecutive_failures += 1;
                let delay = self.compute_delay(inner.consecutive_failures);
                warn!(?delay, "probation failed, circuit breaker reopened");
                inner.state = BreakerState::Open;
                inner.consecutive_successes = 0;
                inner.next_attempt_at = Some(Instant::now() + delay);
            }
            BreakerState::Open => {
                inner.consecutive_failures += 1;
                inner.next_attempt_at =
                    Some(Instant::now() + self.compute_delay(inner.consecutive_failures));
            }
        }
    }

    /// Capped exponential backoff: base * 2^(failures-1), exponent capped at 5.
    fn compute_delay(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.saturating_sub(1).min(5);
        let delay = self.cfg.base_delay.saturating_mul(1u32 << exponent);
        delay.min(self.cfg.max_delay)
    }

    pub fn state(&self) -> BreakerState {
        self.locked().state
    }

    /// Time until the next admission while open, if any. Used for error context.
    pub fn retry_after(&self) -> Option<Duration> {
        let inner = self.locked();
        match inner.state {
            BreakerState::Open => inner
                .next_attempt_at
                .map(|at| at.saturating_duration_since(Instant::now())),
            _ => None,
        }
    }
}
