//! Retry policy and circuit breaking
//!
//! Per-node retry with exponential backoff for retryable failures, bounded
//! by the session deadline, plus a circuit breaker that trips after
//! repeated consecutive failures on the same node within a session.

use crate::{Error, Result};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::sleep;

/// Retry policy for failed node operations.
///
/// Only errors whose `is_retryable()` is true (Transient, Timeout, node
/// errors flagged retryable) are re-attempted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryPolicy {
    /// Fail on the first error
    None,

    /// Exponential backoff
    Exponential {
        /// Delay before the first retry
        base_delay: Duration,
        /// Backoff multiplier per attempt
        multiplier: f64,
        /// Total attempts including the first
        max_attempts: u32,
    },
}

impl RetryPolicy {
    /// Backoff before retry number `retry` (0-based), or `None` when the
    /// attempt budget is exhausted.
    pub fn backoff(&self, retry: u32) -> Option<Duration> {
        match self {
            RetryPolicy::None => None,
            RetryPolicy::Exponential {
                base_delay,
                multiplier,
                max_attempts,
            } => {
                // max_attempts counts the initial attempt
                if retry + 1 >= *max_attempts {
                    return None;
                }
                let ms = base_delay.as_millis() as f64 * multiplier.powi(retry as i32);
                Some(Duration::from_millis(ms as u64))
            }
        }
    }

    /// Read a policy out of node params (`retry_attempts`,
    /// `retry_base_ms`), falling back to the default.
    pub fn from_params(params: &serde_json::Value) -> Self {
        let attempts = params.get("retry_attempts").and_then(|v| v.as_u64());
        let base_ms = params.get("retry_base_ms").and_then(|v| v.as_u64());
        match (attempts, base_ms) {
            (None, None) => RetryPolicy::default(),
            (Some(0), _) => RetryPolicy::None,
            (attempts, base_ms) => RetryPolicy::Exponential {
                base_delay: Duration::from_millis(base_ms.unwrap_or(100)),
                multiplier: 2.0,
                max_attempts: attempts.unwrap_or(3) as u32,
            },
        }
    }
}

impl Default for RetryPolicy {
    /// 3 attempts with 100 ms / 200 ms backoff between them
    fn default() -> Self {
        RetryPolicy::Exponential {
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_attempts: 3,
        }
    }
}

/// Run `operation` under the retry policy, bounded by `deadline`.
///
/// Non-retryable errors return immediately. A backoff that would overrun
/// the deadline converts the last error into `Timeout`.
pub async fn run_with_retry<F, Fut, T>(
    policy: RetryPolicy,
    deadline: Option<Instant>,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retry = 0u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => {
                let Some(delay) = policy.backoff(retry) else {
                    return Err(err);
                };
                if let Some(deadline) = deadline {
                    if Instant::now() + delay >= deadline {
                        return Err(Error::Timeout(format!(
                            "retry budget exceeded session deadline: {err}"
                        )));
                    }
                }
                retry += 1;
                tracing::warn!(retry, ?delay, error = %err, "retrying after failure");
                sleep(delay).await;
            }
        }
    }
}

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Tripped; calls are rejected until the cooldown elapses
    Open,
    /// Cooldown elapsed; one probe call is allowed through
    HalfOpen,
}

/// Trips after N consecutive failures on the same node within a session.
///
/// While open, calls are rejected without reaching the node; after the
/// cooldown a single probe is allowed and its outcome decides the next
/// state.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    consecutive_failures: u32,
    state: CircuitState,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    /// Breaker with the given consecutive-failure threshold and a 30 s
    /// cooldown
    pub fn new(threshold: u32) -> Self {
        Self::with_cooldown(threshold, Duration::from_secs(30))
    }

    /// Breaker with explicit threshold and cooldown
    pub fn with_cooldown(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            consecutive_failures: 0,
            state: CircuitState::Closed,
            opened_at: None,
        }
    }

    /// Whether a call may proceed. Transitions Open → HalfOpen once the
    /// cooldown has elapsed.
    pub fn allow(&mut self) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = self.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.cooldown {
                    self.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.state = CircuitState::Closed;
        self.opened_at = None;
    }

    /// Record a failed call; returns true when this failure trips the
    /// breaker open
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures += 1;
        match self.state {
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                self.opened_at = Some(Instant::now());
                true
            }
            CircuitState::Closed if self.consecutive_failures >= self.threshold => {
                self.state = CircuitState::Open;
                self.opened_at = Some(Instant::now());
                tracing::warn!(
                    failures = self.consecutive_failures,
                    "circuit breaker opened"
                );
                true
            }
            _ => false,
        }
    }

    /// Current state without side effects
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Consecutive failures recorded so far
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

impl Default for CircuitBreaker {
    /// Trips after 5 consecutive failures
    fn default() -> Self {
        Self::new(5)
    }
}
