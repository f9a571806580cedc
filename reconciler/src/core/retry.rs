//! Bounded retry and bounded wait combinators.
//!
//! Every retry site (context establishment, item execution, post-condition
//! confirmation) goes through these two functions. Operations must be
//! idempotent: a retry re-runs the whole closure.

use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Always at least 1.
    pub max_attempts: u32,
    /// Fixed delay between attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Single attempt without delay.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(2))
    }
}

/// Final error of an operation that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GaveUp<E> {
    /// Attempts actually made.
    pub attempts: u32,
    pub error: E,
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the policy
/// is exhausted. `op` receives the 1-based attempt number.
pub fn retry<T, E, F, R>(policy: &RetryPolicy, is_retryable: R, mut op: F) -> Result<T, GaveUp<E>>
where
    F: FnMut(u32) -> Result<T, E>,
    R: Fn(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt >= max_attempts || !is_retryable(&error) {
                    return Err(GaveUp {
                        attempts: attempt,
                        error,
                    });
                }
            }
        }
        if !policy.delay.is_zero() {
            thread::sleep(policy.delay);
        }
        attempt += 1;
    }
}

/// Poll `check` until it returns `true` or `timeout` elapses.
///
/// `check` runs at least once. Returns `Ok(false)` on timeout; errors from
/// `check` are returned immediately.
pub fn wait_until<E, F>(timeout: Duration, poll: Duration, mut check: F) -> Result<bool, E>
where
    F: FnMut() -> Result<bool, E>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check()? {
            return Ok(true);
        }
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .unwrap_or(Duration::ZERO);
        if remaining.is_zero() {
            return Ok(false);
        }
        thread::sleep(poll.min(remaining));
    }
}
