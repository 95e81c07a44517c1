//! Policies deciding whether, and after how long, a failed connection attempt is retried.

use std::fmt;
use std::time::Duration;

/// Decides the delay before connection attempt number `attempt` (starting at 0 for the first
/// retry), given how long the client has been trying so far. `None` gives up.
pub trait RetryPolicy: Send + Sync + fmt::Debug {
    /// The delay before the next attempt, or `None` to stop retrying.
    fn allow_retry(&self, attempt: u32, elapsed: Duration) -> Option<Duration>;
}

/// Bounded exponential backoff: the delay starts at `base` and doubles with every attempt, capped
/// at `max_delay`, for at most `max_retries` retries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExponentialBackoff {
    base: Duration,
    max_delay: Duration,
    max_retries: u32,
}

impl ExponentialBackoff {
    /// Doubles from `base` without a ceiling, for `max_retries` retries.
    pub fn new(base: Duration, max_retries: u32) -> Self {
        ExponentialBackoff {
            base,
            max_delay: Duration::MAX,
            max_retries,
        }
    }

    /// Caps every delay at `max_delay`.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn allow_retry(&self, attempt: u32, _: Duration) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let delay = self.base.checked_mul(factor).unwrap_or(Duration::MAX);
        Some(delay.min(self.max_delay))
    }
}

/// Retries up to `n` times with a fixed sleep in between.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryNTimes {
    n: u32,
    sleep: Duration,
}

impl RetryNTimes {
    /// Retry `n` times, sleeping `sleep` before each retry.
    pub fn new(n: u32, sleep: Duration) -> Self {
        RetryNTimes { n, sleep }
    }
}

impl RetryPolicy for RetryNTimes {
    fn allow_retry(&self, attempt: u32, _: Duration) -> Option<Duration> {
        if attempt < self.n {
            Some(self.sleep)
        } else {
            None
        }
    }
}

/// Keeps retrying with the same delay until `max_elapsed` has passed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryUntilElapsed {
    max_elapsed: Duration,
    sleep: Duration,
}

impl RetryUntilElapsed {
    /// Retry every `sleep` until `max_elapsed` has passed since the first attempt.
    pub fn new(max_elapsed: Duration, sleep: Duration) -> Self {
        RetryUntilElapsed { max_elapsed, sleep }
    }
}

impl RetryPolicy for RetryUntilElapsed {
    fn allow_retry(&self, _: u32, elapsed: Duration) -> Option<Duration> {
        if elapsed < self.max_elapsed {
            Some(self.sleep)
        } else {
            None
        }
    }
}

/// Adapts a plain function into a [`RetryPolicy`].
pub struct RetryFn<F>(pub F);

impl<F> fmt::Debug for RetryFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("RetryFn")
    }
}

impl<F> RetryPolicy for RetryFn<F>
where
    F: Fn(u32, Duration) -> Option<Duration> + Send + Sync,
{
    fn allow_retry(&self, attempt: u32, elapsed: Duration) -> Option<Duration> {
        (self.0)(attempt, elapsed)
    }
}
