//! One retry policy for every call site that retries: moves the filesystem
//! refuses, single pages, whole files.
//!
//! With the default exponential backoff the wait before attempt `n` is
//! `initial_delay * 2^(n-2)`; a fixed policy always waits `initial_delay`.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed,
    Exponential,
}

/// Bounded retry with backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Wait before the second attempt.
    pub initial_delay: Duration,
    pub backoff: Backoff,
}

/// The error of the last attempt, with how many attempts were made.
#[derive(Debug)]
pub struct Exhausted<E> {
    pub attempts: u32,
    pub error: E,
}

impl RetryPolicy {
    /// Exponential policy.
    pub const fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            backoff: Backoff::Exponential,
        }
    }

    /// Single attempt, no waiting.
    pub const fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Same policy with a constant delay.
    pub const fn fixed(mut self) -> Self {
        self.backoff = Backoff::Fixed;
        self
    }

    /// Delay to wait before attempt number `attempt` (1-based).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        match self.backoff {
            Backoff::Fixed => self.initial_delay,
            Backoff::Exponential => {
                let factor = 2u32.saturating_pow(attempt - 2);
                self.initial_delay.saturating_mul(factor)
            }
        }
    }

    /// Run `op` until it succeeds, fails with an error `retryable` rejects,
    /// or the attempts run out.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut>(
        &self,
        what: &str,
        mut op: F,
        retryable: impl Fn(&E) -> bool,
    ) -> Result<T, Exhausted<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let max = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(v) => return Ok(v),
                Err(e) if attempt < max && retryable(&e) => {
                    let delay = self.delay_before(attempt + 1);
                    warn!(
                        "{}: attempt {}/{} failed ({}), retrying in {}ms",
                        what,
                        attempt,
                        max,
                        e,
                        delay.as_millis()
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(Exhausted {
                        attempts: attempt,
                        error: e,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn exponential_delays_double() {
        let p = RetryPolicy::new(5, Duration::from_millis(100));
        assert_eq!(p.delay_before(1), Duration::ZERO);
        assert_eq!(p.delay_before(2), Duration::from_millis(100));
        assert_eq!(p.delay_before(3), Duration::from_millis(200));
        assert_eq!(p.delay_before(4), Duration::from_millis(400));
    }

    #[test]
    fn fixed_delays_stay_constant() {
        let p = RetryPolicy::new(3, Duration::from_millis(50)).fixed();
        assert_eq!(p.delay_before(2), Duration::from_millis(50));
        assert_eq!(p.delay_before(3), Duration::from_millis(50));
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(4, Duration::from_millis(1));
        let result: Result<u32, Exhausted<String>> = tokio_test::block_on(policy.run(
            "flaky",
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(format!("locked #{attempt}"))
                    } else {
                        Ok(attempt)
                    }
                }
            },
            |_| true,
        ));
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let result: Result<(), Exhausted<&str>> =
            tokio_test::block_on(policy.run("always", |_| async { Err("denied") }, |_| true));
        let err = result.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(err.error, "denied");
    }

    #[test]
    fn non_retryable_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Duration::from_millis(1));
        let result: Result<(), Exhausted<&str>> = tokio_test::block_on(policy.run(
            "gone",
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("not found") }
            },
            |_| false,
        ));
        assert_eq!(result.unwrap_err().attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn once_makes_a_single_attempt() {
        let policy = RetryPolicy::once();
        assert_eq!(policy.delay_before(2), Duration::ZERO);
        let result: Result<(), Exhausted<&str>> =
            tokio_test::block_on(policy.run("single", |_| async { Err("busy") }, |_| true));
        assert_eq!(result.unwrap_err().attempts, 1);
    }
}
