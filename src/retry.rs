//! Exponential backoff for rate-limited upstream services.
//!
//! A [`RetryPolicy`] retries an operation only while the caller-supplied
//! predicate classifies its error as retryable (quota / rate-limit
//! exhaustion). Any other error is handed back untouched as
//! [`RetryError::Permanent`].
//!
//! Delay before retry `n` (1-based) is
//! `min(initial_delay * 2^(n-1) + jitter, max_delay)` where jitter is a
//! uniformly random sub-second offset.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::random;

use crate::config::RetryConfig;

/// Blocks the calling thread between attempts.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, delay: Duration);
}

pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, delay: Duration) {
        std::thread::sleep(delay);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error(transparent)]
    Permanent(E),

    #[error("still rate limited after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error("deadline reached after {attempts} attempts: {last}")]
    DeadlineExceeded { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    /// The underlying failure of the last attempt.
    pub fn last(&self) -> &E {
        match self {
            RetryError::Permanent(err) => err,
            RetryError::Exhausted { last, .. } => last,
            RetryError::DeadlineExceeded { last, .. } => last,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }

    pub fn is_deadline(&self) -> bool {
        matches!(self, RetryError::DeadlineExceeded { .. })
    }
}

#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    jitter: bool,
    sleeper: Arc<dyn Sleeper>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .finish()
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay,
            jitter: true,
            sleeper: Arc::new(ThreadSleeper),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        let mut policy = Self::new(
            config.max_attempts,
            Duration::from_secs(config.initial_delay_secs),
            Duration::from_secs(config.max_delay_secs),
        );
        policy.jitter = config.jitter;
        policy
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay slept before retry number `retry` (1 = first retry).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        let base = self.initial_delay.saturating_mul(factor);
        let jitter = if self.jitter {
            Duration::from_secs_f64(random::<f64>())
        } else {
            Duration::ZERO
        };

        base.saturating_add(jitter).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, runs out
    /// of attempts, or the next backoff would end past `deadline`.
    pub fn run<T, E, F, P>(
        &self,
        what: &str,
        deadline: Option<Instant>,
        mut op: F,
        is_retryable: P,
    ) -> Result<T, RetryError<E>>
    where
        E: fmt::Display,
        F: FnMut() -> Result<T, E>,
        P: Fn(&E) -> bool,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;

            let err = match op() {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !is_retryable(&err) {
                return Err(RetryError::Permanent(err));
            }

            if attempt >= self.max_attempts {
                log::error!("{what}: giving up after {attempt} attempts: {err}");
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: err,
                });
            }

            let delay = self.delay_for(attempt);

            if let Some(deadline) = deadline {
                if Instant::now() + delay > deadline {
                    log::warn!("{what}: backoff of {delay:?} would pass the query deadline");
                    return Err(RetryError::DeadlineExceeded {
                        attempts: attempt,
                        last: err,
                    });
                }
            }

            log::warn!(
                "{what}: rate limited (attempt {}/{}), retrying in {:?}: {}",
                attempt,
                self.max_attempts,
                delay,
                err
            );
            self.sleeper.sleep(delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSleeper {
        slept: Mutex<Vec<Duration>>,
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, delay: Duration) {
            self.slept.lock().unwrap().push(delay);
        }
    }

    #[derive(Debug, PartialEq)]
    enum Failure {
        Quota,
        Fatal,
    }

    impl fmt::Display for Failure {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{self:?}")
        }
    }

    fn policy(sleeper: Arc<RecordingSleeper>) -> RetryPolicy {
        RetryPolicy::new(5, Duration::from_secs(60), Duration::from_secs(600)).with_sleeper(sleeper)
    }

    #[test]
    fn test_succeeds_after_four_quota_failures() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let calls = Cell::new(0);

        let result = policy(sleeper.clone()).run(
            "test",
            None,
            || {
                calls.set(calls.get() + 1);
                if calls.get() <= 4 {
                    Err(Failure::Quota)
                } else {
                    Ok("done")
                }
            },
            |err| *err == Failure::Quota,
        );

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.get(), 5);

        let slept = sleeper.slept.lock().unwrap().clone();
        assert_eq!(slept.len(), 4);
        for pair in slept.windows(2) {
            assert!(pair[0] < pair[1], "delays must grow: {slept:?}");
        }
        for (idx, delay) in slept.iter().enumerate() {
            let base = Duration::from_secs(60 * 2u64.pow(idx as u32));
            assert!(*delay >= base.min(Duration::from_secs(600)));
            assert!(*delay < base + Duration::from_secs(1));
            assert!(*delay <= Duration::from_secs(600));
        }
    }

    #[test]
    fn test_five_quota_failures_exhaust_without_sixth_attempt() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let calls = Cell::new(0);

        let result: Result<(), _> = policy(sleeper.clone()).run(
            "test",
            None,
            || {
                calls.set(calls.get() + 1);
                Err(Failure::Quota)
            },
            |err| *err == Failure::Quota,
        );

        let err = result.unwrap_err();
        assert!(err.is_exhausted());
        assert_eq!(*err.last(), Failure::Quota);
        assert_eq!(calls.get(), 5);
        assert_eq!(sleeper.slept.lock().unwrap().len(), 4);
    }

    #[test]
    fn test_non_retryable_error_propagates_immediately() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let calls = Cell::new(0);

        let result: Result<(), _> = policy(sleeper.clone()).run(
            "test",
            None,
            || {
                calls.set(calls.get() + 1);
                Err(Failure::Fatal)
            },
            |err| *err == Failure::Quota,
        );

        assert!(matches!(result, Err(RetryError::Permanent(Failure::Fatal))));
        assert_eq!(calls.get(), 1);
        assert!(sleeper.slept.lock().unwrap().is_empty());
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::new(10, Duration::from_secs(60), Duration::from_secs(600));
        for retry in 1..10 {
            assert!(policy.delay_for(retry) <= Duration::from_secs(600));
        }
        assert_eq!(policy.delay_for(9), Duration::from_secs(600));
    }

    #[test]
    fn test_delay_without_jitter_doubles() {
        let policy = RetryPolicy::new(5, Duration::from_secs(60), Duration::from_secs(600))
            .without_jitter();
        assert_eq!(policy.delay_for(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for(2), Duration::from_secs(120));
        assert_eq!(policy.delay_for(3), Duration::from_secs(240));
        assert_eq!(policy.delay_for(4), Duration::from_secs(480));
        assert_eq!(policy.delay_for(5), Duration::from_secs(600));
    }

    /// Default schedule and deadline scaled from seconds to milliseconds,
    /// with a real clock, so the deadline is checked against actual sleeps.
    #[test]
    fn test_default_deadline_lets_all_attempts_run() {
        let config = crate::config::Config::default();
        let policy = RetryPolicy::new(
            config.retry.max_attempts,
            Duration::from_millis(config.retry.initial_delay_secs),
            Duration::from_millis(config.retry.max_delay_secs),
        )
        .without_jitter();
        let deadline = Instant::now() + Duration::from_millis(config.search.query_timeout_secs);
        let calls = Cell::new(0);

        let result: Result<(), _> = policy.run(
            "test",
            Some(deadline),
            || {
                calls.set(calls.get() + 1);
                Err(Failure::Quota)
            },
            |err| *err == Failure::Quota,
        );

        let err = result.unwrap_err();
        assert!(err.is_exhausted(), "{err}");
        assert_eq!(calls.get(), config.retry.max_attempts);
    }

    #[test]
    fn test_deadline_stops_backoff_before_sleeping() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let deadline = Instant::now() + Duration::from_secs(1);

        let result: Result<(), _> = policy(sleeper.clone()).run(
            "test",
            Some(deadline),
            || Err(Failure::Quota),
            |err| *err == Failure::Quota,
        );

        let err = result.unwrap_err();
        assert!(err.is_deadline());
        assert!(sleeper.slept.lock().unwrap().is_empty());
    }
}
