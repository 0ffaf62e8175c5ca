// SPDX-License-Identifier: MIT OR Apache-2.0

//! Retrying network calls with exponential backoff, timeouts and cancellation.
use std::fmt::Debug;
use std::time::Duration;

use rand::Rng;
use rand_chacha::ChaCha20Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Delay before the second attempt.
    pub initial_delay: Duration,

    /// Factor the delay grows with after every failed attempt.
    pub factor: u32,

    /// Upper bound of the delay between attempts.
    pub max_delay: Duration,

    /// Number of attempts before giving up, including the first one.
    pub max_attempts: u32,

    /// Time a single attempt may take before it counts as failed.
    pub request_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            factor: 2,
            max_delay: Duration::from_secs(10),
            max_attempts: 5,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Exponential backoff with random jitter of up to half the current delay.
#[derive(Debug)]
pub struct Backoff {
    value: Duration,
    config: RetryConfig,
    rng: ChaCha20Rng,
}

impl Backoff {
    pub fn new(config: RetryConfig, rng: ChaCha20Rng) -> Self {
        Self {
            value: config.initial_delay,
            config,
            rng,
        }
    }

    /// Delay to wait before the next attempt. Every call grows the delay.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.value + self.random_jitter();
        self.value = (self.value * self.config.factor).min(self.config.max_delay);
        delay.min(self.config.max_delay)
    }

    pub fn reset(&mut self) {
        self.value = self.config.initial_delay;
    }

    fn random_jitter(&mut self) -> Duration {
        let max = self.value.as_millis() as u64 / 2;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(self.rng.random_range(0..max))
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E: Debug> {
    #[error("operation was cancelled")]
    Cancelled,

    #[error("operation timed out after {0} attempts")]
    TimedOut(u32),

    #[error("operation failed after {attempts} attempts: {error:?}")]
    Exhausted { attempts: u32, error: E },

    #[error("operation failed permanently: {0:?}")]
    Permanent(E),
}

impl<E: Debug> RetryError<E> {
    pub fn map_err<F: Debug>(self, f: impl FnOnce(E) -> F) -> RetryError<F> {
        match self {
            RetryError::Cancelled => RetryError::Cancelled,
            RetryError::TimedOut(attempts) => RetryError::TimedOut(attempts),
            RetryError::Exhausted { attempts, error } => RetryError::Exhausted {
                attempts,
                error: f(error),
            },
            RetryError::Permanent(error) => RetryError::Permanent(f(error)),
        }
    }
}

/// Runs `operation` until it succeeds, fails with a non-transient error, runs out of attempts or
/// gets cancelled.
///
/// Cancellation is checked before every attempt and interrupts attempts and delays alike.
pub async fn retry_with_backoff<T, E, F, Fut>(
    config: &RetryConfig,
    rng: ChaCha20Rng,
    cancel: &CancellationToken,
    is_transient: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    E: Debug,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut backoff = Backoff::new(config.clone(), rng);
    let mut attempt = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        attempt += 1;

        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            result = tokio::time::timeout(config.request_timeout, operation()) => result,
        };

        let error = match result {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(error)) if !is_transient(&error) => return Err(RetryError::Permanent(error)),
            Ok(Err(error)) => RetryError::Exhausted {
                attempts: attempt,
                error,
            },
            Err(_) => RetryError::TimedOut(attempt),
        };

        if attempt >= config.max_attempts {
            debug!(attempt, "giving up on operation");
            return Err(error);
        }

        let delay = backoff.next_delay();
        trace!(attempt, delay_ms = delay.as_millis() as u64, "retrying operation");

        tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(delay) => (),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;
    use tokio_util::sync::CancellationToken;

    use super::{Backoff, RetryConfig, RetryError, retry_with_backoff};

    #[test]
    fn backoff_grows_until_ceiling() {
        let config = RetryConfig::default();
        let mut backoff = Backoff::new(config.clone(), ChaCha20Rng::from_seed([1; 32]));

        let first = backoff.next_delay();
        assert!(first >= config.initial_delay);
        assert!(first < config.initial_delay * 2);

        let second = backoff.next_delay();
        assert!(second >= config.initial_delay * 2);

        for _ in 0..20 {
            assert!(backoff.next_delay() <= config.max_delay);
        }

        backoff.reset();
        assert!(backoff.next_delay() < config.initial_delay * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures() {
        let attempts = Arc::new(AtomicU32::new(0));
        let result = retry_with_backoff(
            &RetryConfig::default(),
            ChaCha20Rng::from_seed([1; 32]),
            &CancellationToken::new(),
            |_: &&str| true,
            || {
                let attempts = attempts.clone();
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("unavailable")
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_attempts() {
        let config = RetryConfig::default();
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(
            &config,
            ChaCha20Rng::from_seed([1; 32]),
            &CancellationToken::new(),
            |_: &&str| true,
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err("unavailable") }
            },
        )
        .await;
        assert!(matches!(
            result,
            Err(RetryError::Exhausted { attempts: 5, .. })
        ));
        assert_eq!(attempts.load(Ordering::SeqCst), config.max_attempts);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failures_are_not_retried() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(
            &RetryConfig::default(),
            ChaCha20Rng::from_seed([1; 32]),
            &CancellationToken::new(),
            |_: &&str| false,
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err("forbidden") }
            },
        )
        .await;
        assert!(matches!(result, Err(RetryError::Permanent("forbidden"))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempts_time_out() {
        let config = RetryConfig {
            max_attempts: 2,
            ..RetryConfig::default()
        };
        let result: Result<(), RetryError<&str>> = retry_with_backoff(
            &config,
            ChaCha20Rng::from_seed([1; 32]),
            &CancellationToken::new(),
            |_| true,
            || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            },
        )
        .await;
        assert!(matches!(result, Err(RetryError::TimedOut(2))));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), RetryError<&str>> = retry_with_backoff(
            &RetryConfig::default(),
            ChaCha20Rng::from_seed([1; 32]),
            &cancel,
            |_| true,
            || async { Ok(()) },
        )
        .await;
        assert!(matches!(result, Err(RetryError::Cancelled)));

        // Cancelling while waiting between attempts.
        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                retry_with_backoff(
                    &RetryConfig::default(),
                    ChaCha20Rng::from_seed([1; 32]),
                    &cancel,
                    |_: &&str| true,
                    || async { Err::<(), _>("unavailable") },
                )
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        assert!(matches!(handle.await.unwrap(), Err(RetryError::Cancelled)));
    }
}
