//! Exponential backoff for reconnection and apply retries.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{ReplError, Result};

/// Backoff settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// First delay (ms).
    pub initial_backoff_ms: u64,
    /// Largest delay (ms).
    pub max_backoff_ms: u64,
    /// Growth factor between consecutive delays.
    pub backoff_multiplier: f64,
    /// Add up to 50% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Reconnection defaults: unbounded retries, 100ms up to 30s.
    pub fn reconnect() -> Self {
        Self {
            max_retries: u32::MAX,
            initial_backoff_ms: 100,
            max_backoff_ms: 30_000,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff_ms as f64;
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let capped = (base * self.backoff_multiplier.powi(exponent)).min(self.max_backoff_ms as f64);
        let capped = capped.max(0.0) as u64;
        if self.jitter && capped > 1 {
            let extra = rand::thread_rng().gen_range(0..=capped / 2);
            Duration::from_millis(capped.saturating_add(extra))
        } else {
            Duration::from_millis(capped)
        }
    }

    /// Validates the settings.
    pub fn validate(&self) -> Result<()> {
        if self.backoff_multiplier < 1.0 {
            return Err(ReplError::Config {
                msg: "backoff_multiplier must be >= 1.0".to_string(),
            });
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(ReplError::Config {
                msg: "initial_backoff_ms exceeds max_backoff_ms".to_string(),
            });
        }
        Ok(())
    }
}

/// Stateful backoff sequence, reset on success.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    attempt: u32,
}

impl Backoff {
    /// Starts a fresh sequence.
    pub fn new(config: RetryConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Next delay, or `None` once `max_retries` delays were handed out.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.config.max_retries {
            return None;
        }
        let delay = self.config.backoff(self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    /// Failed attempts since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Restarts the sequence.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Outcome of a retried operation.
#[derive(Debug)]
pub enum RetryOutcome<T> {
    /// Operation succeeded.
    Success(T),
    /// Permanent error, or retries exhausted.
    Exhausted {
        /// The last error that occurred.
        last_error: ReplError,
        /// Total number of attempts made.
        attempts: u32,
    },
}

impl<T> RetryOutcome<T> {
    /// Converts into a plain result.
    pub fn into_result(self) -> Result<T> {
        match self {
            RetryOutcome::Success(value) => Ok(value),
            RetryOutcome::Exhausted { last_error, .. } => Err(last_error),
        }
    }
}

/// Runs operations, retrying transient failures with backoff.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Creates an executor.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Runs `operation` until it succeeds, fails permanently, or retries run out.
    ///
    /// Only [`ReplError::is_transient`] errors are retried.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut backoff = Backoff::new(self.config.clone());
        loop {
            match operation().await {
                Ok(value) => return RetryOutcome::Success(value),
                Err(e) => {
                    let delay = if e.is_transient() {
                        backoff.next_delay()
                    } else {
                        None
                    };
                    match delay {
                        Some(delay) => {
                            tracing::debug!(error = %e, attempt = backoff.attempts(), ?delay, "retrying");
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            return RetryOutcome::Exhausted {
                                last_error: e,
                                attempts: backoff.attempts() + 1,
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff_ms: 10,
            max_backoff_ms: 50,
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = no_jitter(10);
        assert_eq!(config.backoff(0), Duration::from_millis(10));
        assert_eq!(config.backoff(1), Duration::from_millis(20));
        assert_eq!(config.backoff(2), Duration::from_millis(40));
        assert_eq!(config.backoff(3), Duration::from_millis(50));
        assert_eq!(config.backoff(30), Duration::from_millis(50));
    }

    #[test]
    fn test_jitter_bounds() {
        let config = RetryConfig {
            jitter: true,
            ..no_jitter(3)
        };
        for _ in 0..50 {
            let d = config.backoff(1);
            assert!(d >= Duration::from_millis(20) && d <= Duration::from_millis(30));
        }
    }

    #[test]
    fn test_backoff_sequence_ends_and_resets() {
        let mut backoff = Backoff::new(no_jitter(2));
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(10)));
    }

    #[test]
    fn test_validate() {
        assert!(RetryConfig::default().validate().is_ok());
        let bad = RetryConfig {
            backoff_multiplier: 0.5,
            ..RetryConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_retried() {
        let calls = AtomicU32::new(0);
        let outcome = RetryExecutor::new(no_jitter(3))
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ReplError::backend("busy"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(outcome.into_result().unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_after_max_retries() {
        let outcome: RetryOutcome<()> = RetryExecutor::new(no_jitter(2))
            .execute(|| async { Err(ReplError::backend("down")) })
            .await;
        match outcome {
            RetryOutcome::Exhausted { attempts, .. } => assert_eq!(attempts, 3),
            RetryOutcome::Success(_) => panic!("expected exhaustion"),
        }
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let outcome: RetryOutcome<()> = RetryExecutor::default()
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ReplError::protocol("bad")) }
            })
            .await;
        assert!(matches!(outcome, RetryOutcome::Exhausted { attempts: 1, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
