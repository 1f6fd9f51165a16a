//! Retry execution with configurable backoff and jitter
//!
//! The handler drives an attempt function that performs exactly one call and
//! classifies its own outcome as [`AttemptOutcome::Success`],
//! [`AttemptOutcome::Retryable`] or [`AttemptOutcome::Fatal`]. Retryable
//! failures are retried up to `max_retries` times; the delay before retry
//! `n` (0-indexed) is:
//!
//! | Strategy    | Delay                                        |
//! |-------------|----------------------------------------------|
//! | Fixed       | `initial_delay`                              |
//! | Linear      | `initial_delay * (n + 1) * backoff_multiplier` |
//! | Exponential | `initial_delay * backoff_multiplier^n`       |
//!
//! capped at `max_delay`, then scaled by a uniform factor in `[0.75, 1.25]`
//! when jitter is on. A server wait hint attached to a retryable failure
//! replaces the computed delay entirely.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::{ConfigError, ConfigResult};
use crate::utils::serde::duration_secs;

const JITTER_RATIO: f64 = 0.25;

/// Errors surfaced once the retry loop stops
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every permitted attempt failed with a retryable error
    #[error("All retry attempts exhausted after {attempts} tries")]
    Exhausted { attempts: u32, error: E },

    /// An attempt failed with an error that must not be retried
    #[error("Operation failed with non-retryable error on attempt {attempts}")]
    NonRetryable { attempts: u32, error: E },

    /// The caller cancelled during an attempt or a backoff sleep; `attempts`
    /// counts only attempts that completed
    #[error("Retry loop cancelled after {attempts} completed attempts")]
    Cancelled { attempts: u32, last_error: Option<E> },
}

impl<E> RetryError<E> {
    /// Attempts completed before the loop stopped
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. }
            | Self::NonRetryable { attempts, .. }
            | Self::Cancelled { attempts, .. } => *attempts,
        }
    }

    /// The last underlying error, if any attempt completed
    pub fn into_error(self) -> Option<E> {
        match self {
            Self::Exhausted { error, .. } | Self::NonRetryable { error, .. } => Some(error),
            Self::Cancelled { last_error, .. } => last_error,
        }
    }
}

/// Classified result of a single attempt
#[derive(Debug)]
pub enum AttemptOutcome<T, E> {
    Success(T),
    /// Transient failure; `retry_after` carries a server wait hint
    Retryable { error: E, retry_after: Option<Duration> },
    Fatal(E),
}

impl<T, E> AttemptOutcome<T, E> {
    /// Retryable failure without a wait hint
    pub fn retryable(error: E) -> Self {
        Self::Retryable { error, retry_after: None }
    }
}

/// Outcome of a retry execution including summary statistics
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, RetryError<E>>,
    pub attempts: u32,
    /// Time spent sleeping between attempts
    pub total_delay: Duration,
}

impl<T, E> RetryOutcome<T, E> {
    /// Consume the outcome and return only the result.
    pub fn into_result(self) -> Result<T, RetryError<E>> {
        self.result
    }

    /// Retries performed, i.e. attempts after the first
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Backoff strategy for calculating retry delays
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    #[default]
    Exponential,
}

impl fmt::Display for BackoffStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed => write!(f, "fixed"),
            Self::Linear => write!(f, "linear"),
            Self::Exponential => write!(f, "exponential"),
        }
    }
}

fn default_retryable_status_codes() -> BTreeSet<u16> {
    [408, 429, 500, 502, 503, 504].into_iter().collect()
}

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt; total attempts are `max_retries + 1`
    pub max_retries: u32,
    pub strategy: BackoffStrategy,
    #[serde(with = "duration_secs")]
    pub initial_delay: Duration,
    #[serde(with = "duration_secs")]
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
    pub retryable_status_codes: BTreeSet<u16>,
    pub retry_on_timeout: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            strategy: BackoffStrategy::Exponential,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
            retryable_status_codes: default_retryable_status_codes(),
            retry_on_timeout: true,
        }
    }
}

impl RetryConfig {
    /// Create a configuration builder
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::default()
    }

    /// A policy that performs a single attempt
    pub fn no_retry() -> Self {
        Self { max_retries: 0, ..Self::default() }
    }

    /// Total attempts permitted, including the first
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Whether a response status should be retried
    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_status_codes.contains(&status)
    }

    /// Pre-jitter delay before retry `retry_index` (0-indexed)
    pub fn base_delay(&self, retry_index: u32) -> Duration {
        let initial = self.initial_delay.as_secs_f64();
        let secs = match self.strategy {
            BackoffStrategy::Fixed => initial,
            BackoffStrategy::Linear => {
                initial * (f64::from(retry_index) + 1.0) * self.backoff_multiplier
            }
            BackoffStrategy::Exponential => {
                let exponent = i32::try_from(retry_index).unwrap_or(i32::MAX);
                initial * self.backoff_multiplier.powi(exponent)
            }
        };

        let cap = self.max_delay.as_secs_f64();
        if secs.is_finite() && secs < cap {
            Duration::from_secs_f64(secs.max(0.0))
        } else {
            self.max_delay
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier <= 0.0 {
            return Err(ConfigError::invalid(
                "retry.backoff_multiplier",
                "must be a finite number greater than 0",
            ));
        }

        if self.max_delay < self.initial_delay {
            return Err(ConfigError::invalid(
                "retry.max_delay",
                format!(
                    "max_delay ({:?}) must be >= initial_delay ({:?})",
                    self.max_delay, self.initial_delay
                ),
            ));
        }

        if let Some(code) = self.retryable_status_codes.iter().find(|c| !(100..=599).contains(*c))
        {
            return Err(ConfigError::invalid(
                "retry.retryable_status_codes",
                format!("{code} is not an HTTP status code"),
            ));
        }

        Ok(())
    }
}

/// Builder for [`RetryConfig`]
#[derive(Debug, Default)]
pub struct RetryConfigBuilder {
    config: RetryConfig,
}

impl RetryConfigBuilder {
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    pub fn fixed_backoff(mut self, delay: Duration) -> Self {
        self.config.strategy = BackoffStrategy::Fixed;
        self.config.initial_delay = delay;
        self
    }

    pub fn linear_backoff(mut self, initial_delay: Duration, multiplier: f64) -> Self {
        self.config.strategy = BackoffStrategy::Linear;
        self.config.initial_delay = initial_delay;
        self.config.backoff_multiplier = multiplier;
        self
    }

    pub fn exponential_backoff(
        mut self,
        initial_delay: Duration,
        multiplier: f64,
        max_delay: Duration,
    ) -> Self {
        self.config.strategy = BackoffStrategy::Exponential;
        self.config.initial_delay = initial_delay;
        self.config.backoff_multiplier = multiplier;
        self.config.max_delay = max_delay;
        self
    }

    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.config.max_delay = max_delay;
        self
    }

    pub fn no_jitter(mut self) -> Self {
        self.config.jitter = false;
        self
    }

    pub fn retryable_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.config.retryable_status_codes = codes.into_iter().collect();
        self
    }

    pub fn retry_on_timeout(mut self, enabled: bool) -> Self {
        self.config.retry_on_timeout = enabled;
        self
    }

    pub fn build(self) -> ConfigResult<RetryConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Executes classified attempts under a [`RetryConfig`]
#[derive(Debug, Clone)]
pub struct RetryHandler {
    config: RetryConfig,
}

impl RetryHandler {
    pub fn new(config: RetryConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay before retry `retry_index`, jitter applied
    pub fn delay_for(&self, retry_index: u32) -> Duration {
        let delay = self.config.base_delay(retry_index);
        if self.config.jitter {
            let factor = rand::thread_rng().gen_range((1.0 - JITTER_RATIO)..=(1.0 + JITTER_RATIO));
            delay.mul_f64(factor)
        } else {
            delay
        }
    }

    /// Run `operation` until it succeeds, fails fatally, or runs out of
    /// retries
    ///
    /// `operation` receives the 0-indexed attempt number.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> RetryOutcome<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = AttemptOutcome<T, E>>,
        E: fmt::Debug,
    {
        self.execute_until_cancelled(&CancellationToken::new(), operation).await
    }

    /// Like [`execute`](Self::execute), but stops promptly when `cancel`
    /// fires, whether an attempt or a backoff sleep is in progress
    #[instrument(skip_all, fields(max_retries = self.config.max_retries, strategy = %self.config.strategy))]
    pub async fn execute_until_cancelled<F, Fut, T, E>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> RetryOutcome<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = AttemptOutcome<T, E>>,
        E: fmt::Debug,
    {
        let mut attempts = 0_u32;
        let mut total_delay = Duration::ZERO;
        let mut last_error: Option<E> = None;

        loop {
            attempts += 1;
            debug!(attempt = attempts, max_attempts = self.config.max_attempts(), "Executing attempt");

            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    let completed = attempts - 1;
                    return RetryOutcome {
                        result: Err(RetryError::Cancelled { attempts: completed, last_error }),
                        attempts: completed,
                        total_delay,
                    };
                }
                outcome = operation(attempts - 1) => outcome,
            };

            let (error, retry_after) = match outcome {
                AttemptOutcome::Success(value) => {
                    if attempts > 1 {
                        debug!(retries = attempts - 1, "Operation succeeded after retries");
                    }
                    return RetryOutcome { result: Ok(value), attempts, total_delay };
                }
                AttemptOutcome::Fatal(error) => {
                    debug!(attempt = attempts, ?error, "Non-retryable failure");
                    return RetryOutcome {
                        result: Err(RetryError::NonRetryable { attempts, error }),
                        attempts,
                        total_delay,
                    };
                }
                AttemptOutcome::Retryable { error, retry_after } => (error, retry_after),
            };

            if attempts > self.config.max_retries {
                warn!(attempts, ?error, "All retry attempts exhausted");
                return RetryOutcome {
                    result: Err(RetryError::Exhausted { attempts, error }),
                    attempts,
                    total_delay,
                };
            }

            let delay = retry_after.unwrap_or_else(|| self.delay_for(attempts - 1));
            warn!(
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                server_hint = retry_after.is_some(),
                ?error,
                "Attempt failed, retrying"
            );
            last_error = Some(error);

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return RetryOutcome {
                        result: Err(RetryError::Cancelled { attempts, last_error }),
                        attempts,
                        total_delay,
                    };
                }
                () = tokio::time::sleep(delay) => {}
            }
            total_delay += delay;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use tokio::time::Instant;

    use super::*;

    #[derive(Debug, PartialEq, Eq)]
    struct Flaky(u32);

    fn deterministic(max_retries: u32) -> RetryHandler {
        let config = RetryConfig::builder()
            .max_retries(max_retries)
            .exponential_backoff(Duration::from_secs(1), 2.0, Duration::from_secs(10))
            .no_jitter()
            .build()
            .expect("valid config");
        RetryHandler::new(config).expect("valid handler")
    }

    #[test]
    fn test_default_config() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts(), 4);
        assert_eq!(config.strategy, BackoffStrategy::Exponential);
        assert!(config.is_retryable_status(429));
        assert!(config.is_retryable_status(503));
        assert!(!config.is_retryable_status(404));
        assert!(config.validate().is_ok());
    }

    /// Validates the pre-jitter delay of each strategy.
    ///
    /// Assertions:
    /// - Fixed stays at `initial_delay`.
    /// - Linear grows by `(n + 1) * multiplier`.
    /// - Exponential doubles and is capped at `max_delay`.
    #[test]
    fn test_base_delay_per_strategy() {
        let fixed = RetryConfig::builder().fixed_backoff(Duration::from_millis(250)).build();
        let fixed = fixed.expect("valid");
        assert_eq!(fixed.base_delay(0), Duration::from_millis(250));
        assert_eq!(fixed.base_delay(7), Duration::from_millis(250));

        let linear = RetryConfig::builder()
            .linear_backoff(Duration::from_secs(1), 1.5)
            .max_delay(Duration::from_secs(4))
            .build()
            .expect("valid");
        assert_eq!(linear.base_delay(0), Duration::from_millis(1500));
        assert_eq!(linear.base_delay(1), Duration::from_secs(3));
        assert_eq!(linear.base_delay(2), Duration::from_secs(4), "capped at max_delay");

        let exponential = deterministic(3).config;
        let delays: Vec<_> = (0..6).map(|n| exponential.base_delay(n)).collect();
        assert_eq!(
            delays,
            [1, 2, 4, 8, 10, 10].map(Duration::from_secs).to_vec(),
            "exponential doubling capped at 10s"
        );
        assert_eq!(exponential.base_delay(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let handler = RetryHandler::new(RetryConfig::default()).expect("valid");
        for _ in 0..500 {
            let delay = handler.delay_for(1);
            assert!(
                delay >= Duration::from_millis(1500) && delay <= Duration::from_millis(2500),
                "jittered delay {delay:?} outside [1.5s, 2.5s]"
            );
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(RetryConfig::builder()
            .exponential_backoff(Duration::from_secs(1), 0.0, Duration::from_secs(5))
            .build()
            .is_err());
        assert!(RetryConfig::builder()
            .exponential_backoff(Duration::from_secs(10), 2.0, Duration::from_secs(5))
            .build()
            .is_err());
        assert!(RetryConfig::builder().retryable_status_codes([42]).build().is_err());
    }

    #[test]
    fn test_config_deserializes_seconds() {
        let config: RetryConfig = serde_json::from_str(
            r#"{"max_retries":5,"strategy":"linear","initial_delay":0.5,"jitter":false}"#,
        )
        .expect("should deserialize");

        assert_eq!(config.max_retries, 5);
        assert_eq!(config.strategy, BackoffStrategy::Linear);
        assert_eq!(config.initial_delay, Duration::from_millis(500));
        assert_eq!(config.max_delay, Duration::from_secs(60));
        assert!(!config.jitter);
    }

    /// Validates the retry bound for an always-failing retryable call.
    ///
    /// # Test Steps
    /// 1. Configure `max_retries = 3`, exponential 1s x2, cap 10s, no jitter
    /// 2. Record the paused-clock offset of every attempt
    ///
    /// Assertions:
    /// - Exactly 4 attempts are made.
    /// - Attempts start at 0s, 1s, 3s and 7s.
    /// - The last error is surfaced as `Exhausted`.
    #[tokio::test(start_paused = true)]
    async fn test_retry_bound_with_exponential_delays() {
        let handler = deterministic(3);
        let start = Instant::now();
        let mut offsets = Vec::new();

        let outcome = handler
            .execute(|attempt| {
                offsets.push(start.elapsed());
                async move { AttemptOutcome::<(), _>::retryable(Flaky(attempt)) }
            })
            .await;

        assert_eq!(outcome.attempts, 4);
        assert_eq!(outcome.total_delay, Duration::from_secs(7));
        assert_eq!(offsets, [0, 1, 3, 7].map(Duration::from_secs).to_vec());
        match outcome.result {
            Err(RetryError::Exhausted { attempts, error }) => {
                assert_eq!(attempts, 4);
                assert_eq!(error, Flaky(3), "last error propagates");
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_is_not_retried() {
        let handler = deterministic(3);
        let calls = AtomicU32::new(0);

        let outcome = handler
            .execute(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { AttemptOutcome::<(), _>::Fatal(Flaky(404)) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.retries(), 0);
        assert_eq!(outcome.total_delay, Duration::ZERO);
        assert!(matches!(outcome.result, Err(RetryError::NonRetryable { attempts: 1, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_transient_failures() {
        let handler = deterministic(3);

        let outcome = handler
            .execute(|attempt| async move {
                if attempt < 2 {
                    AttemptOutcome::retryable(Flaky(attempt))
                } else {
                    AttemptOutcome::Success("ok")
                }
            })
            .await;

        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.retries(), 2);
        assert_eq!(outcome.into_result().expect("should succeed"), "ok");
    }

    /// Validates that a server wait hint replaces the computed backoff.
    ///
    /// Assertions:
    /// - The hinted delay is used even when larger than `max_delay`.
    #[tokio::test(start_paused = true)]
    async fn test_server_hint_overrides_backoff() {
        let handler = deterministic(1);

        let outcome = handler
            .execute(|attempt| async move {
                if attempt == 0 {
                    AttemptOutcome::Retryable {
                        error: Flaky(429),
                        retry_after: Some(Duration::from_secs(30)),
                    }
                } else {
                    AttemptOutcome::Success(())
                }
            })
            .await;

        assert!(outcome.result.is_ok());
        assert_eq!(outcome.total_delay, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retries_makes_single_attempt() {
        let handler = RetryHandler::new(RetryConfig::no_retry()).expect("valid");

        let outcome =
            handler.execute(|_| async { AttemptOutcome::<(), _>::retryable(Flaky(503)) }).await;

        assert_eq!(outcome.attempts, 1);
        assert!(matches!(outcome.result, Err(RetryError::Exhausted { attempts: 1, .. })));
    }

    /// Validates cancellation during a backoff sleep.
    ///
    /// # Test Steps
    /// 1. Start a retry loop whose first attempt fails with a 1s backoff
    /// 2. Cancel the token 100ms into the sleep
    ///
    /// Assertions:
    /// - The loop returns `Cancelled` carrying the last error.
    /// - No second attempt is made.
    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let handler = deterministic(3);
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let counter = Arc::clone(&calls);
        let outcome = handler
            .execute_until_cancelled(&cancel, move |attempt| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { AttemptOutcome::<(), _>::retryable(Flaky(attempt)) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        match outcome.result {
            Err(RetryError::Cancelled { attempts, last_error }) => {
                assert_eq!(attempts, 1);
                assert_eq!(last_error, Some(Flaky(0)));
            }
            other => panic!("expected Cancelled, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_already_cancelled_makes_no_attempt() {
        let handler = deterministic(3);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = handler
            .execute_until_cancelled(&cancel, |_| async { AttemptOutcome::<(), Flaky>::Success(()) })
            .await;

        assert!(matches!(
            outcome.result,
            Err(RetryError::Cancelled { attempts: 0, last_error: None })
        ));
    }
}
