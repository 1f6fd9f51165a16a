//! Token-bucket admission control
//!
//! The bucket holds at most `burst_size` tokens and refills continuously at
//! `max_requests / window` tokens per second, computed from the time elapsed
//! since the previous refill. Every read or write of the bucket happens under
//! one mutex, so the available token count never exceeds the capacity and
//! never drops below zero, no matter how many tasks call
//! [`RateLimiter::acquire`] at once.
//!
//! Besides the bucket math the limiter honours a server-imposed deadline
//! (`Retry-After`, `X-RateLimit-Reset`) when `respect_retry_after` is set:
//! no token is granted before that instant.

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::clock::{Clock, SystemClock};
use crate::error::{ConfigError, ConfigResult};
use crate::utils::serde::duration_secs;

// Tolerates float drift after sleeping for exactly the computed wait.
const TOKEN_EPSILON: f64 = 1e-9;

/// Longest pause a single server signal can impose on admissions
pub const MAX_DEFERRAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Configuration for the token-bucket limiter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests admitted per window at the steady-state rate
    pub max_requests: u32,
    /// Window over which `max_requests` are spread
    #[serde(rename = "window_seconds", with = "duration_secs")]
    pub window: Duration,
    /// Bucket capacity; defaults to `max_requests` when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub burst_size: Option<u32>,
    /// Hold new admissions until a server-signalled deadline passes
    pub respect_retry_after: bool,
    /// Multiplier on the refill interval used as the pause after a 429
    /// that carried no wait hint
    pub backoff_factor: f64,
    /// Take one token per physical attempt instead of per logical call
    pub acquire_per_attempt: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_secs(60),
            burst_size: None,
            respect_retry_after: true,
            backoff_factor: 1.0,
            acquire_per_attempt: false,
        }
    }
}

impl RateLimitConfig {
    /// Shorthand for a limiter admitting `max_requests` per `window`
    pub fn per_window(max_requests: u32, window: Duration) -> Self {
        Self { max_requests, window, ..Self::default() }
    }

    /// Set an explicit burst capacity
    #[must_use]
    pub fn with_burst(mut self, burst_size: u32) -> Self {
        self.burst_size = Some(burst_size);
        self
    }

    /// Effective bucket capacity
    pub fn capacity(&self) -> u32 {
        self.burst_size.unwrap_or(self.max_requests)
    }

    /// Steady-state refill rate in tokens per second
    pub fn refill_rate(&self) -> f64 {
        f64::from(self.max_requests) / self.window.as_secs_f64()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_requests == 0 {
            return Err(ConfigError::invalid("rate_limit.max_requests", "must be greater than 0"));
        }

        if self.window.is_zero() {
            return Err(ConfigError::invalid("rate_limit.window_seconds", "must be greater than 0"));
        }

        if self.capacity() < self.max_requests {
            return Err(ConfigError::invalid(
                "rate_limit.burst_size",
                format!(
                    "burst_size ({}) must be >= max_requests ({})",
                    self.capacity(),
                    self.max_requests
                ),
            ));
        }

        if !self.backoff_factor.is_finite() || self.backoff_factor < 0.0 {
            return Err(ConfigError::invalid(
                "rate_limit.backoff_factor",
                "must be a finite, non-negative number",
            ));
        }

        Ok(())
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
    blocked_until: Option<Instant>,
}

/// Token-bucket rate limiter with a pluggable [`Clock`]
pub struct RateLimiter<C: Clock = SystemClock> {
    config: RateLimitConfig,
    capacity: f64,
    rate: f64,
    clock: C,
    state: Mutex<BucketState>,
}

impl<C: Clock> fmt::Debug for RateLimiter<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("capacity", &self.capacity)
            .field("rate", &self.rate)
            .field("available", &self.available_tokens())
            .finish_non_exhaustive()
    }
}

impl RateLimiter<SystemClock> {
    /// Create a limiter on the system clock, starting with a full bucket
    pub fn new(config: RateLimitConfig) -> ConfigResult<Self> {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> RateLimiter<C> {
    /// Create a limiter with a custom clock, starting with a full bucket
    pub fn with_clock(config: RateLimitConfig, clock: C) -> ConfigResult<Self> {
        config.validate()?;

        let capacity = f64::from(config.capacity());
        let rate = config.refill_rate();
        let state =
            Mutex::new(BucketState { tokens: capacity, last_refill: clock.now(), blocked_until: None });

        Ok(Self { config, capacity, rate, clock, state })
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Wait until a token is available and take it
    ///
    /// Returns how long the caller was suspended. Dropping the future before
    /// it completes takes nothing from the bucket.
    pub async fn acquire(&self) -> Duration {
        let started = self.clock.now();

        loop {
            match self.poll_token() {
                Ok(()) => return self.clock.now().saturating_duration_since(started),
                Err(wait) => {
                    debug!(wait_ms = wait.as_millis() as u64, "Rate limit reached, waiting for token");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Take a token if one is available right now
    pub fn try_acquire(&self) -> bool {
        self.poll_token().is_ok()
    }

    /// How long until a token could be granted, zero if one is available now
    pub fn time_until_available(&self) -> Duration {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.refill(&mut state, now);
        self.wait_for(&state, now).unwrap_or(Duration::ZERO)
    }

    /// Tokens currently in the bucket
    pub fn available_tokens(&self) -> f64 {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.refill(&mut state, now);
        state.tokens
    }

    /// Deadline before which no token is granted, if one is pending
    pub fn blocked_until(&self) -> Option<Instant> {
        let now = self.clock.now();
        self.state.lock().blocked_until.filter(|deadline| *deadline > now)
    }

    /// Hold admissions for `delay` from now, at most [`MAX_DEFERRAL`]
    pub fn defer_for(&self, delay: Duration) {
        let now = self.clock.now();
        if let Some(deadline) = now.checked_add(delay.min(MAX_DEFERRAL)) {
            self.defer_until(deadline);
        }
    }

    /// Hold admissions until `deadline`
    ///
    /// No-op unless `respect_retry_after` is enabled. An earlier deadline
    /// never shortens a later one already in force.
    pub fn defer_until(&self, deadline: Instant) {
        if !self.config.respect_retry_after {
            return;
        }

        let mut state = self.state.lock();
        if state.blocked_until.map_or(true, |current| deadline > current) {
            debug!(
                delay_ms =
                    deadline.saturating_duration_since(self.clock.now()).as_millis() as u64,
                "Deferring admissions on server signal"
            );
            state.blocked_until = Some(deadline);
        }
    }

    /// Pause admissions after a 429 that carried no wait hint
    ///
    /// The pause is `backoff_factor` refill intervals, i.e. the time the
    /// bucket needs to accrue `backoff_factor` tokens.
    pub fn throttle(&self) {
        let penalty = Duration::from_secs_f64(self.config.backoff_factor / self.rate);
        self.defer_for(penalty);
    }

    /// Refill the bucket to capacity and clear any deadline
    pub fn reset(&self) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.tokens = self.capacity;
        state.last_refill = now;
        state.blocked_until = None;
    }

    fn poll_token(&self) -> Result<(), Duration> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.refill(&mut state, now);

        match self.wait_for(&state, now) {
            Some(wait) => Err(wait),
            None => {
                state.tokens = (state.tokens - 1.0).max(0.0);
                Ok(())
            }
        }
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.capacity);
        state.last_refill = now;

        if state.blocked_until.is_some_and(|deadline| deadline <= now) {
            state.blocked_until = None;
        }
    }

    fn wait_for(&self, state: &BucketState, now: Instant) -> Option<Duration> {
        if let Some(deadline) = state.blocked_until {
            return Some(deadline.saturating_duration_since(now));
        }

        if state.tokens >= 1.0 - TOKEN_EPSILON {
            None
        } else {
            Some(Duration::from_secs_f64((1.0 - state.tokens) / self.rate))
        }
    }
}
