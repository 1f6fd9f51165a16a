//! Three-state circuit breaker guarding a single downstream target
//!
//! ```text
//!            failures >= failure_threshold
//!   Closed ─────────────────────────────────▶ Open
//!     ▲                                       │  recovery_timeout elapsed,
//!     │ successes >= success_threshold        │  next admission is a trial
//!     │                                       ▼
//!     └─────────────────────────────────── HalfOpen
//!                 any failure ──────────────▶ Open
//! ```
//!
//! All bookkeeping happens under one short `parking_lot::Mutex` critical
//! section. Callers never hold it across the protected operation: admission
//! hands out a [`CircuitPermit`] and the verdict is reported when the
//! operation finishes.

use std::collections::BTreeSet;
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::clock::{Clock, SystemClock};
use crate::error::{ConfigError, ConfigResult};
use crate::utils::serde::duration_secs;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, allowing requests
    Closed,
    /// Circuit is open, rejecting requests
    Open,
    /// Circuit is half-open, allowing a bounded number of trial requests
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

fn default_failure_status_codes() -> BTreeSet<u16> {
    [500, 502, 503, 504].into_iter().collect()
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time the circuit stays open before a trial call is admitted
    #[serde(rename = "recovery_timeout_seconds", with = "duration_secs")]
    pub recovery_timeout: Duration,
    /// Consecutive half-open successes that close the circuit
    pub success_threshold: u32,
    /// Concurrent trial calls admitted while half-open
    pub half_open_max_calls: u32,
    /// HTTP statuses counted as downstream failures
    pub failure_status_codes: BTreeSet<u16>,
    /// Whether timeouts and network errors count as failures
    pub count_timeouts_as_failures: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 2,
            half_open_max_calls: 1,
            failure_status_codes: default_failure_status_codes(),
            count_timeouts_as_failures: true,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration builder
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid(
                "circuit_breaker.failure_threshold",
                "must be greater than 0",
            ));
        }

        if self.success_threshold == 0 {
            return Err(ConfigError::invalid(
                "circuit_breaker.success_threshold",
                "must be greater than 0",
            ));
        }

        if self.half_open_max_calls == 0 {
            return Err(ConfigError::invalid(
                "circuit_breaker.half_open_max_calls",
                "must be greater than 0",
            ));
        }

        if let Some(code) = self.failure_status_codes.iter().find(|c| !(100..=599).contains(*c)) {
            return Err(ConfigError::invalid(
                "circuit_breaker.failure_status_codes",
                format!("{code} is not an HTTP status code"),
            ));
        }

        Ok(())
    }

    /// Whether a response status counts against downstream health
    pub fn is_failure_status(&self, status: u16) -> bool {
        self.failure_status_codes.contains(&status)
    }
}

/// Builder for [`CircuitBreakerConfig`]
#[derive(Debug, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn recovery_timeout(mut self, timeout: Duration) -> Self {
        self.config.recovery_timeout = timeout;
        self
    }

    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    pub fn half_open_max_calls(mut self, max_calls: u32) -> Self {
        self.config.half_open_max_calls = max_calls;
        self
    }

    pub fn failure_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.config.failure_status_codes = codes.into_iter().collect();
        self
    }

    pub fn count_timeouts_as_failures(mut self, enabled: bool) -> Self {
        self.config.count_timeouts_as_failures = enabled;
        self
    }

    pub fn build(self) -> ConfigResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Point-in-time view of a breaker, for metrics and health endpoints
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    /// Time since the circuit last opened, if it is not closed
    pub open_for: Option<Duration>,
    pub half_open_in_flight: u32,
    /// Calls rejected since creation or the last reset
    pub rejections: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
    rejections: u64,
    // Bumped on every transition so verdicts from an older state are ignored.
    generation: u64,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            half_open_in_flight: 0,
            rejections: 0,
            generation: 0,
        }
    }

    fn transition(&mut self, to: CircuitState, now: Instant) {
        let from = self.state;
        self.state = to;
        self.generation = self.generation.wrapping_add(1);
        self.consecutive_successes = 0;
        self.half_open_in_flight = 0;

        match to {
            CircuitState::Open => {
                self.opened_at = Some(now);
                warn!(
                    %from,
                    consecutive_failures = self.consecutive_failures,
                    "Circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                info!(%from, "Circuit breaker half-open, admitting trial calls");
            }
            CircuitState::Closed => {
                self.consecutive_failures = 0;
                self.opened_at = None;
                info!(%from, "Circuit breaker closed");
            }
        }
    }
}

/// Admission ticket returned by [`CircuitBreaker::try_acquire`]
///
/// Report the outcome with [`success`](Self::success) or
/// [`failure`](Self::failure). Dropping the permit without a verdict releases
/// its half-open trial slot and leaves the counters untouched.
#[must_use = "a permit should be resolved with success() or failure()"]
pub struct CircuitPermit<'a, C: Clock = SystemClock> {
    breaker: &'a CircuitBreaker<C>,
    trial: bool,
    generation: u64,
    settled: bool,
}

impl<C: Clock> CircuitPermit<'_, C> {
    /// Whether this permit was issued as a half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Record a healthy outcome for the admitted call
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.settle(Some(self.generation), self.trial, true);
    }

    /// Record a downstream failure for the admitted call
    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.settle(Some(self.generation), self.trial, false);
    }
}

impl<C: Clock> Drop for CircuitPermit<'_, C> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial(self.generation);
        }
    }
}

impl<C: Clock> fmt::Debug for CircuitPermit<'_, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitPermit")
            .field("trial", &self.trial)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Circuit breaker with a pluggable [`Clock`]
pub struct CircuitBreaker<C: Clock = SystemClock> {
    config: CircuitBreakerConfig,
    clock: C,
    inner: Mutex<BreakerInner>,
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker<SystemClock> {
    /// Create a breaker on the system clock
    pub fn new(config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a breaker with a custom clock (useful for testing)
    pub fn with_clock(config: CircuitBreakerConfig, clock: C) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self { config, clock, inner: Mutex::new(BreakerInner::new()) })
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state as last recorded
    ///
    /// An open breaker whose recovery timeout has elapsed still reports
    /// `Open` until the next admission attempt moves it to half-open.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Admit a call, or return `None` when the circuit rejects it
    pub fn try_acquire(&self) -> Option<CircuitPermit<'_, C>> {
        self.admit().map(|(trial, generation)| CircuitPermit {
            breaker: self,
            trial,
            generation,
            settled: false,
        })
    }

    /// Boolean admission check
    ///
    /// A `true` result takes a half-open slot when applicable; the caller must
    /// report the outcome through [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure).
    pub fn allow(&self) -> bool {
        self.admit().is_some()
    }

    /// Record a healthy outcome against the current state
    pub fn record_success(&self) {
        self.settle(None, self.state() == CircuitState::HalfOpen, true);
    }

    /// Record a downstream failure against the current state
    pub fn record_failure(&self) {
        self.settle(None, self.state() == CircuitState::HalfOpen, false);
    }

    /// Time left before an open circuit admits a trial call
    pub fn remaining_open_time(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened_at)) => Some(
                self.config
                    .recovery_timeout
                    .saturating_sub(self.clock.now().saturating_duration_since(opened_at)),
            ),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let now = self.clock.now();
        let inner = self.inner.lock();
        CircuitBreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            open_for: inner.opened_at.map(|at| now.saturating_duration_since(at)),
            half_open_in_flight: inner.half_open_in_flight,
            rejections: inner.rejections,
        }
    }

    /// Force the breaker back to `Closed` and clear every counter
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        let generation = inner.generation.wrapping_add(1);
        *inner = BreakerInner::new();
        inner.generation = generation;
        info!("Circuit breaker reset");
    }

    fn admit(&self) -> Option<(bool, u64)> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => Some((false, inner.generation)),
            CircuitState::Open => {
                let elapsed =
                    inner.opened_at.map_or(Duration::MAX, |at| now.saturating_duration_since(at));
                if elapsed >= self.config.recovery_timeout {
                    inner.transition(CircuitState::HalfOpen, now);
                    inner.half_open_in_flight = 1;
                    Some((true, inner.generation))
                } else {
                    inner.rejections += 1;
                    debug!(
                        remaining_ms =
                            self.config.recovery_timeout.saturating_sub(elapsed).as_millis() as u64,
                        "Circuit breaker rejecting call"
                    );
                    None
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_max_calls {
                    inner.half_open_in_flight += 1;
                    Some((true, inner.generation))
                } else {
                    inner.rejections += 1;
                    debug!(
                        in_flight = inner.half_open_in_flight,
                        "Circuit breaker rejecting call, trial slots exhausted"
                    );
                    None
                }
            }
        }
    }

    fn settle(&self, generation: Option<u64>, trial: bool, success: bool) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        if generation.is_some_and(|g| g != inner.generation) {
            debug!(success, "Ignoring verdict issued before the last state transition");
            return;
        }

        match inner.state {
            CircuitState::Closed => {
                if success {
                    inner.consecutive_failures = 0;
                } else {
                    inner.consecutive_failures += 1;
                    if inner.consecutive_failures >= self.config.failure_threshold {
                        inner.transition(CircuitState::Open, now);
                    }
                }
            }
            CircuitState::HalfOpen => {
                if trial {
                    inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                }
                if success {
                    inner.consecutive_successes += 1;
                    if inner.consecutive_successes >= self.config.success_threshold {
                        inner.transition(CircuitState::Closed, now);
                    }
                } else {
                    inner.consecutive_failures += 1;
                    inner.transition(CircuitState::Open, now);
                }
            }
            CircuitState::Open => {
                debug!(success, "Verdict recorded while circuit is open, ignoring");
            }
        }
    }

    fn release_trial(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation == generation && inner.state == CircuitState::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }
}
