//! Resilience policies composed around a single outbound call
//!
//! - **Rate limiting**: continuous token bucket with server-signalled
//!   deadlines ([`RateLimiter`])
//! - **Circuit breaker**: Closed/Open/HalfOpen failure gate with
//!   drop-safe admission permits ([`CircuitBreaker`])
//! - **Retry**: fixed, linear or exponential backoff with jitter and
//!   cancellation ([`RetryHandler`])
//!
//! Breaker and limiter read time through the [`Clock`] trait. The default
//! [`SystemClock`] follows the tokio clock, so `tokio::time::pause()` makes
//! async tests deterministic; [`MockClock`] covers synchronous tests.
//!
//! None of these types hold a lock across an `.await`. Shared use is done by
//! wrapping them in an `Arc`.

pub mod circuit_breaker;
pub mod clock;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigBuilder, CircuitBreakerSnapshot,
    CircuitPermit, CircuitState,
};
pub use clock::{Clock, MockClock, SystemClock};
pub use rate_limiter::{RateLimitConfig, RateLimiter, MAX_DEFERRAL};
pub use retry::{
    AttemptOutcome, BackoffStrategy, RetryConfig, RetryConfigBuilder, RetryError, RetryHandler,
    RetryOutcome,
};
