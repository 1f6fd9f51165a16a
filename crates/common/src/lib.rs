//! Resilience building blocks shared across Conduit integration crates.
//!
//! Nothing in this crate knows about HTTP. It provides the policies an
//! outbound client composes around a single network call:
//! - [`resilience::RateLimiter`]: token-bucket admission control
//! - [`resilience::CircuitBreaker`]: three-state failure gate
//! - [`resilience::RetryHandler`]: backoff, jitter, and attempt classification
//!
//! plus the [`error::ErrorClassification`] contract used by higher layers.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod error;
pub mod resilience;
pub mod utils;

// Re-export commonly used types and traits for convenience
// ------------------------
pub use error::{ConfigError, ConfigResult, ErrorClassification, ErrorSeverity};
pub use resilience::{
    AttemptOutcome, BackoffStrategy, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerSnapshot, CircuitPermit, CircuitState, Clock, MockClock, RateLimitConfig,
    RateLimiter, RetryConfig, RetryError, RetryHandler, RetryOutcome, SystemClock,
};
pub use utils::serde::{duration_millis, duration_secs};
