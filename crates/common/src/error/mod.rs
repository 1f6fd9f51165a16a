//! Error classification shared by every Conduit layer
//!
//! Two pieces live here:
//!
//! 1. **`ConfigError`**: the single error type returned by every `validate()`
//!    on configuration structs, in this crate and in the HTTP layer above it.
//!
//! 2. **`ErrorClassification` trait**: a standard interface for classifying
//!    errors by their characteristics (retryability, severity, criticality,
//!    server wait hints). Higher layers implement it on their own taxonomies
//!    so callers can branch on behaviour instead of matching variants.
//!
//! ## ErrorSeverity Levels
//!
//! - **Info**: expected conditions, e.g. a breaker rejecting a call
//! - **Warning**: transient issues that were, or may be, retried
//! - **Error**: terminal failures of a single call
//! - **Critical**: failures that need operator attention (bad credentials)
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//!
//! use conduit_common::error::{ErrorClassification, ErrorSeverity};
//!
//! #[derive(Debug)]
//! enum UpstreamError {
//!     Busy(Duration),
//!     Rejected,
//! }
//!
//! impl ErrorClassification for UpstreamError {
//!     fn is_retryable(&self) -> bool {
//!         matches!(self, Self::Busy(_))
//!     }
//!
//!     fn severity(&self) -> ErrorSeverity {
//!         match self {
//!             Self::Busy(_) => ErrorSeverity::Warning,
//!             Self::Rejected => ErrorSeverity::Error,
//!         }
//!     }
//!
//!     fn is_critical(&self) -> bool {
//!         false
//!     }
//!
//!     fn retry_after(&self) -> Option<Duration> {
//!         match self {
//!             Self::Busy(wait) => Some(*wait),
//!             Self::Rejected => None,
//!         }
//!     }
//! }
//!
//! assert!(UpstreamError::Busy(Duration::from_secs(1)).is_retryable());
//! ```

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Configuration validation error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A field holds a value outside its permitted range
    #[error("Invalid configuration for `{field}`: {message}")]
    Invalid { field: &'static str, message: String },

    /// A required value is absent
    #[error("Missing configuration value: {0}")]
    Missing(String),

    /// The configuration source could not be read or parsed
    #[error("Failed to load configuration: {0}")]
    Load(String),
}

impl ConfigError {
    /// Shorthand for [`ConfigError::Invalid`]
    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid { field, message: message.into() }
    }
}

/// Configuration result type
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Trait for classifying errors by their handling characteristics
///
/// This trait provides a standard interface for determining how errors should
/// be handled, logged, and monitored.
pub trait ErrorClassification {
    /// Check if this error is retryable
    ///
    /// Retryable errors are typically transient issues that may succeed if
    /// attempted again, such as:
    /// - Network timeouts
    /// - Rate limiting
    /// - Temporary service unavailability
    fn is_retryable(&self) -> bool;

    /// Get the error severity level
    ///
    /// Used for monitoring, alerting, and logging decisions.
    fn severity(&self) -> ErrorSeverity;

    /// Check if this is a critical error requiring immediate attention
    fn is_critical(&self) -> bool;

    /// Get the suggested retry delay if applicable
    ///
    /// Returns `Some(Duration)` when a specific retry delay is recommended
    /// (e.g., from a Retry-After header), or `None` otherwise.
    fn retry_after(&self) -> Option<Duration>;
}

/// Error severity levels for monitoring and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Informational, typically for debugging
    Info,
    /// Warning, should be monitored but not critical
    Warning,
    /// Error, requires attention and action
    Error,
    /// Critical, immediate action required
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}
