//! API-specific error types
//!
//! Every terminal outcome of [`ApiClient`](super::ApiClient) is one
//! [`IntegrationError`] variant, so callers can tell "we chose not to call"
//! (`CircuitOpen`, `RateLimitTimeout`) apart from "the call failed".

use std::time::Duration;

use conduit_common::{ConfigError, ErrorClassification, ErrorSeverity};
use thiserror::Error;

/// Longest response body excerpt kept on an error.
const BODY_EXCERPT_LIMIT: usize = 1024;

/// Credential acquisition or injection failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Missing credentials: {0}")]
    MissingCredentials(String),

    #[error("Token endpoint returned {status}: {message}")]
    TokenEndpoint { status: u16, message: String },

    #[error("Token endpoint unreachable: {0}")]
    Transport(String),

    #[error("Invalid token response: {0}")]
    InvalidTokenResponse(String),

    #[error("Unsupported credential placement: {0}")]
    UnsupportedPlacement(String),

    #[error("Invalid credential header: {0}")]
    InvalidHeader(String),
}

/// Terminal outcome of a failed API call
#[derive(Debug, Error)]
pub enum IntegrationError {
    /// Credentials could not be obtained; never retried
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// The caller gave up while waiting for a rate-limit token
    #[error("Gave up waiting for a rate-limit token after {waited:?}")]
    RateLimitTimeout { waited: Duration },

    /// The breaker rejected the call without touching the network
    #[error("Circuit breaker open for '{client}'")]
    CircuitOpen { client: String, retry_in: Option<Duration> },

    /// A retryable status persisted through every permitted attempt
    #[error("HTTP {status} from {url} after {attempts} attempts")]
    RetryableHttp {
        status: u16,
        url: String,
        body: String,
        attempts: u32,
        retry_after: Option<Duration>,
    },

    #[error("HTTP {status} from {url}")]
    FatalHttp { status: u16, url: String, body: String, attempts: u32 },

    #[error("Request to {url} timed out after {attempts} attempts")]
    Timeout {
        url: String,
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },

    #[error("Network error calling {url} after {attempts} attempts")]
    Network {
        url: String,
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },

    /// The caller cancelled during backoff or transport I/O
    #[error("Call cancelled after {attempts} completed attempts")]
    Cancelled { attempts: u32 },

    #[error("Failed to parse response: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl IntegrationError {
    /// Build an HTTP error for `status`, truncating the body excerpt
    pub(crate) fn http(
        retryable: bool,
        status: u16,
        url: impl Into<String>,
        body: &str,
        retry_after: Option<Duration>,
    ) -> Self {
        let url = url.into();
        let body = excerpt(body);
        if retryable {
            Self::RetryableHttp { status, url, body, attempts: 1, retry_after }
        } else {
            Self::FatalHttp { status, url, body, attempts: 1 }
        }
    }

    /// HTTP status, for the HTTP variants
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::RetryableHttp { status, .. } | Self::FatalHttp { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Physical attempts made before this error surfaced
    pub fn attempts(&self) -> u32 {
        match self {
            Self::RetryableHttp { attempts, .. }
            | Self::FatalHttp { attempts, .. }
            | Self::Timeout { attempts, .. }
            | Self::Network { attempts, .. }
            | Self::Cancelled { attempts } => *attempts,
            _ => 0,
        }
    }

    /// Replace the attempt count once the retry loop has finished
    pub(crate) fn with_attempts(mut self, total: u32) -> Self {
        match &mut self {
            Self::RetryableHttp { attempts, .. }
            | Self::FatalHttp { attempts, .. }
            | Self::Timeout { attempts, .. }
            | Self::Network { attempts, .. }
            | Self::Cancelled { attempts } => *attempts = total,
            _ => {}
        }
        self
    }

    /// Whether the error is a transport failure rather than an HTTP status
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Network { .. })
    }
}

impl ErrorClassification for IntegrationError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RetryableHttp { .. }
                | Self::Timeout { .. }
                | Self::Network { .. }
                | Self::CircuitOpen { .. }
        )
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Auth(_) | Self::Config(_) => ErrorSeverity::Critical,
            Self::CircuitOpen { .. } | Self::Cancelled { .. } => ErrorSeverity::Info,
            Self::RetryableHttp { .. }
            | Self::Timeout { .. }
            | Self::Network { .. }
            | Self::RateLimitTimeout { .. } => ErrorSeverity::Warning,
            Self::FatalHttp { .. } | Self::Parse(_) => ErrorSeverity::Error,
        }
    }

    fn is_critical(&self) -> bool {
        self.severity() == ErrorSeverity::Critical
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RetryableHttp { retry_after, .. } => *retry_after,
            Self::CircuitOpen { retry_in, .. } => *retry_in,
            _ => None,
        }
    }
}

fn excerpt(body: &str) -> String {
    if body.len() <= BODY_EXCERPT_LIMIT {
        return body.to_string();
    }
    let mut end = BODY_EXCERPT_LIMIT;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}
