//! HTTP transport
//!
//! [`HttpClient`] owns the connection pool and resolves request paths against
//! the configured base URL. [`headers`] interprets the rate-limit headers
//! upstream services send back.

pub mod client;
pub mod headers;

pub use client::{HttpClient, HttpClientBuilder};
pub use headers::{parse_rate_limit_reset, parse_retry_after, quota_exhausted, wait_hint, MAX_WAIT_HINT};
