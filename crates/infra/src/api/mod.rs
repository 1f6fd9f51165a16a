//! Outbound API client
//!
//! [`ApiClient`] composes credential injection ([`AuthManager`]), rate
//! limiting, circuit breaking and retries around one transport call.
//! Callers describe what to send with [`ApiRequest`] (or a
//! [`RequestBuilder`]) and how to read the answer with a [`ResponseParser`].

pub mod auth;
pub mod client;
pub mod errors;
pub mod metrics;
pub mod request;
pub mod response;

pub use auth::{AccessToken, AuthManager, OAuth2TokenEndpoint, TokenGrant, TokenSource};
pub use client::{ApiClient, ApiClientBuilder};
pub use errors::{AuthError, IntegrationError};
pub use metrics::{ClientMetrics, MetricsCollector};
pub use request::{ApiRequest, RequestBody, RequestBuilder};
pub use response::{JsonParser, RawParser, Response, ResponseBody, ResponseMetadata, ResponseParser};
