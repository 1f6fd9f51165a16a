//! # Conduit Infrastructure
//!
//! HTTP-facing half of the Conduit integration framework.
//!
//! This crate contains:
//! - Client configuration and its file/env loader
//! - The shared reqwest transport ([`http::HttpClient`])
//! - Credential injection, including single-flight OAuth2 refresh
//!   ([`api::AuthManager`])
//! - The [`api::ApiClient`] orchestrator, which wraps every logical call in
//!   auth, rate limiting, circuit breaking and retries
//!
//! ## Architecture
//! - Resilience policies come from `conduit-common` and know nothing about
//!   HTTP
//! - Everything that performs I/O lives here

pub mod api;
pub mod config;
pub mod http;
pub mod observability;

// Re-export commonly used items
pub use api::{
    ApiClient, ApiRequest, AuthError, AuthManager, ClientMetrics, IntegrationError, JsonParser,
    RawParser, RequestBody, RequestBuilder, Response, ResponseBody, ResponseParser,
};
pub use config::{ApiKeyPlacement, AuthConfig, ClientConfig, LoggingConfig, OAuth2Config, Secret};
