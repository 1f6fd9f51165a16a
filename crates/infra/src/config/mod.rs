//! Client configuration
//!
//! A [`ClientConfig`] describes one upstream API: where it lives, how to
//! authenticate, and which resilience policies wrap each call. It is built
//! once (in code or through [`loader`]) and never mutated after the client is
//! constructed.
//!
//! ```toml
//! name = "billing"
//! base_url = "https://billing.example.com/v2"
//! timeout = 15.0
//!
//! [auth]
//! scheme = "oauth2"
//! client_id = "conduit"
//! client_secret = "s3cr3t"
//! token_url = "https://auth.example.com/oauth/token"
//!
//! [rate_limit]
//! max_requests = 50
//! window_seconds = 1.0
//!
//! [retry]
//! max_retries = 3
//! strategy = "exponential"
//! ```

pub mod loader;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use conduit_common::resilience::{CircuitBreakerConfig, RateLimitConfig, RetryConfig};
use conduit_common::utils::serde::duration_secs;
use conduit_common::{ConfigError, ConfigResult};
use reqwest::header::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use url::Url;

// Re-export commonly used items
pub use loader::{apply_env_overrides, from_json_str, from_toml_str, load, load_from_file};

/// Credential material whose `Debug` output is redacted
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw secret, for placing on the wire
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Where an API key is attached to the request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiKeyPlacement {
    #[default]
    Header,
    Query,
    Body,
}

fn default_api_key_name() -> String {
    "X-API-Key".to_string()
}

const fn default_refresh_margin() -> Duration {
    Duration::from_secs(30)
}

/// OAuth2 client settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuth2Config {
    pub client_id: String,
    pub client_secret: Secret,
    pub token_url: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Initial refresh token; when absent the client-credentials grant is used
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<Secret>,
    /// Refresh this long before the access token expires
    #[serde(default = "default_refresh_margin", with = "duration_secs")]
    pub refresh_margin: Duration,
}

impl OAuth2Config {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<Secret>,
        token_url: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token_url: token_url.into(),
            scopes: Vec::new(),
            refresh_token: None,
            refresh_margin: default_refresh_margin(),
        }
    }
}

/// Credential-injection strategy, selected by `scheme`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum AuthConfig {
    #[default]
    None,
    ApiKey {
        #[serde(default = "default_api_key_name")]
        name: String,
        value: Secret,
        #[serde(default)]
        placement: ApiKeyPlacement,
    },
    Bearer {
        token: Secret,
    },
    Basic {
        username: String,
        password: Secret,
    },
    #[serde(rename = "oauth2")]
    OAuth2(OAuth2Config),
    /// Arbitrary headers and query parameters
    Custom {
        #[serde(default)]
        headers: BTreeMap<String, Secret>,
        #[serde(default)]
        params: BTreeMap<String, Secret>,
    },
}

impl AuthConfig {
    /// Scheme name as written in configuration files
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::ApiKey { .. } => "api_key",
            Self::Bearer { .. } => "bearer",
            Self::Basic { .. } => "basic",
            Self::OAuth2(_) => "oauth2",
            Self::Custom { .. } => "custom",
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        match self {
            Self::None => Ok(()),
            Self::ApiKey { name, value, placement } => {
                if name.is_empty() {
                    return Err(ConfigError::invalid("auth.name", "API key name is empty"));
                }
                if value.is_empty() {
                    return Err(ConfigError::Missing("auth.value".to_string()));
                }
                if *placement == ApiKeyPlacement::Header {
                    validate_header("auth.name", name, value.expose())?;
                }
                Ok(())
            }
            Self::Bearer { token } => {
                if token.is_empty() {
                    return Err(ConfigError::Missing("auth.token".to_string()));
                }
                validate_header("auth.token", "authorization", token.expose())
            }
            Self::Basic { username, .. } => {
                if username.is_empty() {
                    return Err(ConfigError::Missing("auth.username".to_string()));
                }
                Ok(())
            }
            Self::OAuth2(oauth) => {
                if oauth.client_id.is_empty() {
                    return Err(ConfigError::Missing("auth.client_id".to_string()));
                }
                Url::parse(&oauth.token_url).map_err(|e| {
                    ConfigError::invalid("auth.token_url", format!("{}: {e}", oauth.token_url))
                })?;
                Ok(())
            }
            Self::Custom { headers, .. } => {
                for (name, value) in headers {
                    validate_header("auth.headers", name, value.expose())?;
                }
                Ok(())
            }
        }
    }
}

/// Per-request logging verbosity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log method, URL and attempt number of every physical request
    pub log_requests: bool,
    /// Log status and latency of every response
    pub log_responses: bool,
    /// Log response bodies; off by default since bodies may carry secrets
    pub log_response_body: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { log_requests: true, log_responses: true, log_response_body: false }
    }
}

/// Configuration for one upstream API client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Name used in logs and errors
    pub name: String,
    /// Base URL that relative request paths are joined onto
    pub base_url: String,
    pub default_headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Total time budget of one physical request, body included
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
    /// Concurrent in-flight requests
    pub max_connections: usize,
    /// Idle connections kept per host
    pub max_keepalive_connections: usize,
    pub logging: LoggingConfig,
    pub auth: AuthConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    /// Absent means a single attempt per call
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            base_url: String::new(),
            default_headers: BTreeMap::new(),
            user_agent: None,
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_connections: 100,
            max_keepalive_connections: 20,
            logging: LoggingConfig::default(),
            auth: AuthConfig::None,
            rate_limit: None,
            circuit_breaker: None,
            retry: None,
        }
    }
}

impl ClientConfig {
    /// Configuration with defaults for everything but name and base URL
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self { name: name.into(), base_url: base_url.into(), ..Self::default() }
    }

    #[must_use]
    pub fn with_auth(mut self, auth: AuthConfig) -> Self {
        self.auth = auth;
        self
    }

    #[must_use]
    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    #[must_use]
    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(circuit_breaker);
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    #[must_use]
    pub fn with_timeouts(mut self, timeout: Duration, connect_timeout: Duration) -> Self {
        self.timeout = timeout;
        self.connect_timeout = connect_timeout;
        self
    }

    /// Validate this configuration and every nested policy
    pub fn validate(&self) -> ConfigResult<()> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::invalid("name", "client name is empty"));
        }

        let url = Url::parse(&self.base_url)
            .map_err(|e| ConfigError::invalid("base_url", format!("'{}': {e}", self.base_url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::invalid(
                "base_url",
                format!("unsupported scheme '{}'", url.scheme()),
            ));
        }

        if self.timeout.is_zero() {
            return Err(ConfigError::invalid("timeout", "must be greater than 0"));
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::invalid("connect_timeout", "must be greater than 0"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::invalid("max_connections", "must be greater than 0"));
        }

        for (name, value) in &self.default_headers {
            validate_header("default_headers", name, value)?;
        }

        self.auth.validate()?;
        if let Some(rate_limit) = &self.rate_limit {
            rate_limit.validate()?;
        }
        if let Some(circuit_breaker) = &self.circuit_breaker {
            circuit_breaker.validate()?;
        }
        if let Some(retry) = &self.retry {
            retry.validate()?;
        }

        Ok(())
    }
}

fn validate_header(field: &'static str, name: &str, value: &str) -> ConfigResult<()> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| ConfigError::invalid(field, format!("invalid header name '{name}'")))?;
    HeaderValue::from_str(value)
        .map_err(|_| ConfigError::invalid(field, format!("invalid value for header '{name}'")))?;
    Ok(())
}
