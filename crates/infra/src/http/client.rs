use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use conduit_common::{ConfigError, ConfigResult};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client as ReqwestClient, Method, Request, RequestBuilder, Response};
use tokio::sync::Semaphore;
use tracing::debug;

use crate::config::ClientConfig;

/// Pooled HTTP transport bound to one base URL.
///
/// Performs exactly one physical request per [`send`](Self::send) or
/// [`send_with`](Self::send_with); retry and admission policies live above
/// this layer.
///
/// At most `max_connections` requests hold a connection slot at once. A slot
/// covers the response body only inside `send_with`.
#[derive(Clone)]
pub struct HttpClient {
    client: ReqwestClient,
    base_url: String,
    in_flight: Arc<Semaphore>,
}

impl HttpClient {
    /// Start building a new HTTP client.
    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::default()
    }

    /// Build the transport described by a client configuration.
    pub fn from_config(config: &ClientConfig) -> ConfigResult<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.default_headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                ConfigError::invalid("default_headers", format!("invalid header name '{name}'"))
            })?;
            let value = HeaderValue::from_str(value).map_err(|_| {
                ConfigError::invalid("default_headers", format!("invalid value for header '{name}'"))
            })?;
            headers.insert(name, value);
        }

        let mut builder = Self::builder()
            .base_url(&config.base_url)
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .max_connections(config.max_connections)
            .max_idle_per_host(config.max_keepalive_connections)
            .default_headers(headers);
        if let Some(agent) = &config.user_agent {
            builder = builder.user_agent(agent);
        }
        builder.build()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Resolve `path` against the base URL.
    ///
    /// Absolute `http(s)://` URLs are returned unchanged.
    pub fn resolve(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            self.base_url.clone()
        } else {
            format!("{}/{path}", self.base_url)
        }
    }

    /// Create a request builder using the underlying reqwest client.
    pub fn request<U>(&self, method: Method, url: U) -> RequestBuilder
    where
        U: reqwest::IntoUrl,
    {
        self.client.request(method, url)
    }

    /// Send one request and return once the response head arrives.
    ///
    /// The connection slot is released before the body is read.
    pub async fn send(&self, request: Request) -> Result<Response, reqwest::Error> {
        self.send_with(request, |response| std::future::ready(Ok(response))).await
    }

    /// Send one request and run `read` on the response while still holding
    /// the connection slot.
    pub async fn send_with<T, F, Fut>(&self, request: Request, read: F) -> Result<T, reqwest::Error>
    where
        F: FnOnce(Response) -> Fut,
        Fut: Future<Output = Result<T, reqwest::Error>>,
    {
        // The semaphore is never closed, so acquisition only fails on shutdown.
        let _slot = self.in_flight.acquire().await.ok();

        let method = request.method().clone();
        let url = request.url().clone();
        debug!(%method, %url, "sending HTTP request");

        match self.client.execute(request).await {
            Ok(response) => {
                debug!(%method, %url, status = %response.status(), "received HTTP response");
                read(response).await
            }
            Err(err) => {
                debug!(%method, %url, error = %err, "HTTP request failed");
                Err(err)
            }
        }
    }

    /// The underlying reqwest client, shared with the token endpoint.
    pub fn inner(&self) -> ReqwestClient {
        self.client.clone()
    }

    /// Connection slots not currently in use.
    pub fn available_slots(&self) -> usize {
        self.in_flight.available_permits()
    }
}

/// Builder for [`HttpClient`].
#[derive(Debug)]
pub struct HttpClientBuilder {
    base_url: String,
    timeout: Duration,
    connect_timeout: Duration,
    max_connections: usize,
    max_idle_per_host: usize,
    user_agent: Option<String>,
    default_headers: Option<HeaderMap>,
}

impl Default for HttpClientBuilder {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_connections: 100,
            max_idle_per_host: 20,
            user_agent: None,
            default_headers: None,
        }
    }
}

impl HttpClientBuilder {
    /// Base URL relative paths are joined onto; a trailing `/` is dropped.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// Total budget of one request, response body included.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max.max(1);
        self
    }

    pub fn max_idle_per_host(mut self, max: usize) -> Self {
        self.max_idle_per_host = max;
        self
    }

    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }

    pub fn default_headers(mut self, headers: HeaderMap) -> Self {
        self.default_headers = Some(headers);
        self
    }

    pub fn build(self) -> ConfigResult<HttpClient> {
        let mut builder = ReqwestClient::builder()
            .timeout(self.timeout)
            .connect_timeout(self.connect_timeout)
            .pool_max_idle_per_host(self.max_idle_per_host)
            .no_proxy();

        if let Some(agent) = self.user_agent {
            builder = builder.user_agent(agent);
        }

        if let Some(headers) = self.default_headers {
            builder = builder.default_headers(headers);
        }

        let client = builder
            .build()
            .map_err(|err| ConfigError::invalid("http_client", err.to_string()))?;

        Ok(HttpClient {
            client,
            base_url: self.base_url,
            in_flight: Arc::new(Semaphore::new(self.max_connections.max(1))),
        })
    }
}
