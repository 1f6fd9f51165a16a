//! API client with rate limiting, circuit breaking and retry
//!
//! Every logical call runs the same sequence, each step able to short-circuit
//! the rest:
//!
//! 1. attach credentials
//! 2. take a rate-limit token (may wait)
//! 3. ask the circuit breaker for a permit
//! 4. run the retry loop; each attempt, the first included, re-attaches
//!    credentials and performs exactly one transport call
//! 5. record the breaker verdict and metrics once for the logical call
//!
//! One rate-limit token is taken per logical call unless the limiter is
//! configured with `acquire_per_attempt`, in which case every retry takes
//! its own token before sending.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use conduit_common::resilience::{
    AttemptOutcome, CircuitBreaker, CircuitState, RateLimiter, RetryConfig, RetryError,
    RetryHandler,
};
use conduit_common::ConfigError;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::auth::AuthManager;
use super::errors::IntegrationError;
use super::metrics::{ClientMetrics, MetricsCollector};
use super::request::{ApiRequest, RequestBuilder};
use super::response::{Response, ResponseMetadata, ResponseParser};
use crate::config::ClientConfig;
use crate::http::headers::{self, RATE_LIMIT_RESET, RETRY_AFTER};
use crate::http::HttpClient;

struct ClientInner {
    config: ClientConfig,
    http: HttpClient,
    auth: AuthManager,
    rate_limiter: Option<RateLimiter>,
    circuit_breaker: Option<CircuitBreaker>,
    retry: RetryHandler,
    metrics: MetricsCollector,
}

/// Resilient client for one upstream API
///
/// Cheap to clone; clones share the connection pool, token cache, limiter,
/// breaker and metrics.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("name", &self.inner.config.name)
            .field("base_url", &self.inner.config.base_url)
            .field("auth", &self.inner.auth)
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    /// Create a client from a configuration
    ///
    /// # Errors
    ///
    /// Returns `IntegrationError::Config` if the configuration is invalid or
    /// the HTTP transport cannot be built
    pub fn new(config: ClientConfig) -> Result<Self, IntegrationError> {
        Self::builder().config(config).build()
    }

    /// Create a builder for the API client
    pub fn builder() -> ApiClientBuilder {
        ApiClientBuilder::default()
    }

    fn from_parts(config: ClientConfig, auth: Option<AuthManager>) -> Result<Self, IntegrationError> {
        config.validate()?;

        let http = HttpClient::from_config(&config)?;
        let auth = auth.unwrap_or_else(|| AuthManager::from_config(&config.auth, http.inner()));
        let rate_limiter = config.rate_limit.clone().map(RateLimiter::new).transpose()?;
        let circuit_breaker = config.circuit_breaker.clone().map(CircuitBreaker::new).transpose()?;
        let retry = RetryHandler::new(config.retry.clone().unwrap_or_else(RetryConfig::no_retry))?;

        info!(
            client = %config.name,
            base_url = %config.base_url,
            auth = auth.scheme(),
            rate_limited = rate_limiter.is_some(),
            circuit_breaker = circuit_breaker.is_some(),
            max_retries = retry.config().max_retries,
            "API client created"
        );

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                http,
                auth,
                rate_limiter,
                circuit_breaker,
                retry,
                metrics: MetricsCollector::new(),
            }),
        })
    }

    /// Execute a request under every configured policy
    ///
    /// Returns the response for any status below 400.
    ///
    /// # Errors
    ///
    /// Returns the classified [`IntegrationError`] of the last attempt, or
    /// the policy error that stopped the call before the network
    pub async fn execute(&self, request: ApiRequest) -> Result<Response, IntegrationError> {
        self.execute_with_cancel(request, &CancellationToken::new()).await
    }

    /// Like [`execute`](Self::execute), abandoning the call when `cancel`
    /// fires
    ///
    /// Cancellation while waiting for a rate-limit token yields
    /// `RateLimitTimeout`; during a backoff sleep or transport I/O it yields
    /// `Cancelled`.
    #[instrument(
        skip_all,
        fields(client = %self.inner.config.name, method = %request.method, path = %request.path)
    )]
    pub async fn execute_with_cancel(
        &self,
        request: ApiRequest,
        cancel: &CancellationToken,
    ) -> Result<Response, IntegrationError> {
        let inner = &self.inner;

        // Fails fast on unusable credentials; attempts authorize again after
        // any rate-limit wait.
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(IntegrationError::Cancelled { attempts: 0 }),
            authorized = inner.auth.apply(request.clone()) => { authorized?; }
        }

        if let Some(limiter) = &inner.rate_limiter {
            self.admit(limiter, cancel).await?;
        }

        let permit = match &inner.circuit_breaker {
            Some(breaker) => match breaker.try_acquire() {
                Some(permit) => Some(permit),
                None => {
                    inner.metrics.record_circuit_rejection();
                    let retry_in = breaker.remaining_open_time();
                    warn!(retry_in_ms = retry_in.map(|d| d.as_millis() as u64), "Circuit breaker open, rejecting call");
                    return Err(IntegrationError::CircuitOpen {
                        client: inner.config.name.clone(),
                        retry_in,
                    });
                }
            },
            None => None,
        };

        let outcome = inner
            .retry
            .execute_until_cancelled(cancel, |attempt| {
                let original = &request;
                async move { self.attempt(attempt, original).await }
            })
            .await;

        let attempts = outcome.attempts;
        let retries = outcome.retries();
        let result = match outcome.result {
            Ok(mut response) => {
                response.metadata = ResponseMetadata { attempts, retries };
                Ok(response)
            }
            Err(RetryError::Exhausted { attempts, error } | RetryError::NonRetryable { attempts, error }) => {
                Err(error.with_attempts(attempts))
            }
            Err(RetryError::Cancelled { attempts, .. }) => {
                debug!(attempts, "Call cancelled");
                Err(IntegrationError::Cancelled { attempts })
            }
        };

        if let Some(permit) = permit {
            match self.breaker_verdict(&result) {
                Some(true) => permit.success(),
                Some(false) => permit.failure(),
                None => drop(permit),
            }
        }
        inner.metrics.record_outcome(result.is_ok(), retries);

        result
    }

    /// Build, execute and parse a call through caller-supplied strategies
    ///
    /// # Errors
    ///
    /// Returns builder, transport, policy or parser errors
    pub async fn call<B, P>(
        &self,
        builder: &B,
        input: &B::Input,
        parser: &P,
    ) -> Result<P::Output, IntegrationError>
    where
        B: RequestBuilder,
        P: ResponseParser,
    {
        let request = builder.build(input)?;
        let response = self.execute(request).await?;
        parser.parse(response)
    }

    /// Execute a GET request and deserialize the JSON body
    ///
    /// Empty bodies (e.g. 204 No Content) deserialize from `null`, so `()`
    /// and `Option<T>` work for endpoints without content.
    ///
    /// # Errors
    ///
    /// Returns error if the call fails or the body cannot be deserialized
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, IntegrationError> {
        self.execute(ApiRequest::get(path)).await?.json()
    }

    /// Execute a POST request with a JSON body
    ///
    /// # Errors
    ///
    /// Returns error if the call fails or either body cannot be (de)serialized
    pub async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, IntegrationError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.execute(ApiRequest::post(path).with_json(body)?).await?.json()
    }

    /// Execute a PUT request with a JSON body
    ///
    /// # Errors
    ///
    /// Returns error if the call fails or either body cannot be (de)serialized
    pub async fn put<B, T>(&self, path: &str, body: &B) -> Result<T, IntegrationError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.execute(ApiRequest::put(path).with_json(body)?).await?.json()
    }

    /// Execute a DELETE request
    ///
    /// # Errors
    ///
    /// Returns error if the call fails or the body cannot be deserialized
    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, IntegrationError> {
        self.execute(ApiRequest::delete(path)).await?.json()
    }

    /// Check that the API answers a single GET
    ///
    /// Bypasses the rate limiter, circuit breaker and retries, and records no
    /// metrics. Any failure, including missing credentials, reports `false`.
    #[instrument(skip(self), fields(client = %self.inner.config.name))]
    pub async fn health_check(&self, path: &str) -> bool {
        let inner = &self.inner;
        let request = match inner.auth.apply(ApiRequest::get(path)).await {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, "Health check could not authenticate");
                return false;
            }
        };
        let request = match request.into_reqwest(&inner.http) {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, "Health check request is invalid");
                return false;
            }
        };

        match inner.http.send(request).await {
            Ok(response) if response.status().is_success() => {
                info!("API is healthy");
                true
            }
            Ok(response) => {
                warn!(status = %response.status(), "API returned non-success status");
                false
            }
            Err(err) => {
                warn!(error = %err, "Health check failed");
                false
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> ClientMetrics {
        self.inner.metrics.snapshot()
    }

    pub fn reset_metrics(&self) {
        self.inner.metrics.reset();
    }

    /// Breaker state, `None` when no breaker is configured
    pub fn circuit_state(&self) -> Option<CircuitState> {
        self.inner.circuit_breaker.as_ref().map(CircuitBreaker::state)
    }

    pub fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        self.inner.circuit_breaker.as_ref()
    }

    pub fn rate_limiter(&self) -> Option<&RateLimiter> {
        self.inner.rate_limiter.as_ref()
    }

    pub fn auth(&self) -> &AuthManager {
        &self.inner.auth
    }

    async fn admit(&self, limiter: &RateLimiter, cancel: &CancellationToken) -> Result<(), IntegrationError> {
        let started = Instant::now();
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                let waited = started.elapsed();
                debug!(waited_ms = waited.as_millis() as u64, "Cancelled while waiting for rate-limit token");
                Err(IntegrationError::RateLimitTimeout { waited })
            }
            waited = limiter.acquire() => {
                if !waited.is_zero() {
                    debug!(waited_ms = waited.as_millis() as u64, "Admitted after rate-limit wait");
                    self.inner.metrics.record_rate_limit_wait(waited);
                }
                Ok(())
            }
        }
    }

    /// One physical attempt, classified for the retry loop
    async fn attempt(&self, attempt: u32, original: &ApiRequest) -> AttemptOutcome<Response, IntegrationError> {
        let inner = &self.inner;

        if attempt > 0 {
            if let Some(limiter) = inner.rate_limiter.as_ref().filter(|l| l.config().acquire_per_attempt) {
                let waited = limiter.acquire().await;
                if !waited.is_zero() {
                    inner.metrics.record_rate_limit_wait(waited);
                }
            }
        }

        let request = match inner.auth.apply(original.clone()).await {
            Ok(request) => request,
            Err(err) => return AttemptOutcome::Fatal(err.into()),
        };

        let url = inner.http.resolve(&request.path);
        let method = request.method.clone();
        let authorization = request.headers.get(AUTHORIZATION).cloned();
        let request = match request.into_reqwest(&inner.http) {
            Ok(request) => request,
            Err(err) => return AttemptOutcome::Fatal(err),
        };

        if inner.config.logging.log_requests {
            debug!(%method, %url, attempt = attempt + 1, "Sending request");
        }

        let started = Instant::now();
        let result = inner.http.send_with(request, |response| Response::from_reqwest(response, started)).await;
        inner.metrics.record_attempt(started.elapsed());

        match result {
            Ok(response) => self.classify_response(response, url, authorization.as_ref()),
            Err(err) => self.classify_transport_error(err, url),
        }
    }

    fn classify_response(
        &self,
        response: Response,
        url: String,
        authorization: Option<&HeaderValue>,
    ) -> AttemptOutcome<Response, IntegrationError> {
        let inner = &self.inner;
        let status = response.status.as_u16();

        if inner.config.logging.log_responses {
            debug!(status, elapsed_ms = response.elapsed.as_millis() as u64, "Received response");
        }
        if inner.config.logging.log_response_body {
            debug!(body = %response.body_text(), "Response body");
        }

        let now = Utc::now();
        let retry_after = response.headers.get(RETRY_AFTER).and_then(|v| headers::parse_retry_after(v, now));
        let reset = response.headers.get(RATE_LIMIT_RESET).and_then(|v| headers::parse_rate_limit_reset(v, now));
        let exhausted = headers::quota_exhausted(&response.headers);
        self.apply_server_signals(status, retry_after.or(reset), reset.filter(|_| exhausted));

        if status < 400 {
            return AttemptOutcome::Success(response);
        }

        if status == 401 {
            inner.auth.invalidate_rejected(authorization);
        }

        let hint = if status == 429 || exhausted { retry_after.or(reset) } else { retry_after };
        let retryable = inner.retry.config().is_retryable_status(status);
        let error = IntegrationError::http(retryable, status, url, &response.body_text(), hint);
        if retryable {
            AttemptOutcome::Retryable { error, retry_after: hint }
        } else {
            AttemptOutcome::Fatal(error)
        }
    }

    /// Feed server rate-limit signals to the limiter
    ///
    /// A 429 or 503 defers admissions by its wait hint; an exhausted quota
    /// defers until the advertised reset; a 429 without any hint throttles.
    fn apply_server_signals(&self, status: u16, hint: Option<Duration>, quota_reset: Option<Duration>) {
        let Some(limiter) = &self.inner.rate_limiter else {
            return;
        };

        match (status, hint) {
            (429 | 503, Some(delay)) => limiter.defer_for(delay),
            (429, None) => limiter.throttle(),
            _ => {}
        }
        if let Some(delay) = quota_reset {
            limiter.defer_for(delay);
        }
    }

    fn classify_transport_error(
        &self,
        err: reqwest::Error,
        url: String,
    ) -> AttemptOutcome<Response, IntegrationError> {
        if err.is_timeout() {
            debug!(%url, "Request timed out");
            let error = IntegrationError::Timeout { url, attempts: 1, source: err };
            if self.inner.retry.config().retry_on_timeout {
                AttemptOutcome::retryable(error)
            } else {
                AttemptOutcome::Fatal(error)
            }
        } else {
            debug!(%url, error = %err, "Network error");
            AttemptOutcome::retryable(IntegrationError::Network { url, attempts: 1, source: err })
        }
    }

    /// Breaker verdict for a finished call, `None` when the outcome says
    /// nothing about downstream health
    fn breaker_verdict(&self, result: &Result<Response, IntegrationError>) -> Option<bool> {
        let breaker = self.inner.circuit_breaker.as_ref()?;
        match result {
            Ok(_) => Some(true),
            Err(err) => {
                if let Some(status) = err.status() {
                    Some(!breaker.config().is_failure_status(status))
                } else if err.is_transport() {
                    Some(!breaker.config().count_timeouts_as_failures)
                } else {
                    None
                }
            }
        }
    }
}

/// Builder for API client
#[derive(Default)]
pub struct ApiClientBuilder {
    config: Option<ClientConfig>,
    auth: Option<AuthManager>,
}

impl ApiClientBuilder {
    /// Set the client configuration
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Replace the auth manager derived from `config.auth`
    pub fn auth(mut self, auth: AuthManager) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Build the API client
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is missing or invalid
    pub fn build(self) -> Result<ApiClient, IntegrationError> {
        let config = self.config.ok_or_else(|| ConfigError::Missing("client config".to_string()))?;
        ApiClient::from_parts(config, self.auth)
    }
}
