//! Credential injection with single-flight OAuth2 token refresh
//!
//! [`AuthManager::apply`] returns a decorated copy of the request, so it can
//! be re-run on every retry attempt. Static schemes need no state. OAuth2
//! keeps the current access token and refresh token; when the token is
//! missing or inside the refresh margin, the first caller starts a refresh
//! and every concurrent caller awaits that same future.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use reqwest::header::{HeaderName, HeaderValue, AUTHORIZATION};
use serde::Deserialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::errors::AuthError;
use super::request::{ApiRequest, RequestBody};
use crate::config::{ApiKeyPlacement, AuthConfig, OAuth2Config, Secret};

/// Cached OAuth2 access token
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub value: Secret,
    /// `None` when the endpoint gave no lifetime; valid until invalidated
    pub expires_at: Option<Instant>,
}

impl AccessToken {
    /// Whether the token outlives `now + margin`
    pub fn is_fresh(&self, margin: Duration, now: Instant) -> bool {
        match (self.expires_at, now.checked_add(margin)) {
            (None, _) => true,
            (Some(expires_at), Some(limit)) => limit < expires_at,
            (Some(_), None) => false,
        }
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken").field("expires_at", &self.expires_at).finish_non_exhaustive()
    }
}

/// Result of one token-endpoint exchange
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: Secret,
    pub expires_in: Option<Duration>,
    /// Rotated refresh token, if the endpoint issued one
    pub refresh_token: Option<Secret>,
}

/// Issues access tokens
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Exchange `refresh_token`, or client credentials when `None`
    async fn fetch(&self, refresh_token: Option<Secret>) -> Result<TokenGrant, AuthError>;
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<f64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Form-encoded OAuth2 token endpoint
pub struct OAuth2TokenEndpoint {
    config: OAuth2Config,
    client: reqwest::Client,
}

impl OAuth2TokenEndpoint {
    pub fn new(config: OAuth2Config, client: reqwest::Client) -> Self {
        Self { config, client }
    }
}

#[async_trait]
impl TokenSource for OAuth2TokenEndpoint {
    async fn fetch(&self, refresh_token: Option<Secret>) -> Result<TokenGrant, AuthError> {
        let mut params = match &refresh_token {
            Some(token) => vec![
                ("grant_type", "refresh_token".to_string()),
                ("refresh_token", token.expose().to_string()),
            ],
            None => vec![("grant_type", "client_credentials".to_string())],
        };
        params.push(("client_id", self.config.client_id.clone()));
        if !self.config.client_secret.is_empty() {
            params.push(("client_secret", self.config.client_secret.expose().to_string()));
        }
        if !self.config.scopes.is_empty() {
            params.push(("scope", self.config.scopes.join(" ")));
        }

        let response = self
            .client
            .post(&self.config.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AuthError::TokenEndpoint {
                status: status.as_u16(),
                message: message.chars().take(256).collect(),
            });
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::InvalidTokenResponse(e.to_string()))?;
        if body.access_token.is_empty() {
            return Err(AuthError::InvalidTokenResponse("empty access_token".to_string()));
        }

        Ok(TokenGrant {
            access_token: Secret::new(body.access_token),
            expires_in: body.expires_in.and_then(|secs| Duration::try_from_secs_f64(secs).ok()),
            refresh_token: body.refresh_token.filter(|t| !t.is_empty()).map(Secret::new),
        })
    }
}

type SharedRefresh = Shared<BoxFuture<'static, Result<AccessToken, AuthError>>>;

struct OAuthState {
    source: Arc<dyn TokenSource>,
    margin: Duration,
    cached: RwLock<Option<AccessToken>>,
    refresh_token: Mutex<Option<Secret>>,
    in_flight: Mutex<Option<SharedRefresh>>,
}

impl OAuthState {
    fn fresh_token(&self) -> Option<AccessToken> {
        let now = Instant::now();
        self.cached.read().as_ref().filter(|token| token.is_fresh(self.margin, now)).cloned()
    }

    async fn token(self: &Arc<Self>) -> Result<AccessToken, AuthError> {
        if let Some(token) = self.fresh_token() {
            return Ok(token);
        }

        let refresh = {
            let mut slot = self.in_flight.lock();
            // A refresh may have completed between the fast path and the lock.
            if let Some(token) = self.fresh_token() {
                return Ok(token);
            }
            if let Some(existing) = slot.as_ref() {
                existing.clone()
            } else {
                let state = Arc::clone(self);
                let refresh = async move { state.refresh().await }.boxed().shared();
                *slot = Some(refresh.clone());
                refresh
            }
        };

        let result = refresh.clone().await;

        let mut slot = self.in_flight.lock();
        if slot.as_ref().is_some_and(|current| current.ptr_eq(&refresh)) {
            *slot = None;
        }
        result
    }

    async fn refresh(self: Arc<Self>) -> Result<AccessToken, AuthError> {
        let refresh_token = self.refresh_token.lock().clone();
        let grant_type = if refresh_token.is_some() { "refresh_token" } else { "client_credentials" };
        info!(grant_type, "Refreshing OAuth2 access token");

        let grant = match self.source.fetch(refresh_token).await {
            Ok(grant) => grant,
            Err(err) => {
                warn!(error = %err, grant_type, "OAuth2 token refresh failed");
                return Err(err);
            }
        };

        let token = AccessToken {
            value: grant.access_token,
            // A lifetime past the clock's range is treated as no expiry
            expires_at: grant.expires_in.and_then(|ttl| Instant::now().checked_add(ttl)),
        };
        if let Some(rotated) = grant.refresh_token {
            *self.refresh_token.lock() = Some(rotated);
        }
        *self.cached.write() = Some(token.clone());

        debug!(expires_in_ms = grant.expires_in.map(|ttl| ttl.as_millis() as u64), "OAuth2 access token refreshed");
        Ok(token)
    }
}

enum Scheme {
    Static(AuthConfig),
    OAuth2(Arc<OAuthState>),
}

/// Decorates requests with credentials for one client
pub struct AuthManager {
    scheme: Scheme,
}

impl AuthManager {
    /// Manager that leaves requests untouched
    pub fn none() -> Self {
        Self { scheme: Scheme::Static(AuthConfig::None) }
    }

    /// Build the manager for `config`; OAuth2 uses `client` for the token
    /// endpoint.
    pub fn from_config(config: &AuthConfig, client: reqwest::Client) -> Self {
        match config {
            AuthConfig::OAuth2(oauth) => Self::oauth2(
                Arc::new(OAuth2TokenEndpoint::new(oauth.clone(), client)),
                oauth.refresh_margin,
                oauth.refresh_token.clone(),
            ),
            other => Self { scheme: Scheme::Static(other.clone()) },
        }
    }

    /// OAuth2 manager over an arbitrary token source
    pub fn oauth2(
        source: Arc<dyn TokenSource>,
        refresh_margin: Duration,
        refresh_token: Option<Secret>,
    ) -> Self {
        Self {
            scheme: Scheme::OAuth2(Arc::new(OAuthState {
                source,
                margin: refresh_margin,
                cached: RwLock::new(None),
                refresh_token: Mutex::new(refresh_token),
                in_flight: Mutex::new(None),
            })),
        }
    }

    /// Scheme name, for logs
    pub fn scheme(&self) -> &'static str {
        match &self.scheme {
            Scheme::Static(config) => config.scheme(),
            Scheme::OAuth2(_) => "oauth2",
        }
    }

    /// Return `request` with credentials attached.
    pub async fn apply(&self, mut request: ApiRequest) -> Result<ApiRequest, AuthError> {
        match &self.scheme {
            Scheme::OAuth2(state) => {
                let token = state.token().await?;
                set_header(&mut request, AUTHORIZATION.as_str(), &format!("Bearer {}", token.value.expose()))?;
            }
            Scheme::Static(AuthConfig::None) => {}
            Scheme::Static(AuthConfig::ApiKey { name, value, placement }) => match placement {
                ApiKeyPlacement::Header => set_header(&mut request, name, value.expose())?,
                ApiKeyPlacement::Query => set_query(&mut request, name, value.expose()),
                ApiKeyPlacement::Body => set_body_field(&mut request, name, value.expose())?,
            },
            Scheme::Static(AuthConfig::Bearer { token }) => {
                set_header(&mut request, AUTHORIZATION.as_str(), &format!("Bearer {}", token.expose()))?;
            }
            Scheme::Static(AuthConfig::Basic { username, password }) => {
                let encoded = STANDARD.encode(format!("{username}:{}", password.expose()));
                set_header(&mut request, AUTHORIZATION.as_str(), &format!("Basic {encoded}"))?;
            }
            Scheme::Static(AuthConfig::Custom { headers, params }) => {
                for (name, value) in headers {
                    set_header(&mut request, name, value.expose())?;
                }
                for (name, value) in params {
                    set_query(&mut request, name, value.expose());
                }
            }
            Scheme::Static(AuthConfig::OAuth2(_)) => {
                return Err(AuthError::MissingCredentials("OAuth2 token source not initialized".to_string()));
            }
        }
        Ok(request)
    }

    /// Current OAuth2 access token, refreshing if needed
    pub async fn access_token(&self) -> Result<Secret, AuthError> {
        match &self.scheme {
            Scheme::OAuth2(state) => state.token().await.map(|token| token.value),
            Scheme::Static(_) => Err(AuthError::MissingCredentials(format!(
                "scheme '{}' has no access token",
                self.scheme()
            ))),
        }
    }

    /// Drop the cached access token so the next call refreshes
    pub fn invalidate(&self) {
        if let Scheme::OAuth2(state) = &self.scheme {
            debug!("Invalidating cached OAuth2 access token");
            *state.cached.write() = None;
        }
    }

    /// Drop the cached access token if it is the one `authorization` carried
    ///
    /// A rejection of a token that a concurrent refresh already replaced
    /// leaves the newer token in place.
    pub fn invalidate_rejected(&self, authorization: Option<&HeaderValue>) {
        let (Scheme::OAuth2(state), Some(rejected)) = (&self.scheme, authorization) else {
            return;
        };

        let mut cached = state.cached.write();
        let is_current = cached
            .as_ref()
            .is_some_and(|token| rejected.as_bytes() == format!("Bearer {}", token.value.expose()).as_bytes());
        if is_current {
            debug!("Invalidating rejected OAuth2 access token");
            *cached = None;
        } else {
            debug!("Rejected OAuth2 token was already replaced");
        }
    }

    /// Cached access token without refreshing
    pub fn cached_token(&self) -> Option<AccessToken> {
        match &self.scheme {
            Scheme::OAuth2(state) => state.cached.read().clone(),
            Scheme::Static(_) => None,
        }
    }
}

impl std::fmt::Debug for AuthManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthManager").field("scheme", &self.scheme()).finish()
    }
}

fn set_header(request: &mut ApiRequest, name: &str, value: &str) -> Result<(), AuthError> {
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| AuthError::InvalidHeader(format!("invalid header name '{name}'")))?;
    let mut value = HeaderValue::from_str(value)
        .map_err(|_| AuthError::InvalidHeader(format!("invalid value for header '{name}'")))?;
    value.set_sensitive(true);
    request.headers.insert(name, value);
    Ok(())
}

fn set_query(request: &mut ApiRequest, name: &str, value: &str) {
    request.query.retain(|(existing, _)| existing != name);
    request.query.push((name.to_string(), value.to_string()));
}

fn set_body_field(request: &mut ApiRequest, name: &str, value: &str) -> Result<(), AuthError> {
    match &mut request.body {
        RequestBody::Empty => {
            let mut object = serde_json::Map::new();
            object.insert(name.to_string(), Value::String(value.to_string()));
            request.body = RequestBody::Json(Value::Object(object));
        }
        RequestBody::Json(Value::Object(object)) => {
            object.insert(name.to_string(), Value::String(value.to_string()));
        }
        RequestBody::Form(pairs) => {
            pairs.retain(|(existing, _)| existing != name);
            pairs.push((name.to_string(), value.to_string()));
        }
        RequestBody::Json(_) => {
            return Err(AuthError::UnsupportedPlacement(
                "API key in body requires a JSON object body".to_string(),
            ));
        }
        RequestBody::Bytes(_) => {
            return Err(AuthError::UnsupportedPlacement(
                "API key cannot be placed in a raw byte body".to_string(),
            ));
        }
    }
    Ok(())
}
