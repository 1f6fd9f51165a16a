//! Outbound request model
//!
//! [`ApiRequest`] is a transport-independent description of one logical
//! call. It is cloned for every attempt, so credential injection never
//! mutates the caller's copy.

use conduit_common::ConfigError;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde::Serialize;
use serde_json::Value;

use super::errors::IntegrationError;
use crate::http::HttpClient;

/// Request payload
#[derive(Debug, Clone, Default, PartialEq)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(Value),
    /// `application/x-www-form-urlencoded` pairs
    Form(Vec<(String, String)>),
    Bytes(Vec<u8>),
}

/// One logical API call
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// Path relative to the client's base URL, or an absolute URL
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: RequestBody,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    #[must_use]
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Add a header, rejecting invalid names or values.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, IntegrationError> {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid_header(name))?;
        let value = HeaderValue::from_str(value).map_err(|_| invalid_header(name.as_str()))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Serialize `body` as the JSON payload.
    pub fn with_json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self, IntegrationError> {
        let value = serde_json::to_value(body)
            .map_err(|e| IntegrationError::Parse(format!("request body: {e}")))?;
        self.body = RequestBody::Json(value);
        Ok(self)
    }

    #[must_use]
    pub fn with_form<K, V>(mut self, pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.body = RequestBody::Form(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect());
        self
    }

    #[must_use]
    pub fn with_bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.body = RequestBody::Bytes(bytes.into());
        self
    }

    /// Materialize a reqwest request against `http`'s base URL.
    pub fn into_reqwest(self, http: &HttpClient) -> Result<reqwest::Request, IntegrationError> {
        let url = http.resolve(&self.path);
        let mut builder = http.request(self.method, &url).headers(self.headers);
        if !self.query.is_empty() {
            builder = builder.query(&self.query);
        }
        builder = match self.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::Form(pairs) => builder.form(&pairs),
            RequestBody::Bytes(bytes) => builder.body(bytes),
        };
        builder
            .build()
            .map_err(|e| IntegrationError::Config(ConfigError::invalid("request", format!("{url}: {e}"))))
    }
}

fn invalid_header(name: &str) -> IntegrationError {
    IntegrationError::Config(ConfigError::invalid("headers", format!("invalid header '{name}'")))
}

/// Turns caller input into an [`ApiRequest`]
pub trait RequestBuilder: Send + Sync {
    type Input: ?Sized;

    fn build(&self, input: &Self::Input) -> Result<ApiRequest, IntegrationError>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn http() -> HttpClient {
        HttpClient::builder().base_url("https://api.example.com/v1").build().expect("client")
    }

    #[test]
    fn builds_json_request_with_query() {
        let request = ApiRequest::post("/users")
            .with_query("dry_run", "true")
            .with_json(&json!({"name": "ada"}))
            .expect("json body")
            .into_reqwest(&http())
            .expect("request");

        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.url().as_str(), "https://api.example.com/v1/users?dry_run=true");
        assert_eq!(
            request.headers().get("content-type").and_then(|v| v.to_str().ok()),
            Some("application/json")
        );
        let body = request.body().and_then(reqwest::Body::as_bytes).expect("buffered body");
        assert_eq!(body, br#"{"name":"ada"}"#);
    }

    #[test]
    fn builds_form_request() {
        let request = ApiRequest::post("token")
            .with_form([("a", "1"), ("b", "two words")])
            .into_reqwest(&http())
            .expect("request");

        let body = request.body().and_then(reqwest::Body::as_bytes).expect("buffered body");
        assert_eq!(body, b"a=1&b=two+words");
    }

    #[test]
    fn rejects_invalid_headers() {
        assert!(ApiRequest::get("/").with_header("bad header", "x").is_err());
        assert!(ApiRequest::get("/").with_header("x-ok", "line\nbreak").is_err());

        let request = ApiRequest::get("/").with_header("X-Trace", "abc").expect("valid header");
        assert_eq!(request.headers.get("x-trace").and_then(|v| v.to_str().ok()), Some("abc"));
    }

    struct UserLookup;

    impl RequestBuilder for UserLookup {
        type Input = u64;

        fn build(&self, id: &u64) -> Result<ApiRequest, IntegrationError> {
            Ok(ApiRequest::get(format!("/users/{id}")))
        }
    }

    #[test]
    fn request_builder_strategy() {
        let request = UserLookup.build(&7).expect("request");
        assert_eq!(request.path, "/users/7");
        assert_eq!(request.method, Method::GET);
        assert_eq!(request.body, RequestBody::Empty);
    }
}
