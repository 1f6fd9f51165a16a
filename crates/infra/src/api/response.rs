//! Inbound response model
//!
//! The body is read in full inside the attempt, so the request timeout
//! covers it and a slow body counts as a retryable timeout.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::errors::IntegrationError;

/// Decoded response payload
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Empty,
    Json(Value),
    Text(String),
}

/// Retry bookkeeping for the call that produced a response
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResponseMetadata {
    pub attempts: u32,
    pub retries: u32,
}

/// Fully-read HTTP response
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    /// Lowercase header names; repeated headers are joined with `", "`
    pub headers: HashMap<String, String>,
    pub body: ResponseBody,
    /// Latency of the attempt that produced this response
    pub elapsed: Duration,
    pub metadata: ResponseMetadata,
}

impl Response {
    /// Read a reqwest response to completion.
    pub async fn from_reqwest(
        response: reqwest::Response,
        started: tokio::time::Instant,
    ) -> Result<Self, reqwest::Error> {
        let status = response.status();

        let mut headers: HashMap<String, String> = HashMap::new();
        for (name, value) in response.headers() {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            headers
                .entry(name.as_str().to_ascii_lowercase())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(&value);
                })
                .or_insert(value);
        }

        let is_json = headers
            .get("content-type")
            .is_some_and(|content_type| content_type.contains("json"));
        let bytes = response.bytes().await?;

        let body = if bytes.is_empty() {
            ResponseBody::Empty
        } else if is_json {
            serde_json::from_slice(&bytes).map_or_else(
                |_| ResponseBody::Text(String::from_utf8_lossy(&bytes).into_owned()),
                ResponseBody::Json,
            )
        } else {
            ResponseBody::Text(String::from_utf8_lossy(&bytes).into_owned())
        };

        Ok(Self { status, headers, body, elapsed: started.elapsed(), metadata: ResponseMetadata::default() })
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Header value by case-insensitive name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Text body, or `None` for JSON and empty bodies
    pub fn text(&self) -> Option<&str> {
        match &self.body {
            ResponseBody::Text(text) => Some(text),
            ResponseBody::Empty | ResponseBody::Json(_) => None,
        }
    }

    /// The body rendered as text whatever its kind
    pub fn body_text(&self) -> String {
        match &self.body {
            ResponseBody::Empty => String::new(),
            ResponseBody::Json(value) => value.to_string(),
            ResponseBody::Text(text) => text.clone(),
        }
    }

    /// Deserialize the body; an empty body deserializes from `null`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, IntegrationError> {
        let result = match &self.body {
            ResponseBody::Empty => serde_json::from_value(Value::Null),
            ResponseBody::Json(value) => T::deserialize(value),
            ResponseBody::Text(text) => serde_json::from_str(text),
        };
        result.map_err(|e| {
            IntegrationError::Parse(format!("status {}: {e}", self.status.as_u16()))
        })
    }
}

/// Turns a successful [`Response`] into caller output
pub trait ResponseParser: Send + Sync {
    type Output;

    fn parse(&self, response: Response) -> Result<Self::Output, IntegrationError>;
}

/// Deserializes the JSON body into `T`
pub struct JsonParser<T>(PhantomData<fn() -> T>);

impl<T> JsonParser<T> {
    pub const fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for JsonParser<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> ResponseParser for JsonParser<T> {
    type Output = T;

    fn parse(&self, response: Response) -> Result<T, IntegrationError> {
        response.json()
    }
}

/// Returns the response unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct RawParser;

impl ResponseParser for RawParser {
    type Output = Response;

    fn parse(&self, response: Response) -> Result<Response, IntegrationError> {
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    fn response(body: ResponseBody) -> Response {
        Response {
            status: StatusCode::OK,
            headers: HashMap::from([("retry-after".to_string(), "3".to_string())]),
            body,
            elapsed: Duration::from_millis(12),
            metadata: ResponseMetadata::default(),
        }
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct User {
        id: u64,
    }

    #[test]
    fn test_json_from_each_body_kind() {
        let parsed: User = response(ResponseBody::Json(json!({"id": 7}))).json().expect("json body");
        assert_eq!(parsed, User { id: 7 });

        let parsed: User = response(ResponseBody::Text(r#"{"id":8}"#.into())).json().expect("text body");
        assert_eq!(parsed, User { id: 8 });

        let unit: Option<User> = response(ResponseBody::Empty).json().expect("empty body is null");
        assert_eq!(unit, None);

        let err = response(ResponseBody::Empty).json::<User>().expect_err("null is not a User");
        assert!(matches!(err, IntegrationError::Parse(_)));
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let response = response(ResponseBody::Empty);
        assert_eq!(response.header("Retry-After"), Some("3"));
        assert_eq!(response.header("x-missing"), None);
    }

    #[test]
    fn test_parsers() {
        let raw = RawParser.parse(response(ResponseBody::Text("pong".into()))).expect("raw");
        assert_eq!(raw.text(), Some("pong"));
        assert_eq!(raw.body_text(), "pong");

        let parser = JsonParser::<User>::new();
        assert_eq!(parser.parse(response(ResponseBody::Json(json!({"id": 1})))).expect("user"), User { id: 1 });
    }

    #[tokio::test]
    async fn test_from_reqwest_reads_body_and_headers() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(201)
                    .insert_header("X-Request-Id", "abc")
                    .set_body_json(json!({"id": 3})),
            )
            .mount(&server)
            .await;

        let raw = reqwest::get(server.uri()).await.expect("response");
        let response = Response::from_reqwest(raw, tokio::time::Instant::now()).await.expect("read");

        assert_eq!(response.status, StatusCode::CREATED);
        assert_eq!(response.header("x-request-id"), Some("abc"));
        assert_eq!(response.body, ResponseBody::Json(json!({"id": 3})));
    }
}
