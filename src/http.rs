//! HTTP collaborator used for authentication and history paging.
//!
//! Sibling of the socket core: neither the transport channels nor the
//! correlation engine call into it. Requests carry the same browser-like
//! header set as the web client, plus `Authorization: Token <t>` when asked.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use serde::de::DeserializeOwned;

use crate::error::{Result, SessionError};
use crate::session::TOKEN_PREFIX;

const USER_AGENT: &str = "Character.AI";
const ORIGIN: &str = "https://character.ai";
const REFERER: &str = "https://character.ai/";

/// Per-request options.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// HTTP method.
    pub method: Method,
    /// Attach the stored `Authorization` header.
    pub include_authorization: bool,
    /// Request body, sent verbatim.
    pub body: Option<String>,
    /// `Content-Type` of the body.
    pub content_type: Option<String>,
}

impl RequestOptions {
    /// Authorized GET with no body.
    #[must_use]
    pub fn authorized_get() -> Self {
        Self {
            method: Method::GET,
            include_authorization: true,
            body: None,
            content_type: None,
        }
    }

    /// Attach a JSON body.
    pub fn with_json(mut self, body: &serde_json::Value) -> Result<Self> {
        self.body = Some(serde_json::to_string(body)?);
        self.content_type = Some("application/json".to_string());
        Ok(self)
    }
}

/// Buffered response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Raw body.
    pub body: Bytes,
}

impl HttpResponse {
    /// Whether the status is 2xx.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Decode the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Async HTTP client holding the current authorization header.
///
/// Cheap to clone; clones share the token.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    authorization: Arc<RwLock<Option<String>>>,
}

impl HttpClient {
    /// Build a client with the default browser-like headers.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(default_headers())
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            authorization: Arc::new(RwLock::new(None)),
        })
    }

    /// Store the token used for authorized requests. Empty tokens are ignored.
    pub fn update_token(&self, token: &str) {
        if token.is_empty() {
            return;
        }
        *self
            .authorization
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(format!("{TOKEN_PREFIX}{token}"));
    }

    /// Whether a token has been stored.
    #[must_use]
    pub fn has_token(&self) -> bool {
        self.authorization
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Perform one request and buffer the response.
    ///
    /// Non-2xx statuses are returned, not raised; only transport failures
    /// are errors.
    pub async fn request(&self, url: &str, options: RequestOptions) -> Result<HttpResponse> {
        let mut builder = self.client.request(options.method.clone(), url);

        if options.include_authorization {
            let authorization = self
                .authorization
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            match authorization {
                Some(value) => builder = builder.header(AUTHORIZATION, value),
                None => log::debug!("[Http] No token stored for authorized {} {}", options.method, url),
            }
        }
        if let Some(content_type) = &options.content_type {
            builder = builder.header(CONTENT_TYPE, content_type);
        }
        if let Some(body) = options.body {
            builder = builder.body(body);
        }

        log::debug!("[Http] {} {}", options.method, url);
        let response = builder
            .send()
            .await
            .map_err(|e| SessionError::Http(format!("{} {} failed: {}", options.method, url, e)))?;
        let status = response.status().as_u16();
        let body = response.bytes().await?;
        log::debug!("[Http] {} {} -> {}", options.method, url, status);

        Ok(HttpResponse { status, body })
    }
}

fn default_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in [
        ("dnt", "1"),
        ("sec-gpc", "1"),
        ("upgrade-insecure-requests", "1"),
        ("sec-fetch-dest", "empty"),
        ("sec-fetch-mode", "cors"),
        ("sec-fetch-site", "same-origin"),
        ("origin", ORIGIN),
        ("referer", REFERER),
    ] {
        headers.insert(name, HeaderValue::from_static(value));
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_authorized_request_sends_token_and_browser_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/chat/user/"))
            .and(header("authorization", "Token abc"))
            .and(header("origin", "https://character.ai"))
            .and(header("user-agent", "Character.AI"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"ok":true}"#))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpClient::new().unwrap();
        client.update_token("abc");
        let response = client
            .request(&format!("{}/chat/user/", server.uri()), RequestOptions::authorized_get())
            .await
            .unwrap();

        assert!(response.is_success());
        let body: serde_json::Value = response.json().unwrap();
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn test_non_success_status_is_returned() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = HttpClient::new().unwrap();
        let response = client
            .request(&server.uri(), RequestOptions::authorized_get())
            .await
            .unwrap();
        assert_eq!(response.status, 401);
        assert!(!response.is_success());
    }

    #[tokio::test]
    async fn test_json_body_sets_content_type() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("content-type", "application/json"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpClient::new().unwrap();
        let options = RequestOptions {
            method: Method::POST,
            include_authorization: false,
            body: None,
            content_type: None,
        }
        .with_json(&serde_json::json!({ "a": 1 }))
        .unwrap();
        let response = client.request(&server.uri(), options).await.unwrap();
        assert_eq!(response.status, 204);
    }

    #[test]
    fn test_empty_token_is_ignored() {
        let client = HttpClient::new().unwrap();
        client.update_token("");
        assert!(!client.has_token());
        client.update_token("abc");
        assert!(client.has_token());
    }
}
