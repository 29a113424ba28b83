//! HTTP transport abstraction and implementations
//!
//! The [`HttpTransport`] trait is the single seam through which the crate
//! talks to the network.  [`crate::service::AuthorizationService`] receives
//! one at construction, so tests substitute their own.
//!
//! - [`http::ReqwestTransport`] -- the production implementation on
//!   `reqwest`.
//! - [`fake::FakeTransport`] -- scripted in-memory transport (cfg(test)
//!   only).
//!
//! The transport only moves bytes.  Status codes, OAuth error bodies, and
//! JSON decoding are interpreted by the service.

use std::fmt;

use thiserror::Error;
use url::Url;

use crate::error::OAuthError;

pub mod http;

#[cfg(test)]
pub mod fake;

pub use http::ReqwestTransport;

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    /// `GET`
    Get,
    /// `POST`
    Post,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Get => "GET",
            Self::Post => "POST",
        })
    }
}

/// An outbound HTTP request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    /// Method.
    pub method: HttpMethod,
    /// Target URL.
    pub url: Url,
    /// Header name/value pairs, in insertion order.
    pub headers: Vec<(String, String)>,
    /// Body bytes.
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    /// A `GET` accepting JSON.
    pub fn get(url: Url) -> Self {
        Self {
            method: HttpMethod::Get,
            url,
            headers: vec![("Accept".to_string(), "application/json".to_string())],
            body: None,
        }
    }

    /// A form-urlencoded `POST`.
    pub fn post_form(url: Url, body: String) -> Self {
        Self {
            method: HttpMethod::Post,
            url,
            headers: vec![
                (
                    "Content-Type".to_string(),
                    "application/x-www-form-urlencoded".to_string(),
                ),
                ("Accept".to_string(), "application/json".to_string()),
            ],
            body: Some(body.into_bytes()),
        }
    }

    /// A JSON `POST`.
    pub fn post_json(url: Url, body: Vec<u8>) -> Self {
        Self {
            method: HttpMethod::Post,
            url,
            headers: vec![
                ("Content-Type".to_string(), "application/json".to_string()),
                ("Accept".to_string(), "application/json".to_string()),
            ],
            body: Some(body),
        }
    }

    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// First value of a header, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A received HTTP response.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Header name/value pairs.
    pub headers: Vec<(String, String)>,
    /// Body bytes.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// A response with no headers.
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Returns `true` for a 2xx status.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body decoded lossily as UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// A failure to obtain any response.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// The connection could not be established or was lost.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The transport gave up waiting.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// The request could not be built.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl From<TransportError> for OAuthError {
    fn from(error: TransportError) -> Self {
        OAuthError::Network(error.to_string())
    }
}

/// Executes HTTP requests on behalf of the authorization service.
///
/// Implementations must not apply OAuth semantics; every status code,
/// including 4xx and 5xx, is returned as an [`HttpResponse`].
#[async_trait::async_trait]
pub trait HttpTransport: Send + Sync + fmt::Debug {
    /// Sends `request` and returns the complete response.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when no response was received.
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_form_sets_content_type() {
        let request = HttpRequest::post_form(
            Url::parse("https://auth.example.com/token").unwrap(),
            "a=b".to_string(),
        );
        assert_eq!(request.method, HttpMethod::Post);
        assert_eq!(
            request.header("content-type"),
            Some("application/x-www-form-urlencoded")
        );
        assert_eq!(request.body.as_deref(), Some(&b"a=b"[..]));
    }

    #[test]
    fn test_response_success_range() {
        assert!(HttpResponse::new(200, "").is_success());
        assert!(HttpResponse::new(201, "").is_success());
        assert!(!HttpResponse::new(302, "").is_success());
        assert!(!HttpResponse::new(400, "").is_success());
    }

    #[test]
    fn test_transport_error_maps_to_network_error() {
        let error: OAuthError = TransportError::Timeout("30s".to_string()).into();
        assert!(matches!(error, OAuthError::Network(_)));
        assert!(!error.is_terminal());
    }
}
