//! `reqwest`-backed HTTP transport

use std::sync::Arc;
use std::time::Duration;

use crate::transport::{HttpMethod, HttpRequest, HttpResponse, HttpTransport, TransportError};

/// Production [`HttpTransport`] over a shared `reqwest::Client`.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use oauthkit::transport::{HttpTransport, ReqwestTransport};
///
/// let transport: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::new());
/// ```
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http_client: Arc<reqwest::Client>,
}

impl ReqwestTransport {
    /// Creates a transport with a default client and no timeout.
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    /// Wraps an existing client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            http_client: Arc::new(client),
        }
    }

    /// Creates a transport whose requests time out after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidRequest`] when the TLS backend cannot
    /// be initialised.
    pub fn with_timeout(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
        Ok(Self::with_client(client))
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
        };

        tracing::debug!(method = %request.method, url = %request.url, "sending HTTP request");

        let mut req = self.http_client.request(method, request.url.as_str());
        for (name, value) in &request.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            req = req.body(body);
        }

        let response = req.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(e.to_string())
            } else if e.is_builder() {
                TransportError::InvalidRequest(e.to_string())
            } else {
                TransportError::Connection(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::Connection(format!("failed to read body: {e}")))?
            .to_vec();

        tracing::debug!(status, "received HTTP response");

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
