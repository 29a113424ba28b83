//! In-process fake transport for unit tests
//!
//! [`FakeTransport`] answers requests from a scripted queue and records
//! every request it receives, so tests can assert on outbound traffic
//! without a network.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::transport::{HttpRequest, HttpResponse, HttpTransport, TransportError};

/// Scripted [`HttpTransport`] for tests.
#[derive(Debug, Default)]
pub struct FakeTransport {
    responses: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
    requests: Mutex<Vec<HttpRequest>>,
    delay: Option<Duration>,
}

impl FakeTransport {
    /// Creates an empty fake.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every response, keeping requests in flight.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queues a JSON response.
    pub fn push_json(&self, status: u16, body: serde_json::Value) {
        self.push(Ok(HttpResponse::new(status, body.to_string())));
    }

    /// Queues any outcome.
    pub fn push(&self, outcome: Result<HttpResponse, TransportError>) {
        self.responses
            .lock()
            .expect("FakeTransport: responses lock poisoned")
            .push_back(outcome);
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests
            .lock()
            .expect("FakeTransport: requests lock poisoned")
            .clone()
    }

    /// Number of requests received so far.
    pub fn request_count(&self) -> usize {
        self.requests
            .lock()
            .expect("FakeTransport: requests lock poisoned")
            .len()
    }
}

#[async_trait::async_trait]
impl HttpTransport for FakeTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests
            .lock()
            .expect("FakeTransport: requests lock poisoned")
            .push(request);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.responses
            .lock()
            .expect("FakeTransport: responses lock poisoned")
            .pop_front()
            .unwrap_or_else(|| {
                Err(TransportError::Connection(
                    "FakeTransport: no scripted response".to_string(),
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    #[tokio::test]
    async fn test_fake_returns_scripted_responses_in_order() {
        let fake = FakeTransport::new();
        fake.push_json(200, serde_json::json!({"n": 1}));
        fake.push(Err(TransportError::Timeout("slow".to_string())));

        let url = Url::parse("https://auth.example.com/").unwrap();
        let first = fake.execute(HttpRequest::get(url.clone())).await.unwrap();
        assert_eq!(first.text(), r#"{"n":1}"#);
        assert!(fake.execute(HttpRequest::get(url.clone())).await.is_err());
        assert!(
            fake.execute(HttpRequest::get(url)).await.is_err(),
            "an empty queue fails the request"
        );
        assert_eq!(fake.request_count(), 3);
    }
}
