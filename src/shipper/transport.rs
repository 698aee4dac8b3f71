//! HTTP transport: a narrow trait over `reqwest`'s blocking client so tests
//! can inject a fake without touching the network (§4.6).

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub url: String,
    pub method: &'static str,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub request_id: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

pub trait Transport: Send + Sync {
    fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}

/// `reqwest::blocking` client — the idiomatic fit given this crate's
/// thread-pool concurrency model (no async runtime required).
pub struct ReqwestTransport {
    client: reqwest::blocking::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Ok(ReqwestTransport { client })
    }
}

impl Transport for ReqwestTransport {
    fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let mut builder = self.client.post(&request.url).body(request.body);
        for (k, v) in &request.headers {
            builder = builder.header(k, v);
        }
        let response = builder.send().map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(Duration::from_secs(0))
            } else {
                TransportError::Network(e.to_string())
            }
        })?;
        let status = response.status().as_u16();
        let request_id = response.headers().get("x-request-id").and_then(|v| v.to_str().ok()).map(str::to_string);
        let body = response.bytes().map_err(|e| TransportError::Network(e.to_string()))?.to_vec();
        Ok(TransportResponse { status, request_id, body })
    }
}

/// Deterministic test double: returns a scripted sequence of responses.
#[cfg(any(test, feature = "test-support"))]
pub struct ScriptedTransport {
    responses: std::sync::Mutex<std::collections::VecDeque<Result<TransportResponse, TransportError>>>,
}

#[cfg(any(test, feature = "test-support"))]
impl ScriptedTransport {
    pub fn new(responses: Vec<Result<TransportResponse, TransportError>>) -> Self {
        ScriptedTransport {
            responses: std::sync::Mutex::new(responses.into_iter().collect()),
        }
    }
}

#[cfg(any(test, feature = "test-support"))]
impl Transport for ScriptedTransport {
    fn send(&self, _request: TransportRequest) -> Result<TransportResponse, TransportError> {
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(TransportResponse { status: 200, request_id: Some("default".into()), body: Vec::new() }))
    }
}
