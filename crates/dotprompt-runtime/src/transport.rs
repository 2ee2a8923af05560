use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::blocking::Client;
use serde_json::Value;

use crate::error::{Result, RuntimeError};
use crate::provider::WireRequest;

/// Performs one provider request. Never retries.
pub trait Transport: Send + Sync {
    fn send(&self, provider: &str, request: &WireRequest) -> Result<Value>;
}

// ============================================================================
// HTTP
// ============================================================================

/// Blocking HTTPS transport.
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RuntimeError::api("http", format!("failed to build HTTP client: {}", e)))?;
        Ok(HttpTransport { client })
    }
}

impl Transport for HttpTransport {
    fn send(&self, provider: &str, request: &WireRequest) -> Result<Value> {
        let mut builder = self.client.post(&request.url).json(&request.body);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .send()
            .map_err(|e| RuntimeError::api(provider, format!("HTTP error: {}", e)))?;
        let status = response.status();
        let text = response
            .text()
            .map_err(|e| RuntimeError::api(provider, format!("read error: {}", e)))?;

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(RuntimeError::ProviderAuth {
                provider: provider.to_string(),
                message: format!("{}: {}", status, text),
            });
        }
        if !status.is_success() {
            return Err(RuntimeError::api(provider, format!("{}: {}", status, text)));
        }

        serde_json::from_str(&text)
            .map_err(|e| RuntimeError::api(provider, format!("response is not JSON: {}", e)))
    }
}

// ============================================================================
// Scripted (tests and offline runs)
// ============================================================================

/// Replays queued responses in order and records every request it receives.
///
/// Cloning shares the queue and the request log.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    responses: Arc<Mutex<VecDeque<Result<Value>>>>,
    requests: Arc<Mutex<Vec<WireRequest>>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(self, body: Value) -> Self {
        self.push(Ok(body));
        self
    }

    pub fn with_error(self, error: RuntimeError) -> Self {
        self.push(Err(error));
        self
    }

    pub fn push(&self, response: Result<Value>) {
        if let Ok(mut queue) = self.responses.lock() {
            queue.push_back(response);
        }
    }

    /// Requests sent so far.
    pub fn requests(&self) -> Vec<WireRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().map(|q| q.len()).unwrap_or(0)
    }
}

impl Transport for ScriptedTransport {
    fn send(&self, provider: &str, request: &WireRequest) -> Result<Value> {
        if let Ok(mut log) = self.requests.lock() {
            log.push(request.clone());
        }
        let next = self
            .responses
            .lock()
            .ok()
            .and_then(|mut queue| queue.pop_front());
        next.unwrap_or_else(|| Err(RuntimeError::api(provider, "no scripted response left")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> WireRequest {
        WireRequest {
            url: "https://example.invalid/v1".to_string(),
            headers: vec![],
            body: json!({"model": "m"}),
        }
    }

    #[test]
    fn scripted_replays_in_order_and_logs() {
        let transport = ScriptedTransport::new()
            .with_response(json!({"n": 1}))
            .with_response(json!({"n": 2}));
        assert_eq!(transport.send("P", &request()).unwrap()["n"], 1);
        assert_eq!(transport.send("P", &request()).unwrap()["n"], 2);
        assert!(transport.send("P", &request()).is_err());
        assert_eq!(transport.requests().len(), 3);
        assert_eq!(transport.remaining(), 0);
    }

    #[test]
    fn scripted_errors_pass_through() {
        let transport = ScriptedTransport::new().with_error(RuntimeError::ProviderAuth {
            provider: "P".to_string(),
            message: "bad key".to_string(),
        });
        let err = transport.send("P", &request()).unwrap_err();
        assert!(matches!(err, RuntimeError::ProviderAuth { .. }));
    }
}
