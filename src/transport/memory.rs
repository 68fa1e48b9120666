//! In-memory [`Transport`] for testing and offline use.
//!
//! Responses are registered per URL; unknown URLs answer `404`. Every
//! request is counted per URL so tests can assert how many network calls
//! an operation made. An optional latency keeps requests pending long
//! enough for concurrent callers to overlap.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use super::{HttpRequest, HttpResponse, Transport};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
enum Canned {
    Response(HttpResponse),
    NetworkError(String),
}

/// Canned-response transport.
#[derive(Default)]
pub struct InMemoryTransport {
    routes: Mutex<HashMap<String, Canned>>,
    calls: Mutex<HashMap<String, usize>>,
    requests: Mutex<Vec<HttpRequest>>,
    latency: Option<Duration>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every response by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Answer `url` with `200` and the given JSON body.
    pub fn json(&self, url: impl Into<String>, body: Value) {
        self.raw(url, 200, body.to_string());
    }

    /// Answer `url` with an arbitrary status and body.
    pub fn raw(&self, url: impl Into<String>, status: u16, body: impl Into<String>) {
        self.routes.lock().insert(
            url.into(),
            Canned::Response(HttpResponse {
                status,
                body: body.into(),
            }),
        );
    }

    /// Fail requests to `url` without producing a response.
    pub fn network_error(&self, url: impl Into<String>, message: impl Into<String>) {
        self.routes
            .lock()
            .insert(url.into(), Canned::NetworkError(message.into()));
    }

    pub fn remove(&self, url: &str) {
        self.routes.lock().remove(url);
    }

    /// Number of requests sent to `url`.
    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().get(url).copied().unwrap_or(0)
    }

    /// Number of requests sent to any URL.
    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    pub fn reset_calls(&self) {
        self.calls.lock().clear();
        self.requests.lock().clear();
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        *self.calls.lock().entry(request.url.clone()).or_insert(0) += 1;
        self.requests.lock().push(request.clone());

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let canned = self.routes.lock().get(&request.url).cloned();
        match canned {
            Some(Canned::Response(response)) => Ok(response),
            Some(Canned::NetworkError(message)) => Err(Error::Network {
                url: request.url,
                message,
            }),
            None => Ok(HttpResponse {
                status: 404,
                body: String::new(),
            }),
        }
    }
}
