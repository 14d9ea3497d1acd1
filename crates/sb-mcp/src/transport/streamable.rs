//! Streamable-HTTP transport
//!
//! Each JSON-RPC request is POSTed to the endpoint and answered in the
//! response body. Injected headers (bearer token, OAuth) ride on every
//! request.

use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use parking_lot::RwLock;
use sb_types::{BrokerError, BrokerResult};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

pub struct StreamableTransport {
    http: reqwest::Client,
    url: String,
    headers: Vec<(String, String)>,
    next_id: Arc<RwLock<u64>>,
    connected: Arc<RwLock<bool>>,
}

impl StreamableTransport {
    /// Build the transport; connectivity is verified by the first request
    pub fn connect(url: &str, headers: Vec<(String, String)>) -> BrokerResult<Self> {
        info!("opening streamable-HTTP transport to {}", url);
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BrokerError::Upstream(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            url: url.to_string(),
            headers,
            next_id: Arc::new(RwLock::new(1)),
            connected: Arc::new(RwLock::new(true)),
        })
    }

    pub fn is_healthy(&self) -> bool {
        *self.connected.read()
    }

    pub async fn send_request(&self, mut request: JsonRpcRequest) -> BrokerResult<JsonRpcResponse> {
        if !self.is_healthy() {
            return Err(BrokerError::ServerNotRunning("transport is closed".to_string()));
        }

        {
            let mut next_id = self.next_id.write();
            request.id = Some(Value::Number((*next_id).into()));
            *next_id += 1;
        }

        let mut post = self
            .http
            .post(&self.url)
            .header("Accept", "application/json")
            .json(&request);
        for (name, value) in &self.headers {
            post = post.header(name.as_str(), value.as_str());
        }

        let response = post
            .send()
            .await
            .map_err(|e| BrokerError::Upstream(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BrokerError::Upstream(format!(
                "upstream returned {}: {}",
                status, body
            )));
        }

        response
            .json()
            .await
            .map_err(|e| BrokerError::Upstream(format!("invalid JSON-RPC response: {}", e)))
    }

    pub async fn send_notification(&self, notification: JsonRpcNotification) -> BrokerResult<()> {
        let mut post = self.http.post(&self.url).json(&notification);
        for (name, value) in &self.headers {
            post = post.header(name.as_str(), value.as_str());
        }
        let response = post
            .send()
            .await
            .map_err(|e| BrokerError::Upstream(format!("notification failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(BrokerError::Upstream(format!(
                "upstream returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    pub async fn close(&self) -> BrokerResult<()> {
        *self.connected.write() = false;
        Ok(())
    }
}
