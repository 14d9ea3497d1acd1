//! Upstream MCP client
//!
//! Wraps a transport with the MCP handshake and the capability set the rest
//! of the broker consumes: `list_tools`, `call_tool`, `close`.

use crate::protocol::{JsonRpcNotification, JsonRpcRequest, ListToolsResult};
use crate::transport::TransportHandle;
use sb_types::{BrokerError, BrokerResult, McpTool};
use serde_json::{json, Value};
use tracing::debug;

const PROTOCOL_VERSION: &str = "2024-11-05";

pub struct McpClient {
    transport: TransportHandle,
}

impl McpClient {
    /// Perform the initialize handshake over a connected transport
    pub async fn connect(transport: TransportHandle) -> BrokerResult<Self> {
        let request = JsonRpcRequest::new(
            None,
            "initialize".to_string(),
            Some(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": "switchboard",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            })),
        );

        let response = transport.send_request(request).await?;
        if let Some(error) = response.error {
            return Err(BrokerError::Upstream(format!(
                "initialize failed: {}",
                error.message
            )));
        }
        debug!(
            "initialized MCP session over {} transport",
            transport.kind()
        );

        transport
            .send_notification(JsonRpcNotification::new(
                "notifications/initialized".to_string(),
                None,
            ))
            .await?;

        Ok(Self { transport })
    }

    /// Tools the upstream currently announces, in upstream order
    pub async fn list_tools(&self) -> BrokerResult<Vec<McpTool>> {
        let request = JsonRpcRequest::new(None, "tools/list".to_string(), None);
        let response = self.transport.send_request(request).await?;

        if let Some(error) = response.error {
            return Err(BrokerError::Upstream(error.message));
        }
        let result = response
            .result
            .ok_or_else(|| BrokerError::Upstream("tools/list returned no result".to_string()))?;

        let parsed: ListToolsResult = serde_json::from_value(result)
            .map_err(|e| BrokerError::Upstream(format!("invalid tools/list result: {}", e)))?;
        Ok(parsed.tools)
    }

    /// Invoke a tool by its upstream name; the result passes through verbatim
    pub async fn call_tool(&self, name: &str, args: Value) -> BrokerResult<Value> {
        let request = JsonRpcRequest::new(
            None,
            "tools/call".to_string(),
            Some(json!({ "name": name, "arguments": args })),
        );
        let response = self.transport.send_request(request).await?;

        if let Some(error) = response.error {
            return Err(BrokerError::Upstream(error.message));
        }
        response
            .result
            .ok_or_else(|| BrokerError::Upstream("tools/call returned no result".to_string()))
    }

    pub async fn is_healthy(&self) -> bool {
        self.transport.is_healthy().await
    }

    pub async fn close(&self) -> BrokerResult<()> {
        self.transport.close().await
    }

    pub fn transport_kind(&self) -> &'static str {
        self.transport.kind()
    }
}
