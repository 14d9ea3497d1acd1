//! Test doubles for the transport layer

use crate::protocol::{JsonRpcRequest, JsonRpcResponse};
use parking_lot::Mutex;
use sb_types::{BrokerResult, McpTool};
use serde_json::{json, Value};

/// In-memory transport answering the MCP methods with canned data
///
/// Records every `tools/call` so tests can assert on forwarded names and
/// arguments.
#[derive(Default)]
pub struct MockTransport {
    pub tools: Mutex<Vec<McpTool>>,
    pub calls: Mutex<Vec<(String, Value)>>,
    /// Optional fixed result for tools/call
    pub call_result: Mutex<Option<Value>>,
}

impl MockTransport {
    pub fn with_tools(tools: Vec<McpTool>) -> Self {
        Self {
            tools: Mutex::new(tools),
            ..Default::default()
        }
    }

    pub async fn send_request(&self, request: JsonRpcRequest) -> BrokerResult<JsonRpcResponse> {
        let id = request.id.clone().unwrap_or(Value::Number(0.into()));
        let result = match request.method.as_str() {
            "initialize" => json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "serverInfo": {"name": "mock", "version": "0.0.0"},
            }),
            "tools/list" => json!({ "tools": self.tools.lock().clone() }),
            "tools/call" => {
                let params = request.params.unwrap_or(Value::Null);
                let name = params
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let args = params.get("arguments").cloned().unwrap_or(Value::Null);
                self.calls.lock().push((name.clone(), args));
                self.call_result
                    .lock()
                    .clone()
                    .unwrap_or(json!({ "content": [{"type": "text", "text": format!("ran {name}")}] }))
            }
            other => json!({ "unhandled": other }),
        };
        Ok(JsonRpcResponse::success(id, result))
    }
}
