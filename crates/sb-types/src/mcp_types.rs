//! Tool descriptor types shared between transports, filter, and gateway

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tool definition as announced by an upstream MCP server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpTool {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(rename = "inputSchema", default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

/// Tool as presented to a downstream client after filtering
///
/// `name` carries any client- or globally-configured rename; `original_name`
/// is always the name the upstream server announced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilteredTool {
    pub name: String,

    #[serde(rename = "originalName")]
    pub original_name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(rename = "inputSchema", skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}
