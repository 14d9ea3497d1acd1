//! Domain records for servers and clients
//!
//! These are the persisted shapes; runtime-only state (status, error text,
//! recent logs) is owned by the server manager and never written to disk.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// How an upstream MCP server is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerType {
    /// Child process speaking MCP over stdio
    Local,
    /// Remote HTTP endpoint speaking MCP over SSE
    Remote,
    /// Remote HTTP endpoint speaking streamable HTTP
    RemoteStreamable,
}

impl ServerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerType::Local => "local",
            ServerType::Remote => "remote",
            ServerType::RemoteStreamable => "remote-streamable",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local" => Some(ServerType::Local),
            "remote" => Some(ServerType::Remote),
            "remote-streamable" => Some(ServerType::RemoteStreamable),
            _ => None,
        }
    }
}

/// Declared type of a named input parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InputParamType {
    #[default]
    String,
    Number,
    Boolean,
}

/// A named, typed, defaulted input parameter for a local server
///
/// Parameter values are substituted into `args` as `${NAME}`, `{NAME}`, or
/// the `user_config.NAME` spellings before the child process is spawned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputParam {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, rename = "type")]
    pub param_type: InputParamType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,

    #[serde(default)]
    pub required: bool,
}

/// Runtime status of an upstream server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

/// Persisted configuration for one upstream MCP server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Opaque identifier
    pub id: String,

    /// Unique human-assigned name
    pub name: String,

    #[serde(rename = "serverType")]
    pub server_type: ServerType,

    /// Command to spawn (local servers)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Command arguments, possibly containing `${PARAM}` placeholders
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment passed to the child process
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Endpoint URL (remote variants)
    #[serde(default, rename = "remoteUrl", skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,

    /// Pre-configured bearer token for remote variants
    #[serde(default, rename = "bearerToken", skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,

    #[serde(default, rename = "inputParams")]
    pub input_params: Vec<InputParam>,

    #[serde(default, rename = "autoStart")]
    pub auto_start: bool,

    #[serde(default)]
    pub disabled: bool,

    #[serde(
        default,
        rename = "latestKnownVersion",
        skip_serializing_if = "Option::is_none"
    )]
    pub latest_known_version: Option<String>,

    #[serde(
        default,
        rename = "toolPermissions",
        skip_serializing_if = "Option::is_none"
    )]
    pub tool_permissions: Option<Value>,

    #[serde(rename = "createdAt")]
    pub created_at: i64,

    #[serde(rename = "updatedAt")]
    pub updated_at: i64,
}

impl ServerConfig {
    /// Create a new server configuration with a fresh id
    pub fn new(name: impl Into<String>, server_type: ServerType) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            server_type,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            remote_url: None,
            bearer_token: None,
            input_params: Vec::new(),
            auto_start: false,
            disabled: false,
            latest_known_version: None,
            tool_permissions: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a local (stdio) server configuration
    pub fn local(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        let mut config = Self::new(name, ServerType::Local);
        config.command = Some(command.into());
        config.args = args;
        config
    }

    /// Create a remote (SSE) server configuration
    pub fn remote(name: impl Into<String>, url: impl Into<String>) -> Self {
        let mut config = Self::new(name, ServerType::Remote);
        config.remote_url = Some(url.into());
        config
    }

    /// Create a remote streamable-HTTP server configuration
    pub fn remote_streamable(name: impl Into<String>, url: impl Into<String>) -> Self {
        let mut config = Self::new(name, ServerType::RemoteStreamable);
        config.remote_url = Some(url.into());
        config
    }
}

/// A registered downstream API client
///
/// Client lifetime is independent of its tokens; deleting a client cascades
/// through its tokens at the store layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRecord {
    pub id: String,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(rename = "createdAt")]
    pub created_at: i64,

    #[serde(rename = "updatedAt")]
    pub updated_at: i64,
}

impl ClientRecord {
    pub fn new(name: impl Into<String>, description: Option<String>) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description,
            created_at: now,
            updated_at: now,
        }
    }
}
