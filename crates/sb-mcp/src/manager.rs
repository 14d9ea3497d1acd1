//! Upstream server lifecycle management
//!
//! Owns the in-memory maps (records, live clients, name lookup, status) and
//! the start/stop/remove operations over them. Lifecycle operations for one
//! server are serialized; the store remains the authority for the records
//! themselves.

use crate::client::McpClient;
use crate::transport::{SseTransport, StdioTransport, StreamableTransport, TransportHandle};
use dashmap::DashMap;
use sb_config::{InputParam, ServerConfig, ServerStatus, ServerType};
use sb_filter::ToolFilterService;
use sb_oauth::HeaderSource;
use sb_store::Store;
use sb_types::{BrokerError, BrokerResult};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Local spawn to first message, remote connect to handshake
const START_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ServerManager {
    store: Store,
    filter: ToolFilterService,
    headers: Arc<dyn HeaderSource>,

    /// Full records (server_id -> config)
    servers: DashMap<String, ServerConfig>,

    /// Live transports (server_id -> client); `running` iff present
    clients: DashMap<String, Arc<McpClient>>,

    /// Name lookup for external systems that address by name
    name_to_id: DashMap<String, String>,

    /// Status mirror (server_id -> status)
    status: DashMap<String, ServerStatus>,

    /// Last start error per server
    errors: DashMap<String, String>,

    /// Per-server lifecycle serialization
    lifecycle: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl ServerManager {
    pub fn new(store: Store, filter: ToolFilterService, headers: Arc<dyn HeaderSource>) -> Self {
        Self {
            store,
            filter,
            headers,
            servers: DashMap::new(),
            clients: DashMap::new(),
            name_to_id: DashMap::new(),
            status: DashMap::new(),
            errors: DashMap::new(),
            lifecycle: DashMap::new(),
        }
    }

    /// Populate the maps from the store
    pub fn load(&self) -> BrokerResult<usize> {
        let servers = self.store.list_servers()?;
        let count = servers.len();
        for config in servers {
            self.name_to_id.insert(config.name.clone(), config.id.clone());
            self.status.insert(config.id.clone(), ServerStatus::Stopped);
            self.servers.insert(config.id.clone(), config);
        }
        info!("loaded {} server records", count);
        Ok(count)
    }

    /// Persist and register a new server
    pub fn add_server(&self, config: ServerConfig) -> BrokerResult<()> {
        self.store.insert_server(&config)?;
        self.name_to_id.insert(config.name.clone(), config.id.clone());
        self.status.insert(config.id.clone(), ServerStatus::Stopped);
        self.servers.insert(config.id.clone(), config);
        Ok(())
    }

    pub fn get_server(&self, server_id: &str) -> Option<ServerConfig> {
        self.servers.get(server_id).map(|entry| entry.clone())
    }

    pub fn list_servers(&self) -> Vec<ServerConfig> {
        self.servers.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Resolve by id, else by name
    pub fn resolve_id(&self, server_ref: &str) -> Option<String> {
        if self.servers.contains_key(server_ref) {
            return Some(server_ref.to_string());
        }
        self.name_to_id.get(server_ref).map(|entry| entry.clone())
    }

    pub fn status(&self, server_id: &str) -> ServerStatus {
        self.status
            .get(server_id)
            .map(|entry| *entry)
            .unwrap_or(ServerStatus::Stopped)
    }

    pub fn error_message(&self, server_id: &str) -> Option<String> {
        self.errors.get(server_id).map(|entry| entry.clone())
    }

    pub fn is_running(&self, server_id: &str) -> bool {
        self.clients.contains_key(server_id)
    }

    pub fn get_client(&self, server_id: &str) -> Option<Arc<McpClient>> {
        self.clients.get(server_id).map(|entry| entry.clone())
    }

    /// Start a server; no-op when already running
    pub async fn start(&self, server_id: &str) -> BrokerResult<()> {
        let guard = self.lifecycle_lock(server_id);
        let _held = guard.lock().await;

        let config = self
            .servers
            .get(server_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| BrokerError::NotFound(format!("server {}", server_id)))?;

        if config.disabled {
            return Err(BrokerError::ServerNotRunning(format!(
                "server {} is disabled",
                config.name
            )));
        }
        if self.clients.contains_key(server_id) {
            return Ok(());
        }

        info!("starting MCP server {} ({})", config.name, server_id);
        self.status.insert(server_id.to_string(), ServerStatus::Starting);

        match tokio::time::timeout(START_TIMEOUT, self.open_client(&config)).await {
            Ok(Ok(client)) => {
                let client = Arc::new(client);
                self.clients.insert(server_id.to_string(), client.clone());
                self.status.insert(server_id.to_string(), ServerStatus::Running);
                self.errors.remove(server_id);
                info!(
                    server = %config.name,
                    transport = client.transport_kind(),
                    "MCP server started"
                );

                self.spawn_discovery(server_id, client);
                Ok(())
            }
            Ok(Err(e)) => {
                let message = e.to_string();
                self.status.insert(server_id.to_string(), ServerStatus::Error);
                self.errors.insert(server_id.to_string(), message.clone());
                error!("failed to start {}: {}", config.name, message);
                Err(e)
            }
            Err(_) => {
                let message = format!("server {} did not come up within 30s", config.name);
                self.status.insert(server_id.to_string(), ServerStatus::Error);
                self.errors.insert(server_id.to_string(), message.clone());
                Err(BrokerError::ServerNotRunning(message))
            }
        }
    }

    /// Stop a server; idempotent
    pub async fn stop(&self, server_id: &str) -> BrokerResult<()> {
        let guard = self.lifecycle_lock(server_id);
        let _held = guard.lock().await;
        self.stop_locked(server_id).await
    }

    async fn stop_locked(&self, server_id: &str) -> BrokerResult<()> {
        if let Some((_, client)) = self.clients.remove(server_id) {
            self.status.insert(server_id.to_string(), ServerStatus::Stopping);
            if let Err(e) = client.close().await {
                warn!("error closing transport for {}: {}", server_id, e);
            }
            info!("MCP server stopped: {}", server_id);
        }
        self.status.insert(server_id.to_string(), ServerStatus::Stopped);
        Ok(())
    }

    /// Stop then start
    pub async fn restart(&self, server_id: &str) -> BrokerResult<()> {
        self.stop(server_id).await?;
        self.start(server_id).await
    }

    /// Remove a server entirely; token grants and preferences cascade away
    pub async fn remove(&self, server_id: &str) -> BrokerResult<bool> {
        let guard = self.lifecycle_lock(server_id);
        let _held = guard.lock().await;

        self.stop_locked(server_id).await?;
        let existed = self.store.delete_server(server_id)?;

        if let Some((_, config)) = self.servers.remove(server_id) {
            self.name_to_id.remove(&config.name);
        }
        self.status.remove(server_id);
        self.errors.remove(server_id);
        self.lifecycle.remove(server_id);

        Ok(existed)
    }

    /// Start every non-disabled auto-start server; failures do not abort
    pub async fn auto_start_all(&self) {
        let candidates: Vec<String> = self
            .servers
            .iter()
            .filter(|entry| entry.auto_start && !entry.disabled)
            .map(|entry| entry.id.clone())
            .collect();

        for server_id in candidates {
            if let Err(e) = self.start(&server_id).await {
                warn!("auto-start failed for {}: {}", server_id, e);
            }
        }
    }

    /// Workspace switch: stop everything and clear the maps
    pub async fn clear_all(&self) {
        let running: Vec<String> = self.clients.iter().map(|entry| entry.key().clone()).collect();
        for server_id in running {
            if let Err(e) = self.stop(&server_id).await {
                warn!("failed to stop {} during clear: {}", server_id, e);
            }
        }
        self.servers.clear();
        self.clients.clear();
        self.name_to_id.clear();
        self.status.clear();
        self.errors.clear();
        self.lifecycle.clear();
    }

    fn lifecycle_lock(&self, server_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.lifecycle
            .entry(server_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn open_client(&self, config: &ServerConfig) -> BrokerResult<McpClient> {
        match config.server_type {
            ServerType::Local => {
                let command = config.command.as_deref().ok_or_else(|| {
                    BrokerError::ServerNotRunning(format!(
                        "local server {} has no command",
                        config.name
                    ))
                })?;
                let args = substitute_args(&config.args, &config.input_params, &config.env);

                let transport =
                    Arc::new(StdioTransport::spawn(command, &args, &config.env).await?);
                let handle = TransportHandle::Stdio(transport.clone());

                match McpClient::connect(handle).await {
                    Ok(client) => Ok(client),
                    Err(e) => {
                        // Surface the process's own words where available
                        let stderr = transport.stderr_tail().join("\n");
                        let _ = transport.close().await;
                        if stderr.is_empty() {
                            Err(e)
                        } else {
                            Err(BrokerError::ServerNotRunning(format!("{}: {}", e, stderr)))
                        }
                    }
                }
            }
            ServerType::Remote => {
                let url = remote_url(config)?;
                let headers = self.connection_headers(config).await?;
                let transport = SseTransport::connect(
                    &url,
                    headers,
                    Some((self.headers.clone(), config.id.clone())),
                )
                .await?;
                McpClient::connect(TransportHandle::Sse(Arc::new(transport))).await
            }
            ServerType::RemoteStreamable => {
                let url = remote_url(config)?;
                let headers = self.connection_headers(config).await?;
                let transport = StreamableTransport::connect(&url, headers)?;
                McpClient::connect(TransportHandle::Streamable(Arc::new(transport))).await
            }
        }
    }

    /// Headers for a remote connection: OAuth injection ahead of any
    /// pre-configured bearer token
    async fn connection_headers(&self, config: &ServerConfig) -> BrokerResult<Vec<(String, String)>> {
        let mut headers = self.headers.headers_for(&config.id).await?;
        if headers.is_empty() {
            if let Some(bearer) = config.bearer_token.as_deref() {
                headers.push(("Authorization".to_string(), format!("Bearer {}", bearer)));
            }
        }
        Ok(headers)
    }

    fn spawn_discovery(&self, server_id: &str, client: Arc<McpClient>) {
        let filter = self.filter.clone();
        let server_id = server_id.to_string();
        tokio::spawn(async move {
            match client.list_tools().await {
                Ok(tools) => {
                    info!("server {} announced {} tools", server_id, tools.len());
                    if let Err(e) = filter.sync_discovered(&server_id, &tools) {
                        warn!("tool preference sync failed for {}: {}", server_id, e);
                    }
                }
                Err(e) => warn!("tool discovery failed for {}: {}", server_id, e),
            }
        });
    }

    #[cfg(any(test, feature = "test-util"))]
    pub fn insert_mock_client(&self, server_id: &str, client: McpClient) {
        self.clients.insert(server_id.to_string(), Arc::new(client));
        self.status.insert(server_id.to_string(), ServerStatus::Running);
    }
}

fn remote_url(config: &ServerConfig) -> BrokerResult<String> {
    config.remote_url.clone().ok_or_else(|| {
        BrokerError::ServerNotRunning(format!("server {} has no remote_url", config.name))
    })
}

/// Substitute `${PARAM}`, `{PARAM}`, and the `user_config.` spellings in
/// args, using input-param defaults overlaid with the env map
fn substitute_args(
    args: &[String],
    params: &[InputParam],
    env: &HashMap<String, String>,
) -> Vec<String> {
    args.iter()
        .map(|arg| {
            let mut out = arg.clone();
            for param in params {
                let value = env
                    .get(&param.name)
                    .cloned()
                    .or_else(|| param.default.clone())
                    .unwrap_or_default();
                for pattern in [
                    format!("${{{}}}", param.name),
                    format!("{{{}}}", param.name),
                    format!("${{user_config.{}}}", param.name),
                    format!("{{user_config.{}}}", param.name),
                ] {
                    out = out.replace(&pattern, &value);
                }
            }
            out
        })
        .collect()
}
