//! Router gate
//!
//! Resolves an inbound tool call: authenticate the token, authorize against
//! its grant set, apply the tool filter, and forward to the live upstream.
//! Upstream responses pass through verbatim.

use crate::manager::ServerManager;
use sb_filter::ToolFilterService;
use sb_tokens::{TokenGrant, TokenService};
use sb_types::{BrokerError, BrokerResult, FilteredTool};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

pub struct RouterGate {
    tokens: TokenService,
    filter: ToolFilterService,
    manager: Arc<ServerManager>,
}

impl RouterGate {
    pub fn new(tokens: TokenService, filter: ToolFilterService, manager: Arc<ServerManager>) -> Self {
        Self {
            tokens,
            filter,
            manager,
        }
    }

    /// Forward a tool call after the ordered checks pass
    ///
    /// `server_ref` may be a server id or its unique name. `tool_name` is
    /// the name visible to this client, which may be a configured rename.
    pub async fn call_tool(
        &self,
        token_id: &str,
        server_ref: &str,
        tool_name: &str,
        args: Value,
    ) -> BrokerResult<Value> {
        let (grant, server_id) = self.authorize(token_id, server_ref)?;

        let upstream_name =
            self.filter
                .resolve_upstream_name(&server_id, tool_name, Some(&grant.client_id))?;
        let preference = self
            .filter
            .resolve(&server_id, &upstream_name, Some(&grant.client_id))?;
        if !preference.enabled {
            return Err(BrokerError::ToolDisabled(tool_name.to_string()));
        }

        let client = self
            .manager
            .get_client(&server_id)
            .ok_or_else(|| BrokerError::ServerNotRunning(server_id.clone()))?;

        debug!(
            "forwarding {} -> {}/{}",
            tool_name, server_id, upstream_name
        );
        client.call_tool(&upstream_name, args).await
    }

    /// List the tools this client may see on a server
    ///
    /// Upstream ordering is preserved; disabled tools are dropped and
    /// name/description overrides applied.
    pub async fn list_tools(
        &self,
        token_id: &str,
        server_ref: &str,
    ) -> BrokerResult<Vec<FilteredTool>> {
        let (grant, server_id) = self.authorize(token_id, server_ref)?;

        let client = self
            .manager
            .get_client(&server_id)
            .ok_or_else(|| BrokerError::ServerNotRunning(server_id.clone()))?;

        let tools = client.list_tools().await?;
        self.filter
            .filter_tools(&server_id, Some(&grant.client_id), &tools)
    }

    /// Checks 1-3: token validity, server resolution, grant membership
    fn authorize(&self, token_id: &str, server_ref: &str) -> BrokerResult<(TokenGrant, String)> {
        let grant = self.tokens.validate(token_id)?;

        let server_id = self
            .manager
            .resolve_id(server_ref)
            .ok_or_else(|| BrokerError::NotFound(format!("server {}", server_ref)))?;

        // An empty grant set denies everything
        if !grant.server_ids.iter().any(|granted| granted == &server_id) {
            return Err(BrokerError::Forbidden(server_id));
        }

        Ok((grant, server_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::McpClient;
    use crate::testing::MockTransport;
    use crate::transport::TransportHandle;
    use sb_config::{ClientRecord, ServerConfig};
    use sb_crypto::CryptoService;
    use sb_oauth::{AuditLog, OAuthService, RateLimiter, RecordingBrowser};
    use sb_store::Store;
    use sb_types::McpTool;
    use serde_json::json;

    struct Gate {
        gate: RouterGate,
        manager: Arc<ServerManager>,
        filter: ToolFilterService,
        tokens: TokenService,
        client_id: String,
        _dir: tempfile::TempDir,
    }

    fn tool(name: &str, description: &str) -> McpTool {
        McpTool {
            name: name.to_string(),
            description: Some(description.to_string()),
            input_schema: None,
        }
    }

    async fn mock_client(tools: Vec<McpTool>) -> (McpClient, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::with_tools(tools));
        let client = McpClient::connect(TransportHandle::Mock(transport.clone()))
            .await
            .unwrap();
        (client, transport)
    }

    async fn setup() -> (Gate, ServerConfig, ServerConfig) {
        let dir = tempfile::tempdir().unwrap();
        let crypto = Arc::new(
            CryptoService::load_or_create(
                &dir.path().join(".oauth-key"),
                &dir.path().join("oauth-keys.json"),
            )
            .unwrap(),
        );
        let store = Store::open_in_memory(crypto.clone()).unwrap();
        let audit =
            Arc::new(AuditLog::new(store.clone(), &dir.path().join("oauth-audit.log")).unwrap());
        let oauth = OAuthService::with_browser(
            store.clone(),
            crypto,
            audit,
            Arc::new(RateLimiter::new()),
            Arc::new(RecordingBrowser::default()),
            43999,
        );

        let filter = ToolFilterService::new(store.clone());
        let tokens = TokenService::new(store.clone());
        let manager = Arc::new(ServerManager::new(
            store.clone(),
            filter.clone(),
            Arc::new(oauth),
        ));

        let client_record = ClientRecord::new("ide", None);
        store.insert_client(&client_record).unwrap();

        let server_a = ServerConfig::local("server-a", "echo", vec![]);
        let server_b = ServerConfig::local("server-b", "echo", vec![]);
        manager.add_server(server_a.clone()).unwrap();
        manager.add_server(server_b.clone()).unwrap();

        let gate = RouterGate::new(tokens.clone(), filter.clone(), manager.clone());
        (
            Gate {
                gate,
                manager,
                filter,
                tokens,
                client_id: client_record.id,
                _dir: dir,
            },
            server_a,
            server_b,
        )
    }

    #[tokio::test]
    async fn test_filtered_list_tools_scenario() {
        let (fixture, server_a, server_b) = setup().await;

        // A announces t1, t2, t3; B announces u1
        let (client_a, _) = mock_client(vec![
            tool("t1", "one"),
            tool("t2", "two"),
            tool("t3", "three"),
        ])
        .await;
        let (client_b, _) = mock_client(vec![tool("u1", "u-one")]).await;
        fixture.manager.insert_mock_client(&server_a.id, client_a);
        fixture.manager.insert_mock_client(&server_b.id, client_b);

        let tools_a = fixture.manager.get_client(&server_a.id).unwrap().list_tools().await.unwrap();
        fixture.filter.sync_discovered(&server_a.id, &tools_a).unwrap();

        // Global: disable t2. Client-specific: disable t3, rename t1 -> alpha
        fixture
            .filter
            .set_preference(&server_a.id, "t2", None, false, None, None)
            .unwrap();
        fixture
            .filter
            .set_preference(
                &server_a.id,
                "t3",
                Some(&fixture.client_id),
                false,
                None,
                None,
            )
            .unwrap();
        fixture
            .filter
            .set_preference(
                &server_a.id,
                "t1",
                Some(&fixture.client_id),
                true,
                Some("alpha".to_string()),
                None,
            )
            .unwrap();

        // Token grants A only
        let token = fixture
            .tokens
            .generate(&fixture.client_id, vec![server_a.id.clone()], vec![])
            .unwrap();

        let visible = fixture.gate.list_tools(&token.id, "server-a").await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].name, "alpha");
        assert_eq!(visible[0].original_name, "t1");

        let err = fixture.gate.list_tools(&token.id, "server-b").await.unwrap_err();
        assert!(matches!(err, BrokerError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_call_tool_maps_rename_to_upstream_name() {
        let (fixture, server_a, _) = setup().await;

        let (client_a, transport) = mock_client(vec![tool("t1", "one")]).await;
        fixture.manager.insert_mock_client(&server_a.id, client_a);
        fixture
            .filter
            .sync_discovered(&server_a.id, &[tool("t1", "one")])
            .unwrap();
        fixture
            .filter
            .set_preference(
                &server_a.id,
                "t1",
                Some(&fixture.client_id),
                true,
                Some("alpha".to_string()),
                None,
            )
            .unwrap();

        let token = fixture
            .tokens
            .generate(&fixture.client_id, vec![server_a.id.clone()], vec![])
            .unwrap();

        fixture
            .gate
            .call_tool(&token.id, &server_a.id, "alpha", json!({"x": 1}))
            .await
            .unwrap();

        let calls = transport.calls.lock();
        assert_eq!(calls.len(), 1);
        // The upstream sees its own tool name, not the rename
        assert_eq!(calls[0].0, "t1");
        assert_eq!(calls[0].1, json!({"x": 1}));
    }

    #[tokio::test]
    async fn test_ordered_check_failures() {
        let (fixture, server_a, _) = setup().await;

        // Unknown token
        let err = fixture
            .gate
            .call_tool("bogus", &server_a.id, "t1", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Unauthenticated));

        // Empty grant set denies all
        let token = fixture
            .tokens
            .generate(&fixture.client_id, vec![], vec![])
            .unwrap();
        let err = fixture
            .gate
            .call_tool(&token.id, &server_a.id, "t1", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Forbidden(_)));

        // Unknown server
        let token = fixture
            .tokens
            .generate(&fixture.client_id, vec![server_a.id.clone()], vec![])
            .unwrap();
        let err = fixture
            .gate
            .call_tool(&token.id, "nope", "t1", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::NotFound(_)));

        // Server known but not running
        let err = fixture
            .gate
            .call_tool(&token.id, &server_a.id, "t1", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::ServerNotRunning(_)));
    }

    /// Invariant: a call succeeds only when the token validated, its grant
    /// set contained the target, and the resolved preference was enabled.
    /// Exercised over randomized grants, preference rows, and calls.
    #[tokio::test]
    async fn test_random_calls_never_violate_the_authorization_invariant() {
        let (fixture, server_a, server_b) = setup().await;
        let tool_names = ["t0", "t1", "t2", "t3"];

        for server in [&server_a, &server_b] {
            let tools: Vec<McpTool> = tool_names.iter().map(|n| tool(n, "desc")).collect();
            let (client, _) = mock_client(tools.clone()).await;
            fixture.manager.insert_mock_client(&server.id, client);
            fixture.filter.sync_discovered(&server.id, &tools).unwrap();
        }

        let mut seed: u64 = 0x9E37_79B9_7F4A_7C15;
        let mut next = move || {
            seed = seed
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (seed >> 33) as u32
        };

        // Model of preference rows: (server, tool) -> (global, client)
        let mut model: std::collections::HashMap<(String, String), (Option<bool>, Option<bool>)> =
            std::collections::HashMap::new();

        for _ in 0..60 {
            let server = if next() % 2 == 0 { &server_a } else { &server_b };
            let tool_name = tool_names[(next() % 4) as usize];
            let key = (server.id.clone(), tool_name.to_string());

            // Randomly mutate a preference row in one of the scopes
            match next() % 3 {
                0 => {
                    let enabled = next() % 2 == 0;
                    fixture
                        .filter
                        .set_preference(&server.id, tool_name, None, enabled, None, None)
                        .unwrap();
                    model.entry(key.clone()).or_default().0 = Some(enabled);
                }
                1 => {
                    let enabled = next() % 2 == 0;
                    fixture
                        .filter
                        .set_preference(
                            &server.id,
                            tool_name,
                            Some(&fixture.client_id),
                            enabled,
                            None,
                            None,
                        )
                        .unwrap();
                    model.entry(key.clone()).or_default().1 = Some(enabled);
                }
                _ => {}
            }

            // Random grant set
            let mut grant = Vec::new();
            if next() % 2 == 0 {
                grant.push(server_a.id.clone());
            }
            if next() % 2 == 0 {
                grant.push(server_b.id.clone());
            }
            let token = fixture
                .tokens
                .generate(&fixture.client_id, grant.clone(), vec![])
                .unwrap();

            let (global, client) = model.get(&key).copied().unwrap_or((None, None));
            let expected_enabled = client.unwrap_or(global.unwrap_or(true));
            let expected_granted = grant.contains(&server.id);

            let result = fixture
                .gate
                .call_tool(&token.id, &server.id, tool_name, json!({}))
                .await;

            match (expected_granted, expected_enabled) {
                (false, _) => assert!(matches!(result, Err(BrokerError::Forbidden(_)))),
                (true, false) => assert!(matches!(result, Err(BrokerError::ToolDisabled(_)))),
                (true, true) => assert!(result.is_ok()),
            }
        }
    }

    #[tokio::test]
    async fn test_disabled_tool_is_rejected() {
        let (fixture, server_a, _) = setup().await;

        let (client_a, transport) = mock_client(vec![tool("t1", "one")]).await;
        fixture.manager.insert_mock_client(&server_a.id, client_a);
        fixture
            .filter
            .sync_discovered(&server_a.id, &[tool("t1", "one")])
            .unwrap();
        fixture
            .filter
            .set_preference(&server_a.id, "t1", None, false, None, None)
            .unwrap();

        let token = fixture
            .tokens
            .generate(&fixture.client_id, vec![server_a.id.clone()], vec![])
            .unwrap();

        let err = fixture
            .gate
            .call_tool(&token.id, &server_a.id, "t1", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::ToolDisabled(_)));
        // The check fired before any upstream traffic
        assert!(transport.calls.lock().is_empty());
    }
}
