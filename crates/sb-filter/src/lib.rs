//! Per-(server, client) tool policy
//!
//! Resolves whether a tool is exposed, and under what name and description,
//! for a global or client-specific scope. Rows are initialized when a server
//! announces its tools and cleaned up when tools vanish. Resolution results
//! are cached per scope and invalidated on any write to that scope.

use dashmap::DashMap;
use sb_store::{Store, ToolPreferenceRow};
use sb_types::{BrokerResult, McpTool};
use std::collections::HashMap;
use tracing::{debug, info};

/// Resolved policy for one `(server, tool, client?)` query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPreference {
    pub enabled: bool,
    pub custom_name: Option<String>,
    pub custom_description: Option<String>,
}

impl ResolvedPreference {
    /// The implicit default when no row exists at any scope
    fn default_enabled() -> Self {
        Self {
            enabled: true,
            custom_name: None,
            custom_description: None,
        }
    }
}

type ScopeKey = (String, Option<String>);
type ScopeMap = HashMap<String, ToolPreferenceRow>;

/// Tool filter service with a per-scope cache
#[derive(Clone)]
pub struct ToolFilterService {
    store: Store,
    cache: std::sync::Arc<DashMap<ScopeKey, ScopeMap>>,
}

impl ToolFilterService {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            cache: std::sync::Arc::new(DashMap::new()),
        }
    }

    /// Resolve policy: client-specific row, else global row, else enabled
    pub fn resolve(
        &self,
        server_id: &str,
        tool_name: &str,
        client_id: Option<&str>,
    ) -> BrokerResult<ResolvedPreference> {
        if let Some(client_id) = client_id {
            let scoped = self.scope_map(server_id, Some(client_id))?;
            if let Some(row) = scoped.get(tool_name) {
                return Ok(resolved_from(row));
            }
        }

        let global = self.scope_map(server_id, None)?;
        Ok(global
            .get(tool_name)
            .map(resolved_from)
            .unwrap_or_else(ResolvedPreference::default_enabled))
    }

    /// Apply the resolved policy to an announced tool list
    ///
    /// Disabled tools are dropped; enabled ones carry any rename or
    /// description override. Upstream ordering is preserved.
    pub fn filter_tools(
        &self,
        server_id: &str,
        client_id: Option<&str>,
        tools: &[McpTool],
    ) -> BrokerResult<Vec<sb_types::FilteredTool>> {
        let mut out = Vec::with_capacity(tools.len());
        for tool in tools {
            let pref = self.resolve(server_id, &tool.name, client_id)?;
            if !pref.enabled {
                continue;
            }
            out.push(sb_types::FilteredTool {
                name: pref.custom_name.clone().unwrap_or_else(|| tool.name.clone()),
                original_name: tool.name.clone(),
                description: pref.custom_description.clone().or_else(|| tool.description.clone()),
                input_schema: tool.input_schema.clone(),
            });
        }
        Ok(out)
    }

    /// Map a client-visible tool name back to the upstream name
    ///
    /// Checks the client scope first, then the global scope, so a rename in
    /// either is honored. Falls back to the name itself.
    pub fn resolve_upstream_name(
        &self,
        server_id: &str,
        visible_name: &str,
        client_id: Option<&str>,
    ) -> BrokerResult<String> {
        if let Some(client_id) = client_id {
            let scoped = self.scope_map(server_id, Some(client_id))?;
            if let Some(row) = scoped
                .values()
                .find(|row| row.custom_name.as_deref() == Some(visible_name))
            {
                return Ok(row.tool_name.clone());
            }
        }

        let global = self.scope_map(server_id, None)?;
        if let Some(row) = global
            .values()
            .find(|row| row.custom_name.as_deref() == Some(visible_name))
        {
            return Ok(row.tool_name.clone());
        }

        Ok(visible_name.to_string())
    }

    /// Sync preferences with a fresh tool announcement
    ///
    /// Absent global rows are created enabled with the announced description
    /// captured; existing rows only have `original_description` refreshed
    /// when it changed. Rows for tools no longer announced are removed,
    /// including client-specific ones.
    pub fn sync_discovered(&self, server_id: &str, tools: &[McpTool]) -> BrokerResult<()> {
        let existing = self.store.list_preferences(server_id, None)?;
        let existing_by_name: HashMap<&str, &ToolPreferenceRow> = existing
            .iter()
            .map(|row| (row.tool_name.as_str(), row))
            .collect();

        for tool in tools {
            match existing_by_name.get(tool.name.as_str()) {
                None => {
                    self.store.upsert_preference(&ToolPreferenceRow {
                        server_id: server_id.to_string(),
                        tool_name: tool.name.clone(),
                        client_id: None,
                        enabled: true,
                        original_description: tool.description.clone(),
                        custom_name: None,
                        custom_description: None,
                    })?;
                    debug!("initialized preference for {}/{}", server_id, tool.name);
                }
                Some(row) if row.original_description != tool.description => {
                    self.store.update_original_description(
                        server_id,
                        &tool.name,
                        tool.description.as_deref(),
                    )?;
                }
                Some(_) => {}
            }
        }

        let announced: Vec<String> = tools.iter().map(|t| t.name.clone()).collect();
        let removed = self.store.delete_preferences_not_in(server_id, &announced)?;
        if removed > 0 {
            info!(
                "removed {} stale tool preferences for server {}",
                removed, server_id
            );
        }

        self.invalidate_server(server_id);
        Ok(())
    }

    /// Write one preference row in a scope
    pub fn set_preference(
        &self,
        server_id: &str,
        tool_name: &str,
        client_id: Option<&str>,
        enabled: bool,
        custom_name: Option<String>,
        custom_description: Option<String>,
    ) -> BrokerResult<()> {
        let original_description = self
            .store
            .get_preference(server_id, tool_name, None)?
            .and_then(|row| row.original_description);

        self.store.upsert_preference(&ToolPreferenceRow {
            server_id: server_id.to_string(),
            tool_name: tool_name.to_string(),
            client_id: client_id.map(str::to_string),
            enabled,
            original_description,
            custom_name,
            custom_description,
        })?;

        self.invalidate(server_id, client_id);
        Ok(())
    }

    /// Enable every tool in a scope
    pub fn enable_all(&self, server_id: &str, client_id: Option<&str>) -> BrokerResult<usize> {
        let count = self.store.set_all_enabled(server_id, client_id, true)?;
        self.invalidate(server_id, client_id);
        Ok(count)
    }

    /// Disable every tool in a scope
    pub fn disable_all(&self, server_id: &str, client_id: Option<&str>) -> BrokerResult<usize> {
        let count = self.store.set_all_enabled(server_id, client_id, false)?;
        self.invalidate(server_id, client_id);
        Ok(count)
    }

    /// Reset a scope to defaults
    pub fn reset(&self, server_id: &str, client_id: Option<&str>) -> BrokerResult<usize> {
        let count = self.store.reset_preferences(server_id, client_id)?;
        self.invalidate(server_id, client_id);
        Ok(count)
    }

    fn scope_map(&self, server_id: &str, client_id: Option<&str>) -> BrokerResult<ScopeMap> {
        let key = (server_id.to_string(), client_id.map(str::to_string));
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached.clone());
        }

        let rows = self.store.list_preferences(server_id, client_id)?;
        let map: ScopeMap = rows
            .into_iter()
            .map(|row| (row.tool_name.clone(), row))
            .collect();
        self.cache.insert(key, map.clone());
        Ok(map)
    }

    fn invalidate(&self, server_id: &str, client_id: Option<&str>) {
        match client_id {
            Some(client_id) => {
                self.cache
                    .remove(&(server_id.to_string(), Some(client_id.to_string())));
            }
            // Global writes change the fallback seen by every client scope.
            None => self.invalidate_server(server_id),
        }
    }

    fn invalidate_server(&self, server_id: &str) {
        self.cache.retain(|(sid, _), _| sid.as_str() != server_id);
    }
}

fn resolved_from(row: &ToolPreferenceRow) -> ResolvedPreference {
    ResolvedPreference {
        enabled: row.enabled,
        custom_name: row.custom_name.clone(),
        custom_description: row.custom_description.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sb_config::{ClientRecord, ServerConfig};
    use sb_crypto::CryptoService;
    use std::sync::Arc;

    fn setup() -> (ToolFilterService, Store, String, String, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let crypto = Arc::new(
            CryptoService::load_or_create(
                &dir.path().join(".oauth-key"),
                &dir.path().join("oauth-keys.json"),
            )
            .unwrap(),
        );
        let store = Store::open_in_memory(crypto).unwrap();

        let server = ServerConfig::local("srv", "echo", vec![]);
        store.insert_server(&server).unwrap();
        let client = ClientRecord::new("cli", None);
        store.insert_client(&client).unwrap();

        (
            ToolFilterService::new(store.clone()),
            store,
            server.id,
            client.id,
            dir,
        )
    }

    fn tool(name: &str, description: &str) -> McpTool {
        McpTool {
            name: name.to_string(),
            description: Some(description.to_string()),
            input_schema: None,
        }
    }

    #[test]
    fn test_default_is_enabled() {
        let (filter, _store, server_id, _client_id, _dir) = setup();
        let pref = filter.resolve(&server_id, "unknown_tool", None).unwrap();
        assert!(pref.enabled);
        assert!(pref.custom_name.is_none());
    }

    #[test]
    fn test_resolution_precedence() {
        let (filter, _store, server_id, client_id, _dir) = setup();

        filter
            .sync_discovered(&server_id, &[tool("t1", "first tool")])
            .unwrap();

        // Global disables t1
        filter
            .set_preference(&server_id, "t1", None, false, None, None)
            .unwrap();
        assert!(!filter.resolve(&server_id, "t1", Some(&client_id)).unwrap().enabled);

        // Client row overrides global
        filter
            .set_preference(&server_id, "t1", Some(&client_id), true, None, None)
            .unwrap();
        assert!(filter.resolve(&server_id, "t1", Some(&client_id)).unwrap().enabled);
        // Global scope still disabled
        assert!(!filter.resolve(&server_id, "t1", None).unwrap().enabled);
    }

    #[test]
    fn test_discovery_initializes_and_preserves_customization() {
        let (filter, store, server_id, _client_id, _dir) = setup();

        filter
            .sync_discovered(&server_id, &[tool("t1", "original")])
            .unwrap();
        let row = store.get_preference(&server_id, "t1", None).unwrap().unwrap();
        assert!(row.enabled);
        assert_eq!(row.original_description.as_deref(), Some("original"));

        // User customizes, then upstream changes the announced description
        filter
            .set_preference(
                &server_id,
                "t1",
                None,
                false,
                Some("renamed".to_string()),
                Some("custom desc".to_string()),
            )
            .unwrap();
        filter
            .sync_discovered(&server_id, &[tool("t1", "updated upstream")])
            .unwrap();

        let row = store.get_preference(&server_id, "t1", None).unwrap().unwrap();
        assert_eq!(row.original_description.as_deref(), Some("updated upstream"));
        assert!(!row.enabled);
        assert_eq!(row.custom_name.as_deref(), Some("renamed"));
        assert_eq!(row.custom_description.as_deref(), Some("custom desc"));
    }

    #[test]
    fn test_vanished_tools_are_cleaned_up() {
        let (filter, store, server_id, client_id, _dir) = setup();

        filter
            .sync_discovered(&server_id, &[tool("t1", "a"), tool("t2", "b")])
            .unwrap();
        filter
            .set_preference(&server_id, "t2", Some(&client_id), false, None, None)
            .unwrap();

        filter.sync_discovered(&server_id, &[tool("t1", "a")]).unwrap();

        assert!(store.get_preference(&server_id, "t2", None).unwrap().is_none());
        assert!(store
            .get_preference(&server_id, "t2", Some(&client_id))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_filter_tools_applies_overrides_in_upstream_order() {
        let (filter, _store, server_id, client_id, _dir) = setup();

        let tools = vec![tool("t1", "one"), tool("t2", "two"), tool("t3", "three")];
        filter.sync_discovered(&server_id, &tools).unwrap();

        // Globally disable t2; client renames t1 and disables t3
        filter
            .set_preference(&server_id, "t2", None, false, None, None)
            .unwrap();
        filter
            .set_preference(
                &server_id,
                "t1",
                Some(&client_id),
                true,
                Some("alpha".to_string()),
                None,
            )
            .unwrap();
        filter
            .set_preference(&server_id, "t3", Some(&client_id), false, None, None)
            .unwrap();

        let visible = filter.filter_tools(&server_id, Some(&client_id), &tools).unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].name, "alpha");
        assert_eq!(visible[0].original_name, "t1");
    }

    #[test]
    fn test_resolve_upstream_name() {
        let (filter, _store, server_id, client_id, _dir) = setup();

        filter.sync_discovered(&server_id, &[tool("t1", "one")]).unwrap();
        filter
            .set_preference(
                &server_id,
                "t1",
                Some(&client_id),
                true,
                Some("alpha".to_string()),
                None,
            )
            .unwrap();

        assert_eq!(
            filter
                .resolve_upstream_name(&server_id, "alpha", Some(&client_id))
                .unwrap(),
            "t1"
        );
        assert_eq!(
            filter.resolve_upstream_name(&server_id, "t1", Some(&client_id)).unwrap(),
            "t1"
        );
    }

    #[test]
    fn test_bulk_operations_invalidate_cache() {
        let (filter, _store, server_id, client_id, _dir) = setup();

        filter
            .sync_discovered(&server_id, &[tool("t1", "a"), tool("t2", "b")])
            .unwrap();

        // Warm the cache
        assert!(filter.resolve(&server_id, "t1", Some(&client_id)).unwrap().enabled);

        filter.disable_all(&server_id, Some(&client_id)).unwrap();
        assert!(!filter.resolve(&server_id, "t1", Some(&client_id)).unwrap().enabled);

        filter.enable_all(&server_id, Some(&client_id)).unwrap();
        assert!(filter.resolve(&server_id, "t2", Some(&client_id)).unwrap().enabled);

        filter.reset(&server_id, Some(&client_id)).unwrap();
        assert!(filter.resolve(&server_id, "t1", Some(&client_id)).unwrap().enabled);
    }
}
