//! OAuth 2.1 layer for upstream MCP servers
//!
//! Discovery, authorization-code-with-PKCE browser flows, token lifecycle
//! with coalesced refresh, dynamic client registration, and header
//! injection. Governance (audit, rate limits, key rotation, backup,
//! dataset migration) lives in [`governance`].

pub mod browser;
pub mod discovery;
pub mod flow;
pub mod governance;
pub mod providers;
pub mod registration;
pub mod tokens;

pub use browser::{Browser, RecordingBrowser, SystemBrowser};
pub use discovery::DiscoveryDocument;
pub use governance::audit::{AuditEntry, AuditEventType, AuditLog, AuditSeverity};
pub use governance::rate_limit::{RateLimitKind, RateLimiter};
pub use registration::RegisteredClient;

use async_trait::async_trait;
use chrono::Utc;
use discovery::CachedDiscovery;
use parking_lot::Mutex;
use sb_crypto::CryptoService;
use sb_store::{OAuthConfigRow, Store};
use sb_types::{BrokerError, BrokerResult};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Fixed loopback port for the authorization callback
pub const DEFAULT_CALLBACK_PORT: u16 = 42424;

/// Auth-state rows older than this are garbage-collected
const AUTH_STATE_TTL_MS: i64 = 3600 * 1000;

/// Per-server authentication state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OAuthStatus {
    Unconfigured,
    Configured,
    Authorizing,
    Authenticated,
    Refreshing,
    Failed,
}

/// Transient state overlaying what the store can answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RuntimeState {
    Authorizing,
    Refreshing,
    Failed,
}

/// Partial configuration merged over the provider template
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub discovery_url: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub scopes: Option<Vec<String>>,
    pub grant_type: Option<String>,
    pub auth_endpoint: Option<String>,
    pub token_endpoint: Option<String>,
    pub revoke_endpoint: Option<String>,
    pub introspect_endpoint: Option<String>,
    pub userinfo_endpoint: Option<String>,
    pub use_pkce: Option<bool>,
    pub dynamic_registration: Option<bool>,
    pub audience: Option<String>,
    pub additional_params: Option<HashMap<String, String>>,
}

/// Pull interface the server manager calls before each transport open
///
/// Keeps the dependency one-way: the OAuth layer never needs the manager.
#[async_trait]
pub trait HeaderSource: Send + Sync {
    /// Headers to inject into an upstream connection
    async fn headers_for(&self, server_id: &str) -> BrokerResult<Vec<(String, String)>>;

    /// One refresh after an upstream 401; returns the new access token
    async fn refresh_after_unauthorized(&self, server_id: &str) -> BrokerResult<Option<String>>;
}

/// OAuth service for upstream servers
///
/// Cheap to clone; all clones share state. Spawned timers and coalesced
/// refresh futures capture a clone.
#[derive(Clone)]
pub struct OAuthService {
    pub(crate) store: Store,
    pub(crate) crypto: Arc<CryptoService>,
    pub(crate) audit: Arc<AuditLog>,
    pub(crate) limiter: Arc<RateLimiter>,
    pub(crate) http: reqwest::Client,
    pub(crate) browser: Arc<dyn Browser>,
    pub(crate) callback_port: u16,
    pub(crate) discovery_cache: Arc<Mutex<HashMap<String, CachedDiscovery>>>,
    pub(crate) inflight_refresh: Arc<Mutex<HashMap<String, tokens::SharedRefresh>>>,
    pub(crate) refresh_timers: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    pub(crate) overlays: Arc<Mutex<HashMap<String, RuntimeState>>>,
}

impl OAuthService {
    pub fn new(
        store: Store,
        crypto: Arc<CryptoService>,
        audit: Arc<AuditLog>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self::with_browser(store, crypto, audit, limiter, Arc::new(SystemBrowser), DEFAULT_CALLBACK_PORT)
    }

    /// Constructor with a substitutable browser and callback port (tests)
    pub fn with_browser(
        store: Store,
        crypto: Arc<CryptoService>,
        audit: Arc<AuditLog>,
        limiter: Arc<RateLimiter>,
        browser: Arc<dyn Browser>,
        callback_port: u16,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client");

        Self {
            store,
            crypto,
            audit,
            limiter,
            http,
            browser,
            callback_port,
            discovery_cache: Arc::new(Mutex::new(HashMap::new())),
            inflight_refresh: Arc::new(Mutex::new(HashMap::new())),
            refresh_timers: Arc::new(Mutex::new(HashMap::new())),
            overlays: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Current state of the per-server machine
    pub fn status(&self, server_id: &str) -> BrokerResult<OAuthStatus> {
        if let Some(overlay) = self.overlays.lock().get(server_id) {
            return Ok(match overlay {
                RuntimeState::Authorizing => OAuthStatus::Authorizing,
                RuntimeState::Refreshing => OAuthStatus::Refreshing,
                RuntimeState::Failed => OAuthStatus::Failed,
            });
        }

        if self.store.get_oauth_token(server_id)?.is_some() {
            return Ok(OAuthStatus::Authenticated);
        }
        if self.store.get_oauth_config(server_id)?.is_some() {
            return Ok(OAuthStatus::Configured);
        }
        Ok(OAuthStatus::Unconfigured)
    }

    /// Configure OAuth for a server: provider template, overrides, endpoint
    /// discovery for remaining gaps, then dynamic registration when enabled
    /// and no client id was supplied. Idempotent merge.
    pub async fn configure(
        &self,
        server_id: &str,
        provider: &str,
        overrides: ConfigOverrides,
    ) -> BrokerResult<OAuthConfigRow> {
        let server = self
            .store
            .get_server(server_id)?
            .ok_or_else(|| BrokerError::NotFound(format!("server {}", server_id)))?;

        let mut config = self
            .store
            .get_oauth_config(server_id)?
            .unwrap_or_else(|| OAuthConfigRow {
                server_id: server_id.to_string(),
                grant_type: "authorization_code".to_string(),
                use_pkce: true,
                ..Default::default()
            });
        config.provider = provider.to_string();

        if let Some(template) = providers::provider_template(provider) {
            if config.auth_endpoint.is_none() {
                config.auth_endpoint = Some(template.auth_endpoint.to_string());
            }
            if config.token_endpoint.is_none() {
                config.token_endpoint = Some(template.token_endpoint.to_string());
            }
            if config.revoke_endpoint.is_none() {
                config.revoke_endpoint = template.revoke_endpoint.map(str::to_string);
            }
            if config.scopes.is_empty() {
                config.scopes = template.default_scopes.iter().map(|s| s.to_string()).collect();
            }
            config.use_pkce = template.supports_pkce;
        }

        apply_overrides(&mut config, overrides);

        // Endpoint discovery fills whatever is still missing
        if config.auth_endpoint.is_none() || config.token_endpoint.is_none() {
            let base = config
                .discovery_url
                .clone()
                .or_else(|| server.remote_url.clone());
            if let Some(base) = base {
                match self.discover(&base).await {
                    Ok(document) => {
                        if config.auth_endpoint.is_none() {
                            config.auth_endpoint = document.authorization_endpoint.clone();
                        }
                        if config.token_endpoint.is_none() {
                            config.token_endpoint = document.token_endpoint.clone();
                        }
                        if config.revoke_endpoint.is_none() {
                            config.revoke_endpoint = document.revocation_endpoint.clone();
                        }
                        if config.introspect_endpoint.is_none() {
                            config.introspect_endpoint = document.introspection_endpoint.clone();
                        }
                        if config.userinfo_endpoint.is_none() {
                            config.userinfo_endpoint = document.userinfo_endpoint.clone();
                        }

                        // Dynamic registration needs the endpoint from metadata
                        let blank_client =
                            config.client_id.as_deref().unwrap_or_default().is_empty();
                        if config.dynamic_registration && blank_client {
                            if let Some(endpoint) = document.registration_endpoint.as_deref() {
                                let registered =
                                    self.register_client(endpoint, &server.name).await?;
                                config.client_id = Some(registered.client_id);
                                config.client_secret = registered.client_secret;
                                config.registration_client_uri = registered.registration_client_uri;
                                config.registration_access_token =
                                    registered.registration_access_token;
                            } else {
                                warn!(
                                    "dynamic registration enabled for {} but metadata has no registration endpoint",
                                    server_id
                                );
                            }
                        }
                    }
                    Err(e) => {
                        warn!("endpoint discovery failed for {}: {}", server_id, e);
                    }
                }
            }
        }

        if config.auth_endpoint.is_none() || config.token_endpoint.is_none() {
            return Err(BrokerError::OAuthConfiguration(format!(
                "incomplete endpoints for server {} (provider {})",
                server_id, provider
            )));
        }

        self.store.upsert_oauth_config(&config)?;
        self.audit.log(
            AuditEventType::ConfigurationChanged,
            AuditSeverity::Info,
            Some(server_id),
            json!({ "provider": provider }),
        );

        info!("OAuth configured for server {} ({})", server_id, provider);
        Ok(config)
    }

    /// Remove a server's OAuth configuration and any stored token
    pub async fn deconfigure(&self, server_id: &str) -> BrokerResult<bool> {
        self.cancel_refresh_timer(server_id);
        self.store.delete_oauth_token(server_id)?;
        let removed = self.store.delete_oauth_config(server_id)?;
        self.overlays.lock().remove(server_id);

        if removed {
            self.audit.log(
                AuditEventType::ConfigurationDeleted,
                AuditSeverity::Info,
                Some(server_id),
                json!({}),
            );
        }
        Ok(removed)
    }

    /// Delete auth-state rows older than one hour
    pub fn gc_auth_states(&self) -> BrokerResult<usize> {
        let cutoff = Utc::now().timestamp_millis() - AUTH_STATE_TTL_MS;
        self.store.gc_auth_states(cutoff)
    }

    /// Release every timer deterministically
    pub fn shutdown(&self) {
        let mut timers = self.refresh_timers.lock();
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }

    pub(crate) fn set_overlay(&self, server_id: &str, state: RuntimeState) {
        self.overlays.lock().insert(server_id.to_string(), state);
    }

    pub(crate) fn clear_overlay(&self, server_id: &str) {
        self.overlays.lock().remove(server_id);
    }
}

#[async_trait]
impl HeaderSource for OAuthService {
    async fn headers_for(&self, server_id: &str) -> BrokerResult<Vec<(String, String)>> {
        match self.get_access_token(server_id).await? {
            Some(token) => Ok(vec![("Authorization".to_string(), format!("Bearer {}", token))]),
            None => Ok(Vec::new()),
        }
    }

    async fn refresh_after_unauthorized(&self, server_id: &str) -> BrokerResult<Option<String>> {
        if self.store.get_oauth_token(server_id)?.is_none() {
            return Ok(None);
        }
        Ok(Some(self.refresh(server_id).await?))
    }
}

fn apply_overrides(config: &mut OAuthConfigRow, overrides: ConfigOverrides) {
    if let Some(v) = overrides.discovery_url {
        config.discovery_url = Some(v);
    }
    if let Some(v) = overrides.client_id {
        config.client_id = Some(v);
    }
    if let Some(v) = overrides.client_secret {
        config.client_secret = Some(v);
    }
    if let Some(v) = overrides.scopes {
        config.scopes = v;
    }
    if let Some(v) = overrides.grant_type {
        config.grant_type = v;
    }
    if let Some(v) = overrides.auth_endpoint {
        config.auth_endpoint = Some(v);
    }
    if let Some(v) = overrides.token_endpoint {
        config.token_endpoint = Some(v);
    }
    if let Some(v) = overrides.revoke_endpoint {
        config.revoke_endpoint = Some(v);
    }
    if let Some(v) = overrides.introspect_endpoint {
        config.introspect_endpoint = Some(v);
    }
    if let Some(v) = overrides.userinfo_endpoint {
        config.userinfo_endpoint = Some(v);
    }
    if let Some(v) = overrides.use_pkce {
        config.use_pkce = v;
    }
    if let Some(v) = overrides.dynamic_registration {
        config.dynamic_registration = v;
    }
    if let Some(v) = overrides.audience {
        config.audience = Some(v);
    }
    if let Some(v) = overrides.additional_params {
        config.additional_params = v;
    }
}
