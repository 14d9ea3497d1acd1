//! OAuth repositories: per-server configs, tokens, and in-flight auth states
//!
//! Client secrets, registration access tokens, token material, and PKCE
//! verifiers are encrypted before they reach the database.

use crate::{from_json, now_ms, to_json, Store};
use rusqlite::{params, OptionalExtension};
use sb_types::BrokerResult;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;

/// Per-server OAuth configuration (decrypted, in-memory form)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OAuthConfigRow {
    pub server_id: String,
    /// Provider tag: github | google | microsoft | slack | gitlab | bitbucket | custom
    pub provider: String,
    pub discovery_url: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub scopes: Vec<String>,
    pub grant_type: String,
    pub auth_endpoint: Option<String>,
    pub token_endpoint: Option<String>,
    pub revoke_endpoint: Option<String>,
    pub introspect_endpoint: Option<String>,
    pub userinfo_endpoint: Option<String>,
    pub registration_client_uri: Option<String>,
    pub registration_access_token: Option<String>,
    pub use_pkce: bool,
    pub dynamic_registration: bool,
    pub audience: Option<String>,
    pub additional_params: HashMap<String, String>,
    pub updated_at: i64,
}

/// Per-server OAuth token (decrypted, in-memory form); unique per server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthTokenRow {
    pub server_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    pub token_type: String,
    /// Unix ms; `None` means the token never auto-refreshes
    pub expires_at: Option<i64>,
    pub scopes: Option<Vec<String>>,
    pub refresh_count: i64,
    pub last_used: i64,
}

/// Ephemeral state for one in-flight browser authorization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthStateRow {
    pub state: String,
    pub server_id: String,
    pub code_verifier: String,
    pub code_challenge: Option<String>,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub created_at: i64,
}

impl Store {
    pub fn upsert_oauth_config(&self, config: &OAuthConfigRow) -> BrokerResult<()> {
        let secret_enc = config
            .client_secret
            .as_deref()
            .map(|s| self.crypto().encrypt(s))
            .transpose()?;
        let reg_token_enc = config
            .registration_access_token
            .as_deref()
            .map(|s| self.crypto().encrypt(s))
            .transpose()?;

        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO oauth_configs (server_id, provider, discovery_url, client_id,
                    client_secret_enc, scopes_json, grant_type, auth_endpoint, token_endpoint,
                    revoke_endpoint, introspect_endpoint, userinfo_endpoint,
                    registration_client_uri, registration_access_token_enc, use_pkce,
                    dynamic_registration, audience, additional_params_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
                 ON CONFLICT (server_id) DO UPDATE SET
                    provider = excluded.provider,
                    discovery_url = excluded.discovery_url,
                    client_id = excluded.client_id,
                    client_secret_enc = excluded.client_secret_enc,
                    scopes_json = excluded.scopes_json,
                    grant_type = excluded.grant_type,
                    auth_endpoint = excluded.auth_endpoint,
                    token_endpoint = excluded.token_endpoint,
                    revoke_endpoint = excluded.revoke_endpoint,
                    introspect_endpoint = excluded.introspect_endpoint,
                    userinfo_endpoint = excluded.userinfo_endpoint,
                    registration_client_uri = excluded.registration_client_uri,
                    registration_access_token_enc = excluded.registration_access_token_enc,
                    use_pkce = excluded.use_pkce,
                    dynamic_registration = excluded.dynamic_registration,
                    audience = excluded.audience,
                    additional_params_json = excluded.additional_params_json,
                    updated_at = excluded.updated_at",
                params![
                    config.server_id,
                    config.provider,
                    config.discovery_url,
                    config.client_id,
                    secret_enc,
                    to_json(&config.scopes)?,
                    config.grant_type,
                    config.auth_endpoint,
                    config.token_endpoint,
                    config.revoke_endpoint,
                    config.introspect_endpoint,
                    config.userinfo_endpoint,
                    config.registration_client_uri,
                    reg_token_enc,
                    config.use_pkce,
                    config.dynamic_registration,
                    config.audience,
                    to_json(&config.additional_params)?,
                    now_ms(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_oauth_config(&self, server_id: &str) -> BrokerResult<Option<OAuthConfigRow>> {
        type RawConfig = (
            String,
            String,
            Option<String>,
            Option<String>,
            Option<String>,
            String,
            String,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
            bool,
            bool,
            Option<String>,
            String,
            i64,
        );

        let raw: Option<RawConfig> = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT server_id, provider, discovery_url, client_id, client_secret_enc,
                        scopes_json, grant_type, auth_endpoint, token_endpoint, revoke_endpoint,
                        introspect_endpoint, userinfo_endpoint, registration_client_uri,
                        registration_access_token_enc, use_pkce, dynamic_registration, audience,
                        additional_params_json, updated_at
                     FROM oauth_configs WHERE server_id = ?1",
                    [server_id],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                            row.get(7)?,
                            row.get(8)?,
                            row.get(9)?,
                            row.get(10)?,
                            row.get(11)?,
                            row.get(12)?,
                            row.get(13)?,
                            row.get(14)?,
                            row.get(15)?,
                            row.get(16)?,
                            row.get(17)?,
                            row.get(18)?,
                        ))
                    },
                )
                .optional()?)
        })?;

        let Some(raw) = raw else { return Ok(None) };
        Ok(Some(OAuthConfigRow {
            server_id: raw.0,
            provider: raw.1,
            discovery_url: raw.2,
            client_id: raw.3,
            client_secret: raw.4.map(|ct| self.crypto().decrypt(&ct)).transpose()?,
            scopes: from_json(&raw.5)?,
            grant_type: raw.6,
            auth_endpoint: raw.7,
            token_endpoint: raw.8,
            revoke_endpoint: raw.9,
            introspect_endpoint: raw.10,
            userinfo_endpoint: raw.11,
            registration_client_uri: raw.12,
            registration_access_token: raw.13.map(|ct| self.crypto().decrypt(&ct)).transpose()?,
            use_pkce: raw.14,
            dynamic_registration: raw.15,
            audience: raw.16,
            additional_params: from_json(&raw.17)?,
            updated_at: raw.18,
        }))
    }

    pub fn list_oauth_config_ids(&self) -> BrokerResult<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT server_id FROM oauth_configs ORDER BY server_id")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
    }

    pub fn delete_oauth_config(&self, server_id: &str) -> BrokerResult<bool> {
        self.with_tx(|tx| {
            let deleted = tx.execute("DELETE FROM oauth_configs WHERE server_id = ?1", [server_id])?;
            Ok(deleted > 0)
        })
    }

    pub fn upsert_oauth_token(&self, token: &OAuthTokenRow) -> BrokerResult<()> {
        let crypto = self.crypto();
        let access_enc = crypto.encrypt(&token.access_token)?;
        let refresh_enc = token
            .refresh_token
            .as_deref()
            .map(|t| crypto.encrypt(t))
            .transpose()?;
        let id_enc = token
            .id_token
            .as_deref()
            .map(|t| crypto.encrypt(t))
            .transpose()?;

        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO oauth_tokens (server_id, access_token_enc, refresh_token_enc,
                    id_token_enc, token_type, expires_at, scopes_json, refresh_count, last_used)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT (server_id) DO UPDATE SET
                    access_token_enc = excluded.access_token_enc,
                    refresh_token_enc = excluded.refresh_token_enc,
                    id_token_enc = excluded.id_token_enc,
                    token_type = excluded.token_type,
                    expires_at = excluded.expires_at,
                    scopes_json = excluded.scopes_json,
                    refresh_count = excluded.refresh_count,
                    last_used = excluded.last_used",
                params![
                    token.server_id,
                    access_enc,
                    refresh_enc,
                    id_enc,
                    token.token_type,
                    token.expires_at,
                    token.scopes.as_ref().map(to_json).transpose()?,
                    token.refresh_count,
                    token.last_used,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_oauth_token(&self, server_id: &str) -> BrokerResult<Option<OAuthTokenRow>> {
        type RawToken = (
            String,
            String,
            Option<String>,
            Option<String>,
            String,
            Option<i64>,
            Option<String>,
            i64,
            i64,
        );

        let raw: Option<RawToken> = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT server_id, access_token_enc, refresh_token_enc, id_token_enc,
                        token_type, expires_at, scopes_json, refresh_count, last_used
                     FROM oauth_tokens WHERE server_id = ?1",
                    [server_id],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                            row.get(7)?,
                            row.get(8)?,
                        ))
                    },
                )
                .optional()?)
        })?;

        let Some(raw) = raw else { return Ok(None) };
        let crypto = self.crypto();
        Ok(Some(OAuthTokenRow {
            server_id: raw.0,
            access_token: crypto.decrypt(&raw.1)?,
            refresh_token: raw.2.map(|ct| crypto.decrypt(&ct)).transpose()?,
            id_token: raw.3.map(|ct| crypto.decrypt(&ct)).transpose()?,
            token_type: raw.4,
            expires_at: raw.5,
            scopes: raw.6.as_deref().map(from_json).transpose()?,
            refresh_count: raw.7,
            last_used: raw.8,
        }))
    }

    pub fn list_oauth_token_ids(&self) -> BrokerResult<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT server_id FROM oauth_tokens ORDER BY server_id")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
    }

    pub fn delete_oauth_token(&self, server_id: &str) -> BrokerResult<bool> {
        self.with_tx(|tx| {
            let deleted = tx.execute("DELETE FROM oauth_tokens WHERE server_id = ?1", [server_id])?;
            Ok(deleted > 0)
        })
    }

    pub fn touch_oauth_token(&self, server_id: &str) -> BrokerResult<()> {
        self.with_tx(|tx| {
            tx.execute(
                "UPDATE oauth_tokens SET last_used = ?2 WHERE server_id = ?1",
                params![server_id, now_ms()],
            )?;
            Ok(())
        })
    }

    pub fn insert_auth_state(&self, state: &AuthStateRow) -> BrokerResult<()> {
        let verifier_enc = self.crypto().encrypt(&state.code_verifier)?;
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO oauth_auth_states (state, server_id, code_verifier_enc,
                    code_challenge, redirect_uri, scopes_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    state.state,
                    state.server_id,
                    verifier_enc,
                    state.code_challenge,
                    state.redirect_uri,
                    to_json(&state.scopes)?,
                    state.created_at,
                ],
            )?;
            Ok(())
        })
    }

    /// Fetch and delete the auth state matching `state`, in one transaction
    pub fn take_auth_state(&self, state: &str) -> BrokerResult<Option<AuthStateRow>> {
        type RawState = (String, String, String, Option<String>, String, String, i64);

        let raw: Option<RawState> = self.with_tx(|tx| {
            let row = tx
                .query_row(
                    "SELECT state, server_id, code_verifier_enc, code_challenge, redirect_uri,
                        scopes_json, created_at
                     FROM oauth_auth_states WHERE state = ?1",
                    [state],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                        ))
                    },
                )
                .optional()?;
            if row.is_some() {
                tx.execute("DELETE FROM oauth_auth_states WHERE state = ?1", [state])?;
            }
            Ok(row)
        })?;

        let Some(raw) = raw else { return Ok(None) };
        Ok(Some(AuthStateRow {
            state: raw.0,
            server_id: raw.1,
            code_verifier: self.crypto().decrypt(&raw.2)?,
            code_challenge: raw.3,
            redirect_uri: raw.4,
            scopes: from_json(&raw.5)?,
            created_at: raw.6,
        }))
    }

    /// Garbage-collect auth states created before `cutoff_ms`
    pub fn gc_auth_states(&self, cutoff_ms: i64) -> BrokerResult<usize> {
        self.with_tx(|tx| {
            Ok(tx.execute(
                "DELETE FROM oauth_auth_states WHERE created_at < ?1",
                [cutoff_ms],
            )?)
        })
    }

    pub fn count_auth_states(&self) -> BrokerResult<usize> {
        self.with_conn(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM oauth_auth_states", [], |row| row.get(0))?;
            Ok(count as usize)
        })
    }

    /// Export the OAuth dataset exactly as stored (ciphertexts included)
    ///
    /// Used by the governance migrator: snapshots written to disk must carry
    /// the encrypted column values, never plaintext.
    pub fn export_oauth_raw(&self) -> BrokerResult<(Vec<Value>, Vec<Value>)> {
        self.with_conn(|conn| {
            let mut configs = Vec::new();
            let mut stmt = conn.prepare(
                "SELECT server_id, provider, discovery_url, client_id, client_secret_enc,
                    scopes_json, grant_type, auth_endpoint, token_endpoint, revoke_endpoint,
                    introspect_endpoint, userinfo_endpoint, registration_client_uri,
                    registration_access_token_enc, use_pkce, dynamic_registration, audience,
                    additional_params_json, updated_at
                 FROM oauth_configs ORDER BY server_id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(json!({
                    "server_id": row.get::<_, String>(0)?,
                    "provider": row.get::<_, String>(1)?,
                    "discovery_url": row.get::<_, Option<String>>(2)?,
                    "client_id": row.get::<_, Option<String>>(3)?,
                    "client_secret_enc": row.get::<_, Option<String>>(4)?,
                    "scopes_json": row.get::<_, String>(5)?,
                    "grant_type": row.get::<_, String>(6)?,
                    "auth_endpoint": row.get::<_, Option<String>>(7)?,
                    "token_endpoint": row.get::<_, Option<String>>(8)?,
                    "revoke_endpoint": row.get::<_, Option<String>>(9)?,
                    "introspect_endpoint": row.get::<_, Option<String>>(10)?,
                    "userinfo_endpoint": row.get::<_, Option<String>>(11)?,
                    "registration_client_uri": row.get::<_, Option<String>>(12)?,
                    "registration_access_token_enc": row.get::<_, Option<String>>(13)?,
                    "use_pkce": row.get::<_, bool>(14)?,
                    "dynamic_registration": row.get::<_, bool>(15)?,
                    "audience": row.get::<_, Option<String>>(16)?,
                    "additional_params_json": row.get::<_, String>(17)?,
                    "updated_at": row.get::<_, i64>(18)?,
                }))
            })?;
            for row in rows {
                configs.push(row?);
            }

            let mut tokens = Vec::new();
            let mut stmt = conn.prepare(
                "SELECT server_id, access_token_enc, refresh_token_enc, id_token_enc, token_type,
                    expires_at, scopes_json, refresh_count, last_used
                 FROM oauth_tokens ORDER BY server_id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(json!({
                    "server_id": row.get::<_, String>(0)?,
                    "access_token_enc": row.get::<_, String>(1)?,
                    "refresh_token_enc": row.get::<_, Option<String>>(2)?,
                    "id_token_enc": row.get::<_, Option<String>>(3)?,
                    "token_type": row.get::<_, String>(4)?,
                    "expires_at": row.get::<_, Option<i64>>(5)?,
                    "scopes_json": row.get::<_, Option<String>>(6)?,
                    "refresh_count": row.get::<_, i64>(7)?,
                    "last_used": row.get::<_, i64>(8)?,
                }))
            })?;
            for row in rows {
                tokens.push(row?);
            }

            Ok((configs, tokens))
        })
    }

    /// Replace the OAuth dataset with raw rows in one transaction
    pub fn import_oauth_raw(&self, configs: &[Value], tokens: &[Value]) -> BrokerResult<()> {
        let s = |v: &Value, k: &str| v.get(k).and_then(Value::as_str).map(str::to_string);
        let i = |v: &Value, k: &str| v.get(k).and_then(Value::as_i64);
        let b = |v: &Value, k: &str| v.get(k).and_then(Value::as_bool).unwrap_or(false);

        self.with_tx(|tx| {
            tx.execute("DELETE FROM oauth_configs", [])?;
            tx.execute("DELETE FROM oauth_tokens", [])?;

            for row in configs {
                tx.execute(
                    "INSERT INTO oauth_configs (server_id, provider, discovery_url, client_id,
                        client_secret_enc, scopes_json, grant_type, auth_endpoint, token_endpoint,
                        revoke_endpoint, introspect_endpoint, userinfo_endpoint,
                        registration_client_uri, registration_access_token_enc, use_pkce,
                        dynamic_registration, audience, additional_params_json, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
                    params![
                        s(row, "server_id"),
                        s(row, "provider"),
                        s(row, "discovery_url"),
                        s(row, "client_id"),
                        s(row, "client_secret_enc"),
                        s(row, "scopes_json").unwrap_or_else(|| "[]".to_string()),
                        s(row, "grant_type").unwrap_or_else(|| "authorization_code".to_string()),
                        s(row, "auth_endpoint"),
                        s(row, "token_endpoint"),
                        s(row, "revoke_endpoint"),
                        s(row, "introspect_endpoint"),
                        s(row, "userinfo_endpoint"),
                        s(row, "registration_client_uri"),
                        s(row, "registration_access_token_enc"),
                        b(row, "use_pkce"),
                        b(row, "dynamic_registration"),
                        s(row, "audience"),
                        s(row, "additional_params_json").unwrap_or_else(|| "{}".to_string()),
                        i(row, "updated_at").unwrap_or(0),
                    ],
                )?;
            }

            for row in tokens {
                tx.execute(
                    "INSERT INTO oauth_tokens (server_id, access_token_enc, refresh_token_enc,
                        id_token_enc, token_type, expires_at, scopes_json, refresh_count, last_used)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        s(row, "server_id"),
                        s(row, "access_token_enc"),
                        s(row, "refresh_token_enc"),
                        s(row, "id_token_enc"),
                        s(row, "token_type").unwrap_or_else(|| "Bearer".to_string()),
                        i(row, "expires_at"),
                        s(row, "scopes_json"),
                        i(row, "refresh_count").unwrap_or(0),
                        i(row, "last_used").unwrap_or(0),
                    ],
                )?;
            }

            Ok(())
        })
    }
}
