//! Server repository
//!
//! `args`, `env`, `remote_url`, `bearer_token`, and `input_params` are all
//! treated as sensitive and stored encrypted.

use crate::{from_json, now_ms, to_json, Store};
use rusqlite::{params, OptionalExtension, Row};
use sb_config::{InputParam, ServerConfig, ServerType};
use sb_types::{BrokerError, BrokerResult};
use std::collections::HashMap;

impl Store {
    /// Insert a new server record
    pub fn insert_server(&self, config: &ServerConfig) -> BrokerResult<()> {
        let enc = self.encrypt_server_fields(config)?;
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO servers (id, name, server_type, command, args_enc, env_enc,
                    remote_url_enc, bearer_token_enc, input_params_enc, auto_start, disabled,
                    latest_known_version, tool_permissions_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    config.id,
                    config.name,
                    config.server_type.as_str(),
                    config.command,
                    enc.args,
                    enc.env,
                    enc.remote_url,
                    enc.bearer_token,
                    enc.input_params,
                    config.auto_start,
                    config.disabled,
                    config.latest_known_version,
                    config
                        .tool_permissions
                        .as_ref()
                        .map(to_json)
                        .transpose()?,
                    config.created_at,
                    config.updated_at,
                ],
            )?;
            Ok(())
        })
    }

    /// Update an existing server record
    pub fn update_server(&self, config: &ServerConfig) -> BrokerResult<()> {
        let enc = self.encrypt_server_fields(config)?;
        let changed = self.with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE servers SET name = ?2, server_type = ?3, command = ?4, args_enc = ?5,
                    env_enc = ?6, remote_url_enc = ?7, bearer_token_enc = ?8,
                    input_params_enc = ?9, auto_start = ?10, disabled = ?11,
                    latest_known_version = ?12, tool_permissions_json = ?13, updated_at = ?14
                 WHERE id = ?1",
                params![
                    config.id,
                    config.name,
                    config.server_type.as_str(),
                    config.command,
                    enc.args,
                    enc.env,
                    enc.remote_url,
                    enc.bearer_token,
                    enc.input_params,
                    config.auto_start,
                    config.disabled,
                    config.latest_known_version,
                    config
                        .tool_permissions
                        .as_ref()
                        .map(to_json)
                        .transpose()?,
                    now_ms(),
                ],
            )?;
            Ok(changed)
        })?;

        if changed == 0 {
            return Err(BrokerError::NotFound(format!("server {}", config.id)));
        }
        Ok(())
    }

    /// Fetch a server by id
    pub fn get_server(&self, server_id: &str) -> BrokerResult<Option<ServerConfig>> {
        let raw = self.with_conn(|conn| {
            Ok(conn
                .query_row(&format!("{} WHERE id = ?1", SELECT_SERVER), [server_id], raw_server)
                .optional()?)
        })?;
        raw.map(|raw| self.decode_server(raw)).transpose()
    }

    /// Fetch a server by its unique name
    pub fn get_server_by_name(&self, name: &str) -> BrokerResult<Option<ServerConfig>> {
        let raw = self.with_conn(|conn| {
            Ok(conn
                .query_row(&format!("{} WHERE name = ?1", SELECT_SERVER), [name], raw_server)
                .optional()?)
        })?;
        raw.map(|raw| self.decode_server(raw)).transpose()
    }

    /// List every server record
    pub fn list_servers(&self) -> BrokerResult<Vec<ServerConfig>> {
        let raws: Vec<RawServer> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{} ORDER BY name", SELECT_SERVER))?;
            let rows = stmt.query_map([], raw_server)?;
            Ok(rows.collect::<Result<_, _>>()?)
        })?;

        raws.into_iter().map(|raw| self.decode_server(raw)).collect()
    }

    /// Delete a server; tokens lose the grant and preferences vanish via FK
    pub fn delete_server(&self, server_id: &str) -> BrokerResult<bool> {
        self.with_tx(|tx| {
            let deleted = tx.execute("DELETE FROM servers WHERE id = ?1", [server_id])?;
            Ok(deleted > 0)
        })
    }

    fn encrypt_server_fields(&self, config: &ServerConfig) -> BrokerResult<EncryptedFields> {
        let crypto = self.crypto();
        Ok(EncryptedFields {
            args: Some(crypto.encrypt(&to_json(&config.args)?)?),
            env: Some(crypto.encrypt(&to_json(&config.env)?)?),
            remote_url: config
                .remote_url
                .as_deref()
                .map(|v| crypto.encrypt(v))
                .transpose()?,
            bearer_token: config
                .bearer_token
                .as_deref()
                .map(|v| crypto.encrypt(v))
                .transpose()?,
            input_params: Some(crypto.encrypt(&to_json(&config.input_params)?)?),
        })
    }

    fn decode_server(&self, raw: RawServer) -> BrokerResult<ServerConfig> {
        let crypto = self.crypto();

        let decrypt_opt = |field: Option<String>| -> BrokerResult<Option<String>> {
            field.map(|ct| crypto.decrypt(&ct)).transpose()
        };

        let args: Vec<String> = match decrypt_opt(raw.args_enc)? {
            Some(json) if !json.is_empty() => from_json(&json)?,
            _ => Vec::new(),
        };
        let env: HashMap<String, String> = match decrypt_opt(raw.env_enc)? {
            Some(json) if !json.is_empty() => from_json(&json)?,
            _ => HashMap::new(),
        };
        let input_params: Vec<InputParam> = match decrypt_opt(raw.input_params_enc)? {
            Some(json) if !json.is_empty() => from_json(&json)?,
            _ => Vec::new(),
        };

        let server_type = ServerType::parse(&raw.server_type).ok_or_else(|| {
            BrokerError::Store(format!("unknown server type: {}", raw.server_type))
        })?;

        Ok(ServerConfig {
            id: raw.id,
            name: raw.name,
            server_type,
            command: raw.command,
            args,
            env,
            remote_url: decrypt_opt(raw.remote_url_enc)?,
            bearer_token: decrypt_opt(raw.bearer_token_enc)?,
            input_params,
            auto_start: raw.auto_start,
            disabled: raw.disabled,
            latest_known_version: raw.latest_known_version,
            tool_permissions: raw
                .tool_permissions_json
                .as_deref()
                .map(from_json)
                .transpose()?,
            created_at: raw.created_at,
            updated_at: raw.updated_at,
        })
    }
}

const SELECT_SERVER: &str = "SELECT id, name, server_type, command, args_enc, env_enc,
    remote_url_enc, bearer_token_enc, input_params_enc, auto_start, disabled,
    latest_known_version, tool_permissions_json, created_at, updated_at FROM servers";

struct EncryptedFields {
    args: Option<String>,
    env: Option<String>,
    remote_url: Option<String>,
    bearer_token: Option<String>,
    input_params: Option<String>,
}

struct RawServer {
    id: String,
    name: String,
    server_type: String,
    command: Option<String>,
    args_enc: Option<String>,
    env_enc: Option<String>,
    remote_url_enc: Option<String>,
    bearer_token_enc: Option<String>,
    input_params_enc: Option<String>,
    auto_start: bool,
    disabled: bool,
    latest_known_version: Option<String>,
    tool_permissions_json: Option<String>,
    created_at: i64,
    updated_at: i64,
}

fn raw_server(row: &Row<'_>) -> Result<RawServer, rusqlite::Error> {
    Ok(RawServer {
        id: row.get(0)?,
        name: row.get(1)?,
        server_type: row.get(2)?,
        command: row.get(3)?,
        args_enc: row.get(4)?,
        env_enc: row.get(5)?,
        remote_url_enc: row.get(6)?,
        bearer_token_enc: row.get(7)?,
        input_params_enc: row.get(8)?,
        auto_start: row.get(9)?,
        disabled: row.get(10)?,
        latest_known_version: row.get(11)?,
        tool_permissions_json: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

#[cfg(test)]
mod tests {
    use crate::test_util::test_store;
    use sb_config::{ServerConfig, ServerType};

    #[test]
    fn test_insert_and_get_roundtrip() {
        let (store, _dir) = test_store();

        let mut config = ServerConfig::local(
            "filesystem",
            "npx",
            vec!["-y".to_string(), "@modelcontextprotocol/server-filesystem".to_string()],
        );
        config.env.insert("API_KEY".to_string(), "sekrit".to_string());
        config.auto_start = true;

        store.insert_server(&config).unwrap();

        let loaded = store.get_server(&config.id).unwrap().unwrap();
        assert_eq!(loaded.name, "filesystem");
        assert_eq!(loaded.server_type, ServerType::Local);
        assert_eq!(loaded.args, config.args);
        assert_eq!(loaded.env.get("API_KEY").map(String::as_str), Some("sekrit"));
        assert!(loaded.auto_start);

        let by_name = store.get_server_by_name("filesystem").unwrap().unwrap();
        assert_eq!(by_name.id, config.id);
    }

    #[test]
    fn test_sensitive_fields_not_stored_in_plaintext() {
        let (store, _dir) = test_store();

        let mut config = ServerConfig::remote("api", "https://mcp.example.com/sse");
        config.bearer_token = Some("super-secret-bearer".to_string());
        config.env.insert("TOKEN".to_string(), "env-secret-value".to_string());
        store.insert_server(&config).unwrap();

        let raw: (Option<String>, Option<String>, Option<String>) = store
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT bearer_token_enc, env_enc, remote_url_enc FROM servers WHERE id = ?1",
                    [&config.id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )?)
            })
            .unwrap();

        let bearer = raw.0.unwrap();
        assert!(!bearer.contains("super-secret-bearer"));
        assert!(!raw.1.unwrap().contains("env-secret-value"));
        assert!(!raw.2.unwrap().contains("mcp.example.com"));
    }

    #[test]
    fn test_update_and_delete() {
        let (store, _dir) = test_store();

        let mut config = ServerConfig::local("echo", "echo", vec![]);
        store.insert_server(&config).unwrap();

        config.disabled = true;
        store.update_server(&config).unwrap();
        assert!(store.get_server(&config.id).unwrap().unwrap().disabled);

        assert!(store.delete_server(&config.id).unwrap());
        assert!(store.get_server(&config.id).unwrap().is_none());
        assert!(!store.delete_server(&config.id).unwrap());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let (store, _dir) = test_store();

        store
            .insert_server(&ServerConfig::local("dup", "echo", vec![]))
            .unwrap();
        let result = store.insert_server(&ServerConfig::local("dup", "cat", vec![]));
        assert!(result.is_err());
    }

    #[test]
    fn test_update_missing_server_is_not_found() {
        let (store, _dir) = test_store();
        let config = ServerConfig::local("ghost", "echo", vec![]);
        assert!(store.update_server(&config).is_err());
    }
}
