//! Transactional persistence for Switchboard
//!
//! A single-file SQLite store with write-ahead durability. Owns the schema
//! evolution runner and typed repositories for servers, clients, tokens,
//! tool preferences, OAuth configuration/tokens/auth-states, and audit rows.
//! Sensitive columns are encrypted through [`sb_crypto::CryptoService`]
//! before they reach disk.

mod audit;
mod clients;
mod oauth;
mod prefs;
pub mod schema;
mod servers;
mod tokens;

pub use audit::AuditRow;
pub use oauth::{AuthStateRow, OAuthConfigRow, OAuthTokenRow};
pub use prefs::ToolPreferenceRow;
pub use tokens::StoredToken;

use parking_lot::Mutex;
use rusqlite::Connection;
use sb_crypto::CryptoService;
use sb_types::{BrokerError, BrokerResult};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// The relational store
///
/// Cheap to clone; all clones share one connection behind a mutex, which is
/// the single-writer serialization boundary. No I/O other than SQLite calls
/// happens while the connection lock is held.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    crypto: Arc<CryptoService>,
}

impl Store {
    /// Open (or create) the store at `path` and run pending schema migrations
    pub fn open(path: &Path, crypto: Arc<CryptoService>) -> BrokerResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn, crypto)
    }

    /// Open an in-memory store (tests)
    pub fn open_in_memory(crypto: Arc<CryptoService>) -> BrokerResult<Self> {
        Self::init(Connection::open_in_memory()?, crypto)
    }

    fn init(conn: Connection, crypto: Arc<CryptoService>) -> BrokerResult<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        let mut conn = conn;
        let applied = schema::run_migrations(&mut conn)?;
        if !applied.is_empty() {
            info!("applied {} schema migrations: {:?}", applied.len(), applied);
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            crypto,
        })
    }

    /// Run a read-only closure against the connection
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> BrokerResult<T>,
    ) -> BrokerResult<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run a closure inside a transaction; commits on `Ok`, rolls back on `Err`
    pub(crate) fn with_tx<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> BrokerResult<T>,
    ) -> BrokerResult<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    pub(crate) fn crypto(&self) -> &CryptoService {
        &self.crypto
    }

    /// Re-encrypt every encrypted column under `new_key` in one transaction
    ///
    /// Rows are decrypted with the current key inside the same transaction;
    /// any failure rolls everything back and the old key stays authoritative.
    pub fn reencrypt_all(&self, new_key: &[u8; 32]) -> BrokerResult<usize> {
        let current = self.crypto.current_key();
        let reencrypt = |value: Option<String>| -> BrokerResult<Option<String>> {
            match value {
                None => Ok(None),
                Some(ct) => {
                    let plaintext = CryptoService::decrypt_with_key(&current, &ct)?;
                    Ok(Some(CryptoService::encrypt_with_key(new_key, &plaintext)?))
                }
            }
        };

        self.with_tx(|tx| {
            let mut updated = 0usize;

            let rows: Vec<(String, Option<String>, Option<String>, Option<String>, Option<String>, Option<String>)> = {
                let mut stmt = tx.prepare(
                    "SELECT id, args_enc, env_enc, remote_url_enc, bearer_token_enc, input_params_enc FROM servers",
                )?;
                let mapped = stmt.query_map([], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?))
                })?;
                mapped.collect::<Result<_, _>>()?
            };
            for (id, args, env, url, bearer, params) in rows {
                tx.execute(
                    "UPDATE servers SET args_enc = ?1, env_enc = ?2, remote_url_enc = ?3,
                     bearer_token_enc = ?4, input_params_enc = ?5 WHERE id = ?6",
                    rusqlite::params![
                        reencrypt(args)?,
                        reencrypt(env)?,
                        reencrypt(url)?,
                        reencrypt(bearer)?,
                        reencrypt(params)?,
                        id
                    ],
                )?;
                updated += 1;
            }

            let rows: Vec<(String, Option<String>, Option<String>)> = {
                let mut stmt = tx.prepare(
                    "SELECT server_id, client_secret_enc, registration_access_token_enc FROM oauth_configs",
                )?;
                let mapped = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
                mapped.collect::<Result<_, _>>()?
            };
            for (id, secret, reg_token) in rows {
                tx.execute(
                    "UPDATE oauth_configs SET client_secret_enc = ?1, registration_access_token_enc = ?2 WHERE server_id = ?3",
                    rusqlite::params![reencrypt(secret)?, reencrypt(reg_token)?, id],
                )?;
                updated += 1;
            }

            let rows: Vec<(String, String, Option<String>, Option<String>)> = {
                let mut stmt = tx.prepare(
                    "SELECT server_id, access_token_enc, refresh_token_enc, id_token_enc FROM oauth_tokens",
                )?;
                let mapped = stmt.query_map([], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })?;
                mapped.collect::<Result<_, _>>()?
            };
            for (id, access, refresh, id_token) in rows {
                let access = reencrypt(Some(access))?.unwrap_or_default();
                tx.execute(
                    "UPDATE oauth_tokens SET access_token_enc = ?1, refresh_token_enc = ?2, id_token_enc = ?3 WHERE server_id = ?4",
                    rusqlite::params![access, reencrypt(refresh)?, reencrypt(id_token)?, id],
                )?;
                updated += 1;
            }

            let rows: Vec<(String, String)> = {
                let mut stmt =
                    tx.prepare("SELECT state, code_verifier_enc FROM oauth_auth_states")?;
                let mapped = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
                mapped.collect::<Result<_, _>>()?
            };
            for (state, verifier) in rows {
                let verifier = reencrypt(Some(verifier))?.unwrap_or_default();
                tx.execute(
                    "UPDATE oauth_auth_states SET code_verifier_enc = ?1 WHERE state = ?2",
                    rusqlite::params![verifier, state],
                )?;
                updated += 1;
            }

            Ok(updated)
        })
    }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> BrokerResult<String> {
    serde_json::to_string(value).map_err(BrokerError::from)
}

pub(crate) fn from_json<T: serde::de::DeserializeOwned>(raw: &str) -> BrokerResult<T> {
    serde_json::from_str(raw).map_err(BrokerError::from)
}
