//! Client token repository
//!
//! Grant sets live in the `token_servers` join table, so deleting a server
//! removes it from every token through the foreign-key cascade.

use crate::{from_json, to_json, Store};
use rusqlite::{params, OptionalExtension};
use sb_types::BrokerResult;

/// A persisted client token with its grant set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredToken {
    /// The token id is the credential itself
    pub id: String,
    pub client_id: String,
    /// Servers this token may reach; empty means deny-all
    pub server_ids: Vec<String>,
    pub scopes: Vec<String>,
    pub issued_at: i64,
}

impl Store {
    pub fn insert_token(&self, token: &StoredToken) -> BrokerResult<()> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO tokens (id, client_id, issued_at, scopes_json) VALUES (?1, ?2, ?3, ?4)",
                params![token.id, token.client_id, token.issued_at, to_json(&token.scopes)?],
            )?;
            for server_id in &token.server_ids {
                tx.execute(
                    "INSERT OR IGNORE INTO token_servers (token_id, server_id) VALUES (?1, ?2)",
                    params![token.id, server_id],
                )?;
            }
            Ok(())
        })
    }

    pub fn get_token(&self, token_id: &str) -> BrokerResult<Option<StoredToken>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, client_id, issued_at, scopes_json FROM tokens WHERE id = ?1",
                    [token_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    },
                )
                .optional()?;

            let Some((id, client_id, issued_at, scopes_json)) = row else {
                return Ok(None);
            };

            let mut stmt = conn.prepare(
                "SELECT server_id FROM token_servers WHERE token_id = ?1 ORDER BY server_id",
            )?;
            let server_ids: Vec<String> = stmt
                .query_map([&id], |row| row.get(0))?
                .collect::<Result<_, _>>()?;

            Ok(Some(StoredToken {
                id,
                client_id,
                server_ids,
                scopes: from_json(&scopes_json)?,
                issued_at,
            }))
        })
    }

    pub fn list_tokens_by_client(&self, client_id: &str) -> BrokerResult<Vec<StoredToken>> {
        let ids: Vec<String> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM tokens WHERE client_id = ?1 ORDER BY issued_at DESC",
            )?;
            let rows = stmt.query_map([client_id], |row| row.get(0))?;
            Ok(rows.collect::<Result<_, _>>()?)
        })?;

        let mut tokens = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(token) = self.get_token(&id)? {
                tokens.push(token);
            }
        }
        Ok(tokens)
    }

    pub fn delete_token(&self, token_id: &str) -> BrokerResult<bool> {
        self.with_tx(|tx| {
            let deleted = tx.execute("DELETE FROM tokens WHERE id = ?1", [token_id])?;
            Ok(deleted > 0)
        })
    }
}
