//! Tool preference repository
//!
//! The `(server_id, tool_name, client_id)` triple is unique; a NULL
//! `client_id` is the global default row (guarded by a partial unique index,
//! since SQLite treats NULLs as distinct in plain UNIQUE constraints).

use crate::Store;
use rusqlite::{params, OptionalExtension, Row};
use sb_types::BrokerResult;

/// A persisted tool preference row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPreferenceRow {
    pub server_id: String,
    pub tool_name: String,
    /// `None` is the global default scope
    pub client_id: Option<String>,
    pub enabled: bool,
    /// Description captured from the upstream announcement at discovery time
    pub original_description: Option<String>,
    pub custom_name: Option<String>,
    pub custom_description: Option<String>,
}

fn pref_from_row(row: &Row<'_>) -> Result<ToolPreferenceRow, rusqlite::Error> {
    Ok(ToolPreferenceRow {
        server_id: row.get(0)?,
        tool_name: row.get(1)?,
        client_id: row.get(2)?,
        enabled: row.get(3)?,
        original_description: row.get(4)?,
        custom_name: row.get(5)?,
        custom_description: row.get(6)?,
    })
}

const SELECT_PREF: &str = "SELECT server_id, tool_name, client_id, enabled,
    original_description, custom_name, custom_description FROM tool_preferences";

impl Store {
    /// Insert or replace a preference row for its exact scope
    pub fn upsert_preference(&self, pref: &ToolPreferenceRow) -> BrokerResult<()> {
        self.with_tx(|tx| {
            match &pref.client_id {
                Some(client_id) => {
                    tx.execute(
                        "INSERT INTO tool_preferences
                            (server_id, tool_name, client_id, enabled, original_description,
                             custom_name, custom_description)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                         ON CONFLICT (server_id, tool_name, client_id) DO UPDATE SET
                            enabled = excluded.enabled,
                            original_description = excluded.original_description,
                            custom_name = excluded.custom_name,
                            custom_description = excluded.custom_description",
                        params![
                            pref.server_id,
                            pref.tool_name,
                            client_id,
                            pref.enabled,
                            pref.original_description,
                            pref.custom_name,
                            pref.custom_description
                        ],
                    )?;
                }
                None => {
                    // The partial unique index is not addressable via ON
                    // CONFLICT's column list, so global rows are upserted by
                    // hand.
                    let updated = tx.execute(
                        "UPDATE tool_preferences SET enabled = ?3, original_description = ?4,
                            custom_name = ?5, custom_description = ?6
                         WHERE server_id = ?1 AND tool_name = ?2 AND client_id IS NULL",
                        params![
                            pref.server_id,
                            pref.tool_name,
                            pref.enabled,
                            pref.original_description,
                            pref.custom_name,
                            pref.custom_description
                        ],
                    )?;
                    if updated == 0 {
                        tx.execute(
                            "INSERT INTO tool_preferences
                                (server_id, tool_name, client_id, enabled, original_description,
                                 custom_name, custom_description)
                             VALUES (?1, ?2, NULL, ?3, ?4, ?5, ?6)",
                            params![
                                pref.server_id,
                                pref.tool_name,
                                pref.enabled,
                                pref.original_description,
                                pref.custom_name,
                                pref.custom_description
                            ],
                        )?;
                    }
                }
            }
            Ok(())
        })
    }

    /// Fetch the exact row for a scope, if present
    pub fn get_preference(
        &self,
        server_id: &str,
        tool_name: &str,
        client_id: Option<&str>,
    ) -> BrokerResult<Option<ToolPreferenceRow>> {
        self.with_conn(|conn| match client_id {
            Some(client_id) => Ok(conn
                .query_row(
                    &format!(
                        "{} WHERE server_id = ?1 AND tool_name = ?2 AND client_id = ?3",
                        SELECT_PREF
                    ),
                    params![server_id, tool_name, client_id],
                    pref_from_row,
                )
                .optional()?),
            None => Ok(conn
                .query_row(
                    &format!(
                        "{} WHERE server_id = ?1 AND tool_name = ?2 AND client_id IS NULL",
                        SELECT_PREF
                    ),
                    params![server_id, tool_name],
                    pref_from_row,
                )
                .optional()?),
        })
    }

    /// List every row in one `(server_id, client_id?)` scope
    pub fn list_preferences(
        &self,
        server_id: &str,
        client_id: Option<&str>,
    ) -> BrokerResult<Vec<ToolPreferenceRow>> {
        self.with_conn(|conn| match client_id {
            Some(client_id) => {
                let mut stmt = conn.prepare(&format!(
                    "{} WHERE server_id = ?1 AND client_id = ?2 ORDER BY tool_name",
                    SELECT_PREF
                ))?;
                let rows = stmt.query_map(params![server_id, client_id], pref_from_row)?;
                Ok(rows.collect::<Result<_, _>>()?)
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "{} WHERE server_id = ?1 AND client_id IS NULL ORDER BY tool_name",
                    SELECT_PREF
                ))?;
                let rows = stmt.query_map(params![server_id], pref_from_row)?;
                Ok(rows.collect::<Result<_, _>>()?)
            }
        })
    }

    /// Update only the captured description of a global row
    pub fn update_original_description(
        &self,
        server_id: &str,
        tool_name: &str,
        description: Option<&str>,
    ) -> BrokerResult<()> {
        self.with_tx(|tx| {
            tx.execute(
                "UPDATE tool_preferences SET original_description = ?3
                 WHERE server_id = ?1 AND tool_name = ?2 AND client_id IS NULL",
                params![server_id, tool_name, description],
            )?;
            Ok(())
        })
    }

    /// Delete every row (global and client-specific) for tools a server no
    /// longer announces; returns the number of rows removed
    pub fn delete_preferences_not_in(
        &self,
        server_id: &str,
        announced: &[String],
    ) -> BrokerResult<usize> {
        self.with_tx(|tx| {
            let placeholders: Vec<String> =
                (0..announced.len()).map(|i| format!("?{}", i + 2)).collect();
            let sql = if announced.is_empty() {
                "DELETE FROM tool_preferences WHERE server_id = ?1".to_string()
            } else {
                format!(
                    "DELETE FROM tool_preferences WHERE server_id = ?1 AND tool_name NOT IN ({})",
                    placeholders.join(", ")
                )
            };

            let mut stmt = tx.prepare(&sql)?;
            let mut values: Vec<&dyn rusqlite::ToSql> = vec![&server_id];
            for name in announced {
                values.push(name);
            }
            Ok(stmt.execute(values.as_slice())?)
        })
    }

    /// Set the enabled flag on every row in a scope; for the client scope a
    /// row is created per globally-known tool when absent
    pub fn set_all_enabled(
        &self,
        server_id: &str,
        client_id: Option<&str>,
        enabled: bool,
    ) -> BrokerResult<usize> {
        match client_id {
            None => self.with_tx(|tx| {
                Ok(tx.execute(
                    "UPDATE tool_preferences SET enabled = ?2
                     WHERE server_id = ?1 AND client_id IS NULL",
                    params![server_id, enabled],
                )?)
            }),
            Some(client_id) => {
                let tools: Vec<String> = self
                    .list_preferences(server_id, None)?
                    .into_iter()
                    .map(|p| p.tool_name)
                    .collect();

                self.with_tx(|tx| {
                    let mut count = 0usize;
                    for tool_name in &tools {
                        tx.execute(
                            "INSERT INTO tool_preferences (server_id, tool_name, client_id, enabled)
                             VALUES (?1, ?2, ?3, ?4)
                             ON CONFLICT (server_id, tool_name, client_id) DO UPDATE SET
                                enabled = excluded.enabled",
                            params![server_id, tool_name, client_id, enabled],
                        )?;
                        count += 1;
                    }
                    Ok(count)
                })
            }
        }
    }

    /// Reset a scope to defaults
    ///
    /// Client scope: the overriding rows are deleted so resolution falls back
    /// to global. Global scope: rows are re-enabled and customizations
    /// cleared, keeping the captured descriptions.
    pub fn reset_preferences(
        &self,
        server_id: &str,
        client_id: Option<&str>,
    ) -> BrokerResult<usize> {
        self.with_tx(|tx| match client_id {
            Some(client_id) => Ok(tx.execute(
                "DELETE FROM tool_preferences WHERE server_id = ?1 AND client_id = ?2",
                params![server_id, client_id],
            )?),
            None => Ok(tx.execute(
                "UPDATE tool_preferences SET enabled = 1, custom_name = NULL,
                    custom_description = NULL
                 WHERE server_id = ?1 AND client_id IS NULL",
                params![server_id],
            )?),
        })
    }
}
