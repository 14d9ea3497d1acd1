//! Client repository

use crate::{now_ms, Store};
use rusqlite::{params, OptionalExtension, Row};
use sb_config::ClientRecord;
use sb_types::{BrokerError, BrokerResult};

fn client_from_row(row: &Row<'_>) -> Result<ClientRecord, rusqlite::Error> {
    Ok(ClientRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

impl Store {
    pub fn insert_client(&self, client: &ClientRecord) -> BrokerResult<()> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO clients (id, name, description, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    client.id,
                    client.name,
                    client.description,
                    client.created_at,
                    client.updated_at
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_client(&self, client_id: &str) -> BrokerResult<Option<ClientRecord>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, name, description, created_at, updated_at FROM clients WHERE id = ?1",
                    [client_id],
                    client_from_row,
                )
                .optional()?)
        })
    }

    pub fn list_clients(&self) -> BrokerResult<Vec<ClientRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, description, created_at, updated_at FROM clients ORDER BY name",
            )?;
            let rows = stmt.query_map([], client_from_row)?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
    }

    pub fn update_client(&self, client: &ClientRecord) -> BrokerResult<()> {
        let changed = self.with_tx(|tx| {
            Ok(tx.execute(
                "UPDATE clients SET name = ?2, description = ?3, updated_at = ?4 WHERE id = ?1",
                params![client.id, client.name, client.description, now_ms()],
            )?)
        })?;
        if changed == 0 {
            return Err(BrokerError::NotFound(format!("client {}", client.id)));
        }
        Ok(())
    }

    /// Delete a client; its tokens cascade away
    pub fn delete_client(&self, client_id: &str) -> BrokerResult<bool> {
        self.with_tx(|tx| {
            let deleted = tx.execute("DELETE FROM clients WHERE id = ?1", [client_id])?;
            Ok(deleted > 0)
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::test_util::test_store;
    use sb_config::ClientRecord;

    #[test]
    fn test_client_crud() {
        let (store, _dir) = test_store();

        let mut client = ClientRecord::new("cursor", None);
        store.insert_client(&client).unwrap();
        assert_eq!(store.list_clients().unwrap().len(), 1);

        client.description = Some("IDE integration".to_string());
        store.update_client(&client).unwrap();
        assert_eq!(
            store.get_client(&client.id).unwrap().unwrap().description,
            Some("IDE integration".to_string())
        );

        assert!(store.delete_client(&client.id).unwrap());
        assert!(store.get_client(&client.id).unwrap().is_none());
    }
}
