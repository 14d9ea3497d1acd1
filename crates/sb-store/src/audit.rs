//! Audit log repository (append-only)

use crate::Store;
use rusqlite::params;
use sb_types::BrokerResult;
use serde_json::Value;

/// One persisted audit entry
#[derive(Debug, Clone)]
pub struct AuditRow {
    pub id: i64,
    pub timestamp: i64,
    pub event_type: String,
    pub severity: String,
    pub server_id: Option<String>,
    pub details: Value,
}

impl Store {
    pub fn insert_audit_row(
        &self,
        timestamp: i64,
        event_type: &str,
        severity: &str,
        server_id: Option<&str>,
        details: &Value,
    ) -> BrokerResult<()> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO audit_log (timestamp, event_type, severity, server_id, details_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![timestamp, event_type, severity, server_id, details.to_string()],
            )?;
            Ok(())
        })
    }

    /// Most recent audit rows, newest first
    pub fn recent_audit_rows(&self, limit: usize) -> BrokerResult<Vec<AuditRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, timestamp, event_type, severity, server_id, details_json
                 FROM audit_log ORDER BY timestamp DESC, id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map([limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (id, timestamp, event_type, severity, server_id, details_json) = row?;
                out.push(AuditRow {
                    id,
                    timestamp,
                    event_type,
                    severity,
                    server_id,
                    details: serde_json::from_str(&details_json).unwrap_or(Value::Null),
                });
            }
            Ok(out)
        })
    }
}
