//! Schema evolution runner
//!
//! An ordered list of named migrations, each with a forward step and an
//! optional reverse step. Applied ids are recorded in the `migrations`
//! table; pending migrations run in order inside transactions at startup.
//! Forward steps introspect the schema first so they stay idempotent
//! against partially-applied states.

use rusqlite::{Connection, Transaction};
use sb_types::{BrokerError, BrokerResult};
use tracing::{error, info};

type Step = fn(&Transaction<'_>) -> BrokerResult<()>;

/// A named schema migration
pub struct Migration {
    pub id: &'static str,
    pub description: &'static str,
    pub up: Step,
    pub down: Option<Step>,
}

/// All migrations, in application order
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        id: "0001_initial_schema",
        description: "servers, clients, tokens, tool preferences, OAuth tables",
        up: initial_schema,
        down: None,
    },
    Migration {
        id: "0002_audit_log",
        description: "append-only audit log table",
        up: audit_log,
        down: Some(audit_log_down),
    },
    Migration {
        id: "0003_token_scopes",
        description: "scopes on client tokens",
        up: token_scopes,
        down: Some(token_scopes_down),
    },
    Migration {
        id: "0004_registration_metadata",
        description: "RFC 7591 registration management fields on oauth_configs",
        up: registration_metadata,
        down: Some(registration_metadata_down),
    },
    Migration {
        id: "0005_token_last_used",
        description: "last_used tracking on oauth_tokens",
        up: token_last_used,
        down: Some(token_last_used_down),
    },
];

/// Apply all pending migrations; returns the ids that were newly applied
///
/// A failed forward step with no reverse is fatal. With a reverse, the
/// reverse is attempted (best effort) and startup still aborts.
pub fn run_migrations(conn: &mut Connection) -> BrokerResult<Vec<&'static str>> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            id TEXT PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let applied: Vec<String> = {
        let mut stmt = conn.prepare("SELECT id FROM migrations")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<Result<_, _>>()?
    };

    let mut newly_applied = Vec::new();

    for migration in MIGRATIONS {
        if applied.iter().any(|id| id.as_str() == migration.id) {
            continue;
        }

        info!("applying migration {}: {}", migration.id, migration.description);

        let tx = conn.transaction()?;
        match (migration.up)(&tx) {
            Ok(()) => {
                tx.execute(
                    "INSERT INTO migrations (id, applied_at) VALUES (?1, ?2)",
                    rusqlite::params![migration.id, crate::now_ms()],
                )?;
                tx.commit()?;
                newly_applied.push(migration.id);
            }
            Err(e) => {
                drop(tx);
                if let Some(down) = migration.down {
                    error!("migration {} failed, attempting reverse: {}", migration.id, e);
                    if let Ok(reverse_tx) = conn.transaction() {
                        if down(&reverse_tx).is_ok() {
                            let _ = reverse_tx.commit();
                        }
                    }
                } else {
                    error!("migration {} failed with no reverse step: {}", migration.id, e);
                }
                return Err(BrokerError::Migration(format!(
                    "migration {} failed: {}",
                    migration.id, e
                )));
            }
        }
    }

    Ok(newly_applied)
}

/// Check whether a table exists
pub fn table_exists(tx: &Transaction<'_>, table: &str) -> BrokerResult<bool> {
    let count: i64 = tx.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Check whether a column exists on a table
pub fn column_exists(tx: &Transaction<'_>, table: &str, column: &str) -> BrokerResult<bool> {
    let mut stmt = tx.prepare(&format!("PRAGMA table_info({})", table))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in names {
        if name? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn initial_schema(tx: &Transaction<'_>) -> BrokerResult<()> {
    tx.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS servers (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            server_type TEXT NOT NULL,
            command TEXT,
            args_enc TEXT,
            env_enc TEXT,
            remote_url_enc TEXT,
            bearer_token_enc TEXT,
            input_params_enc TEXT,
            auto_start INTEGER NOT NULL DEFAULT 0,
            disabled INTEGER NOT NULL DEFAULT 0,
            latest_known_version TEXT,
            tool_permissions_json TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS clients (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS tokens (
            id TEXT PRIMARY KEY,
            client_id TEXT NOT NULL REFERENCES clients(id) ON DELETE CASCADE,
            issued_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tokens_client ON tokens(client_id);

        CREATE TABLE IF NOT EXISTS token_servers (
            token_id TEXT NOT NULL REFERENCES tokens(id) ON DELETE CASCADE,
            server_id TEXT NOT NULL REFERENCES servers(id) ON DELETE CASCADE,
            PRIMARY KEY (token_id, server_id)
        );
        CREATE INDEX IF NOT EXISTS idx_token_servers_server ON token_servers(server_id);

        CREATE TABLE IF NOT EXISTS tool_preferences (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            server_id TEXT NOT NULL REFERENCES servers(id) ON DELETE CASCADE,
            tool_name TEXT NOT NULL,
            client_id TEXT REFERENCES clients(id) ON DELETE CASCADE,
            enabled INTEGER NOT NULL DEFAULT 1,
            original_description TEXT,
            custom_name TEXT,
            custom_description TEXT,
            UNIQUE (server_id, tool_name, client_id)
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_prefs_global
            ON tool_preferences(server_id, tool_name) WHERE client_id IS NULL;
        CREATE INDEX IF NOT EXISTS idx_prefs_server ON tool_preferences(server_id);
        CREATE INDEX IF NOT EXISTS idx_prefs_client ON tool_preferences(client_id);

        CREATE TABLE IF NOT EXISTS oauth_configs (
            server_id TEXT PRIMARY KEY REFERENCES servers(id) ON DELETE CASCADE,
            provider TEXT NOT NULL,
            discovery_url TEXT,
            client_id TEXT,
            client_secret_enc TEXT,
            scopes_json TEXT NOT NULL DEFAULT '[]',
            grant_type TEXT NOT NULL DEFAULT 'authorization_code',
            auth_endpoint TEXT,
            token_endpoint TEXT,
            revoke_endpoint TEXT,
            introspect_endpoint TEXT,
            userinfo_endpoint TEXT,
            use_pkce INTEGER NOT NULL DEFAULT 1,
            dynamic_registration INTEGER NOT NULL DEFAULT 0,
            audience TEXT,
            additional_params_json TEXT NOT NULL DEFAULT '{}',
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS oauth_tokens (
            server_id TEXT PRIMARY KEY REFERENCES servers(id) ON DELETE CASCADE,
            access_token_enc TEXT NOT NULL,
            refresh_token_enc TEXT,
            id_token_enc TEXT,
            token_type TEXT NOT NULL DEFAULT 'Bearer',
            expires_at INTEGER,
            scopes_json TEXT,
            refresh_count INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_oauth_tokens_expires ON oauth_tokens(expires_at);

        CREATE TABLE IF NOT EXISTS oauth_auth_states (
            state TEXT PRIMARY KEY,
            server_id TEXT NOT NULL,
            code_verifier_enc TEXT NOT NULL,
            code_challenge TEXT,
            redirect_uri TEXT NOT NULL,
            scopes_json TEXT NOT NULL DEFAULT '[]',
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_auth_states_created ON oauth_auth_states(created_at);
        "#,
    )?;
    Ok(())
}

fn audit_log(tx: &Transaction<'_>) -> BrokerResult<()> {
    tx.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp INTEGER NOT NULL,
            event_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            server_id TEXT,
            details_json TEXT NOT NULL DEFAULT '{}'
        );
        CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp);
        "#,
    )?;
    Ok(())
}

fn audit_log_down(tx: &Transaction<'_>) -> BrokerResult<()> {
    tx.execute_batch("DROP TABLE IF EXISTS audit_log;")?;
    Ok(())
}

fn token_scopes(tx: &Transaction<'_>) -> BrokerResult<()> {
    if !column_exists(tx, "tokens", "scopes_json")? {
        tx.execute(
            "ALTER TABLE tokens ADD COLUMN scopes_json TEXT NOT NULL DEFAULT '[]'",
            [],
        )?;
    }
    Ok(())
}

fn token_scopes_down(tx: &Transaction<'_>) -> BrokerResult<()> {
    if column_exists(tx, "tokens", "scopes_json")? {
        tx.execute("ALTER TABLE tokens DROP COLUMN scopes_json", [])?;
    }
    Ok(())
}

fn registration_metadata(tx: &Transaction<'_>) -> BrokerResult<()> {
    if !column_exists(tx, "oauth_configs", "registration_client_uri")? {
        tx.execute(
            "ALTER TABLE oauth_configs ADD COLUMN registration_client_uri TEXT",
            [],
        )?;
    }
    if !column_exists(tx, "oauth_configs", "registration_access_token_enc")? {
        tx.execute(
            "ALTER TABLE oauth_configs ADD COLUMN registration_access_token_enc TEXT",
            [],
        )?;
    }
    Ok(())
}

fn registration_metadata_down(tx: &Transaction<'_>) -> BrokerResult<()> {
    if column_exists(tx, "oauth_configs", "registration_client_uri")? {
        tx.execute(
            "ALTER TABLE oauth_configs DROP COLUMN registration_client_uri",
            [],
        )?;
    }
    if column_exists(tx, "oauth_configs", "registration_access_token_enc")? {
        tx.execute(
            "ALTER TABLE oauth_configs DROP COLUMN registration_access_token_enc",
            [],
        )?;
    }
    Ok(())
}

fn token_last_used(tx: &Transaction<'_>) -> BrokerResult<()> {
    if !column_exists(tx, "oauth_tokens", "last_used")? {
        tx.execute(
            "ALTER TABLE oauth_tokens ADD COLUMN last_used INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }
    Ok(())
}

fn token_last_used_down(tx: &Transaction<'_>) -> BrokerResult<()> {
    if column_exists(tx, "oauth_tokens", "last_used")? {
        tx.execute("ALTER TABLE oauth_tokens DROP COLUMN last_used", [])?;
    }
    Ok(())
}
