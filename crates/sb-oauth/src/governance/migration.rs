//! Versioned migration of the OAuth dataset
//!
//! Distinct from the store's schema migrations: these operate on the OAuth
//! rows themselves (normalizing fields, filling defaults, canonicalizing
//! provider tags). Snapshots hold the rows exactly as stored — encrypted
//! columns stay encrypted — so rollback never writes secret material to the
//! state file. A pre-migration backup is created unconditionally.

use super::audit::{AuditEventType, AuditLog, AuditSeverity};
use super::backup::{BackupKind, BackupManager};
use chrono::Utc;
use sb_store::Store;
use sb_types::{BrokerError, BrokerResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Dataset version of a store that has never been migrated
pub const INITIAL_VERSION: &str = "1.0.0";

/// The OAuth dataset as raw rows (ciphertexts included)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OAuthDataset {
    pub configs: Vec<Value>,
    pub tokens: Vec<Value>,
}

/// One dataset migration step
struct DatasetMigration {
    version: &'static str,
    description: &'static str,
    up: fn(&mut OAuthDataset),
}

/// Migrations in order; the last entry is the current dataset version
const MIGRATIONS: [DatasetMigration; 5] = [
    DatasetMigration {
        version: "1.1.0",
        description: "normalize scope strings to JSON arrays",
        up: normalize_scopes,
    },
    DatasetMigration {
        version: "1.2.0",
        description: "default use_pkce on configs that predate PKCE support",
        up: default_use_pkce,
    },
    DatasetMigration {
        version: "1.3.0",
        description: "backfill refresh_count on tokens",
        up: backfill_refresh_count,
    },
    DatasetMigration {
        version: "1.4.0",
        description: "ensure audience and additional_params fields exist",
        up: ensure_param_fields,
    },
    DatasetMigration {
        version: "2.0.0",
        description: "canonicalize provider tags",
        up: canonicalize_providers,
    },
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedMigration {
    pub version: String,
    pub applied_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RollbackSnapshot {
    /// The version this snapshot was taken before applying
    version: String,
    taken_at: i64,
    dataset: OAuthDataset,
}

/// Persisted migration state (applied versions + rollback snapshots)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationState {
    pub current_version: String,
    pub applied_migrations: Vec<AppliedMigration>,
    rollback_history: Vec<RollbackSnapshot>,
}

impl Default for MigrationState {
    fn default() -> Self {
        Self {
            current_version: INITIAL_VERSION.to_string(),
            applied_migrations: Vec::new(),
            rollback_history: Vec::new(),
        }
    }
}

/// Runs and rolls back dataset migrations
pub struct DatasetMigrator {
    store: Store,
    backup: Arc<BackupManager>,
    audit: Arc<AuditLog>,
    state_path: PathBuf,
}

impl DatasetMigrator {
    pub fn new(
        store: Store,
        backup: Arc<BackupManager>,
        audit: Arc<AuditLog>,
        state_path: &Path,
    ) -> Self {
        Self {
            store,
            backup,
            audit,
            state_path: state_path.to_path_buf(),
        }
    }

    /// Latest known dataset version
    pub fn latest_version() -> &'static str {
        MIGRATIONS[MIGRATIONS.len() - 1].version
    }

    pub fn state(&self) -> MigrationState {
        std::fs::read(&self.state_path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default()
    }

    /// Apply all pending migrations; returns the resulting version
    pub fn migrate(&self) -> BrokerResult<String> {
        let mut state = self.state();
        let pending: Vec<&DatasetMigration> = MIGRATIONS
            .iter()
            .skip_while(|m| version_lte(m.version, &state.current_version))
            .collect();

        if pending.is_empty() {
            return Ok(state.current_version);
        }

        // Unconditional safety net before any data is touched
        self.backup.create(BackupKind::Automatic, None)?;

        let (configs, tokens) = self.store.export_oauth_raw()?;
        let mut dataset = OAuthDataset { configs, tokens };
        let now = Utc::now().timestamp_millis();

        for migration in &pending {
            state.rollback_history.push(RollbackSnapshot {
                version: migration.version.to_string(),
                taken_at: now,
                dataset: dataset.clone(),
            });

            (migration.up)(&mut dataset);
            state.applied_migrations.push(AppliedMigration {
                version: migration.version.to_string(),
                applied_at: now,
            });
            info!(
                "applied dataset migration {} ({})",
                migration.version, migration.description
            );
        }

        self.store.import_oauth_raw(&dataset.configs, &dataset.tokens)?;
        state.current_version = pending.last().unwrap().version.to_string();
        self.write_state(&state)?;

        self.audit.log(
            AuditEventType::ConfigurationChanged,
            AuditSeverity::Info,
            None,
            json!({
                "migration": "dataset",
                "version": state.current_version,
                "applied": pending.len(),
            }),
        );
        Ok(state.current_version)
    }

    /// Roll the dataset back to `target_version`
    ///
    /// Restores the pre-image snapshot of the earliest migration past the
    /// target and truncates the applied list accordingly.
    pub fn rollback(&self, target_version: &str) -> BrokerResult<String> {
        let mut state = self.state();

        if !version_lte(target_version, &state.current_version) {
            return Err(BrokerError::Migration(format!(
                "cannot roll forward from {} to {}",
                state.current_version, target_version
            )));
        }
        if target_version != INITIAL_VERSION
            && !MIGRATIONS.iter().any(|m| m.version == target_version)
        {
            return Err(BrokerError::Migration(format!(
                "unknown dataset version {}",
                target_version
            )));
        }

        // The snapshot taken before the first migration past the target is
        // the dataset as it stood at the target version.
        let snapshot_index = state
            .rollback_history
            .iter()
            .position(|snapshot| !version_lte(&snapshot.version, target_version))
            .ok_or_else(|| {
                BrokerError::Migration(format!(
                    "no rollback snapshot reaches version {}",
                    target_version
                ))
            })?;

        let snapshot = state.rollback_history[snapshot_index].clone();
        self.store
            .import_oauth_raw(&snapshot.dataset.configs, &snapshot.dataset.tokens)?;

        state.rollback_history.truncate(snapshot_index);
        state
            .applied_migrations
            .retain(|applied| version_lte(&applied.version, target_version));
        state.current_version = target_version.to_string();
        self.write_state(&state)?;

        self.audit.log(
            AuditEventType::ConfigurationChanged,
            AuditSeverity::Warning,
            None,
            json!({ "migration": "rollback", "version": target_version }),
        );
        info!("rolled dataset back to {}", target_version);
        Ok(state.current_version)
    }

    fn write_state(&self, state: &MigrationState) -> BrokerResult<()> {
        let tmp = self.state_path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(state)?)?;
        std::fs::rename(&tmp, &self.state_path)?;
        Ok(())
    }
}

/// Lexicographic-on-parts comparison: a <= b for dotted versions
fn version_lte(a: &str, b: &str) -> bool {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.').map(|part| part.parse().unwrap_or(0)).collect()
    };
    parse(a) <= parse(b)
}

fn normalize_scopes(dataset: &mut OAuthDataset) {
    let fix = |row: &mut Value| {
        let Some(raw) = row.get("scopes_json").and_then(Value::as_str) else {
            return;
        };
        if serde_json::from_str::<Vec<String>>(raw).is_ok() {
            return;
        }
        // Legacy space-separated scope strings
        let scopes: Vec<String> = raw.split_whitespace().map(str::to_string).collect();
        row["scopes_json"] = Value::String(serde_json::to_string(&scopes).unwrap_or_default());
    };
    dataset.configs.iter_mut().for_each(fix);
    dataset.tokens.iter_mut().for_each(fix);
}

fn default_use_pkce(dataset: &mut OAuthDataset) {
    for row in &mut dataset.configs {
        if row.get("use_pkce").map(Value::is_boolean) != Some(true) {
            row["use_pkce"] = Value::Bool(true);
        }
    }
}

fn backfill_refresh_count(dataset: &mut OAuthDataset) {
    for row in &mut dataset.tokens {
        if row.get("refresh_count").and_then(Value::as_i64).is_none() {
            row["refresh_count"] = json!(0);
        }
    }
}

fn ensure_param_fields(dataset: &mut OAuthDataset) {
    for row in &mut dataset.configs {
        if row.get("additional_params_json").and_then(Value::as_str).is_none() {
            row["additional_params_json"] = Value::String("{}".to_string());
        }
        if row.get("audience").is_none() {
            row["audience"] = Value::Null;
        }
    }
}

fn canonicalize_providers(dataset: &mut OAuthDataset) {
    for row in &mut dataset.configs {
        let Some(provider) = row.get("provider").and_then(Value::as_str) else {
            continue;
        };
        let canonical = match provider.to_lowercase().as_str() {
            "azure" | "azuread" | "entra" => "microsoft".to_string(),
            other => other.to_string(),
        };
        row["provider"] = Value::String(canonical);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sb_config::ServerConfig;
    use sb_crypto::CryptoService;
    use sb_store::{OAuthConfigRow, OAuthTokenRow};

    fn setup() -> (DatasetMigrator, Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let crypto = Arc::new(
            CryptoService::load_or_create(
                &dir.path().join(".oauth-key"),
                &dir.path().join("oauth-keys.json"),
            )
            .unwrap(),
        );
        let store = Store::open_in_memory(crypto.clone()).unwrap();
        let audit =
            Arc::new(AuditLog::new(store.clone(), &dir.path().join("oauth-audit.log")).unwrap());
        let backups = dir.path().join("oauth-backups");
        let backup = Arc::new(
            BackupManager::new(
                store.clone(),
                crypto,
                audit.clone(),
                &backups,
                &backups.join("backup-history.json"),
            )
            .unwrap(),
        );

        let server = ServerConfig::remote("srv", "https://mcp.example.com");
        store.insert_server(&server).unwrap();
        store
            .upsert_oauth_config(&OAuthConfigRow {
                server_id: server.id.clone(),
                provider: "AzureAD".to_string(),
                grant_type: "authorization_code".to_string(),
                ..Default::default()
            })
            .unwrap();
        store
            .upsert_oauth_token(&OAuthTokenRow {
                server_id: server.id,
                access_token: "access".to_string(),
                refresh_token: None,
                id_token: None,
                token_type: "Bearer".to_string(),
                expires_at: None,
                scopes: None,
                refresh_count: 0,
                last_used: 0,
            })
            .unwrap();

        let migrator = DatasetMigrator::new(
            store.clone(),
            backup,
            audit,
            &dir.path().join("oauth-migration-state.json"),
        );
        (migrator, store, dir)
    }

    fn dataset_fingerprint(store: &Store) -> (Vec<Value>, Vec<Value>) {
        let (mut configs, mut tokens) = store.export_oauth_raw().unwrap();
        // Timestamps are allowed to differ across migrate/rollback cycles
        for row in configs.iter_mut().chain(tokens.iter_mut()) {
            if let Some(obj) = row.as_object_mut() {
                obj.remove("updated_at");
                obj.remove("last_used");
            }
        }
        (configs, tokens)
    }

    #[test]
    fn test_fresh_migrate_applies_all_five() {
        let (migrator, store, _dir) = setup();

        let version = migrator.migrate().unwrap();
        assert_eq!(version, "2.0.0");

        let state = migrator.state();
        assert_eq!(state.applied_migrations.len(), 5);
        assert_eq!(state.current_version, "2.0.0");

        // The provider tag was canonicalized
        let (configs, _) = store.export_oauth_raw().unwrap();
        assert_eq!(configs[0]["provider"], "microsoft");
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let (migrator, store, _dir) = setup();

        migrator.migrate().unwrap();
        let before = dataset_fingerprint(&store);
        let version = migrator.migrate().unwrap();
        assert_eq!(version, "2.0.0");
        assert_eq!(dataset_fingerprint(&store), before);
        assert_eq!(migrator.state().applied_migrations.len(), 5);
    }

    #[test]
    fn test_rollback_and_remigrate_roundtrip() {
        let (migrator, store, _dir) = setup();

        migrator.migrate().unwrap();
        let migrated = dataset_fingerprint(&store);

        let version = migrator.rollback("1.1.0").unwrap();
        assert_eq!(version, "1.1.0");
        let state = migrator.state();
        assert_eq!(state.applied_migrations.len(), 1);
        assert_eq!(state.applied_migrations[0].version, "1.1.0");

        let version = migrator.migrate().unwrap();
        assert_eq!(version, "2.0.0");
        assert_eq!(dataset_fingerprint(&store), migrated);
    }

    #[test]
    fn test_rollback_forward_is_rejected() {
        let (migrator, _store, _dir) = setup();
        assert!(migrator.rollback("2.0.0").is_err());
    }

    #[test]
    fn test_migration_state_contains_no_plaintext() {
        let (migrator, _store, dir) = setup();
        migrator.migrate().unwrap();

        let content =
            std::fs::read_to_string(dir.path().join("oauth-migration-state.json")).unwrap();
        assert!(!content.contains("\"access\""));
    }

    #[test]
    fn test_version_ordering() {
        assert!(version_lte("1.0.0", "1.1.0"));
        assert!(version_lte("1.1.0", "1.1.0"));
        assert!(!version_lte("2.0.0", "1.4.0"));
        assert!(version_lte("1.9.0", "1.10.0"));
    }
}
