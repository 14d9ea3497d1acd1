//! Encrypted backup and restore of the OAuth dataset
//!
//! A backup file is a JSON envelope: metadata in the clear, the payload
//! (configs + decrypted token material) encrypted either under a user
//! passphrase or under the current store key. Automatic daily backups keep
//! the newest seven; manual backups are never auto-pruned. Restore verifies
//! the checksum and re-encrypts token material under the current key.

use super::audit::{AuditEventType, AuditLog, AuditSeverity};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::Utc;
use sb_crypto::CryptoService;
use sb_store::{OAuthConfigRow, OAuthTokenRow, Store};
use sb_types::{BrokerError, BrokerResult};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Automatic backups retained
const AUTO_BACKUP_KEEP: usize = 7;

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    Automatic,
    Manual,
}

/// Clear-text metadata carried in the envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub format_version: u32,
    pub created_at: i64,
    /// SHA-256 of the machine id; ties a backup to its origin host
    pub machine_id_hash: String,
    pub app_version: String,
    pub config_count: usize,
    pub token_count: usize,
    /// SHA-256 over the canonical `{configs, tokens}` JSON
    pub checksum: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct BackupPayload {
    configs: Vec<OAuthConfigRow>,
    tokens: Vec<OAuthTokenRow>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BackupEnvelope {
    metadata: BackupMetadata,
    /// "passphrase" or "key"
    encryption: String,
    payload: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HistoryEntry {
    file: String,
    kind: BackupKind,
    created_at: i64,
    config_count: usize,
    token_count: usize,
}

/// Backup/restore manager for the OAuth dataset
pub struct BackupManager {
    store: Store,
    crypto: Arc<CryptoService>,
    audit: Arc<AuditLog>,
    dir: PathBuf,
    history_path: PathBuf,
}

impl BackupManager {
    pub fn new(
        store: Store,
        crypto: Arc<CryptoService>,
        audit: Arc<AuditLog>,
        dir: &Path,
        history_path: &Path,
    ) -> BrokerResult<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            store,
            crypto,
            audit,
            dir: dir.to_path_buf(),
            history_path: history_path.to_path_buf(),
        })
    }

    /// Create a backup file; automatic backups are pruned to the newest 7
    pub fn create(&self, kind: BackupKind, passphrase: Option<&str>) -> BrokerResult<PathBuf> {
        let payload = self.collect_payload()?;
        let payload_json = serde_json::to_vec(&payload)?;
        let checksum = hex::encode(Sha256::digest(&payload_json));

        let metadata = BackupMetadata {
            format_version: FORMAT_VERSION,
            created_at: Utc::now().timestamp_millis(),
            machine_id_hash: machine_id_hash(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            config_count: payload.configs.len(),
            token_count: payload.tokens.len(),
            checksum,
        };

        let (encryption, encoded) = match passphrase {
            Some(passphrase) => {
                let blob = sb_crypto::backup_encrypt(&payload_json, passphrase)?;
                ("passphrase".to_string(), STANDARD.encode(blob))
            }
            None => {
                let payload_str = String::from_utf8(payload_json)
                    .map_err(|_| BrokerError::Crypto("payload is not UTF-8".to_string()))?;
                ("key".to_string(), self.crypto.encrypt(&payload_str)?)
            }
        };

        let envelope = BackupEnvelope {
            metadata: metadata.clone(),
            encryption,
            payload: encoded,
        };

        // Millisecond stamp keeps rapid successive backups from colliding
        let stamp = Utc::now().format("%Y%m%d-%H%M%S%3f");
        let suffix = match kind {
            BackupKind::Automatic => "auto",
            BackupKind::Manual => "manual",
        };
        let file_name = format!("backup-{}-{}.json", stamp, suffix);
        let path = self.dir.join(&file_name);

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&envelope)?)?;
        std::fs::rename(&tmp, &path)?;

        let mut history = self.read_history();
        history.push(HistoryEntry {
            file: file_name,
            kind,
            created_at: metadata.created_at,
            config_count: metadata.config_count,
            token_count: metadata.token_count,
        });
        if kind == BackupKind::Automatic {
            self.prune_automatic(&mut history);
        }
        self.write_history(&history)?;

        info!(
            "created {} backup with {} configs, {} tokens",
            match kind {
                BackupKind::Automatic => "automatic",
                BackupKind::Manual => "manual",
            },
            metadata.config_count,
            metadata.token_count
        );
        Ok(path)
    }

    /// Restore a backup file, re-encrypting tokens under the current key
    ///
    /// Rows for servers that no longer exist are skipped. Returns
    /// (configs restored, tokens restored).
    pub fn restore(&self, path: &Path, passphrase: Option<&str>) -> BrokerResult<(usize, usize)> {
        let envelope: BackupEnvelope = serde_json::from_slice(&std::fs::read(path)?)?;

        let payload_json: Vec<u8> = match (envelope.encryption.as_str(), passphrase) {
            ("passphrase", Some(passphrase)) => {
                let blob = STANDARD
                    .decode(&envelope.payload)
                    .map_err(|e| BrokerError::Crypto(format!("invalid backup encoding: {}", e)))?;
                sb_crypto::backup_decrypt(&blob, passphrase)?
            }
            ("passphrase", None) => {
                return Err(BrokerError::Crypto(
                    "backup is passphrase-protected".to_string(),
                ))
            }
            _ => self.crypto.decrypt(&envelope.payload)?.into_bytes(),
        };

        let checksum = hex::encode(Sha256::digest(&payload_json));
        if checksum != envelope.metadata.checksum {
            return Err(BrokerError::Crypto("backup checksum mismatch".to_string()));
        }

        let payload: BackupPayload = serde_json::from_slice(&payload_json)?;

        let mut configs_restored = 0;
        for config in &payload.configs {
            if self.store.get_server(&config.server_id)?.is_none() {
                warn!("skipping backup config for unknown server {}", config.server_id);
                continue;
            }
            self.store.upsert_oauth_config(config)?;
            configs_restored += 1;
        }

        let mut tokens_restored = 0;
        for token in &payload.tokens {
            if self.store.get_server(&token.server_id)?.is_none() {
                warn!("skipping backup token for unknown server {}", token.server_id);
                continue;
            }
            // upsert re-encrypts under the current key
            self.store.upsert_oauth_token(token)?;
            tokens_restored += 1;
        }

        self.audit.log(
            AuditEventType::ConfigurationChanged,
            AuditSeverity::Warning,
            None,
            json!({
                "restored_configs": configs_restored,
                "restored_tokens": tokens_restored,
                "backup": path.file_name().map(|n| n.to_string_lossy().to_string()),
            }),
        );
        info!(
            "restored backup: {} configs, {} tokens",
            configs_restored, tokens_restored
        );
        Ok((configs_restored, tokens_restored))
    }

    /// Automatic backup files currently on disk, newest first
    pub fn automatic_backups(&self) -> Vec<PathBuf> {
        let mut history = self.read_history();
        history.retain(|entry| entry.kind == BackupKind::Automatic);
        history.sort_by_key(|entry| std::cmp::Reverse(entry.created_at));
        history
            .iter()
            .map(|entry| self.dir.join(&entry.file))
            .collect()
    }

    fn collect_payload(&self) -> BrokerResult<BackupPayload> {
        let mut configs = Vec::new();
        for server_id in self.store.list_oauth_config_ids()? {
            if let Some(config) = self.store.get_oauth_config(&server_id)? {
                configs.push(config);
            }
        }
        let mut tokens = Vec::new();
        for server_id in self.store.list_oauth_token_ids()? {
            if let Some(token) = self.store.get_oauth_token(&server_id)? {
                tokens.push(token);
            }
        }
        Ok(BackupPayload { configs, tokens })
    }

    fn prune_automatic(&self, history: &mut Vec<HistoryEntry>) {
        let mut automatic: Vec<(usize, i64)> = history
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.kind == BackupKind::Automatic)
            .map(|(i, entry)| (i, entry.created_at))
            .collect();
        if automatic.len() <= AUTO_BACKUP_KEEP {
            return;
        }

        automatic.sort_by_key(|(_, created_at)| std::cmp::Reverse(*created_at));
        let doomed: Vec<usize> = automatic
            .into_iter()
            .skip(AUTO_BACKUP_KEEP)
            .map(|(i, _)| i)
            .collect();

        let mut index = 0usize;
        history.retain(|entry| {
            let keep = !doomed.contains(&index);
            if !keep {
                let path = self.dir.join(&entry.file);
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!("failed to remove pruned backup {}: {}", path.display(), e);
                }
            }
            index += 1;
            keep
        });
    }

    fn read_history(&self) -> Vec<HistoryEntry> {
        std::fs::read(&self.history_path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default()
    }

    fn write_history(&self, history: &[HistoryEntry]) -> BrokerResult<()> {
        let tmp = self.history_path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(history)?)?;
        std::fs::rename(&tmp, &self.history_path)?;
        Ok(())
    }
}

fn machine_id_hash() -> String {
    let machine_id = machine_uid::get().unwrap_or_else(|_| "unknown-machine".to_string());
    hex::encode(Sha256::digest(machine_id.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sb_config::ServerConfig;

    fn setup() -> (BackupManager, Store, String, tempfile::TempDir) {
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

        let server = ServerConfig::remote("srv", "https://mcp.example.com");
        store.insert_server(&server).unwrap();
        store
            .upsert_oauth_config(&OAuthConfigRow {
                server_id: server.id.clone(),
                provider: "github".to_string(),
                client_secret: Some("secret".to_string()),
                grant_type: "authorization_code".to_string(),
                ..Default::default()
            })
            .unwrap();
        store
            .upsert_oauth_token(&OAuthTokenRow {
                server_id: server.id.clone(),
                access_token: "the-access-token".to_string(),
                refresh_token: Some("the-refresh-token".to_string()),
                id_token: None,
                token_type: "Bearer".to_string(),
                expires_at: None,
                scopes: None,
                refresh_count: 2,
                last_used: 0,
            })
            .unwrap();

        let backups_dir = dir.path().join("oauth-backups");
        let manager = BackupManager::new(
            store.clone(),
            crypto,
            audit,
            &backups_dir,
            &backups_dir.join("backup-history.json"),
        )
        .unwrap();
        (manager, store, server.id, dir)
    }

    #[test]
    fn test_backup_restore_roundtrip_with_passphrase() {
        let (manager, store, server_id, _dir) = setup();

        let path = manager.create(BackupKind::Manual, Some("hunter2")).unwrap();

        // Wipe the dataset, then restore
        store.delete_oauth_token(&server_id).unwrap();
        store.delete_oauth_config(&server_id).unwrap();

        let (configs, tokens) = manager.restore(&path, Some("hunter2")).unwrap();
        assert_eq!((configs, tokens), (1, 1));

        let token = store.get_oauth_token(&server_id).unwrap().unwrap();
        assert_eq!(token.access_token, "the-access-token");
        assert_eq!(token.refresh_count, 2);
        let config = store.get_oauth_config(&server_id).unwrap().unwrap();
        assert_eq!(config.client_secret.as_deref(), Some("secret"));
    }

    #[test]
    fn test_wrong_passphrase_rejected() {
        let (manager, _store, _server_id, _dir) = setup();
        let path = manager.create(BackupKind::Manual, Some("right")).unwrap();
        assert!(manager.restore(&path, Some("wrong")).is_err());
        assert!(manager.restore(&path, None).is_err());
    }

    #[test]
    fn test_key_encrypted_backup_roundtrip() {
        let (manager, store, server_id, _dir) = setup();
        let path = manager.create(BackupKind::Automatic, None).unwrap();

        store.delete_oauth_token(&server_id).unwrap();
        let (_, tokens) = manager.restore(&path, None).unwrap();
        assert_eq!(tokens, 1);
    }

    #[test]
    fn test_backup_file_contains_no_plaintext_secrets() {
        let (manager, _store, _server_id, _dir) = setup();
        let path = manager.create(BackupKind::Manual, Some("pass")).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(!content.contains("the-access-token"));
        assert!(!content.contains("the-refresh-token"));
        assert!(!content.contains("\"secret\""));
    }

    #[test]
    fn test_automatic_backups_pruned_to_seven() {
        let (manager, _store, _server_id, _dir) = setup();

        for _ in 0..9 {
            manager.create(BackupKind::Automatic, None).unwrap();
            // Distinct timestamps keep the prune ordering meaningful
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        manager.create(BackupKind::Manual, None).unwrap();

        let automatic = manager.automatic_backups();
        assert!(automatic.len() <= 7, "kept {}", automatic.len());
        for path in automatic {
            assert!(path.exists());
        }
    }
}
