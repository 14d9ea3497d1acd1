//! OS-specific path resolution for persisted state
//!
//! All broker state lives under a single user-data directory:
//! the relational store, the encryption key, rotation metadata, the audit
//! log, backups, and the OAuth dataset migration state.

use sb_types::{BrokerError, BrokerResult};
use std::path::PathBuf;

/// Get the user-data directory
///
/// Priority:
/// 1. Runtime override via `SWITCHBOARD_ENV` environment variable: `~/.switchboard-{env}/`
/// 2. Development mode (debug builds): `~/.switchboard-dev/`
/// 3. Production mode (release builds): `~/.switchboard/`
pub fn data_dir() -> BrokerResult<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| BrokerError::Store("could not determine home directory".to_string()))?;

    if let Ok(env_suffix) = std::env::var("SWITCHBOARD_ENV") {
        return Ok(home.join(format!(".switchboard-{}", env_suffix)));
    }

    #[cfg(debug_assertions)]
    let dir = home.join(".switchboard-dev");

    #[cfg(not(debug_assertions))]
    let dir = home.join(".switchboard");

    Ok(dir)
}

/// Path of the relational store
pub fn store_db_file() -> BrokerResult<PathBuf> {
    Ok(data_dir()?.join("store.db"))
}

/// Path of the raw 32-byte encryption key (mode 0o600)
pub fn oauth_key_file() -> BrokerResult<PathBuf> {
    Ok(data_dir()?.join(".oauth-key"))
}

/// Path of the key rotation metadata (version, last, next)
pub fn oauth_keys_meta_file() -> BrokerResult<PathBuf> {
    Ok(data_dir()?.join("oauth-keys.json"))
}

/// Path of the newline-delimited JSON audit log
pub fn audit_log_file() -> BrokerResult<PathBuf> {
    Ok(data_dir()?.join("oauth-audit.log"))
}

/// Directory holding dated backup files
pub fn backups_dir() -> BrokerResult<PathBuf> {
    Ok(data_dir()?.join("oauth-backups"))
}

/// Path of the backup history index
pub fn backup_history_file() -> BrokerResult<PathBuf> {
    Ok(backups_dir()?.join("backup-history.json"))
}

/// Path of the OAuth dataset migration state (applied versions, rollback snapshots)
pub fn migration_state_file() -> BrokerResult<PathBuf> {
    Ok(data_dir()?.join("oauth-migration-state.json"))
}

/// Ensure a directory exists, creating parents as needed
pub fn ensure_dir_exists(dir: &PathBuf) -> BrokerResult<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}
