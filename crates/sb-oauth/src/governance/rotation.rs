//! Scheduled encryption key rotation
//!
//! Rotation re-encrypts every encrypted column under a fresh key inside one
//! store transaction, then makes the new key authoritative. A failure at any
//! point before the commit leaves the old key in place.

use super::audit::{AuditEventType, AuditLog, AuditSeverity};
use chrono::Utc;
use sb_crypto::CryptoService;
use sb_store::Store;
use sb_types::BrokerResult;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// How often the scheduler re-evaluates whether rotation is due
const SCHEDULER_TICK: Duration = Duration::from_secs(3600);

pub struct KeyRotationManager {
    store: Store,
    crypto: Arc<CryptoService>,
    audit: Arc<AuditLog>,
}

impl KeyRotationManager {
    pub fn new(store: Store, crypto: Arc<CryptoService>, audit: Arc<AuditLog>) -> Self {
        Self { store, crypto, audit }
    }

    /// Whether the scheduled rotation interval has elapsed
    pub fn is_due(&self) -> bool {
        Utc::now().timestamp_millis() >= self.crypto.metadata().next_rotation_at
    }

    /// Rotate now; returns the new key version
    pub fn rotate(&self) -> BrokerResult<u32> {
        let new_key = CryptoService::generate_key();

        let rows = self.store.reencrypt_all(&new_key)?;
        let version = self.crypto.commit_rotation(new_key)?;

        self.audit.log(
            AuditEventType::KeyRotated,
            AuditSeverity::Critical,
            None,
            json!({ "key_version": version, "rows_reencrypted": rows }),
        );
        info!("key rotation complete: version {}, {} rows", version, rows);
        Ok(version)
    }

    /// Hourly tick that rotates when due; aborted via the returned handle
    pub fn spawn_scheduler(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SCHEDULER_TICK).await;
                if self.is_due() {
                    if let Err(e) = self.rotate() {
                        error!("scheduled key rotation failed: {}", e);
                    }
                }
            }
        })
    }
}
