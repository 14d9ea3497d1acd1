//! Switchboard broker entry point
//!
//! Builds the service graph in dependency order (store, crypto, governance,
//! token/filter services, OAuth, server manager, router gate), runs startup
//! migrations, auto-starts servers, and installs the maintenance schedulers.
//! Teardown happens in reverse order on shutdown.

use anyhow::Context;
use sb_config::paths;
use sb_crypto::CryptoService;
use sb_filter::ToolFilterService;
use sb_mcp::{RouterGate, ServerManager};
use sb_oauth::governance::{BackupKind, BackupManager, DatasetMigrator, KeyRotationManager};
use sb_oauth::{AuditLog, OAuthService, RateLimiter};
use sb_store::Store;
use sb_tokens::TokenService;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Auth-state GC cadence
const GC_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Automatic backup cadence
const BACKUP_INTERVAL: Duration = Duration::from_secs(24 * 3600);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let data_dir = paths::data_dir().context("resolving data directory")?;
    paths::ensure_dir_exists(&data_dir)?;
    info!("switchboard starting (data dir: {})", data_dir.display());

    // Store and crypto come up first; everything else hangs off them
    let crypto = Arc::new(
        CryptoService::load_or_create(&paths::oauth_key_file()?, &paths::oauth_keys_meta_file()?)
            .context("loading encryption key")?,
    );
    let store = Store::open(&paths::store_db_file()?, crypto.clone())
        .context("opening store (schema migrations are fatal)")?;

    let audit = Arc::new(
        AuditLog::new(store.clone(), &paths::audit_log_file()?).context("opening audit log")?,
    );
    let limiter = Arc::new(RateLimiter::new());

    let backup = Arc::new(BackupManager::new(
        store.clone(),
        crypto.clone(),
        audit.clone(),
        &paths::backups_dir()?,
        &paths::backup_history_file()?,
    )?);

    // Dataset migrations run before anything touches the OAuth rows
    let migrator = DatasetMigrator::new(
        store.clone(),
        backup.clone(),
        audit.clone(),
        &paths::migration_state_file()?,
    );
    let dataset_version = migrator
        .migrate()
        .context("OAuth dataset migration failed")?;
    info!("OAuth dataset at version {}", dataset_version);

    let rotation = Arc::new(KeyRotationManager::new(
        store.clone(),
        crypto.clone(),
        audit.clone(),
    ));
    let rotation_task = rotation.clone().spawn_scheduler();

    let tokens = TokenService::new(store.clone());
    let filter = ToolFilterService::new(store.clone());
    let oauth = Arc::new(OAuthService::new(
        store.clone(),
        crypto,
        audit.clone(),
        limiter,
    ));

    let manager = Arc::new(ServerManager::new(
        store,
        filter.clone(),
        oauth.clone(),
    ));
    manager.load().context("loading server records")?;
    manager.auto_start_all().await;

    let _gate = RouterGate::new(tokens, filter, manager.clone());
    info!("router gate ready");

    // Maintenance loops: stale auth states and daily automatic backups
    let gc_oauth = oauth.clone();
    let gc_task = tokio::spawn(async move {
        loop {
            tokio::time::sleep(GC_INTERVAL).await;
            match gc_oauth.gc_auth_states() {
                Ok(0) => {}
                Ok(n) => info!("garbage-collected {} stale auth states", n),
                Err(e) => warn!("auth-state GC failed: {}", e),
            }
        }
    });

    let backup_task = tokio::spawn(async move {
        loop {
            tokio::time::sleep(BACKUP_INTERVAL).await;
            if let Err(e) = backup.create(BackupKind::Automatic, None) {
                error!("automatic backup failed: {}", e);
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    // Reverse of construction order
    manager.clear_all().await;
    oauth.shutdown();
    backup_task.abort();
    gc_task.abort();
    rotation_task.abort();

    Ok(())
}
