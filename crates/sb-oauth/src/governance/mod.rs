//! OAuth governance: audit, rate limits, key rotation, backup, migration

pub mod audit;
pub mod backup;
pub mod migration;
pub mod rate_limit;
pub mod rotation;

pub use audit::{AuditEntry, AuditEventType, AuditLog, AuditSeverity};
pub use backup::{BackupKind, BackupManager, BackupMetadata};
pub use migration::{DatasetMigrator, MigrationState};
pub use rate_limit::{RateLimitKind, RateLimiter};
pub use rotation::KeyRotationManager;
