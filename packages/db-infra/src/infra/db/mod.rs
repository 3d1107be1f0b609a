pub mod core;
pub mod diagnostics;
pub mod hooks;
pub mod locking;
pub mod runner;
pub mod version_store;

pub use core::{build_admin_pool, orchestrate_migration, orchestrate_migration_internal};
pub use diagnostics::migration_counters;
pub use hooks::{NoopHook, PgReloadTypes, PostMigrateHook, SqlStatementsHook};
pub use locking::{
    acquire_with_backoff, Guard, InMemoryLock, MigrationLock, MySqlNamedLock, PgAdvisoryLock,
    SqliteFileLock,
};
pub use runner::{MigrationReport, MigrationRunner, MigrationState, MigrationStatus, RunnerOptions};
pub use version_store::{VersionRecord, VersionStore};
