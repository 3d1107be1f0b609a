//! Migration engine: configuration, version ledger, cross-process locking and
//! the runner that applies pending migrations.
//! Used by the migration CLI.

pub mod config;
pub mod error;
pub mod infra;

pub use config::db;
pub use error::DbInfraError;
pub use infra::db::core::{
    build_admin_pool, orchestrate_migration, orchestrate_migration_internal, MigrationOutcome,
};
pub use infra::db::runner::{
    MigrationReport, MigrationRunner, MigrationState, MigrationStatus, RunnerOptions,
};
pub use infra::db::version_store::{VersionRecord, VersionStore};
