use std::time::Duration;

use migration::{MigrationId, RegistryError};
use sea_orm::DbErr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbInfraError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Database error: {0}")]
    Db(#[from] DbErr),

    /// Another runner held the migration lock for longer than the bounded wait.
    /// Retryable by re-invocation.
    #[error("migration lock acquisition timeout after {elapsed:?} ({attempts} attempts)")]
    LockTimeout { elapsed: Duration, attempts: u32 },

    #[error("migration cancelled: {message}")]
    Cancelled { message: String },

    #[error("migration {id} is already recorded in the version ledger")]
    DuplicateMigration { id: MigrationId },

    #[error(transparent)]
    DuplicateIdentifier(#[from] RegistryError),

    #[error("migration {id} failed: {cause}")]
    MigrationFailed {
        id: MigrationId,
        #[source]
        cause: Box<DbInfraError>,
    },

    /// The backend commits DDL implicitly (MySQL), so statements that ran
    /// before the failure may persist without a ledger row.
    #[error(
        "migration {id} failed on a backend without transactional DDL; schema changes made \
         before the failure may already be committed and need manual repair before re-running: {cause}"
    )]
    PartialApply {
        id: MigrationId,
        #[source]
        cause: Box<DbInfraError>,
    },

    #[error("Migration verification failed: {message}")]
    Verification { message: String },
}

impl DbInfraError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// True for failures that a plain re-run can resolve without code changes.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. } | Self::Cancelled { .. })
    }

    /// Identifier of the migration whose `up` step or ledger write failed.
    pub fn failed_migration(&self) -> Option<MigrationId> {
        match self {
            Self::MigrationFailed { id, .. } | Self::PartialApply { id, .. } => Some(*id),
            _ => None,
        }
    }
}
